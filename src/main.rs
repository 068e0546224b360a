#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # edgestream
//!
//! Streaming proxy between a cluster API server and kubelets on edge nodes
//! that sit behind NAT. Each edge node dials one WebSocket tunnel to the
//! cloud; logs, exec, attach, metrics and video requests are multiplexed
//! over it.
//!
//! ## Subcommands
//!
//! - `edgestream cloud`: run the tunnel server and the stream server
//! - `edgestream edge`: keep the tunnels to the cloud up and serve requests
//!
//! ## Cloud endpoints
//!
//! | Listener | Path                                              | Description            |
//! |----------|---------------------------------------------------|------------------------|
//! | tunnel   | `/v1/kubeedge/connect`                            | Primary edge tunnel    |
//! | tunnel   | `/v1/kubeedge/videoconnect?ep=&url=`              | Per-camera tunnel      |
//! | stream   | `/containerLogs/{ns}/{pod}/{container}`           | Container logs         |
//! | stream   | `/exec/{ns}/{pod}/{container}`                    | Exec (upgrade)         |
//! | stream   | `/attach/{ns}/{pod}/{container}`                  | Attach (upgrade)       |
//! | stream   | `/stats/summary`, `/metrics`, `/metrics/cadvisor` | Node metrics           |
//! | stream   | `/video/{endpoint}`                               | Video fan-out (WS)     |

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use edgestream::config::Config;
use edgestream::{cloud, edge};

/// Cloud/edge streaming proxy for kubelet traffic.
#[derive(Parser)]
#[command(name = "edgestream", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the cloud half: tunnel server and stream server.
    Cloud {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Run the edge half: tunnel client and kubelet pumps.
    Edge {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config_path = match &cli.command {
        Commands::Cloud { config } | Commands::Edge { config } => config.clone(),
    };
    let config = Config::load(config_path.as_deref());

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();
    info!("edgestream v{} starting", env!("CARGO_PKG_VERSION"));

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    let result = match cli.command {
        Commands::Cloud { .. } => cloud::run(&config.cloud, shutdown).await,
        Commands::Edge { .. } => edge::run(config.edge, shutdown).await,
    };
    match result {
        Ok(()) => info!("Goodbye"),
        Err(e) => {
            error!("edgestream failed: {e}");
            std::process::exit(1);
        }
    }
}

async fn wait_for_signal(shutdown: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to register SIGTERM");
        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
    shutdown.cancel();
}
