//! Edge half: keeps the tunnels to the cloud up and serves the requests the
//! cloud opens on them against the local kubelet and transcoder.

pub mod client;
pub mod connection;
pub mod session;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::EdgeConfig;
use crate::error::Result;
use crate::tls;
use client::{run_tunnel, TunnelTarget};
use connection::EdgeContext;

/// Run the primary tunnel and one tunnel per video endpoint until `shutdown`.
pub async fn run(config: EdgeConfig, shutdown: CancellationToken) -> Result<()> {
    let tls = if config.server.starts_with("wss://") {
        Some(tls::edge_client_config(
            &config.tls_ca_file,
            &config.tls_cert_file,
            &config.tls_private_key_file,
        )?)
    } else {
        None
    };
    let context = Arc::new(EdgeContext::new(&config));
    let config = Arc::new(config);
    info!(
        node = %config.hostname_override,
        server = %config.server,
        video_endpoints = config.video.len(),
        "edge stream proxy starting"
    );

    let targets = std::iter::once(TunnelTarget::Primary).chain(config.video.iter().cloned().map(TunnelTarget::Video));
    let tasks: Vec<_> = targets
        .map(|target| {
            tokio::spawn(run_tunnel(
                target,
                config.clone(),
                tls.clone(),
                context.clone(),
                shutdown.clone(),
            ))
        })
        .collect();
    for task in tasks {
        let _ = task.await;
    }
    info!("edge tunnels stopped");
    Ok(())
}
