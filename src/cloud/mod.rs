//! Cloud half: the edge-facing tunnel server and the API-server-facing stream
//! server, sharing one session registry.
//!
//! ```text
//! tunnel_server.rs  /v1/kubeedge/connect, /v1/kubeedge/videoconnect
//! stream_server.rs  containerLogs, exec, attach, stats, metrics, video
//! session.rs        one tunnel: request map, reader loop
//! connection/       per-request state and the logs/exec/video relays
//! node.rs           node status publisher, pod to node resolver
//! listener.rs       TCP/TLS accept loop
//! ```

pub mod connection;
pub mod listener;
pub mod node;
pub mod session;
pub mod stream_server;
pub mod tunnel_server;

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::CloudConfig;
use crate::error::Result;
use crate::tls;
use listener::ListenerOptions;
use node::{NodeStatusPublisher, PodNodeResolver, RecordingPublisher, StaticPodNodeResolver};
use stream_server::StreamServer;
use tunnel_server::{SessionRegistry, TunnelServer};

/// Run both servers until `shutdown` fires, then close every live session.
pub async fn run(config: &CloudConfig, shutdown: CancellationToken) -> Result<()> {
    let tunnel_tls = tls::tunnel_server_config(
        &config.tls_tunnel_ca_file,
        &config.tls_tunnel_cert_file,
        &config.tls_tunnel_private_key_file,
    )?;
    let stream_tls = tls::stream_server_config(
        &config.tls_stream_ca_file,
        &config.tls_stream_cert_file,
        &config.tls_stream_private_key_file,
    )?;

    let registry = SessionRegistry::default();
    let publisher: Arc<dyn NodeStatusPublisher> = Arc::new(RecordingPublisher::default());
    let resolver: Arc<dyn PodNodeResolver> = Arc::new(StaticPodNodeResolver::new(config.pod_nodes.clone()));
    let tunnel = TunnelServer::new(config, registry.clone(), publisher).router();
    let stream = StreamServer::new(config, registry.clone(), resolver).router();

    let tunnel_listener = TcpListener::bind(&config.tunnel_listen).await?;
    let stream_listener = TcpListener::bind(&config.stream_listen).await?;
    info!(
        tunnel = %config.tunnel_listen,
        stream = %config.stream_listen,
        session_key = ?config.session_key,
        "cloud stream proxy ready"
    );

    tokio::join!(
        listener::serve(
            "tunnel",
            tunnel_listener,
            Some(TlsAcceptor::from(tunnel_tls)),
            tunnel,
            ListenerOptions::tunnel(),
            shutdown.clone(),
        ),
        listener::serve(
            "stream",
            stream_listener,
            Some(TlsAcceptor::from(stream_tls)),
            stream,
            ListenerOptions::stream(),
            shutdown.clone(),
        ),
    );

    info!(sessions = registry.len().await, "closing tunnel sessions");
    registry.close_all().await;
    Ok(())
}
