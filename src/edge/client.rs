//! Tunnel client: outbound WebSocket from the edge to the cloud tunnel server.
//!
//! One task per tunnel (the primary one plus one per video endpoint). Each
//! keeps its tunnel up with exponential-backoff reconnect and serves the
//! requests the cloud opens on it.

use std::sync::Arc;
use std::time::Duration;

use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::Connector;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use super::connection::EdgeContext;
use super::session::{Disconnect, EdgeSession};
use crate::config::{EdgeConfig, VideoEndpoint};
use crate::error::{Result, TunnelError};
use crate::stream::message::MAX_HEADER_LEN;
use crate::stream::{SafeTunnel, CONNECT_PATH, SESSION_HOST_NAME_OVERRIDE, SESSION_INTERNAL_IP, VIDEO_CONNECT_PATH};
use crate::util::query_escape;

/// Which tunnel a client task maintains.
#[derive(Debug, Clone)]
pub enum TunnelTarget {
    Primary,
    Video(VideoEndpoint),
}

impl TunnelTarget {
    fn name(&self) -> &str {
        match self {
            Self::Primary => "primary",
            Self::Video(endpoint) => &endpoint.ep,
        }
    }

    /// Handshake request: URL plus identity headers.
    pub fn request(&self, config: &EdgeConfig) -> Result<Request> {
        let base = config.server.trim_end_matches('/');
        let url = match self {
            Self::Primary => format!("{base}{CONNECT_PATH}"),
            Self::Video(endpoint) => format!(
                "{base}{VIDEO_CONNECT_PATH}?ep={}&url={}",
                query_escape(&endpoint.ep),
                query_escape(&endpoint.url)
            ),
        };
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| TunnelError::ProtocolViolation(format!("bad tunnel url {url}: {e}")))?;

        let headers = request.headers_mut();
        let header = |value: &str| {
            HeaderValue::from_str(value).map_err(|e| TunnelError::ProtocolViolation(format!("bad header value {value}: {e}")))
        };
        headers.insert(SESSION_HOST_NAME_OVERRIDE, header(&config.hostname_override)?);
        if let Some(ip) = &config.internal_ip {
            headers.insert(SESSION_INTERNAL_IP, header(ip)?);
        }
        Ok(request)
    }
}

/// Keep `target` connected until `shutdown` fires.
pub async fn run_tunnel(
    target: TunnelTarget,
    config: Arc<EdgeConfig>,
    tls: Option<Arc<rustls::ClientConfig>>,
    context: Arc<EdgeContext>,
    shutdown: CancellationToken,
) {
    let initial = Duration::from_secs(config.reconnect_delay_secs);
    let max_delay = Duration::from_secs(config.reconnect_max_delay_secs);
    let mut delay = initial;
    let span = info_span!("edge_tunnel", tunnel = %target.name());

    loop {
        info!(parent: &span, server = %config.server, "connecting");
        let run = connect_and_run(&target, &config, tls.clone(), context.clone()).instrument(span.clone());
        let outcome = tokio::select! {
            () = shutdown.cancelled() => return,
            outcome = run => outcome,
        };
        match outcome {
            Ok(Disconnect::Closed) => {
                info!(parent: &span, "tunnel closed, reconnecting");
                delay = initial;
            }
            Ok(Disconnect::CloseConnect(reason)) => {
                warn!(parent: &span, "cloud refused tunnel: {reason}, reconnecting in {}s", delay.as_secs());
            }
            Err(e) => {
                warn!(parent: &span, "tunnel error: {e}, reconnecting in {}s", delay.as_secs());
            }
        }
        tokio::select! {
            () = shutdown.cancelled() => return,
            () = tokio::time::sleep(delay) => {}
        }
        delay = (delay * 2).min(max_delay);
    }
}

/// One connection attempt: handshake, then serve until the tunnel ends.
pub async fn connect_and_run(
    target: &TunnelTarget,
    config: &EdgeConfig,
    tls: Option<Arc<rustls::ClientConfig>>,
    context: Arc<EdgeContext>,
) -> Result<Disconnect> {
    let request = target.request(config)?;
    let limit = config.max_resp_body_length + MAX_HEADER_LEN;
    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(limit);
    ws_config.max_frame_size = Some(limit);

    let (ws, _response) = tokio_tungstenite::connect_async_tls_with_config(
        request,
        Some(ws_config),
        false,
        tls.map(Connector::Rustls),
    )
    .await
    .map_err(|e| TunnelError::Read(format!("handshake failed: {e}")))?;
    info!("tunnel established");

    let (tunnel, reader) = SafeTunnel::from_tungstenite(ws, config.max_resp_body_length);
    let session = EdgeSession::new(config.hostname_override.clone(), tunnel, context);
    session.serve(reader).await
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use axum::routing::get;
    use axum::Router;
    use bytes::Bytes;
    use http_body_util::{BodyExt, Empty};
    use hyper_util::client::legacy::Client;
    use hyper_util::rt::TokioExecutor;
    use tokio::net::TcpListener;

    use super::*;
    use crate::cloud::node::{RecordingPublisher, StaticPodNodeResolver};
    use crate::cloud::stream_server::StreamServer;
    use crate::cloud::tunnel_server::tests::{spawn_router, test_server, wait_session, MAX};
    use crate::config::CloudConfig;

    fn edge_config(server: String) -> EdgeConfig {
        EdgeConfig {
            server,
            hostname_override: "edge-1".to_string(),
            internal_ip: Some("10.0.0.5".to_string()),
            max_resp_body_length: MAX,
            ..EdgeConfig::default()
        }
    }

    #[test]
    fn test_primary_request_headers() {
        let mut config = edge_config("wss://cloud:10004/".to_string());
        config.internal_ip = None;
        let request = TunnelTarget::Primary.request(&config).unwrap();
        assert_eq!(request.uri().to_string(), "wss://cloud:10004/v1/kubeedge/connect");
        assert_eq!(request.headers()[SESSION_HOST_NAME_OVERRIDE], "edge-1");
        assert!(request.headers().get(SESSION_INTERNAL_IP).is_none());
    }

    #[test]
    fn test_video_request_url() {
        let target = TunnelTarget::Video(VideoEndpoint {
            ep: "cam-1".to_string(),
            url: "rtsp://10.0.0.9/live".to_string(),
        });
        let request = target.request(&edge_config("wss://cloud:10004".to_string())).unwrap();
        assert_eq!(
            request.uri().to_string(),
            "wss://cloud:10004/v1/kubeedge/videoconnect?ep=cam-1&url=rtsp%3A%2F%2F10.0.0.9%2Flive"
        );
        assert_eq!(request.headers()[SESSION_INTERNAL_IP], "10.0.0.5");
    }

    #[tokio::test]
    async fn test_logs_end_to_end() {
        // kubelet on the edge
        let kubelet = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let kubelet_port = kubelet.local_addr().unwrap().port();
        let router = Router::new().route("/containerLogs/ns1/pod1/c1", get(|| async { "line 1\nline 2\n" }));
        tokio::spawn(async move { axum::serve(kubelet, router).await.unwrap() });

        // cloud
        let tunnel = test_server(Arc::new(RecordingPublisher::default()));
        let registry = tunnel.registry().clone();
        let tunnel_addr = spawn_router(tunnel.router()).await;
        let config = CloudConfig {
            kubelet_port,
            ..CloudConfig::default()
        };
        let resolver = StaticPodNodeResolver::new(HashMap::from([("ns1/pod1".to_string(), "edge-1".to_string())]));
        let stream = StreamServer::new(&config, registry.clone(), Arc::new(resolver));
        let stream_addr = spawn_router(stream.router()).await;

        // edge
        let edge = Arc::new(edge_config(format!("ws://{tunnel_addr}")));
        let context = Arc::new(EdgeContext::new(&edge));
        let shutdown = CancellationToken::new();
        let client_task = tokio::spawn(run_tunnel(TunnelTarget::Primary, edge, None, context, shutdown.clone()));
        wait_session(&registry, "edge-1").await;

        let client = Client::builder(TokioExecutor::new()).build_http::<Empty<Bytes>>();
        let response = client
            .get(format!("http://{stream_addr}/containerLogs/ns1/pod1/c1").parse().unwrap())
            .await
            .unwrap();
        let body = tokio::time::timeout(Duration::from_secs(3), response.into_body().collect())
            .await
            .unwrap()
            .unwrap()
            .to_bytes();
        assert_eq!(body, "line 1\nline 2\n");

        shutdown.cancel();
        client_task.await.unwrap();
    }
}
