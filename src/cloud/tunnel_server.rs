//! Tunnel server: edge-facing WebSocket endpoints.
//!
//! - `/v1/kubeedge/connect`: primary tunnel. The edge names itself with the
//!   `SessionHostNameOverride` header and optionally `SessionInternalIP`.
//! - `/v1/kubeedge/videoconnect?ep=&url=`: auxiliary tunnel carrying the
//!   video stream of one endpoint.
//!
//! Every accepted tunnel becomes a [`Session`] registered under the node name
//! and its internal IP (video tunnels: under the endpoint name). A new
//! handshake for a registered key closes the previous session first.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{ConnectInfo, Query, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde::Deserialize;
use tokio::sync::RwLock;
use tower_http::trace::TraceLayer;
use tracing::{error, info, info_span, warn, Instrument};

use super::node::{publish_kubelet_port, NodeStatusPublisher};
use super::session::Session;
use crate::config::CloudConfig;
use crate::stream::message::MAX_HEADER_LEN;
use crate::stream::{
    Message, SafeTunnel, TunnelReader, CONNECT_PATH, SESSION_HOST_NAME_OVERRIDE, SESSION_INTERNAL_IP,
    VIDEO_CONNECT_PATH,
};

/// Live sessions keyed by node name, internal IP or video endpoint, plus the
/// node name → internal IP table.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, Arc<Session>>>>,
    node_ips: Arc<RwLock<HashMap<String, String>>>,
}

impl SessionRegistry {
    /// Register `session` under `key`. A different session previously stored
    /// under the key is closed.
    pub async fn add_session(&self, key: &str, session: Arc<Session>) {
        let previous = self.sessions.write().await.insert(key.to_string(), session.clone());
        if let Some(previous) = previous {
            if !Arc::ptr_eq(&previous, &session) {
                warn!(key = %key, "replacing existing session, closing the old one");
                previous.close().await;
            }
        }
    }

    pub async fn get_session(&self, key: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(key).cloned()
    }

    /// Remove `key` only if it still maps to `session`.
    pub async fn remove_session(&self, key: &str, session: &Arc<Session>) {
        let mut sessions = self.sessions.write().await;
        if sessions.get(key).is_some_and(|s| Arc::ptr_eq(s, session)) {
            sessions.remove(key);
        }
    }

    pub async fn add_node_ip(&self, node: &str, ip: &str) {
        self.node_ips.write().await.insert(node.to_string(), ip.to_string());
    }

    pub async fn get_node_ip(&self, node: &str) -> Option<String> {
        self.node_ips.read().await.get(node).cloned()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Close every session (shutdown).
    pub async fn close_all(&self) {
        let sessions: Vec<Arc<Session>> = self.sessions.write().await.drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.close().await;
        }
    }
}

/// State shared by the tunnel handlers.
#[derive(Clone)]
pub struct TunnelServer {
    registry: SessionRegistry,
    publisher: Arc<dyn NodeStatusPublisher>,
    tunnel_port: u16,
    publish: bool,
    publish_interval: Duration,
    publish_timeout: Duration,
    max_payload: usize,
}

impl TunnelServer {
    pub fn new(config: &CloudConfig, registry: SessionRegistry, publisher: Arc<dyn NodeStatusPublisher>) -> Self {
        Self {
            registry,
            publisher,
            tunnel_port: config.published_tunnel_port(),
            publish: config.node_status_publish,
            publish_interval: Duration::from_secs(config.node_status_retry_secs),
            publish_timeout: Duration::from_secs(config.node_status_timeout_secs),
            max_payload: config.max_resp_body_length,
        }
    }

    /// Override the node-status polling cadence.
    #[must_use]
    pub fn with_publish_timing(mut self, interval: Duration, timeout: Duration) -> Self {
        self.publish_interval = interval;
        self.publish_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn router(self) -> Router {
        Router::new()
            .route(CONNECT_PATH, get(connect))
            .route(VIDEO_CONNECT_PATH, get(video_connect))
            .layer(TraceLayer::new_for_http())
            .with_state(self)
    }

    fn upgrade(&self, ws: WebSocketUpgrade) -> WebSocketUpgrade {
        let limit = self.max_payload + MAX_HEADER_LEN;
        ws.max_message_size(limit).max_frame_size(limit)
    }

    async fn run_tunnel(self, tunnel: SafeTunnel, reader: TunnelReader, node: String, internal_ip: String) {
        let session = Session::new(node.clone(), tunnel, None);

        if self.publish {
            if let Err(e) = publish_kubelet_port(
                self.publisher.as_ref(),
                &node,
                self.tunnel_port,
                self.publish_interval,
                self.publish_timeout,
            )
            .await
            {
                error!(node = %node, "{e}");
                if let Err(e) = session.write_message_to_tunnel(&Message::close(&e.to_string())).await {
                    warn!(node = %node, "failed to send CLOSE_CONNECT: {e}");
                }
                session.close().await;
                return;
            }
        }

        self.registry.add_session(&node, session.clone()).await;
        self.registry.add_session(&internal_ip, session.clone()).await;
        self.registry.add_node_ip(&node, &internal_ip).await;
        info!(node = %node, internal_ip = %internal_ip, "tunnel session established");

        session.clone().serve(reader).await;

        self.registry.remove_session(&node, &session).await;
        self.registry.remove_session(&internal_ip, &session).await;
        info!(node = %node, "tunnel session ended");
    }
}

/// `GET /v1/kubeedge/connect`: primary edge tunnel.
async fn connect(
    State(server): State<TunnelServer>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(node) = header_str(&headers, SESSION_HOST_NAME_OVERRIDE) else {
        return (
            StatusCode::BAD_REQUEST,
            format!("missing {SESSION_HOST_NAME_OVERRIDE} header"),
        )
            .into_response();
    };
    let internal_ip = header_str(&headers, SESSION_INTERNAL_IP).unwrap_or_else(|| remote.ip().to_string());
    info!(node = %node, internal_ip = %internal_ip, "edge connecting");

    let max_payload = server.max_payload;
    server.upgrade(ws).on_upgrade(move |socket| {
        let (tunnel, reader) = SafeTunnel::from_axum(socket, max_payload);
        let span = info_span!("tunnel_session", node = %node);
        server.run_tunnel(tunnel, reader, node, internal_ip).instrument(span)
    })
}

/// Query params for the video tunnel.
#[derive(Deserialize)]
struct VideoConnectQuery {
    ep: String,
    url: String,
}

/// `GET /v1/kubeedge/videoconnect?ep=<endpoint>&url=<rtsp>`: video tunnel.
async fn video_connect(
    State(server): State<TunnelServer>,
    Query(query): Query<VideoConnectQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    if query.ep.is_empty() {
        return (StatusCode::BAD_REQUEST, "missing ep").into_response();
    }
    info!(endpoint = %query.ep, "video tunnel connecting");

    let max_payload = server.max_payload;
    server.upgrade(ws).on_upgrade(move |socket| {
        let span = info_span!("video_session", endpoint = %query.ep);
        async move {
            let (tunnel, reader) = SafeTunnel::from_axum(socket, max_payload);
            let session = Session::new(query.ep.clone(), tunnel, Some(query.url));
            server.registry.add_session(&query.ep, session.clone()).await;
            info!("video tunnel established");
            session.clone().serve(reader).await;
            server.registry.remove_session(&query.ep, &session).await;
            info!("video tunnel ended");
        }
        .instrument(span)
    })
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
