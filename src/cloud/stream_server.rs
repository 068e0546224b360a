//! Stream server: API-server-facing routes.
//!
//! Each request is mapped to the tunnel session of the node that serves it,
//! registered there as a request connection and relayed over the tunnel.
//! Admission failures answer `500` with the error text.

use std::sync::Arc;

use axum::{
    extract::{Path, Request, State, WebSocketUpgrade},
    http::{header, HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use hyper::upgrade::OnUpgrade;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use super::connection::exec::{exec_descriptor, is_upgrade_request, upgrade_response};
use super::connection::logs::{logs_descriptor, metrics_descriptor, stream_response};
use super::connection::video::{serve_video, VideoSessions};
use super::connection::ConnectionKind;
use super::node::PodNodeResolver;
use super::session::Session;
use super::tunnel_server::SessionRegistry;
use crate::config::{CloudConfig, SessionKeyMode};
use crate::error::{Result, TunnelError};
use crate::stream::{ConnectDescriptor, TargetUrl};
use crate::util::split_host_port;

/// Header set by the API server's node proxy: `/api/v1/nodes/{node}/proxy/...`.
pub const X_FORWARDED_URI: &str = "X-Forwarded-Uri";

/// State shared by the stream handlers.
#[derive(Clone)]
pub struct StreamServer {
    registry: SessionRegistry,
    videos: VideoSessions,
    resolver: Arc<dyn PodNodeResolver>,
    session_key: SessionKeyMode,
    kubelet_port: u16,
}

impl StreamServer {
    pub fn new(config: &CloudConfig, registry: SessionRegistry, resolver: Arc<dyn PodNodeResolver>) -> Self {
        Self {
            registry,
            videos: VideoSessions::default(),
            resolver,
            session_key: config.session_key,
            kubelet_port: config.kubelet_port,
        }
    }

    pub fn videos(&self) -> &VideoSessions {
        &self.videos
    }

    pub fn router(self) -> Router {
        Router::new()
            .route("/containerLogs/{ns}/{pod}/{container}", get(container_logs))
            .route("/exec/{ns}/{pod}/{container}", get(exec).post(exec))
            .route("/exec/{ns}/{pod}/{uid}/{container}", get(exec).post(exec))
            .route("/attach/{ns}/{pod}/{container}", get(attach).post(attach))
            .route("/attach/{ns}/{pod}/{uid}/{container}", get(attach).post(attach))
            .route("/stats", get(metrics))
            .route("/stats/summary", get(metrics))
            .route("/stats/container", get(metrics))
            .route("/stats/{pod}/{container}", get(metrics))
            .route("/stats/{ns}/{pod}/{uid}/{container}", get(metrics))
            .route("/metrics", get(metrics))
            .route("/metrics/cadvisor", get(metrics))
            .route("/metrics/probes", get(metrics))
            .route("/metrics/resource", get(metrics))
            .route("/video/{endpoint}", get(video))
            .layer(TraceLayer::new_for_http())
            .with_state(self)
    }

    async fn lookup(&self, key: &str) -> Result<Arc<Session>> {
        let session = self
            .registry
            .get_session(key)
            .await
            .ok_or_else(|| TunnelError::NotFound(format!("tunnel session for {key}")))?;
        if session.is_closed().await {
            return Err(TunnelError::SessionClosed(key.to_string()));
        }
        Ok(session)
    }

    /// Session for a pod-scoped route (logs, exec, attach).
    async fn pod_session(&self, uri: &Uri, headers: &HeaderMap) -> Result<Arc<Session>> {
        let key = match self.session_key {
            SessionKeyMode::Pod => {
                let (namespace, pod) = get_session_key(uri.path())?;
                self.resolver.node_name_for(namespace, pod).await?
            }
            SessionKeyMode::Host => request_hostname(uri, headers)
                .ok_or_else(|| TunnelError::NotFound("Host header".to_string()))?
                .to_string(),
        };
        self.lookup(&key).await
    }

    async fn upgrade(&self, kind: ConnectionKind, mut req: Request) -> Result<Response> {
        let session = self.pod_session(req.uri(), req.headers()).await?;
        if !is_upgrade_request(req.headers()) {
            return Err(TunnelError::UpgradeRequired);
        }
        let on_upgrade = req
            .extensions_mut()
            .remove::<OnUpgrade>()
            .ok_or_else(|| TunnelError::HijackFailed("connection does not support upgrades".to_string()))?;
        let descriptor = exec_descriptor(req.method(), req.uri(), req.headers(), self.kubelet_port);
        upgrade_response(session, kind, descriptor, on_upgrade).await
    }
}

/// `(namespace, pod)` from `/{kind}/{ns}/{pod}/...`.
pub fn get_session_key(path: &str) -> Result<(&str, &str)> {
    let mut params = path.split('/').filter(|s| !s.is_empty()).skip(1);
    match (params.next(), params.next()) {
        (Some(namespace), Some(pod)) => Ok((namespace, pod)),
        _ => Err(TunnelError::PodNameMissing),
    }
}

/// Hostname of the request target, without the port.
fn request_hostname<'a>(uri: &'a Uri, headers: &'a HeaderMap) -> Option<&'a str> {
    let authority = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| uri.authority().map(|a| a.as_str()))?;
    let host = split_host_port(authority).0;
    (!host.is_empty()).then_some(host)
}

/// Session key for metrics: the node named by `X-Forwarded-Uri`, else the
/// request hostname.
pub fn metrics_session_key(uri: &Uri, headers: &HeaderMap) -> Option<String> {
    let forwarded = headers.get(X_FORWARDED_URI).and_then(|v| v.to_str().ok());
    if let Some(forwarded) = forwarded {
        let parts: Vec<&str> = forwarded.trim_start_matches('/').split('/').collect();
        if let ["api", "v1", "nodes", node, "proxy", ..] = parts.as_slice() {
            if !node.is_empty() {
                return Some((*node).to_string());
            }
        }
    }
    request_hostname(uri, headers).map(str::to_string)
}

fn internal_error(kind: ConnectionKind, e: &TunnelError) -> Response {
    warn!(kind = kind.as_str(), "request refused: {e}");
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
}

/// `GET /containerLogs/{ns}/{pod}/{container}`
async fn container_logs(
    State(server): State<StreamServer>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let result = async {
        let session = server.pod_session(&uri, &headers).await?;
        let descriptor = logs_descriptor(&method, &uri, &headers, server.kubelet_port);
        stream_response(session, ConnectionKind::Logs, descriptor).await
    }
    .await;
    result.unwrap_or_else(|e| internal_error(ConnectionKind::Logs, &e))
}

/// `GET|POST /exec/{ns}/{pod}[/{uid}]/{container}`
async fn exec(State(server): State<StreamServer>, req: Request) -> Response {
    server
        .upgrade(ConnectionKind::Exec, req)
        .await
        .unwrap_or_else(|e| internal_error(ConnectionKind::Exec, &e))
}

/// `GET|POST /attach/{ns}/{pod}[/{uid}]/{container}`
async fn attach(State(server): State<StreamServer>, req: Request) -> Response {
    server
        .upgrade(ConnectionKind::Attach, req)
        .await
        .unwrap_or_else(|e| internal_error(ConnectionKind::Attach, &e))
}

/// `GET /stats[...]`, `GET /metrics[...]`
async fn metrics(State(server): State<StreamServer>, method: Method, uri: Uri, headers: HeaderMap) -> Response {
    let result = async {
        let key = metrics_session_key(&uri, &headers)
            .ok_or_else(|| TunnelError::NotFound("node name for metrics request".to_string()))?;
        let session = server.lookup(&key).await?;
        let host = headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .or_else(|| uri.authority().map(|a| a.as_str()))
            .unwrap_or_default();
        let descriptor = metrics_descriptor(&method, &uri, &headers, host, server.kubelet_port);
        stream_response(session, ConnectionKind::Metrics, descriptor).await
    }
    .await;
    result.unwrap_or_else(|e| internal_error(ConnectionKind::Metrics, &e))
}

/// `GET /video/{endpoint}`, a WebSocket whose binary frames carry the stream.
async fn video(
    State(server): State<StreamServer>,
    Path(endpoint): Path<String>,
    uri: Uri,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let session = match server.lookup(&endpoint).await {
        Ok(session) => session,
        Err(e) => return internal_error(ConnectionKind::Video, &e),
    };
    let host = request_hostname(&uri, &headers).unwrap_or_default().to_string();
    let descriptor = ConnectDescriptor::new(&Method::GET, TargetUrl::from_uri(&uri, "http", &host), &HeaderMap::new());
    debug!(endpoint = %endpoint, session = %session.id(), "video client connecting");

    let videos = server.videos.clone();
    ws.on_upgrade(move |socket| serve_video(videos, session, endpoint, descriptor, socket))
}
