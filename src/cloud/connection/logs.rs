//! Logs and metrics: the edge fetches the kubelet endpoint and streams the
//! body back; the cloud relays it as a chunked HTTP response.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::Response;
use bytes::Bytes;
use futures::stream;
use tokio::sync::mpsc;
use tracing::info;

use super::{ApiServerConnection, ApiServerSink, ConnectionKind, SINK_BUFFER};
use crate::cloud::session::Session;
use crate::error::Result;
use crate::stream::{ConnectDescriptor, TargetUrl};
use crate::util::split_host_port;

/// Descriptor for a logs request: plain HTTP to the local kubelet port.
pub fn logs_descriptor(method: &Method, uri: &Uri, headers: &HeaderMap, kubelet_port: u16) -> ConnectDescriptor {
    let url = TargetUrl::from_uri(uri, "http", &format!("127.0.0.1:{kubelet_port}"));
    ConnectDescriptor::new(method, url, headers)
}

/// Descriptor for a metrics request. The port comes from the request's own
/// `Host`, falling back to `default_port`.
pub fn metrics_descriptor(
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    host: &str,
    default_port: u16,
) -> ConnectDescriptor {
    let port = split_host_port(host).1.unwrap_or(default_port);
    let url = TargetUrl::from_uri(uri, "http", &format!("127.0.0.1:{port}"));
    ConnectDescriptor::new(method, url, headers)
}

/// Register a logs or metrics request on `session`, send its CONNECT frame and
/// return a `200 OK` response whose chunked body carries the edge's DATA.
///
/// The request is served on a background task: it ends when the response
/// body is dropped (client gone) or when the edge sends REMOVE_CONNECT.
pub async fn stream_response(
    session: Arc<Session>,
    kind: ConnectionKind,
    descriptor: ConnectDescriptor,
) -> Result<Response> {
    let (tx, rx) = mpsc::channel::<Bytes>(SINK_BUFFER);
    let conn = ApiServerConnection::new(kind, &session, descriptor, ApiServerSink::stream(tx.clone()));
    let conn = session.add_request(conn).await?;
    let message_id = conn.message_id();

    if let Err(e) = conn.send_connection().await {
        session.delete_request(message_id).await;
        return Err(e);
    }

    tokio::spawn(async move {
        let termination = conn.serve(async move { tx.closed().await }).await;
        session.delete_request(message_id).await;
        info!(
            session = %session.id(),
            message_id,
            kind = kind.as_str(),
            ?termination,
            "request done"
        );
    });

    let body = Body::from_stream(stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (Ok::<_, Infallible>(chunk), rx))
    }));
    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    Ok(response)
}
