//! Logs and metrics: fetch the kubelet URL and stream the body back in
//! 256-byte DATA frames.

use axum::http::{header, HeaderValue, Method, Request, Uri};
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::body::Incoming;

use super::{EdgeRequest, HttpClient, READ_CHUNK};
use crate::error::{Result, TunnelError};

pub(super) fn upstream(e: impl std::fmt::Display) -> TunnelError {
    TunnelError::Upstream(e.to_string())
}

/// Build the upstream request. Metrics force identity encoding so the body
/// is relayed as the API server expects it.
fn build_request(request: &EdgeRequest, metrics: bool) -> Result<Request<Empty<Bytes>>> {
    let descriptor = &request.descriptor;
    let uri: Uri = descriptor.url.to_string().parse().map_err(upstream)?;
    let method = Method::from_bytes(descriptor.method.as_bytes()).map_err(upstream)?;
    let mut req = Request::builder()
        .method(method)
        .uri(uri)
        .body(Empty::new())
        .map_err(upstream)?;
    *req.headers_mut() = descriptor.header_map();
    if metrics {
        req.headers_mut()
            .insert(header::ACCEPT_ENCODING, HeaderValue::from_static("identity"));
    }
    Ok(req)
}

pub async fn serve(client: &HttpClient, request: &mut EdgeRequest, metrics: bool) -> Result<()> {
    let req = build_request(request, metrics)?;
    let response = tokio::select! {
        () = request.stop.cancelled() => return Ok(()),
        response = client.request(req) => response.map_err(upstream)?,
    };
    tracing::debug!(message_id = request.id, status = %response.status(), "upstream responded");
    relay_body(request, response.into_body()).await
}

/// Stream `body` back as DATA frames until it ends or the request stops.
pub(super) async fn relay_body(request: &mut EdgeRequest, mut body: Incoming) -> Result<()> {
    loop {
        tokio::select! {
            biased;
            () = request.stop.cancelled() => return Ok(()),
            frame = body.frame() => {
                let Some(frame) = frame else { return Ok(()) };
                let Ok(mut data) = frame.map_err(upstream)?.into_data() else { continue };
                while !data.is_empty() {
                    let chunk = data.split_to(data.len().min(READ_CHUNK));
                    request.send_data(chunk).await?;
                }
            }
            message = request.inbound.recv() => {
                // nothing flows toward a plain HTTP request
                if message.is_none() {
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;

    use axum::http::HeaderMap;
    use axum::routing::get;
    use axum::Router;
    use hyper_util::client::legacy::Client;
    use hyper_util::rt::TokioExecutor;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::stream::tunnel::memory_pair;
    use crate::stream::{ConnectDescriptor, Message, MessageType, TargetUrl, TunnelReader};

    async fn kubelet(router: Router) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
        addr
    }

    /// Request `id` for `http://{addr}{path}`, plus the cloud end of its tunnel.
    async fn edge_request(addr: SocketAddr, path: &str, id: u64) -> (EdgeRequest, TunnelReader, mpsc::Sender<Message>) {
        let ((_cloud_tunnel, cloud_reader), (edge_tunnel, _)) = memory_pair(1 << 20).await;
        let (tx, inbound) = mpsc::channel(8);
        let uri: Uri = path.parse().unwrap();
        let mut descriptor = ConnectDescriptor::new(
            &Method::GET,
            TargetUrl::from_uri(&uri, "http", &addr.to_string()),
            &HeaderMap::new(),
        );
        descriptor.message_id = id;
        let request = EdgeRequest {
            id,
            descriptor,
            tunnel: Arc::new(edge_tunnel),
            inbound,
            stop: CancellationToken::new(),
        };
        (request, cloud_reader, tx)
    }

    fn client() -> HttpClient {
        Client::builder(TokioExecutor::new()).build_http()
    }

    async fn collect(reader: &mut TunnelReader, id: u64, len: usize) -> Vec<u8> {
        let mut received = Vec::new();
        while received.len() < len {
            let msg = reader.next_message().await.unwrap();
            assert_eq!(msg.message_type, MessageType::Data);
            assert_eq!(msg.connect_id, id);
            assert!(msg.data.len() <= READ_CHUNK);
            received.extend_from_slice(&msg.data);
        }
        received
    }

    #[tokio::test]
    async fn test_body_streamed_in_small_chunks() {
        let body = "x".repeat(1000);
        let served = body.clone();
        let addr = kubelet(Router::new().route(
            "/containerLogs/ns1/pod1/c1",
            get(move || async move { served }),
        ))
        .await;

        let (mut request, mut cloud_reader, _tx) = edge_request(addr, "/containerLogs/ns1/pod1/c1", 4).await;
        serve(&client(), &mut request, false).await.unwrap();
        assert_eq!(collect(&mut cloud_reader, 4, body.len()).await, body.as_bytes());
    }

    #[tokio::test]
    async fn test_metrics_force_identity_encoding() {
        let addr = kubelet(Router::new().route(
            "/metrics/cadvisor",
            get(|headers: HeaderMap| async move {
                headers
                    .get(header::ACCEPT_ENCODING)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("none")
                    .to_string()
            }),
        ))
        .await;

        let (mut request, mut cloud_reader, _tx) = edge_request(addr, "/metrics/cadvisor", 9).await;
        request
            .descriptor
            .header
            .insert("Accept-Encoding".to_string(), vec!["gzip".to_string()]);
        serve(&client(), &mut request, true).await.unwrap();
        assert_eq!(collect(&mut cloud_reader, 9, "identity".len()).await, b"identity");
    }

    #[tokio::test]
    async fn test_stop_ends_a_stalled_request() {
        // accepts but never answers
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _hold = tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            std::future::pending::<()>().await;
        });

        let (mut request, _cloud_reader, _tx) = edge_request(addr, "/containerLogs/ns1/pod1/c1", 2).await;
        let stop = request.stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            stop.cancel();
        });
        tokio::time::timeout(std::time::Duration::from_secs(1), serve(&client(), &mut request, false))
            .await
            .unwrap()
            .unwrap();
    }
}
