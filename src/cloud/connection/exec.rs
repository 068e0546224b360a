//! Exec and attach: full-duplex upgraded streams.
//!
//! The edge dials the kubelet, performs the upgrade handshake there and pumps
//! the raw response back: first the response head, then the stream. The cloud
//! buffers DATA until the head is complete, answers the API server with the
//! same status and headers, and on `101 Switching Protocols` pumps the
//! upgraded connection in both directions.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::Response;
use bytes::{Bytes, BytesMut};
use futures::{stream, StreamExt};
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::{ApiServerConnection, ApiServerSink, ConnectionKind, Termination, SINK_BUFFER};
use crate::cloud::session::Session;
use crate::error::{Result, TunnelError};
use crate::stream::{ConnectDescriptor, Message, TargetUrl};

/// Read size for API-server to tunnel copies.
const READ_BUFFER: usize = 256;

/// Upper bound on a relayed response head.
const MAX_HEAD_LEN: usize = 64 * 1024;

const MAX_HEADERS: usize = 64;

pub fn exec_descriptor(method: &Method, uri: &Uri, headers: &HeaderMap, kubelet_port: u16) -> ConnectDescriptor {
    let url = TargetUrl::from_uri(uri, "http", &format!("127.0.0.1:{kubelet_port}"));
    ConnectDescriptor::new(method, url, headers)
}

/// Whether `headers` ask for a connection upgrade (`Connection: upgrade`).
pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
}

/// Register an exec or attach request, relay the edge's handshake response
/// and, once the API server's connection is upgraded, pump bytes both ways.
pub async fn upgrade_response(
    session: Arc<Session>,
    kind: ConnectionKind,
    descriptor: ConnectDescriptor,
    on_upgrade: OnUpgrade,
) -> Result<Response> {
    let (tx, rx) = mpsc::channel::<Bytes>(SINK_BUFFER);
    let conn = ApiServerConnection::new(kind, &session, descriptor, ApiServerSink::stream(tx.clone()));
    let conn = session.add_request(conn).await?;

    if let Err(e) = conn.send_connection().await {
        session.delete_request(conn.message_id()).await;
        return Err(e);
    }

    // The relay outlives this handler: the request is cleaned up even if the
    // API server disconnects before the handshake completes.
    let (response_tx, response_rx) = oneshot::channel();
    tokio::spawn(relay(session, conn, tx, rx, on_upgrade, response_tx));
    response_rx
        .await
        .map_err(|_| TunnelError::HijackFailed("relay ended before the handshake".to_string()))?
}

async fn relay(
    session: Arc<Session>,
    conn: Arc<ApiServerConnection>,
    watch: mpsc::Sender<Bytes>,
    mut rx: mpsc::Receiver<Bytes>,
    on_upgrade: OnUpgrade,
    response_tx: oneshot::Sender<Result<Response>>,
) {
    let message_id = conn.message_id();
    let termination = match read_head(&mut rx).await {
        Err(e) => {
            let _ = response_tx.send(Err(e));
            Termination::EdgePeerDone
        }
        Ok((status, headers, rest)) if status == StatusCode::SWITCHING_PROTOCOLS => {
            drop(watch);
            let mut response = Response::new(Body::empty());
            *response.status_mut() = status;
            *response.headers_mut() = headers;
            if response_tx.send(Ok(response)).is_err() {
                Termination::ClientGone
            } else {
                match on_upgrade.await {
                    Ok(upgraded) => pump(&conn, TokioIo::new(upgraded), rest, rx).await,
                    Err(e) => {
                        warn!(message_id, "api-server upgrade failed: {e}");
                        Termination::ClientGone
                    }
                }
            }
        }
        Ok((status, mut headers, rest)) => {
            debug!(message_id, %status, "edge refused upgrade");
            headers.remove(header::TRANSFER_ENCODING);
            headers.remove(header::CONNECTION);
            let body = Body::from_stream(stream::once(async move { Ok::<_, Infallible>(rest) }).chain(
                stream::unfold(rx, |mut rx| async move {
                    rx.recv().await.map(|chunk| (Ok::<_, Infallible>(chunk), rx))
                }),
            ));
            let mut response = Response::new(body);
            *response.status_mut() = status;
            *response.headers_mut() = headers;
            if response_tx.send(Ok(response)).is_err() {
                conn.finish(Termination::ClientGone).await;
                session.delete_request(message_id).await;
                return;
            }
            let termination = conn.serve(async move { watch.closed().await }).await;
            session.delete_request(message_id).await;
            info!(session = %session.id(), message_id, ?termination, "request done");
            return;
        }
    };

    conn.finish(termination).await;
    session.delete_request(message_id).await;
    info!(
        session = %session.id(),
        message_id,
        kind = conn.kind().as_str(),
        ?termination,
        "request done"
    );
}

/// Copy between the upgraded API-server connection and the tunnel until
/// either side finishes.
async fn pump<T>(
    conn: &ApiServerConnection,
    io: T,
    rest: Bytes,
    mut rx: mpsc::Receiver<Bytes>,
) -> Termination
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite,
{
    let message_id = conn.message_id();
    let (mut reader, mut writer) = tokio::io::split(io);

    let outbound = async {
        let mut buf = [0u8; READ_BUFFER];
        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!(message_id, "api-server read ended: {e}");
                    break;
                }
            };
            let message = Message::data(message_id, Bytes::copy_from_slice(&buf[..n]));
            if let Err(e) = conn.write_to_tunnel(&message).await {
                warn!(message_id, "tunnel write failed: {e}");
                break;
            }
        }
    };

    let inbound = async {
        if !rest.is_empty() && writer.write_all(&rest).await.is_err() {
            return Termination::ClientGone;
        }
        while let Some(chunk) = rx.recv().await {
            if let Err(e) = writer.write_all(&chunk).await {
                debug!(message_id, "api-server write ended: {e}");
                return Termination::ClientGone;
            }
        }
        let _ = writer.shutdown().await;
        Termination::EdgePeerDone
    };

    tokio::select! {
        biased;
        () = outbound => Termination::ClientGone,
        termination = inbound => termination,
    }
}

/// Collect DATA until the end of the response head. Returns the parsed head
/// and whatever followed it.
async fn read_head(rx: &mut mpsc::Receiver<Bytes>) -> Result<(StatusCode, HeaderMap, Bytes)> {
    let mut buf = BytesMut::new();
    loop {
        let Some(chunk) = rx.recv().await else {
            return Err(TunnelError::HijackFailed(
                "edge closed the stream before responding".to_string(),
            ));
        };
        buf.extend_from_slice(&chunk);
        if let Some((status, headers, len)) = parse_head(&buf)? {
            let rest = buf.split_off(len).freeze();
            return Ok((status, headers, rest));
        }
        if buf.len() > MAX_HEAD_LEN {
            return Err(TunnelError::HijackFailed("response head too large".to_string()));
        }
    }
}

/// Parse a response head with httparse. `None` until the head is complete;
/// otherwise the status, the headers and the head's length in bytes.
fn parse_head(buf: &[u8]) -> Result<Option<(StatusCode, HeaderMap, usize)>> {
    let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut slots);
    let len = match response.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => return Err(TunnelError::HijackFailed(format!("bad response head: {e}"))),
    };
    let status = response
        .code
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| TunnelError::HijackFailed("bad response status".to_string()))?;

    let mut headers = HeaderMap::with_capacity(response.headers.len());
    for h in response.headers.iter() {
        let name = HeaderName::from_bytes(h.name.as_bytes())
            .map_err(|e| TunnelError::HijackFailed(format!("bad header name {}: {e}", h.name)))?;
        let value = HeaderValue::from_bytes(h.value)
            .map_err(|e| TunnelError::HijackFailed(format!("bad value for {}: {e}", h.name)))?;
        headers.append(name, value);
    }
    Ok(Some((status, headers, len)))
}
