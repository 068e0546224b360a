//! Per-request connections on the cloud side.
//!
//! One [`ApiServerConnection`] exists per in-flight API-server request. It
//! owns the request's message ID, the CONNECT descriptor, the edge-peer-done
//! signal and the client-facing sink. Variant-specific behavior is selected by
//! [`ConnectionKind`] and by the [`ApiServerSink`] tag:
//!
//! - `logs`: chunked HTTP bodies (logs, metrics)
//! - `exec`: upgraded byte streams (exec, attach)
//! - `video`: WebSocket fan-out (video)

pub mod exec;
pub mod logs;
pub mod video;

use std::future::Future;
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use self::video::VideoFanout;
use super::session::Session;
use crate::error::{Result, TunnelError};
use crate::stream::{send_remove_connect, ConnectDescriptor, Message, MessageType, SafeTunnel};

/// Channel depth between the session reader and a streaming sink.
pub const SINK_BUFFER: usize = 64;

/// Streaming request kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    Logs,
    Metrics,
    Exec,
    Attach,
    Video,
}

impl ConnectionKind {
    pub fn message_type(self) -> MessageType {
        match self {
            Self::Logs => MessageType::LogsConnect,
            Self::Metrics => MessageType::MetricConnect,
            Self::Exec => MessageType::ExecConnect,
            Self::Attach => MessageType::AttachConnect,
            Self::Video => MessageType::VideoConnect,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Logs => "logs",
            Self::Metrics => "metrics",
            Self::Exec => "exec",
            Self::Attach => "attach",
            Self::Video => "video",
        }
    }
}

/// Why `serve` returned. Both are normal endings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The API-server side went away.
    ClientGone,
    /// The edge sent REMOVE_CONNECT, or the session closed.
    EdgePeerDone,
}

/// Where inbound DATA for a request is delivered.
pub enum ApiServerSink {
    /// Ordered byte stream consumed by a response body or an upgraded socket.
    /// Taking the sender out closes the stream once buffered bytes drain.
    Stream(std::sync::Mutex<Option<mpsc::Sender<Bytes>>>),
    /// Set of WebSocket subscribers watching one video endpoint.
    Video(VideoFanout),
}

impl ApiServerSink {
    pub fn stream(tx: mpsc::Sender<Bytes>) -> Self {
        Self::Stream(std::sync::Mutex::new(Some(tx)))
    }

    fn sender(&self) -> Option<mpsc::Sender<Bytes>> {
        match self {
            Self::Stream(slot) => lock(slot).clone(),
            Self::Video(_) => None,
        }
    }

    fn close(&self) {
        match self {
            Self::Stream(slot) => {
                lock(slot).take();
            }
            Self::Video(fanout) => fanout.shut(),
        }
    }
}

fn lock<T>(m: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// One API-server request multiplexed over a session's tunnel.
pub struct ApiServerConnection {
    kind: ConnectionKind,
    message_id: OnceLock<u64>,
    session_id: String,
    tunnel: Arc<SafeTunnel>,
    descriptor: ConnectDescriptor,
    done: CancellationToken,
    sink: ApiServerSink,
}

impl ApiServerConnection {
    pub fn new(
        kind: ConnectionKind,
        session: &Session,
        descriptor: ConnectDescriptor,
        sink: ApiServerSink,
    ) -> Self {
        Self {
            kind,
            message_id: OnceLock::new(),
            session_id: session.id().to_string(),
            tunnel: session.tunnel(),
            descriptor,
            done: CancellationToken::new(),
            sink,
        }
    }

    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Zero until the session assigns an ID.
    pub fn message_id(&self) -> u64 {
        self.message_id.get().copied().unwrap_or_default()
    }

    /// Assign the message ID. Only the first call has an effect.
    pub fn set_message_id(&self, id: u64) {
        let _ = self.message_id.set(id);
    }

    /// Serialize the descriptor with this request's ID and write the CONNECT
    /// frame of this request's kind.
    pub async fn send_connection(&self) -> Result<ConnectDescriptor> {
        let mut descriptor = self.descriptor.clone();
        descriptor.message_id = self.message_id();
        let message = descriptor.to_message(self.kind.message_type())?;
        self.write_to_tunnel(&message).await?;
        debug!(
            session = %self.session_id,
            message_id = descriptor.message_id,
            kind = self.kind.as_str(),
            "sent {} for {}",
            self.kind.message_type(),
            descriptor.url
        );
        Ok(descriptor)
    }

    pub async fn write_to_tunnel(&self, message: &Message) -> Result<()> {
        self.tunnel.write_message(message).await
    }

    /// Deliver inbound DATA to the client sink. Returns the bytes accepted.
    pub async fn write_to_api_server(&self, data: Bytes) -> Result<usize> {
        let len = data.len();
        match &self.sink {
            ApiServerSink::Stream(_) => {
                let tx = self.sender_or_closed()?;
                tx.send(data)
                    .await
                    .map_err(|_| TunnelError::Write("api-server client is gone".to_string()))?;
                Ok(len)
            }
            ApiServerSink::Video(fanout) => Ok(fanout.write(data).await),
        }
    }

    fn sender_or_closed(&self) -> Result<mpsc::Sender<Bytes>> {
        self.sink
            .sender()
            .ok_or_else(|| TunnelError::Write("api-server sink is closed".to_string()))
    }

    /// Signal that the edge has finished with this request. Safe to call any
    /// number of times; closes the sink so buffered bytes drain and end.
    pub fn set_edge_peer_done(&self) {
        self.done.cancel();
        self.sink.close();
    }

    /// Resolves once [`set_edge_peer_done`](Self::set_edge_peer_done) has run.
    pub async fn edge_peer_done(&self) {
        self.done.cancelled().await;
    }

    pub fn is_edge_peer_done(&self) -> bool {
        self.done.is_cancelled()
    }

    /// The video fan-out, if this is a video request.
    pub fn fanout(&self) -> Option<&VideoFanout> {
        match &self.sink {
            ApiServerSink::Video(fanout) => Some(fanout),
            ApiServerSink::Stream(_) => None,
        }
    }

    /// Wait until the client goes away or the edge is done, then close the
    /// sink and tell the edge to stop. A ready client wins over a ready edge.
    pub async fn serve(&self, client_gone: impl Future<Output = ()>) -> Termination {
        let termination = tokio::select! {
            biased;
            () = client_gone => Termination::ClientGone,
            () = self.done.cancelled() => Termination::EdgePeerDone,
        };
        self.finish(termination).await;
        termination
    }

    /// Close the sink and send REMOVE_CONNECT (retry x3).
    pub async fn finish(&self, termination: Termination) {
        self.sink.close();
        debug!(
            session = %self.session_id,
            message_id = self.message_id(),
            kind = self.kind.as_str(),
            ?termination,
            "request finished"
        );
        send_remove_connect(&self.tunnel, self.message_id()).await;
    }
}

impl std::fmt::Debug for ApiServerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiServerConnection")
            .field("kind", &self.kind)
            .field("message_id", &self.message_id())
            .field("session_id", &self.session_id)
            .field("done", &self.is_edge_peer_done())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::http::{HeaderMap, Method, Uri};

    use super::*;
    use crate::stream::tunnel::memory_pair;
    use crate::stream::TargetUrl;

    fn descriptor(path: &str) -> ConnectDescriptor {
        let uri: Uri = path.parse().unwrap();
        ConnectDescriptor::new(
            &Method::GET,
            TargetUrl::from_uri(&uri, "http", "127.0.0.1:10350"),
            &HeaderMap::new(),
        )
    }

    #[tokio::test]
    async fn test_send_connection_uses_assigned_id() {
        let ((tunnel, _), (_, mut edge)) = memory_pair(1 << 16).await;
        let session = Session::new("node-a", tunnel, None);
        let (tx, _rx) = mpsc::channel(SINK_BUFFER);
        let conn = ApiServerConnection::new(
            ConnectionKind::Metrics,
            &session,
            descriptor("/metrics"),
            ApiServerSink::stream(tx),
        );
        conn.set_message_id(7);
        conn.set_message_id(8);
        assert_eq!(conn.message_id(), 7);

        let sent = conn.send_connection().await.unwrap();
        assert_eq!(sent.message_id, 7);
        let msg = edge.next_message().await.unwrap();
        assert_eq!(msg.connect_id, 7);
        assert_eq!(msg.message_type, MessageType::MetricConnect);
        assert_eq!(ConnectDescriptor::from_message(&msg).unwrap(), sent);
    }

    #[tokio::test]
    async fn test_edge_peer_done_is_idempotent_and_drains_sink() {
        let ((tunnel, _), _edge) = memory_pair(1 << 16).await;
        let session = Session::new("node-a", tunnel, None);
        let (tx, mut rx) = mpsc::channel(SINK_BUFFER);
        let conn = ApiServerConnection::new(
            ConnectionKind::Logs,
            &session,
            descriptor("/containerLogs/ns/p/c"),
            ApiServerSink::stream(tx),
        );

        assert_eq!(conn.write_to_api_server(Bytes::from_static(b"a")).await.unwrap(), 1);
        for _ in 0..3 {
            conn.set_edge_peer_done();
        }
        tokio::time::timeout(Duration::from_millis(100), conn.edge_peer_done())
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"a"));
        assert!(rx.recv().await.is_none());
        assert!(conn.write_to_api_server(Bytes::from_static(b"b")).await.is_err());
    }

    #[tokio::test]
    async fn test_serve_client_gone_sends_remove() {
        let ((tunnel, _), (_, mut edge)) = memory_pair(1 << 16).await;
        let session = Session::new("node-a", tunnel, None);
        let (tx, _rx) = mpsc::channel(SINK_BUFFER);
        let conn = ApiServerConnection::new(
            ConnectionKind::Logs,
            &session,
            descriptor("/containerLogs/ns/p/c"),
            ApiServerSink::stream(tx),
        );
        conn.set_message_id(3);

        let termination = conn.serve(async {}).await;
        assert_eq!(termination, Termination::ClientGone);
        assert_eq!(edge.next_message().await.unwrap(), Message::remove(3));
    }

    #[tokio::test]
    async fn test_client_wins_when_both_ready() {
        let ((tunnel, _), _edge) = memory_pair(1 << 16).await;
        let session = Session::new("node-a", tunnel, None);
        let (tx, _rx) = mpsc::channel(SINK_BUFFER);
        let conn = ApiServerConnection::new(
            ConnectionKind::Exec,
            &session,
            descriptor("/exec/ns/p/c"),
            ApiServerSink::stream(tx),
        );
        conn.set_edge_peer_done();
        assert_eq!(conn.serve(async {}).await, Termination::ClientGone);
    }
}
