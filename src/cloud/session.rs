//! Cloud-side session: one per edge tunnel.
//!
//! A session owns the write half of the tunnel and the map of in-flight
//! requests. Its reader loop is the only consumer of the tunnel's read half;
//! it dispatches DATA to request sinks and REMOVE_CONNECT to the request's
//! edge-peer-done signal. The map lock is held for lookups and mutations only,
//! never across tunnel or sink I/O.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::connection::ApiServerConnection;
use crate::error::{Result, TunnelError};
use crate::stream::{Message, MessageType, SafeTunnel, TunnelReader};

struct SessionState {
    requests: HashMap<u64, Arc<ApiServerConnection>>,
    closed: bool,
}

pub struct Session {
    id: String,
    tunnel: Arc<SafeTunnel>,
    state: RwLock<SessionState>,
    next_message_id: AtomicU64,
    /// Upstream RTSP URL for sessions opened on the video tunnel.
    resource_url: Option<String>,
    shutdown: CancellationToken,
}

impl Session {
    pub fn new(id: impl Into<String>, tunnel: SafeTunnel, resource_url: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            tunnel: Arc::new(tunnel),
            state: RwLock::new(SessionState {
                requests: HashMap::new(),
                closed: false,
            }),
            next_message_id: AtomicU64::new(1),
            resource_url,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tunnel(&self) -> Arc<SafeTunnel> {
        self.tunnel.clone()
    }

    pub fn resource_url(&self) -> Option<&str> {
        self.resource_url.as_deref()
    }

    /// Admit a request: assign the next message ID and register it.
    pub async fn add_request(&self, conn: ApiServerConnection) -> Result<Arc<ApiServerConnection>> {
        let mut state = self.state.write().await;
        if state.closed {
            return Err(TunnelError::SessionClosed(self.id.clone()));
        }
        let id = self.next_message_id.fetch_add(1, Ordering::SeqCst);
        conn.set_message_id(id);
        let conn = Arc::new(conn);
        state.requests.insert(id, conn.clone());
        debug!(session = %self.id, message_id = id, kind = conn.kind().as_str(), "request registered");
        Ok(conn)
    }

    pub async fn get_request(&self, id: u64) -> Result<Arc<ApiServerConnection>> {
        self.state
            .read()
            .await
            .requests
            .get(&id)
            .cloned()
            .ok_or_else(|| TunnelError::NotFound(format!("request {id} in session {}", self.id)))
    }

    /// Deregister a request. Idempotent.
    pub async fn delete_request(&self, id: u64) {
        if self.state.write().await.requests.remove(&id).is_some() {
            debug!(session = %self.id, message_id = id, "request deregistered");
        }
    }

    pub async fn request_count(&self) -> usize {
        self.state.read().await.requests.len()
    }

    pub async fn write_message_to_tunnel(&self, message: &Message) -> Result<()> {
        self.tunnel.write_message(message).await
    }

    pub async fn is_closed(&self) -> bool {
        self.state.read().await.closed
    }

    /// Resolves once the session has closed.
    pub async fn closed(&self) {
        self.shutdown.cancelled().await;
    }

    /// Signal every request that the edge is gone, close the tunnel and refuse
    /// further admissions. Idempotent.
    pub async fn close(&self) {
        let requests: Vec<Arc<ApiServerConnection>> = {
            let mut state = self.state.write().await;
            if state.closed {
                return;
            }
            state.closed = true;
            state.requests.values().cloned().collect()
        };
        for conn in &requests {
            conn.set_edge_peer_done();
        }
        self.tunnel.close().await;
        self.shutdown.cancel();
        info!(session = %self.id, requests = requests.len(), "session closed");
    }

    /// Reader loop. Runs until the tunnel fails or the session is closed from
    /// outside, then closes the session.
    pub async fn serve(self: Arc<Self>, mut reader: TunnelReader) {
        loop {
            let next = tokio::select! {
                () = self.shutdown.cancelled() => break,
                next = reader.next_message() => next,
            };
            match next {
                Ok(message) => self.dispatch(message).await,
                Err(TunnelError::Closed) => {
                    info!(session = %self.id, "tunnel closed by edge");
                    break;
                }
                Err(e) => {
                    error!(session = %self.id, "tunnel read failed: {e}");
                    break;
                }
            }
        }
        self.close().await;
    }

    async fn dispatch(&self, message: Message) {
        match message.message_type {
            MessageType::RemoveConnect => match self.get_request(message.connect_id).await {
                Ok(conn) => {
                    debug!(session = %self.id, message_id = message.connect_id, "edge peer done");
                    conn.set_edge_peer_done();
                }
                Err(e) => debug!(session = %self.id, "REMOVE_CONNECT dropped: {e}"),
            },
            MessageType::Data => {
                let conn = match self.get_request(message.connect_id).await {
                    Ok(conn) => conn,
                    Err(e) => {
                        debug!(session = %self.id, "DATA dropped: {e}");
                        return;
                    }
                };
                if let Err(e) = conn.write_to_api_server(message.data).await {
                    warn!(
                        session = %self.id,
                        message_id = message.connect_id,
                        kind = conn.kind().as_str(),
                        "failed to write to api-server: {e}"
                    );
                }
            }
            other => debug!(session = %self.id, "ignoring {other} from edge"),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("id", &self.id).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::http::{HeaderMap, Method, Uri};
    use bytes::Bytes;
    use tokio::sync::mpsc;

    use super::*;
    use crate::cloud::connection::{ApiServerSink, ConnectionKind, SINK_BUFFER};
    use crate::stream::tunnel::memory_pair;
    use crate::stream::{CarrierFrame, ConnectDescriptor, TargetUrl};

    fn logs_conn(session: &Session) -> (ApiServerConnection, mpsc::Receiver<Bytes>) {
        let uri: Uri = "/containerLogs/ns1/pod1/c1".parse().unwrap();
        let desc = ConnectDescriptor::new(
            &Method::GET,
            TargetUrl::from_uri(&uri, "http", "127.0.0.1:10350"),
            &HeaderMap::new(),
        );
        let (tx, rx) = mpsc::channel(SINK_BUFFER);
        (
            ApiServerConnection::new(ConnectionKind::Logs, session, desc, ApiServerSink::stream(tx)),
            rx,
        )
    }

    #[tokio::test]
    async fn test_ids_strictly_increase() {
        let ((tunnel, _), _edge) = memory_pair(1024).await;
        let session = Session::new("node-a", tunnel, None);
        let mut last = 0;
        for _ in 0..5 {
            let (conn, _rx) = logs_conn(&session);
            let conn = session.add_request(conn).await.unwrap();
            assert!(conn.message_id() > last);
            last = conn.message_id();
            session.delete_request(last).await;
        }
        let (conn, _rx) = logs_conn(&session);
        assert_eq!(session.add_request(conn).await.unwrap().message_id(), 6);
    }

    #[tokio::test]
    async fn test_close_refuses_and_signals_every_request() {
        let ((tunnel, _), _edge) = memory_pair(1024).await;
        let session = Session::new("node-a", tunnel, None);
        let mut conns = Vec::new();
        for _ in 0..3 {
            let (conn, _rx) = logs_conn(&session);
            conns.push(session.add_request(conn).await.unwrap());
        }

        session.close().await;
        session.close().await;
        assert!(session.is_closed().await);
        for conn in &conns {
            assert!(conn.is_edge_peer_done());
        }
        let (conn, _rx) = logs_conn(&session);
        assert!(matches!(
            session.add_request(conn).await,
            Err(TunnelError::SessionClosed(id)) if id == "node-a"
        ));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let ((tunnel, _), _edge) = memory_pair(1024).await;
        let session = Session::new("node-a", tunnel, None);
        let (conn, _rx) = logs_conn(&session);
        let id = session.add_request(conn).await.unwrap().message_id();
        session.delete_request(id).await;
        session.delete_request(id).await;
        assert!(matches!(session.get_request(id).await, Err(TunnelError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_reader_dispatches_data_then_remove() {
        let ((tunnel, reader), (edge, _)) = memory_pair(1024).await;
        let session = Session::new("node-a", tunnel, None);
        let (conn, mut rx) = logs_conn(&session);
        let conn = session.add_request(conn).await.unwrap();
        let id = conn.message_id();
        tokio::spawn(session.clone().serve(reader));

        edge.write_message(&Message::data(id, &b"line 1\n"[..])).await.unwrap();
        edge.write_message(&Message::data(99, &b"stray"[..])).await.unwrap();
        edge.write_message(&Message::data(id, &b"line 2\n"[..])).await.unwrap();
        edge.write_message(&Message::remove(id)).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"line 1\n"));
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"line 2\n"));
        assert!(rx.recv().await.is_none());
        tokio::time::timeout(Duration::from_secs(1), conn.edge_peer_done())
            .await
            .unwrap();
        assert!(!session.is_closed().await);
    }

    #[tokio::test]
    async fn test_dispatch_error_keeps_session_alive() {
        let ((tunnel, reader), (edge, _)) = memory_pair(1024).await;
        let session = Session::new("node-a", tunnel, None);
        let (conn, rx) = logs_conn(&session);
        let id = session.add_request(conn).await.unwrap().message_id();
        drop(rx);
        tokio::spawn(session.clone().serve(reader));

        edge.write_message(&Message::data(id, &b"lost"[..])).await.unwrap();
        let (conn, mut rx) = logs_conn(&session);
        let second = session.add_request(conn).await.unwrap().message_id();
        edge.write_message(&Message::data(second, &b"kept"[..])).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"kept"));
        assert!(!session.is_closed().await);
    }

    #[tokio::test]
    async fn test_malformed_frame_closes_session() {
        let ((tunnel, reader), (edge, _)) = memory_pair(1024).await;
        let session = Session::new("node-a", tunnel, None);
        let (conn, _rx) = logs_conn(&session);
        let conn = session.add_request(conn).await.unwrap();
        let task = tokio::spawn(session.clone().serve(reader));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        edge.write_control(CarrierFrame::Binary(Bytes::from_static(&[0x80])), deadline)
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert!(session.is_closed().await);
        assert!(conn.is_edge_peer_done());
    }

    #[tokio::test]
    async fn test_edge_disconnect_closes_session() {
        let ((tunnel, reader), (edge, edge_reader)) = memory_pair(1024).await;
        let session = Session::new("node-a", tunnel, None);
        let (conn, _rx) = logs_conn(&session);
        let conn = session.add_request(conn).await.unwrap();
        tokio::spawn(session.clone().serve(reader));

        edge.close().await;
        drop(edge_reader);
        tokio::time::timeout(Duration::from_secs(1), conn.edge_peer_done())
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), session.closed())
            .await
            .unwrap();
    }
}
