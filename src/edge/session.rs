//! Edge end of one tunnel: dispatches inbound frames to per-request pumps.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::connection::{self, EdgeContext, EdgeRequest};
use crate::error::{Result, TunnelError};
use crate::stream::{ConnectDescriptor, Message, MessageType, SafeTunnel, TunnelReader};

/// Depth of each request's inbound DATA queue.
const INBOUND_BUFFER: usize = 64;

/// Why an edge tunnel ended without a transport error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disconnect {
    /// The carrier closed.
    Closed,
    /// The cloud refused the tunnel (CLOSE_CONNECT) with this reason.
    CloseConnect(String),
}

struct Running {
    inbound: mpsc::Sender<Message>,
    stop: CancellationToken,
}

pub struct EdgeSession {
    id: String,
    tunnel: Arc<SafeTunnel>,
    context: Arc<EdgeContext>,
    requests: RwLock<HashMap<u64, Running>>,
}

impl EdgeSession {
    pub fn new(id: impl Into<String>, tunnel: SafeTunnel, context: Arc<EdgeContext>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            tunnel: Arc::new(tunnel),
            context,
            requests: RwLock::new(HashMap::new()),
        })
    }

    pub fn tunnel(&self) -> Arc<SafeTunnel> {
        self.tunnel.clone()
    }

    pub async fn request_count(&self) -> usize {
        self.requests.read().await.len()
    }

    /// Read frames until the tunnel ends, then stop every running request.
    pub async fn serve(self: Arc<Self>, mut reader: TunnelReader) -> Result<Disconnect> {
        let result = loop {
            let message = match reader.next_message().await {
                Ok(message) => message,
                Err(TunnelError::Closed) => break Ok(Disconnect::Closed),
                Err(e) => break Err(e),
            };
            if let Some(reason) = self.clone().dispatch(message).await {
                break Ok(Disconnect::CloseConnect(reason));
            }
        };

        let running: Vec<Running> = self.requests.write().await.drain().map(|(_, r)| r).collect();
        for request in running {
            request.stop.cancel();
        }
        self.tunnel.close().await;
        info!(session = %self.id, "edge tunnel ended");
        result
    }

    /// Handle one frame. Returns the reason when the cloud closed the tunnel.
    async fn dispatch(self: Arc<Self>, message: Message) -> Option<String> {
        let id = message.connect_id;
        match message.message_type {
            kind if kind.is_connect() => self.start(kind, &message).await,
            MessageType::Data => {
                let inbound = self.requests.read().await.get(&id).map(|r| r.inbound.clone());
                match inbound {
                    Some(inbound) => {
                        if inbound.send(message).await.is_err() {
                            debug!(message_id = id, "request finished, DATA dropped");
                        }
                    }
                    None => debug!(message_id = id, "DATA for unknown request"),
                }
            }
            MessageType::RemoveConnect => {
                if let Some(running) = self.requests.read().await.get(&id) {
                    debug!(message_id = id, "cloud removed request");
                    running.stop.cancel();
                }
            }
            MessageType::CloseConnect => {
                let reason = String::from_utf8_lossy(&message.data).into_owned();
                warn!(session = %self.id, "cloud closed the tunnel: {reason}");
                return Some(reason);
            }
            other => debug!(message_id = id, "ignoring {other}"),
        }
        None
    }

    async fn start(self: Arc<Self>, kind: MessageType, message: &Message) {
        let id = message.connect_id;
        let descriptor = match ConnectDescriptor::from_message(message) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                warn!(message_id = id, "bad {kind} descriptor: {e}");
                return;
            }
        };

        let (tx, inbound) = mpsc::channel(INBOUND_BUFFER);
        let stop = CancellationToken::new();
        {
            let mut requests = self.requests.write().await;
            if requests.contains_key(&id) {
                debug!(message_id = id, "request already being served");
                return;
            }
            requests.insert(
                id,
                Running {
                    inbound: tx,
                    stop: stop.clone(),
                },
            );
        }

        let request = EdgeRequest {
            id,
            descriptor,
            tunnel: self.tunnel.clone(),
            inbound,
            stop,
        };
        let context = self.context.clone();
        tokio::spawn(async move {
            connection::serve(context, kind, request).await;
            self.requests.write().await.remove(&id);
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::http::{HeaderMap, Method, Uri};
    use tokio::net::TcpListener;

    use super::*;
    use crate::config::EdgeConfig;
    use crate::stream::tunnel::memory_pair;
    use crate::stream::TargetUrl;

    fn logs_connect(id: u64, host: &str) -> Message {
        let uri: Uri = "/containerLogs/ns1/pod1/c1".parse().unwrap();
        let mut descriptor = ConnectDescriptor::new(&Method::GET, TargetUrl::from_uri(&uri, "http", host), &HeaderMap::new());
        descriptor.message_id = id;
        descriptor.to_message(MessageType::LogsConnect).unwrap()
    }

    /// Upstream that accepts connections and never answers.
    async fn stalled_upstream() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });
        addr.to_string()
    }

    async fn wait_count(session: &EdgeSession, n: usize) {
        for _ in 0..100 {
            if session.request_count().await == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(session.request_count().await, n);
    }

    #[tokio::test]
    async fn test_duplicate_connect_is_ignored_and_remove_stops() {
        let upstream = stalled_upstream().await;
        let ((cloud, mut cloud_reader), (edge, edge_reader)) = memory_pair(1 << 20).await;
        let session = EdgeSession::new("edge-1", edge, Arc::new(EdgeContext::new(&EdgeConfig::default())));
        let serving = tokio::spawn(session.clone().serve(edge_reader));

        cloud.write_message(&logs_connect(1, &upstream)).await.unwrap();
        cloud.write_message(&logs_connect(1, &upstream)).await.unwrap();
        wait_count(&session, 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(session.request_count().await, 1);

        cloud.write_message(&Message::remove(1)).await.unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(3), cloud_reader.next_message())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.message_type, MessageType::RemoveConnect);
        assert_eq!(reply.connect_id, 1);
        wait_count(&session, 0).await;

        cloud.close().await;
        assert_eq!(serving.await.unwrap().unwrap(), Disconnect::Closed);
    }

    #[tokio::test]
    async fn test_close_connect_ends_session_and_requests() {
        let upstream = stalled_upstream().await;
        let ((cloud, _cloud_reader), (edge, edge_reader)) = memory_pair(1 << 20).await;
        let session = EdgeSession::new("edge-1", edge, Arc::new(EdgeContext::new(&EdgeConfig::default())));
        let serving = tokio::spawn(session.clone().serve(edge_reader));

        cloud.write_message(&logs_connect(7, &upstream)).await.unwrap();
        wait_count(&session, 1).await;
        cloud
            .write_message(&Message::close("failed to update kubelet endpoint port"))
            .await
            .unwrap();

        let disconnect = serving.await.unwrap().unwrap();
        assert_eq!(
            disconnect,
            Disconnect::CloseConnect("failed to update kubelet endpoint port".to_string())
        );
        assert_eq!(session.request_count().await, 0);
    }

    #[tokio::test]
    async fn test_bad_descriptor_is_dropped() {
        let ((cloud, _cloud_reader), (edge, edge_reader)) = memory_pair(1 << 20).await;
        let session = EdgeSession::new("edge-1", edge, Arc::new(EdgeContext::new(&EdgeConfig::default())));
        let serving = tokio::spawn(session.clone().serve(edge_reader));

        cloud
            .write_message(&Message::new(4, MessageType::ExecConnect, &b"{not json"[..]))
            .await
            .unwrap();
        cloud.write_message(&Message::data(4, "stray")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(session.request_count().await, 0);

        cloud.close().await;
        assert_eq!(serving.await.unwrap().unwrap(), Disconnect::Closed);
    }
}
