//! Video requests: one edge-side transcoder stream fanned out to every
//! WebSocket client watching the same endpoint.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use bytes::Bytes;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ApiServerConnection, ApiServerSink, ConnectionKind, Termination};
use crate::cloud::session::Session;
use crate::stream::ConnectDescriptor;

struct Subscriber {
    id: u64,
    sink: SplitSink<WebSocket, WsMessage>,
}

/// Subscribers of one video request.
pub struct VideoFanout {
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
    shut: AtomicBool,
    empty_tx: mpsc::Sender<()>,
}

/// Fires once the subscriber set drains to zero.
pub struct EmptySignal(mpsc::Receiver<()>);

impl EmptySignal {
    pub async fn wait(&mut self) {
        let _ = self.0.recv().await;
    }
}

impl VideoFanout {
    pub fn new() -> (Self, EmptySignal) {
        // One slot: a signal sent before the handler listens is not lost.
        let (empty_tx, empty_rx) = mpsc::channel(1);
        (
            Self {
                subscribers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                shut: AtomicBool::new(false),
                empty_tx,
            },
            EmptySignal(empty_rx),
        )
    }

    /// Write `data` as one BINARY frame to every subscriber. Subscribers whose
    /// write fails are closed and dropped.
    pub async fn write(&self, data: Bytes) -> usize {
        let mut subscribers = self.subscribers.lock().await;
        let before = subscribers.len();
        let mut i = 0;
        while i < subscribers.len() {
            let frame = WsMessage::Binary(data.clone());
            if let Err(e) = subscribers[i].sink.send(frame).await {
                let mut gone = subscribers.swap_remove(i);
                warn!(subscriber = gone.id, "dropping video subscriber: {e}");
                let _ = gone.sink.close().await;
            } else {
                i += 1;
            }
        }
        if before > 0 && subscribers.is_empty() {
            self.signal_empty();
        }
        data.len()
    }

    pub async fn len(&self) -> usize {
        self.subscribers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn push(
        &self,
        sink: SplitSink<WebSocket, WsMessage>,
    ) -> Result<u64, SplitSink<WebSocket, WsMessage>> {
        let mut subscribers = self.subscribers.lock().await;
        if self.is_shut() {
            return Err(sink);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        subscribers.push(Subscriber { id, sink });
        Ok(id)
    }

    async fn remove(&self, id: u64) {
        let mut subscribers = self.subscribers.lock().await;
        let Some(pos) = subscribers.iter().position(|s| s.id == id) else {
            return;
        };
        let mut gone = subscribers.swap_remove(pos);
        let _ = gone.sink.close().await;
        if subscribers.is_empty() {
            self.signal_empty();
        }
    }

    /// Refuse new subscribers from now on.
    pub(super) fn shut(&self) {
        self.shut.store(true, Ordering::SeqCst);
    }

    pub fn is_shut(&self) -> bool {
        self.shut.load(Ordering::SeqCst)
    }

    /// Close every subscriber socket.
    pub async fn close_all(&self) {
        self.shut();
        let drained: Vec<Subscriber> = self.subscribers.lock().await.drain(..).collect();
        for mut subscriber in drained {
            let _ = subscriber.sink.send(WsMessage::Close(None)).await;
            let _ = subscriber.sink.close().await;
        }
    }

    fn signal_empty(&self) {
        let _ = self.empty_tx.try_send(());
    }
}

/// Add `socket` to the fan-out of `conn`. A watcher task drops the subscriber
/// when the client closes. Returns the socket back if the request no longer
/// accepts subscribers.
pub async fn attach_subscriber(
    conn: &Arc<ApiServerConnection>,
    socket: WebSocket,
) -> Result<u64, WebSocket> {
    let Some(fanout) = conn.fanout() else {
        return Err(socket);
    };
    if fanout.is_shut() || conn.is_edge_peer_done() {
        return Err(socket);
    }
    let (sink, mut stream) = socket.split();
    let id = match fanout.push(sink).await {
        Ok(id) => id,
        Err(sink) => return sink.reunite(stream).map_or_else(|_| Ok(0), Err),
    };

    let conn = conn.clone();
    tokio::spawn(async move {
        while let Some(Ok(msg)) = stream.next().await {
            if matches!(msg, WsMessage::Close(_)) {
                break;
            }
        }
        debug!(message_id = conn.message_id(), subscriber = id, "video subscriber left");
        if let Some(fanout) = conn.fanout() {
            fanout.remove(id).await;
        }
    });
    Ok(id)
}

/// Active video request for an endpoint: the owning session and the ID of the
/// request whose fan-out late joiners attach to.
pub struct VideoSession {
    pub session: Arc<Session>,
    pub message_id: u64,
}

pub type VideoSessions = Arc<Mutex<HashMap<String, VideoSession>>>;

/// Serve one WebSocket client of `/video/{endpoint}`.
///
/// The first client creates the request and sends VIDEO_CONNECT; later
/// clients join its fan-out. The first client's task waits until the
/// subscriber set is empty (or the edge is done), then tears the request down.
pub async fn serve_video(
    videos: VideoSessions,
    session: Arc<Session>,
    endpoint: String,
    mut descriptor: ConnectDescriptor,
    socket: WebSocket,
) {
    let mut socket = socket;
    let (conn, mut empty) = {
        let mut map = videos.lock().await;
        if let Some(existing) = map.get(&endpoint) {
            if let Ok(conn) = existing.session.get_request(existing.message_id).await {
                match attach_subscriber(&conn, socket).await {
                    Ok(subscriber) => {
                        info!(endpoint = %endpoint, message_id = conn.message_id(), subscriber, "joined video stream");
                        return;
                    }
                    Err(back) => socket = back,
                }
            }
        }

        descriptor.resource_url = session.resource_url().map(str::to_string);
        let (fanout, empty) = VideoFanout::new();
        let conn = ApiServerConnection::new(
            ConnectionKind::Video,
            &session,
            descriptor,
            ApiServerSink::Video(fanout),
        );
        let conn = match session.add_request(conn).await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(endpoint = %endpoint, "video request refused: {e}");
                let _ = socket.close().await;
                return;
            }
        };
        map.insert(
            endpoint.clone(),
            VideoSession {
                session: session.clone(),
                message_id: conn.message_id(),
            },
        );
        (conn, empty)
    };
    let message_id = conn.message_id();

    if let Err(e) = conn.send_connection().await {
        warn!(endpoint = %endpoint, message_id, "failed to send VIDEO_CONNECT: {e}");
        forget_video(&videos, &endpoint, &session, message_id).await;
        session.delete_request(message_id).await;
        let _ = socket.close().await;
        return;
    }

    if let Err(mut socket) = attach_subscriber(&conn, socket).await {
        warn!(endpoint = %endpoint, message_id, "video stream ended before its first subscriber joined");
        abandon(&videos, &endpoint, &session, &conn).await;
        let _ = socket.close().await;
        return;
    }
    info!(endpoint = %endpoint, message_id, session = %session.id(), "video stream started");

    let client = CancellationToken::new();
    let serve = {
        let conn = conn.clone();
        let session = session.clone();
        let client = client.clone();
        tokio::spawn(async move {
            conn.serve(client.cancelled_owned()).await;
            session.delete_request(conn.message_id()).await;
        })
    };

    tokio::select! {
        () = empty.wait() => debug!(endpoint = %endpoint, "all video subscribers left"),
        () = conn.edge_peer_done() => debug!(endpoint = %endpoint, "edge finished video stream"),
    }

    forget_video(&videos, &endpoint, &session, message_id).await;
    client.cancel();
    if let Some(fanout) = conn.fanout() {
        fanout.close_all().await;
    }
    let _ = serve.await;
    info!(endpoint = %endpoint, message_id, "video stream ended");
}

/// Tear down a video request that never got a subscriber.
async fn abandon(videos: &VideoSessions, endpoint: &str, session: &Arc<Session>, conn: &ApiServerConnection) {
    let message_id = conn.message_id();
    forget_video(videos, endpoint, session, message_id).await;
    session.delete_request(message_id).await;
    conn.finish(Termination::ClientGone).await;
}

/// Remove the endpoint entry if it still points at this request.
async fn forget_video(videos: &VideoSessions, endpoint: &str, session: &Arc<Session>, message_id: u64) {
    let mut map = videos.lock().await;
    if map
        .get(endpoint)
        .is_some_and(|v| v.message_id == message_id && Arc::ptr_eq(&v.session, session))
    {
        map.remove(endpoint);
    }
}

#[cfg(test)]
mod tests {
    use axum::http::{HeaderMap, Method, Uri};

    use super::*;
    use crate::stream::tunnel::memory_pair;
    use crate::stream::{Message, TargetUrl};

    #[tokio::test]
    async fn test_abandon_tears_down_unwatched_request() {
        let ((tunnel, _), (_, mut edge)) = memory_pair(1 << 16).await;
        let session = Session::new("cam-1", tunnel, Some("rtsp://10.0.0.9/live".to_string()));
        let uri: Uri = "/video/cam-1".parse().unwrap();
        let descriptor = ConnectDescriptor::new(
            &Method::GET,
            TargetUrl::from_uri(&uri, "ws", "cam-1"),
            &HeaderMap::new(),
        );
        let (fanout, _empty) = VideoFanout::new();
        let conn = ApiServerConnection::new(ConnectionKind::Video, &session, descriptor, ApiServerSink::Video(fanout));
        let conn = session.add_request(conn).await.unwrap();
        let message_id = conn.message_id();

        let videos = VideoSessions::default();
        videos.lock().await.insert(
            "cam-1".to_string(),
            VideoSession {
                session: session.clone(),
                message_id,
            },
        );

        abandon(&videos, "cam-1", &session, &conn).await;
        assert!(videos.lock().await.is_empty());
        assert_eq!(session.request_count().await, 0);
        assert!(conn.fanout().unwrap().is_shut());
        assert_eq!(edge.next_message().await.unwrap(), Message::remove(message_id));
    }

    #[tokio::test]
    async fn test_abandon_keeps_a_newer_entry() {
        let ((tunnel, _), (_, _edge)) = memory_pair(1 << 16).await;
        let session = Session::new("cam-2", tunnel, None);
        let uri: Uri = "/video/cam-2".parse().unwrap();
        let descriptor = ConnectDescriptor::new(
            &Method::GET,
            TargetUrl::from_uri(&uri, "ws", "cam-2"),
            &HeaderMap::new(),
        );
        let (fanout, _empty) = VideoFanout::new();
        let conn = ApiServerConnection::new(ConnectionKind::Video, &session, descriptor, ApiServerSink::Video(fanout));
        let conn = session.add_request(conn).await.unwrap();

        let videos = VideoSessions::default();
        videos.lock().await.insert(
            "cam-2".to_string(),
            VideoSession {
                session: session.clone(),
                message_id: conn.message_id() + 1,
            },
        );

        abandon(&videos, "cam-2", &session, &conn).await;
        assert!(videos.lock().await.contains_key("cam-2"));
        assert_eq!(session.request_count().await, 0);
    }
}
