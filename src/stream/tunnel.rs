//! Safe tunnel: a WebSocket carrier with serialized writes and a single reader.
//!
//! The carrier is split on construction. [`SafeTunnel`] owns the write half
//! behind a mutex so frames from many requests never interleave below frame
//! granularity; [`TunnelReader`] owns the read half and is moved into the one
//! task that drives the session. Both the cloud side (axum) and the edge side
//! (tokio-tungstenite) are adapted onto the same [`CarrierFrame`] type.
//!
//! Tunnel messages travel as BINARY carrier frames: the varint header is not
//! valid UTF-8 in general, and both WebSocket stacks enforce UTF-8 on TEXT.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

use super::message::Message;
use crate::error::{Result, TunnelError};

/// Carrier-level frame, independent of the WebSocket implementation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CarrierFrame {
    Text(String),
    Binary(Bytes),
    Ping(Bytes),
    Pong(Bytes),
    Close,
}

type FrameSink = Pin<Box<dyn Sink<CarrierFrame, Error = SinkError> + Send>>;
type FrameStream = Pin<Box<dyn Stream<Item = Result<CarrierFrame>> + Send>>;

/// Write-side failure from either WebSocket stack. The sink must stay
/// usable after an error: close and the REMOVE retries write again.
#[derive(Debug)]
struct SinkError(String);

impl From<axum::Error> for SinkError {
    fn from(e: axum::Error) -> Self {
        Self(e.to_string())
    }
}

impl From<tungstenite::Error> for SinkError {
    fn from(e: tungstenite::Error) -> Self {
        Self(e.to_string())
    }
}

impl From<SinkError> for TunnelError {
    fn from(e: SinkError) -> Self {
        Self::Write(e.0)
    }
}

/// Write half of a tunnel. Share it behind an `Arc`.
pub struct SafeTunnel {
    writer: Mutex<FrameSink>,
    closed: AtomicBool,
}

/// Read half of a tunnel. Exactly one task owns it.
pub struct TunnelReader {
    stream: FrameStream,
    max_payload: usize,
}

impl SafeTunnel {
    fn new(sink: FrameSink, stream: FrameStream, max_payload: usize) -> (Self, TunnelReader) {
        (
            Self {
                writer: Mutex::new(sink),
                closed: AtomicBool::new(false),
            },
            TunnelReader {
                stream,
                max_payload,
            },
        )
    }

    /// Wrap a socket upgraded by axum (cloud side).
    pub fn from_axum(
        socket: axum::extract::ws::WebSocket,
        max_payload: usize,
    ) -> (Self, TunnelReader) {
        let (sink, stream) = socket.split();
        let sink = sink.with(|frame: CarrierFrame| {
            future::ready(Ok::<_, SinkError>(axum::extract::ws::Message::from(frame)))
        });
        let stream = stream.map(|item| {
            item.map(CarrierFrame::from)
                .map_err(|e| TunnelError::Read(e.to_string()))
        });
        Self::new(Box::pin(sink), Box::pin(stream), max_payload)
    }

    /// Wrap a tokio-tungstenite stream (edge side, and in-memory test pairs).
    pub fn from_tungstenite<S>(ws: WebSocketStream<S>, max_payload: usize) -> (Self, TunnelReader)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = ws.split();
        let sink = sink.with(|frame: CarrierFrame| {
            future::ready(Ok::<_, SinkError>(tungstenite::Message::from(frame)))
        });
        let stream = stream.map(|item| {
            item.map(CarrierFrame::from)
                .map_err(|e| TunnelError::Read(e.to_string()))
        });
        Self::new(Box::pin(sink), Box::pin(stream), max_payload)
    }

    /// Encode `message` and write it as one carrier frame.
    pub async fn write_message(&self, message: &Message) -> Result<()> {
        if self.is_closed() {
            return Err(TunnelError::Closed);
        }
        let frame = CarrierFrame::Binary(message.encode());
        let mut writer = self.writer.lock().await;
        Ok(writer.send(frame).await?)
    }

    /// Write a control frame, giving up at `deadline`.
    pub async fn write_control(&self, frame: CarrierFrame, deadline: Instant) -> Result<()> {
        if self.is_closed() {
            return Err(TunnelError::Closed);
        }
        tokio::time::timeout_at(deadline, async {
            let mut writer = self.writer.lock().await;
            writer.send(frame).await.map_err(TunnelError::from)
        })
        .await
        .map_err(|_| TunnelError::Write("control frame deadline exceeded".to_string()))?
    }

    /// Send a close frame and shut the write half. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.send(CarrierFrame::Close).await {
            debug!("close frame not delivered: {}", e.0);
        }
        if let Err(e) = writer.close().await {
            debug!("tunnel write half not shut cleanly: {}", e.0);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl TunnelReader {
    /// Next tunnel message. Ping/pong frames are skipped; TEXT frames are a
    /// protocol violation; end of stream and close frames yield `Closed`.
    pub async fn next_message(&mut self) -> Result<Message> {
        loop {
            match self.stream.next().await {
                None | Some(Ok(CarrierFrame::Close)) => return Err(TunnelError::Closed),
                Some(Err(e)) => return Err(e),
                Some(Ok(CarrierFrame::Binary(frame))) => {
                    return Message::decode(&frame, self.max_payload)
                }
                Some(Ok(CarrierFrame::Ping(_) | CarrierFrame::Pong(_))) => {}
                Some(Ok(CarrierFrame::Text(_))) => {
                    return Err(TunnelError::ProtocolViolation(
                        "unexpected text frame on tunnel".to_string(),
                    ))
                }
            }
        }
    }
}

impl From<CarrierFrame> for axum::extract::ws::Message {
    fn from(frame: CarrierFrame) -> Self {
        match frame {
            CarrierFrame::Text(text) => Self::Text(text.into()),
            CarrierFrame::Binary(data) => Self::Binary(data),
            CarrierFrame::Ping(data) => Self::Ping(data),
            CarrierFrame::Pong(data) => Self::Pong(data),
            CarrierFrame::Close => Self::Close(None),
        }
    }
}

impl From<axum::extract::ws::Message> for CarrierFrame {
    fn from(message: axum::extract::ws::Message) -> Self {
        use axum::extract::ws::Message as M;
        match message {
            M::Text(text) => Self::Text(text.to_string()),
            M::Binary(data) => Self::Binary(data),
            M::Ping(data) => Self::Ping(data),
            M::Pong(data) => Self::Pong(data),
            M::Close(_) => Self::Close,
        }
    }
}

impl From<CarrierFrame> for tungstenite::Message {
    fn from(frame: CarrierFrame) -> Self {
        match frame {
            CarrierFrame::Text(text) => Self::Text(text.into()),
            CarrierFrame::Binary(data) => Self::Binary(data),
            CarrierFrame::Ping(data) => Self::Ping(data),
            CarrierFrame::Pong(data) => Self::Pong(data),
            CarrierFrame::Close => Self::Close(None),
        }
    }
}

impl From<tungstenite::Message> for CarrierFrame {
    fn from(message: tungstenite::Message) -> Self {
        use tungstenite::Message as M;
        match message {
            M::Text(text) => Self::Text(text.to_string()),
            M::Binary(data) => Self::Binary(data),
            M::Ping(data) => Self::Ping(data),
            M::Pong(data) => Self::Pong(data),
            M::Close(_) => Self::Close,
            // Raw frames never surface from a reader.
            M::Frame(frame) => Self::Binary(Bytes::copy_from_slice(frame.payload())),
        }
    }
}

/// Two tunnel endpoints joined by an in-memory pipe. First is the server role.
#[cfg(test)]
pub(crate) async fn memory_pair(
    max_payload: usize,
) -> ((SafeTunnel, TunnelReader), (SafeTunnel, TunnelReader)) {
    use tungstenite::protocol::Role;

    let (a, b) = tokio::io::duplex(1 << 16);
    let (server, client) = tokio::join!(
        WebSocketStream::from_raw_socket(a, Role::Server, None),
        WebSocketStream::from_raw_socket(b, Role::Client, None),
    );
    (
        SafeTunnel::from_tungstenite(server, max_payload),
        SafeTunnel::from_tungstenite(client, max_payload),
    )
}
