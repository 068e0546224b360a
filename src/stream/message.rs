//! Tunnel message codec.
//!
//! Every carrier frame holds exactly one [`Message`]:
//!
//! ```text
//! +-------------------+---------------------+----------------------+
//! | uvarint ConnectID | uvarint MessageType | Data (rest of frame) |
//! +-------------------+---------------------+----------------------+
//! ```
//!
//! Varints are unsigned LEB128 (7 bits per byte, low group first, high bit
//! set on every byte except the last).

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Result, TunnelError};

/// Longest encoding of a `u64` as an unsigned varint.
pub const MAX_VARINT_LEN: usize = 10;

/// Upper bound on the encoded header (connect ID + message type).
pub const MAX_HEADER_LEN: usize = 2 * MAX_VARINT_LEN;

/// Kind of a tunnel message. Wire values follow declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    LogsConnect = 0,
    ExecConnect = 1,
    AttachConnect = 2,
    MetricConnect = 3,
    VideoConnect = 4,
    Data = 5,
    RemoveConnect = 6,
    CloseConnect = 7,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LogsConnect => "LOGS_CONNECT",
            Self::ExecConnect => "EXEC_CONNECT",
            Self::AttachConnect => "ATTACH_CONNECT",
            Self::MetricConnect => "METRIC_CONNECT",
            Self::VideoConnect => "VIDEO_CONNECT",
            Self::Data => "DATA",
            Self::RemoveConnect => "REMOVE_CONNECT",
            Self::CloseConnect => "CLOSE_CONNECT",
        }
    }

    /// Whether this type opens a new request stream.
    pub fn is_connect(self) -> bool {
        matches!(
            self,
            Self::LogsConnect
                | Self::ExecConnect
                | Self::AttachConnect
                | Self::MetricConnect
                | Self::VideoConnect
        )
    }
}

impl TryFrom<u64> for MessageType {
    type Error = TunnelError;

    fn try_from(value: u64) -> Result<Self> {
        Ok(match value {
            0 => Self::LogsConnect,
            1 => Self::ExecConnect,
            2 => Self::AttachConnect,
            3 => Self::MetricConnect,
            4 => Self::VideoConnect,
            5 => Self::Data,
            6 => Self::RemoveConnect,
            7 => Self::CloseConnect,
            other => {
                return Err(TunnelError::ProtocolViolation(format!(
                    "unknown message type {other}"
                )))
            }
        })
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One tunnel frame: `(ConnectID, MessageType, Data)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub connect_id: u64,
    pub message_type: MessageType,
    pub data: Bytes,
}

impl Message {
    pub fn new(connect_id: u64, message_type: MessageType, data: impl Into<Bytes>) -> Self {
        Self {
            connect_id,
            message_type,
            data: data.into(),
        }
    }

    pub fn data(connect_id: u64, data: impl Into<Bytes>) -> Self {
        Self::new(connect_id, MessageType::Data, data)
    }

    pub fn remove(connect_id: u64) -> Self {
        Self::new(connect_id, MessageType::RemoveConnect, Bytes::new())
    }

    /// Session-scoped shutdown carrying a human-readable reason.
    pub fn close(reason: &str) -> Self {
        Self::new(
            0,
            MessageType::CloseConnect,
            Bytes::copy_from_slice(reason.as_bytes()),
        )
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(MAX_HEADER_LEN + self.data.len());
        put_uvarint(&mut buf, self.connect_id);
        put_uvarint(&mut buf, self.message_type as u64);
        buf.extend_from_slice(&self.data);
        buf.freeze()
    }

    /// Decode one frame. `max_payload` bounds the data section.
    pub fn decode(frame: &Bytes, max_payload: usize) -> Result<Self> {
        let (connect_id, id_len) =
            read_uvarint(frame).ok_or(TunnelError::MalformedFrame("bad connect id"))?;
        let (raw_type, type_len) = read_uvarint(&frame[id_len..])
            .ok_or(TunnelError::MalformedFrame("bad message type"))?;
        let message_type = MessageType::try_from(raw_type)?;

        let data = frame.slice(id_len + type_len..);
        if data.len() > max_payload {
            return Err(TunnelError::TooLarge {
                len: data.len(),
                max: max_payload,
            });
        }

        Ok(Self {
            connect_id,
            message_type,
            data,
        })
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MESSAGE: connectID {} messageType {} ({} bytes)",
            self.connect_id,
            self.message_type,
            self.data.len()
        )
    }
}

fn put_uvarint(buf: &mut BytesMut, mut value: u64) {
    while value >= 0x80 {
        buf.put_u8((value as u8) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

/// Returns `(value, bytes_read)`, or `None` on underflow or a value wider
/// than 64 bits.
fn read_uvarint(buf: &[u8]) -> Option<(u64, usize)> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    for (i, &byte) in buf.iter().enumerate() {
        if i == MAX_VARINT_LEN {
            return None;
        }
        if byte < 0x80 {
            if i == MAX_VARINT_LEN - 1 && byte > 1 {
                return None;
            }
            return Some((value | u64::from(byte) << shift, i + 1));
        }
        value |= u64::from(byte & 0x7f) << shift;
        shift += 7;
    }
    None
}
