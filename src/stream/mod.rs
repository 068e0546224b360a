//! Tunnel protocol shared by the cloud and edge halves.
//!
//! - `message`: varint frame codec
//! - `descriptor`: JSON payload of CONNECT frames
//! - `tunnel`: single-writer WebSocket wrapper

pub mod descriptor;
pub mod message;
pub mod tunnel;

use std::time::Duration;

use tracing::warn;

pub use descriptor::{ConnectDescriptor, TargetUrl};
pub use message::{Message, MessageType};
pub use tunnel::{CarrierFrame, SafeTunnel, TunnelReader};

use crate::error::TunnelError;

/// Handshake header naming the edge node.
pub const SESSION_HOST_NAME_OVERRIDE: &str = "SessionHostNameOverride";

/// Handshake header carrying the edge node's internal IP.
pub const SESSION_INTERNAL_IP: &str = "SessionInternalIP";

/// Primary tunnel endpoint.
pub const CONNECT_PATH: &str = "/v1/kubeedge/connect";

/// Auxiliary tunnel endpoint for video streams.
pub const VIDEO_CONNECT_PATH: &str = "/v1/kubeedge/videoconnect";

const REMOVE_ATTEMPTS: u32 = 3;
const REMOVE_BACKOFF: Duration = Duration::from_secs(1);

/// Tell the peer that request `connect_id` is finished.
///
/// Up to three attempts one second apart. Failure is logged; the request
/// ends regardless.
pub async fn send_remove_connect(tunnel: &SafeTunnel, connect_id: u64) {
    let message = Message::remove(connect_id);
    for attempt in 1..=REMOVE_ATTEMPTS {
        match tunnel.write_message(&message).await {
            Ok(()) => return,
            Err(TunnelError::Closed) => {
                warn!(message_id = connect_id, "tunnel closed, REMOVE_CONNECT not sent");
                return;
            }
            Err(e) => {
                warn!(
                    message_id = connect_id,
                    attempt, "failed to send REMOVE_CONNECT: {e}"
                );
                if attempt < REMOVE_ATTEMPTS {
                    tokio::time::sleep(REMOVE_BACKOFF).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_remove_connect_reaches_peer() {
        let ((tunnel, _), (_, mut reader)) = tunnel::memory_pair(1024).await;
        send_remove_connect(&tunnel, 12).await;
        let msg = reader.next_message().await.unwrap();
        assert_eq!(msg, Message::remove(12));
    }

    #[tokio::test]
    async fn test_remove_connect_on_closed_tunnel_returns() {
        let ((tunnel, _), _) = tunnel::memory_pair(1024).await;
        tunnel.close().await;
        tokio::time::timeout(Duration::from_millis(100), send_remove_connect(&tunnel, 1))
            .await
            .unwrap();
    }
}
