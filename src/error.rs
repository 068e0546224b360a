//! Error kinds shared by the cloud and edge halves of the tunnel.

use thiserror::Error;

/// Every failure that can end a frame, a request, or a whole session.
///
/// Normal terminations (API-server client gone, edge peer done) are not
/// errors; see [`crate::cloud::connection::Termination`].
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Header or payload cannot be parsed. Terminates the session.
    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),

    /// Payload exceeds the configured maximum length.
    #[error("frame payload of {len} bytes exceeds limit of {max}")]
    TooLarge { len: usize, max: usize },

    /// Unexpected carrier frame or unknown critical message type.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Admission attempted on a session that is already closed.
    #[error("session {0} is closed")]
    SessionClosed(String),

    /// Lookup of a session by key or of a request by ID failed.
    #[error("{0} not found")]
    NotFound(String),

    /// Pod-scoped route whose path lacks the namespace or pod segment.
    #[error("can not get pod name from url path")]
    PodNameMissing,

    /// Writing to the tunnel failed; the tunnel is unusable afterwards.
    #[error("tunnel write failed: {0}")]
    Write(String),

    /// Reading from the carrier failed.
    #[error("tunnel read failed: {0}")]
    Read(String),

    /// The carrier was closed by either side.
    #[error("tunnel closed")]
    Closed,

    /// Exec/attach request without `Connection: Upgrade`.
    #[error("request was not an upgrade")]
    UpgradeRequired,

    /// Exec/attach request whose connection cannot be taken over.
    #[error("request connection cannot be hijacked: {0}")]
    HijackFailed(String),

    /// The node status could not be updated with the tunnel port.
    #[error("failed to update kubelet endpoint port of node {node}: {reason}")]
    NodeStatusPublishFailed { node: String, reason: String },

    /// The edge could not reach or read the local target (kubelet, transcoder).
    #[error("upstream request failed: {0}")]
    Upstream(String),

    /// Certificate material or TLS settings are unusable.
    #[error("tls: {0}")]
    Tls(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl TunnelError {
    /// Whether this error ends the owning session rather than one request.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            Self::MalformedFrame(_)
                | Self::TooLarge { .. }
                | Self::ProtocolViolation(_)
                | Self::Write(_)
                | Self::Read(_)
                | Self::Closed
        )
    }
}

pub type Result<T, E = TunnelError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_fatal_kinds() {
        assert!(TunnelError::MalformedFrame("truncated header").is_session_fatal());
        assert!(TunnelError::Write("broken pipe".into()).is_session_fatal());
        assert!(!TunnelError::SessionClosed("node-a".into()).is_session_fatal());
        assert!(!TunnelError::UpgradeRequired.is_session_fatal());
    }

    #[test]
    fn test_display_includes_context() {
        let err = TunnelError::TooLarge { len: 10, max: 4 };
        assert_eq!(err.to_string(), "frame payload of 10 bytes exceeds limit of 4");
        let err = TunnelError::NodeStatusPublishFailed {
            node: "edge-1".into(),
            reason: "timed out".into(),
        };
        assert!(err.to_string().contains("edge-1"));
    }
}
