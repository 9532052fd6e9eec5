use std::time::Duration;

/// Errors that can occur in link operations.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] synclink_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] synclink_frame::FrameError),

    /// Inbound payload did not decode to a known message.
    #[error("decode error: {0}")]
    Decode(#[from] synclink_proto::DecodeError),

    /// Outbound message could not be serialized.
    #[error("encode error: {0}")]
    Encode(#[from] synclink_proto::EncodeError),

    /// Handshake failed.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// The controller answered `authenticate` with `success: false`.
    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    /// No `auth_response` arrived in time.
    #[error("no auth response within {0:?}")]
    AuthTimeout(Duration),

    /// A non-auth message was sent before authentication completed.
    #[error("connection is not authenticated yet")]
    NotAuthenticated,

    /// Peer disconnected, or there is no current connection.
    #[error("peer disconnected: {0}")]
    Disconnected(String),

    /// Request timed out.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Automatic recovery gave up; a forced retry is required.
    #[error("automatic recovery exhausted after {attempts} attempts")]
    RecoveryExhausted { attempts: u32 },

    /// TLS could not be configured, or its handshake failed.
    #[error("tls error: {0}")]
    Tls(String),

    /// Settings could not be read or written.
    #[error("settings error: {0}")]
    Settings(String),

    /// I/O error outside the framed stream (settings files, pings).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PeerError {
    /// True for violations of the wire contract (framing, decoding, handshake),
    /// as opposed to transport faults.
    pub fn is_protocol_violation(&self) -> bool {
        match self {
            PeerError::Frame(err) => err.is_protocol_violation(),
            PeerError::Decode(_) | PeerError::HandshakeFailed(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, PeerError>;
