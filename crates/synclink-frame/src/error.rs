/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The header announced a zero-length payload.
    #[error("empty frame (length 0)")]
    EmptyFrame,

    /// The payload exceeds the configured maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed before a complete frame was received.
    #[error("connection closed (incomplete frame)")]
    ConnectionClosed,

    /// A read or write did not complete within the configured timeout.
    #[error("frame {op} timed out after {timeout:?}")]
    Timeout {
        op: &'static str,
        timeout: std::time::Duration,
    },
}

impl FrameError {
    /// True for violations of the framing contract, as opposed to transport faults.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            FrameError::EmptyFrame | FrameError::PayloadTooLarge { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, FrameError>;
