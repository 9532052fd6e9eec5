use std::path::PathBuf;

use synclink_peer::PeerError;

/// Failure reported by an external collaborator, by category.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DelegateError {
    /// Storage, device or network I/O.
    #[error("{0}")]
    Io(String),

    /// Missing permission or refused access.
    #[error("{0}")]
    Permission(String),

    /// The collaborator is not in a state that allows the call.
    #[error("{0}")]
    InvalidState(String),

    #[error("{0}")]
    Other(String),
}

impl DelegateError {
    /// Human-readable ack text, prefixed with the category.
    pub fn ack_message(&self) -> String {
        match self {
            DelegateError::Io(detail) => format!("Network error: {detail}"),
            DelegateError::Permission(detail) => format!("Permission error: {detail}"),
            DelegateError::InvalidState(detail) => format!("State error: {detail}"),
            DelegateError::Other(detail) => format!("Processing error: {detail}"),
        }
    }
}

impl From<std::io::Error> for DelegateError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::PermissionDenied => DelegateError::Permission(err.to_string()),
            _ => DelegateError::Io(err.to_string()),
        }
    }
}

pub type DelegateResult<T> = std::result::Result<T, DelegateError>;

/// Why a command was refused. Always turned into an error ack.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("Already recording")]
    AlreadyRecording,

    #[error("Not currently recording")]
    NotRecording,

    /// A collaborator failure; the message carries its category prefix.
    #[error("{}", .0.ack_message())]
    Delegate(#[from] DelegateError),

    /// Command-specific failure text, relayed verbatim.
    #[error("{0}")]
    Failed(String),
}

/// File transfer failures. Reported as `send_file` error acks.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("File not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Not a regular file: {}", .0.display())]
    NotAFile(PathBuf),

    #[error("Cannot open {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("File too large: {size} bytes (max {max})")]
    TooLarge { size: u64, max: u64 },

    #[error("Read failed after {offset} bytes: {source}")]
    Read {
        offset: u64,
        #[source]
        source: std::io::Error,
    },

    /// The file changed size while it was being sent.
    #[error("Size mismatch: declared {declared} bytes, read {actual}")]
    SizeMismatch { declared: u64, actual: u64 },

    /// The link failed mid-transfer.
    #[error("link error: {0}")]
    Link(#[from] PeerError),

    #[error("transfer queue is closed")]
    QueueClosed,
}

/// Receiver-side sequencing violations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AssemblyError {
    #[error("file_chunk or file_end without file_info")]
    NotStarted,

    #[error("file_info for {incoming} while {active} is still open")]
    AlreadyStarted { active: String, incoming: String },

    #[error("declared size {size} exceeds limit {max}")]
    TooLarge { size: u64, max: u64 },

    #[error("chunk {got} out of sequence (expected {expected})")]
    Gap { expected: u64, got: u64 },

    #[error("duplicate chunk {0}")]
    Duplicate(u64),

    #[error("chunk overflows declared size: {received} of {declared} bytes")]
    Overflow { declared: u64, received: u64 },

    #[error("file_end after {received} of {declared} bytes")]
    EarlyEnd { declared: u64, received: u64 },

    #[error("file_end names {got}, expected {expected}")]
    NameMismatch { expected: String, got: String },
}

/// Errors surfaced by the device agent itself.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error(transparent)]
    Peer(#[from] PeerError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, DeviceError>;
