//! Length-prefixed message framing for the synclink control link.
//!
//! Every message on the wire is framed as:
//! - A 4-byte big-endian payload length
//! - Exactly that many payload bytes (UTF-8 JSON from `synclink-proto`)
//!
//! Zero-length frames and frames over the configured maximum (1 MiB by
//! default) are protocol violations. No partial reads leak to callers.

pub mod codec;
pub mod error;
pub mod reader;
pub mod writer;

pub use codec::{decode_frame, encode_frame, FrameConfig, DEFAULT_MAX_PAYLOAD, HEADER_SIZE};
pub use error::{FrameError, Result};
pub use reader::FrameReader;
pub use writer::FrameWriter;
