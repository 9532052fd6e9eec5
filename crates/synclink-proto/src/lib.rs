//! Typed control messages and their JSON wire encoding.
//!
//! Every message is a JSON object whose `type` key names the variant.
//! Decoding is strict: unknown types, missing required fields and
//! mistyped fields are errors, never silently dropped or defaulted.
//!
//! ```
//! use synclink_proto::{decode, encode, Command, Message};
//!
//! let msg = Message::Command(Command::StopRecord);
//! let bytes = encode(&msg).unwrap();
//! assert_eq!(bytes, br#"{"type":"stop_record"}"#);
//! assert_eq!(decode(&bytes).unwrap(), msg);
//! ```

pub mod codec;
pub mod error;
pub mod message;

pub use codec::{decode, encode};
pub use error::{DecodeError, EncodeError};
pub use message::{
    Ack, AckStatus, Auth, AuthToken, Command, DeviceStatus, FileTransfer, Hello, Message,
    MessageKind,
};
