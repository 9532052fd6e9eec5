//! Device synchronization and control link for multi-sensor recording.
//!
//! A controller drives recording devices over a framed JSON protocol on TCP;
//! devices answer every command with an ack, stream files back in chunks,
//! and reconnect on their own when the link drops.
//!
//! # Crate Structure
//!
//! - [`transport`]: TCP dial/listen and connect pings
//! - [`frame`]: length-prefixed framing
//! - [`proto`]: message model and JSON codec
//! - [`peer`]: authenticated channel, quality monitor, recovery manager
//! - [`device`]: command processor, file transfer and the device agent
//!   (behind the `device` feature)

/// Re-export transport types.
pub mod transport {
    pub use synclink_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use synclink_frame::*;
}

/// Re-export protocol types.
pub mod proto {
    pub use synclink_proto::*;
}

/// Re-export link types.
pub mod peer {
    pub use synclink_peer::*;
}

/// Re-export device types (requires `device` feature).
#[cfg(feature = "device")]
pub mod device {
    pub use synclink_device::*;
}
