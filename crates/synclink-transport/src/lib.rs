//! TCP transport for the synclink device control link.
//!
//! This is the lowest layer of synclink. It knows how to dial a controller,
//! listen for devices, and run the short-lived connection pings the quality
//! monitor uses for latency. Everything else builds on the [`TcpStream`]
//! values handed out here.
//!
//! [`TcpStream`]: tokio::net::TcpStream

pub mod endpoint;
pub mod error;
pub mod tcp;

pub use endpoint::{Endpoint, DEFAULT_CONTROL_PORT, LEGACY_CONTROL_PORT};
pub use error::{Result, TransportError};
pub use tcp::{connect, ping, TcpLinkListener, DEFAULT_CONNECT_TIMEOUT};
