//! Device-side link management for the synclink control protocol.
//!
//! A [`Connection`] is one framed, optionally authenticated TCP session to
//! the controller. The [`RecoveryManager`] owns the current connection,
//! replaces it after a loss, and hands out a [`LinkSender`] that always
//! targets whichever connection is live. [`QualityMonitor`] scores the link
//! from connect pings and observed throughput.

pub mod channel;
pub mod config;
pub mod error;
pub mod handshake;
pub mod listener;
pub mod quality;
pub mod recovery;
pub mod sink;
pub mod tls;

pub use channel::{
    event_queue, ChannelConfig, ChannelEvent, ChannelState, Connection, ConnectionHandle,
    DisconnectReason, EventReceiver, EventSender, DEFAULT_OUTBOUND_CAPACITY,
};
pub use config::{JsonSettingsStore, LinkSettings, SettingsStore};
pub use error::{PeerError, Result};
pub use handshake::{
    handshake_controller, CapabilityProfile, ControllerHandshakeConfig, HandshakeConfig,
    HandshakeResult, DEFAULT_AUTH_TIMEOUT, DEFAULT_CAPABILITIES, DEFAULT_HELLO_TIMEOUT,
};
pub use listener::{ControllerListener, ControllerSession};
pub use quality::{
    quality_score, LatencyPing, QualityConfig, QualityLevel, QualityMonitor, QualitySample,
    TcpLatencyPing,
};
pub use recovery::{
    retry_delay, Dialer, LinkSender, LinkStatus, RecoveryEvent, RecoveryManager, RecoveryPhase,
    RecoveryPolicy, RecoveryStats, RecoveryStrategy, SessionPreservationRecord, SessionSnapshot,
    TcpDialer,
};
pub use sink::{BoxFuture, MessageSink};
pub use tls::LinkTls;
