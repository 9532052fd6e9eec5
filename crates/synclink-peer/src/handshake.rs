use std::collections::HashSet;
use std::time::Duration;

use synclink_frame::{FrameError, FrameReader, FrameWriter};
use synclink_proto::{Auth, AuthToken, Hello, Message};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use crate::error::{PeerError, Result};

const MAX_DEVICE_ID_LEN: usize = 128;
const MAX_CAPABILITIES: usize = 64;
const MAX_CAPABILITY_LEN: usize = 64;
const MAX_AUTH_TOKEN_LEN: usize = 4096;

/// Time a device waits for `auth_response` before closing the connection.
pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(30);

/// Time a controller waits for the opening `hello`.
pub const DEFAULT_HELLO_TIMEOUT: Duration = Duration::from_secs(10);

/// Capabilities a device announces when nothing else is configured.
pub const DEFAULT_CAPABILITIES: &[&str] = &["rgb_video", "thermal", "shimmer"];

/// Which capability set to announce on a new connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CapabilityProfile {
    /// Every configured capability.
    #[default]
    Full,
    /// Configured capabilities minus the optional ones.
    Reduced,
}

/// Device-side handshake settings.
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    pub device_id: String,
    pub capabilities: Vec<String>,
    /// Capabilities dropped under [`CapabilityProfile::Reduced`].
    pub optional_capabilities: Vec<String>,
    /// When set, an `authenticate` message follows `hello`.
    pub auth_token: Option<AuthToken>,
    pub auth_timeout: Duration,
}

impl HandshakeConfig {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            capabilities: DEFAULT_CAPABILITIES.iter().map(|c| c.to_string()).collect(),
            optional_capabilities: vec!["shimmer".to_string()],
            auth_token: None,
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
        }
    }

    pub fn with_auth_token(mut self, token: AuthToken) -> Self {
        self.auth_token = Some(token);
        self
    }

    pub fn requires_auth(&self) -> bool {
        self.auth_token.is_some()
    }

    /// Build the `hello` announced for `profile`.
    pub fn hello(&self, profile: CapabilityProfile) -> Result<Hello> {
        validate_device_id(&self.device_id)?;
        let capabilities = normalize_capabilities(&self.capabilities)?;
        let capabilities = match profile {
            CapabilityProfile::Full => capabilities,
            CapabilityProfile::Reduced => capabilities
                .into_iter()
                .filter(|cap| !self.optional_capabilities.contains(cap))
                .collect(),
        };
        Ok(Hello {
            device_id: self.device_id.clone(),
            capabilities,
        })
    }

    /// The `authenticate` message, if a token is configured.
    pub fn authenticate(&self) -> Result<Option<Message>> {
        match &self.auth_token {
            Some(token) => {
                validate_auth_token(token)?;
                Ok(Some(Message::Auth(Auth::Authenticate {
                    token: token.clone(),
                })))
            }
            None => Ok(None),
        }
    }
}

/// Controller-side handshake settings.
#[derive(Debug, Clone)]
pub struct ControllerHandshakeConfig {
    /// When set, devices must authenticate with this token.
    pub expected_token: Option<AuthToken>,
    pub hello_timeout: Duration,
    pub auth_timeout: Duration,
}

impl Default for ControllerHandshakeConfig {
    fn default() -> Self {
        Self {
            expected_token: None,
            hello_timeout: DEFAULT_HELLO_TIMEOUT,
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
        }
    }
}

/// Result of a controller-side handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResult {
    pub hello: Hello,
    /// True when the device presented the expected token.
    pub authenticated: bool,
}

/// Accept a device: read its `hello` and, if a token is expected, verify
/// its `authenticate` and answer with `auth_response`.
pub async fn handshake_controller<R, W>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    config: &ControllerHandshakeConfig,
) -> Result<HandshakeResult>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let hello = match recv_message(reader, config.hello_timeout).await? {
        Message::Hello(hello) => hello,
        other => {
            return Err(PeerError::HandshakeFailed(format!(
                "expected hello, got {}",
                other.kind()
            )))
        }
    };
    validate_device_id(&hello.device_id)?;
    normalize_capabilities(&hello.capabilities)?;
    debug!(device_id = %hello.device_id, capabilities = ?hello.capabilities, "hello received");

    let Some(expected) = &config.expected_token else {
        return Ok(HandshakeResult {
            hello,
            authenticated: false,
        });
    };

    let presented = match recv_message(reader, config.auth_timeout).await {
        Ok(Message::Auth(Auth::Authenticate { token })) => token,
        Ok(other) => {
            return Err(PeerError::HandshakeFailed(format!(
                "expected authenticate, got {}",
                other.kind()
            )))
        }
        Err(PeerError::Timeout(timeout)) => return Err(PeerError::AuthTimeout(timeout)),
        Err(err) => return Err(err),
    };

    if tokens_match(expected, &presented) {
        send_message(writer, &auth_response(true, None)).await?;
        Ok(HandshakeResult {
            hello,
            authenticated: true,
        })
    } else {
        warn!(device_id = %hello.device_id, token = ?presented, "device presented a wrong token");
        send_message(writer, &auth_response(false, Some("invalid token"))).await?;
        Err(PeerError::AuthRejected("invalid token".to_string()))
    }
}

pub(crate) fn auth_response(success: bool, message: Option<&str>) -> Message {
    Message::Auth(Auth::AuthResponse {
        success,
        message: message.map(str::to_string),
    })
}

/// Read and decode one message within `timeout`.
pub(crate) async fn recv_message<R: AsyncRead + Unpin>(
    reader: &mut FrameReader<R>,
    timeout: Duration,
) -> Result<Message> {
    let frame = match tokio::time::timeout(timeout, reader.read_frame()).await {
        Err(_) => return Err(PeerError::Timeout(timeout)),
        Ok(Err(FrameError::ConnectionClosed)) => {
            return Err(PeerError::Disconnected(
                "connection closed during handshake".to_string(),
            ))
        }
        Ok(result) => result?,
    };
    Ok(synclink_proto::decode(&frame)?)
}

/// Encode and write one message.
pub(crate) async fn send_message<W: AsyncWrite + Unpin>(
    writer: &mut FrameWriter<W>,
    message: &Message,
) -> Result<usize> {
    let payload = synclink_proto::encode(message)?;
    Ok(writer.send(&payload).await?)
}

fn normalize_capabilities(capabilities: &[String]) -> Result<Vec<String>> {
    if capabilities.len() > MAX_CAPABILITIES {
        return Err(PeerError::HandshakeFailed(format!(
            "too many capabilities: {} (max {})",
            capabilities.len(),
            MAX_CAPABILITIES
        )));
    }

    let mut seen = HashSet::with_capacity(capabilities.len());
    let mut out = Vec::with_capacity(capabilities.len());

    for capability in capabilities {
        if capability.is_empty() || capability.len() > MAX_CAPABILITY_LEN {
            return Err(PeerError::HandshakeFailed(format!(
                "invalid capability name length: {}",
                capability.len()
            )));
        }
        if seen.insert(capability.as_str()) {
            out.push(capability.clone());
        }
    }

    Ok(out)
}

fn validate_device_id(device_id: &str) -> Result<()> {
    if device_id.is_empty() || device_id.len() > MAX_DEVICE_ID_LEN {
        return Err(PeerError::HandshakeFailed(format!(
            "invalid device id length: {}",
            device_id.len()
        )));
    }
    Ok(())
}

fn validate_auth_token(token: &AuthToken) -> Result<()> {
    let len = token.expose().len();
    if len == 0 || len > MAX_AUTH_TOKEN_LEN {
        return Err(PeerError::HandshakeFailed(format!(
            "invalid auth token length: {len}"
        )));
    }
    Ok(())
}

fn tokens_match(expected: &AuthToken, presented: &AuthToken) -> bool {
    let a = expected.expose().as_bytes();
    let b = presented.expose().as_bytes();
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
