//! Persisted link settings.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use synclink_proto::AuthToken;
use synclink_transport::{Endpoint, DEFAULT_CONTROL_PORT, LEGACY_CONTROL_PORT};
use tracing::debug;

use crate::channel::ChannelConfig;
use crate::error::{PeerError, Result};
use crate::handshake::{HandshakeConfig, DEFAULT_AUTH_TIMEOUT, DEFAULT_CAPABILITIES};
use crate::tls::LinkTls;

/// Everything a device needs to reach its controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkSettings {
    pub host: String,
    pub port: u16,
    pub legacy_port: u16,
    /// Dial `legacy_port` instead of `port`.
    pub use_legacy_port: bool,
    pub device_id: String,
    pub capabilities: Vec<String>,
    pub optional_capabilities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<AuthToken>,
    pub connect_timeout_ms: u64,
    pub auth_timeout_ms: u64,
    pub auto_reconnect: bool,
    /// Dial the controller over TLS.
    pub use_tls: bool,
    /// PEM bundle of trusted CAs. The public web roots are used when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_ca_file: Option<PathBuf>,
    /// Name checked against the controller certificate; defaults to `host`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_server_name: Option<String>,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_CONTROL_PORT,
            legacy_port: LEGACY_CONTROL_PORT,
            use_legacy_port: false,
            device_id: "synclink-device".to_string(),
            capabilities: DEFAULT_CAPABILITIES.iter().map(|c| c.to_string()).collect(),
            optional_capabilities: vec!["shimmer".to_string()],
            auth_token: None,
            connect_timeout_ms: 10_000,
            auth_timeout_ms: DEFAULT_AUTH_TIMEOUT.as_millis() as u64,
            auto_reconnect: true,
            use_tls: false,
            tls_ca_file: None,
            tls_server_name: None,
        }
    }
}

impl LinkSettings {
    pub fn endpoint(&self) -> Endpoint {
        let port = if self.use_legacy_port {
            self.legacy_port
        } else {
            self.port
        };
        Endpoint::new(self.host.clone(), port)
    }

    pub fn handshake_config(&self) -> HandshakeConfig {
        HandshakeConfig {
            device_id: self.device_id.clone(),
            capabilities: self.capabilities.clone(),
            optional_capabilities: self.optional_capabilities.clone(),
            auth_token: self.auth_token.clone().filter(|t| !t.is_empty()),
            auth_timeout: Duration::from_millis(self.auth_timeout_ms),
        }
    }

    /// `None` unless `use_tls` is set.
    pub fn tls(&self) -> Result<Option<LinkTls>> {
        if !self.use_tls {
            return Ok(None);
        }
        let server_name = self.tls_server_name.as_deref().unwrap_or(&self.host);
        LinkTls::new(server_name, self.tls_ca_file.as_deref()).map(Some)
    }

    pub fn channel_config(&self) -> Result<ChannelConfig> {
        let mut config = ChannelConfig::new(self.endpoint(), self.handshake_config());
        config.connect_timeout = Duration::from_millis(self.connect_timeout_ms);
        config.tls = self.tls()?;
        Ok(config)
    }

    /// Reject settings that can never produce a working link.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(PeerError::Settings("host must not be empty".to_string()));
        }
        if self.port == 0 || self.legacy_port == 0 {
            return Err(PeerError::Settings("ports must be non-zero".to_string()));
        }
        if self.device_id.trim().is_empty() {
            return Err(PeerError::Settings("device_id must not be empty".to_string()));
        }
        if self.connect_timeout_ms == 0 || self.auth_timeout_ms == 0 {
            return Err(PeerError::Settings("timeouts must be non-zero".to_string()));
        }
        Ok(())
    }
}

/// Load/save collaborator for [`LinkSettings`].
pub trait SettingsStore: Send + Sync {
    /// `Ok(None)` when nothing has been saved yet.
    fn load(&self) -> Result<Option<LinkSettings>>;
    fn save(&self, settings: &LinkSettings) -> Result<()>;
}

/// Settings persisted as a pretty-printed JSON file.
#[derive(Debug, Clone)]
pub struct JsonSettingsStore {
    path: PathBuf,
}

impl JsonSettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsStore for JsonSettingsStore {
    fn load(&self) -> Result<Option<LinkSettings>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let settings: LinkSettings = serde_json::from_slice(&bytes).map_err(|err| {
            PeerError::Settings(format!("{}: {err}", self.path.display()))
        })?;
        settings.validate()?;
        debug!(path = %self.path.display(), "settings loaded");
        Ok(Some(settings))
    }

    fn save(&self, settings: &LinkSettings) -> Result<()> {
        settings.validate()?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(settings)
            .map_err(|err| PeerError::Settings(err.to_string()))?;
        // replace atomically
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), "settings saved");
        Ok(())
    }
}
