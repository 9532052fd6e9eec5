use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Subcommand};
use synclink_frame::FrameError;
use synclink_peer::{ControllerHandshakeConfig, ControllerListener, PeerError};
use synclink_proto::AuthToken;

use crate::exit::{peer_error, CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod device;
pub mod listen;
pub mod send;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the device agent against a controller.
    Device(DeviceArgs),
    /// Accept one device and print every message it sends.
    Listen(ListenArgs),
    /// Accept one device and send it a single command.
    Send(SendArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub async fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Device(args) => device::run(args, format).await,
        Command::Listen(args) => listen::run(args, format).await,
        Command::Send(args) => send::run(args, format).await,
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct DeviceArgs {
    /// Controller host.
    #[arg(long, env = "SYNCLINK_HOST")]
    pub host: Option<String>,
    /// Controller port (default 9000).
    #[arg(long, env = "SYNCLINK_PORT")]
    pub port: Option<u16>,
    /// Dial the legacy port instead of the default one.
    #[arg(long)]
    pub legacy: bool,
    /// Identifier sent in hello.
    #[arg(long)]
    pub device_id: Option<String>,
    /// Shared token for authentication.
    #[arg(long, env = "SYNCLINK_TOKEN", hide_env_values = true)]
    pub token: Option<String>,
    /// Directory for sync markers and calibration images.
    #[arg(long, value_name = "DIR", default_value = "synclink-data")]
    pub data_dir: PathBuf,
    /// Link settings file (JSON). Flags override its values.
    #[arg(long, value_name = "FILE")]
    pub settings: Option<PathBuf>,
    /// Write the effective settings back to --settings.
    #[arg(long, requires = "settings")]
    pub save_settings: bool,
    /// Do not reconnect after the link drops.
    #[arg(long)]
    pub no_reconnect: bool,
    /// Dial the controller over TLS.
    #[arg(long)]
    pub tls: bool,
    /// Trusted CA bundle (PEM) for --tls.
    #[arg(long, value_name = "FILE", requires = "tls")]
    pub tls_ca: Option<PathBuf>,
    /// Ping controller latency periodically.
    #[arg(long)]
    pub ping_quality: bool,
    /// Stop after this long (e.g. 30s, 500ms). Runs until Ctrl-C otherwise.
    #[arg(long)]
    pub run_for: Option<String>,
}

#[derive(Args, Debug)]
pub struct ListenArgs {
    /// Address to accept devices on.
    #[arg(long, env = "SYNCLINK_BIND", default_value = "0.0.0.0:9000")]
    pub bind: String,
    /// Require devices to authenticate with this token.
    #[arg(long, env = "SYNCLINK_TOKEN", hide_env_values = true)]
    pub token: Option<String>,
    /// Exit after printing N messages.
    #[arg(long)]
    pub count: Option<usize>,
}

#[derive(Args, Debug)]
pub struct SendArgs {
    /// Address to accept devices on.
    #[arg(long, env = "SYNCLINK_BIND", default_value = "0.0.0.0:9000")]
    pub bind: String,
    /// Require devices to authenticate with this token.
    #[arg(long, env = "SYNCLINK_TOKEN", hide_env_values = true)]
    pub token: Option<String>,
    /// Command as JSON, e.g. '{"type":"stop_record"}'.
    #[arg(long)]
    pub json: String,
    /// Wait for the command's ack and exit non-zero if it is an error.
    #[arg(long)]
    pub wait: bool,
    /// Longest silence from the device while waiting (e.g. 10s, 500ms).
    #[arg(long, default_value = "10s")]
    pub wait_timeout: String,
    /// Where files requested with send_file are written.
    #[arg(long, value_name = "DIR", default_value = ".")]
    pub out_dir: PathBuf,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show build details.
    #[arg(long)]
    pub extended: bool,
}

/// Bind a controller listener, requiring `token` when given.
pub async fn bind_controller(addr: &str, token: Option<&str>) -> CliResult<ControllerListener> {
    let listener = ControllerListener::bind(addr)
        .await
        .map_err(|err| peer_error("bind failed", err))?;
    let handshake = ControllerHandshakeConfig {
        expected_token: token.filter(|t| !t.is_empty()).map(AuthToken::new),
        ..ControllerHandshakeConfig::default()
    };
    Ok(listener.with_handshake_config(handshake))
}

/// True when `err` just means the device went away.
pub fn is_disconnect(err: &PeerError) -> bool {
    matches!(
        err,
        PeerError::Disconnected(_) | PeerError::Frame(FrameError::ConnectionClosed)
    )
}

pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(match unit {
        "ms" => Duration::from_millis(value),
        _ => Duration::from_secs(value),
    })
}
