use std::fmt;

use serde::{Deserialize, Serialize};

/// Any message that can cross the control link.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Command(Command),
    Ack(Ack),
    Status(DeviceStatus),
    Hello(Hello),
    Auth(Auth),
    FileTransfer(FileTransfer),
}

/// Controller-to-device instructions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    StartRecord {
        session_id: String,
        #[serde(default = "default_true")]
        record_video: bool,
        #[serde(default = "default_true")]
        record_thermal: bool,
        #[serde(default)]
        record_shimmer: bool,
    },
    StopRecord,
    CaptureCalibration {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        calibration_id: Option<String>,
        #[serde(default = "default_true")]
        capture_rgb: bool,
        #[serde(default = "default_true")]
        capture_thermal: bool,
        #[serde(default = "default_true")]
        high_resolution: bool,
    },
    SetStimulusTime {
        /// Target instant, epoch milliseconds.
        time: i64,
    },
    FlashSync {
        #[serde(default = "default_sync_duration_ms")]
        duration_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sync_id: Option<String>,
    },
    BeepSync {
        #[serde(default = "default_frequency_hz")]
        frequency_hz: u32,
        #[serde(default = "default_sync_duration_ms")]
        duration_ms: u64,
        #[serde(default = "default_volume")]
        volume: f32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sync_id: Option<String>,
    },
    SyncTime {
        /// Controller wall clock, epoch milliseconds.
        pc_timestamp: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sync_id: Option<String>,
    },
    SendFile {
        filepath: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filetype: Option<String>,
    },
    FileReceived {
        name: String,
        status: String,
    },
}

impl Command {
    /// Wire name of this command, as echoed in the `cmd` field of its ack.
    pub fn name(&self) -> &'static str {
        MessageKind::of_command(self).as_str()
    }
}

fn default_true() -> bool {
    true
}

fn default_sync_duration_ms() -> u64 {
    200
}

fn default_frequency_hz() -> u32 {
    1000
}

fn default_volume() -> f32 {
    0.8
}

fn default_connected() -> bool {
    true
}

// JSON has no NaN or infinity; such readings are left out instead of sent as null.
fn no_reading(value: &Option<f64>) -> bool {
    !value.is_some_and(f64::is_finite)
}

/// Outcome of a command, sent device-to-controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Ok,
    Error,
}

/// Acknowledgement of a command by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub cmd: String,
    pub status: AckStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Ack {
    /// Success with no message.
    pub fn success(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            status: AckStatus::Ok,
            message: None,
        }
    }

    pub fn ok(cmd: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            status: AckStatus::Ok,
            message: Some(message.into()),
        }
    }

    pub fn error(cmd: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            status: AckStatus::Error,
            message: Some(message.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == AckStatus::Ok
    }
}

/// Device health report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    /// Battery charge, percent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery: Option<u8>,
    /// Free/total storage summary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<String>,
    /// Device temperature, degrees Celsius.
    #[serde(default, skip_serializing_if = "no_reading")]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub recording: bool,
    #[serde(default = "default_connected")]
    pub connected: bool,
}

impl Default for DeviceStatus {
    fn default() -> Self {
        Self {
            battery: None,
            storage: None,
            temperature: None,
            recording: false,
            connected: true,
        }
    }
}

/// First message a device sends on every new connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub device_id: String,
    pub capabilities: Vec<String>,
}

/// Shared secret presented by a device. `Debug` never shows the value.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuthToken(String);

impl AuthToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<redacted:{} bytes>", self.0.len())
    }
}

/// Authentication exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Auth {
    Authenticate {
        token: AuthToken,
    },
    AuthResponse {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

/// Device-to-controller file streaming.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FileTransfer {
    FileInfo {
        name: String,
        size: u64,
    },
    FileChunk {
        /// 1-based chunk sequence number.
        seq: u64,
        /// Raw chunk bytes, base64 on the wire.
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    FileEnd {
        name: String,
    },
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(|err| serde::de::Error::custom(format!("invalid base64 chunk data: {err}")))
    }
}

impl From<Command> for Message {
    fn from(value: Command) -> Self {
        Message::Command(value)
    }
}

impl From<Ack> for Message {
    fn from(value: Ack) -> Self {
        Message::Ack(value)
    }
}

impl From<DeviceStatus> for Message {
    fn from(value: DeviceStatus) -> Self {
        Message::Status(value)
    }
}

impl From<Hello> for Message {
    fn from(value: Hello) -> Self {
        Message::Hello(value)
    }
}

impl From<Auth> for Message {
    fn from(value: Auth) -> Self {
        Message::Auth(value)
    }
}

impl From<FileTransfer> for Message {
    fn from(value: FileTransfer) -> Self {
        Message::FileTransfer(value)
    }
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        MessageKind::of(self)
    }

    /// True for `authenticate` and `auth_response`, the only messages allowed
    /// before a connection is authenticated.
    pub fn is_auth(&self) -> bool {
        matches!(self, Message::Auth(_))
    }
}

/// Every wire discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    StartRecord,
    StopRecord,
    CaptureCalibration,
    SetStimulusTime,
    FlashSync,
    BeepSync,
    SyncTime,
    SendFile,
    FileReceived,
    Ack,
    Status,
    Hello,
    Authenticate,
    AuthResponse,
    FileInfo,
    FileChunk,
    FileEnd,
}

impl MessageKind {
    pub const ALL: [MessageKind; 17] = [
        MessageKind::StartRecord,
        MessageKind::StopRecord,
        MessageKind::CaptureCalibration,
        MessageKind::SetStimulusTime,
        MessageKind::FlashSync,
        MessageKind::BeepSync,
        MessageKind::SyncTime,
        MessageKind::SendFile,
        MessageKind::FileReceived,
        MessageKind::Ack,
        MessageKind::Status,
        MessageKind::Hello,
        MessageKind::Authenticate,
        MessageKind::AuthResponse,
        MessageKind::FileInfo,
        MessageKind::FileChunk,
        MessageKind::FileEnd,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::StartRecord => "start_record",
            MessageKind::StopRecord => "stop_record",
            MessageKind::CaptureCalibration => "capture_calibration",
            MessageKind::SetStimulusTime => "set_stimulus_time",
            MessageKind::FlashSync => "flash_sync",
            MessageKind::BeepSync => "beep_sync",
            MessageKind::SyncTime => "sync_time",
            MessageKind::SendFile => "send_file",
            MessageKind::FileReceived => "file_received",
            MessageKind::Ack => "ack",
            MessageKind::Status => "status",
            MessageKind::Hello => "hello",
            MessageKind::Authenticate => "authenticate",
            MessageKind::AuthResponse => "auth_response",
            MessageKind::FileInfo => "file_info",
            MessageKind::FileChunk => "file_chunk",
            MessageKind::FileEnd => "file_end",
        }
    }

    pub fn from_wire(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }

    /// Fields that must be present for this kind to decode.
    pub fn required_fields(self) -> &'static [&'static str] {
        match self {
            MessageKind::StartRecord => &["session_id"],
            MessageKind::SetStimulusTime => &["time"],
            MessageKind::SyncTime => &["pc_timestamp"],
            MessageKind::SendFile => &["filepath"],
            MessageKind::FileReceived => &["name", "status"],
            MessageKind::Ack => &["cmd", "status"],
            MessageKind::Hello => &["device_id", "capabilities"],
            MessageKind::Authenticate => &["token"],
            MessageKind::AuthResponse => &["success"],
            MessageKind::FileInfo => &["name", "size"],
            MessageKind::FileChunk => &["seq", "data"],
            MessageKind::FileEnd => &["name"],
            MessageKind::StopRecord
            | MessageKind::CaptureCalibration
            | MessageKind::FlashSync
            | MessageKind::BeepSync
            | MessageKind::Status => &[],
        }
    }

    pub fn is_command(self) -> bool {
        matches!(
            self,
            MessageKind::StartRecord
                | MessageKind::StopRecord
                | MessageKind::CaptureCalibration
                | MessageKind::SetStimulusTime
                | MessageKind::FlashSync
                | MessageKind::BeepSync
                | MessageKind::SyncTime
                | MessageKind::SendFile
                | MessageKind::FileReceived
        )
    }

    pub fn of(message: &Message) -> Self {
        match message {
            Message::Command(cmd) => Self::of_command(cmd),
            Message::Ack(_) => MessageKind::Ack,
            Message::Status(_) => MessageKind::Status,
            Message::Hello(_) => MessageKind::Hello,
            Message::Auth(Auth::Authenticate { .. }) => MessageKind::Authenticate,
            Message::Auth(Auth::AuthResponse { .. }) => MessageKind::AuthResponse,
            Message::FileTransfer(FileTransfer::FileInfo { .. }) => MessageKind::FileInfo,
            Message::FileTransfer(FileTransfer::FileChunk { .. }) => MessageKind::FileChunk,
            Message::FileTransfer(FileTransfer::FileEnd { .. }) => MessageKind::FileEnd,
        }
    }

    fn of_command(command: &Command) -> Self {
        match command {
            Command::StartRecord { .. } => MessageKind::StartRecord,
            Command::StopRecord => MessageKind::StopRecord,
            Command::CaptureCalibration { .. } => MessageKind::CaptureCalibration,
            Command::SetStimulusTime { .. } => MessageKind::SetStimulusTime,
            Command::FlashSync { .. } => MessageKind::FlashSync,
            Command::BeepSync { .. } => MessageKind::BeepSync,
            Command::SyncTime { .. } => MessageKind::SyncTime,
            Command::SendFile { .. } => MessageKind::SendFile,
            Command::FileReceived { .. } => MessageKind::FileReceived,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_round_trip_through_wire_names() {
        for kind in MessageKind::ALL {
            assert_eq!(MessageKind::from_wire(kind.as_str()), Some(kind));
        }
        assert_eq!(MessageKind::from_wire("preview_frame"), None);
        assert_eq!(MessageKind::from_wire(""), None);
    }

    #[test]
    fn command_names_match_kinds() {
        assert_eq!(Command::StopRecord.name(), "stop_record");
        let cmd = Command::SendFile {
            filepath: "/tmp/a".to_string(),
            filetype: None,
        };
        assert_eq!(cmd.name(), "send_file");
        assert!(MessageKind::of(&Message::Command(cmd)).is_command());
        assert!(!MessageKind::Ack.is_command());
    }

    #[test]
    fn auth_token_debug_is_redacted() {
        let auth = Auth::Authenticate {
            token: AuthToken::new("hunter22"),
        };
        let rendered = format!("{auth:?}");
        assert!(!rendered.contains("hunter22"));
        assert!(rendered.contains("<redacted:8 bytes>"));
    }

    #[test]
    fn ack_helpers() {
        let ok = Ack::ok("stop_record", "Recording stopped");
        assert!(ok.is_ok());
        let err = Ack::error("start_record", "State error: Already recording");
        assert_eq!(err.status, AckStatus::Error);
        assert!(!err.is_ok());
    }

    #[test]
    fn status_defaults() {
        let status = DeviceStatus::default();
        assert!(status.connected);
        assert!(!status.recording);
        assert!(status.battery.is_none());
    }

    #[test]
    fn non_finite_temperature_is_omitted() {
        for reading in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let status = DeviceStatus {
                temperature: Some(reading),
                ..DeviceStatus::default()
            };
            let json = serde_json::to_value(&status).unwrap();
            assert!(json.get("temperature").is_none(), "{json}");
            let back: DeviceStatus = serde_json::from_value(json).unwrap();
            assert_eq!(back.temperature, None);
        }

        let status = DeviceStatus {
            temperature: Some(36.5),
            ..DeviceStatus::default()
        };
        assert_eq!(serde_json::to_value(&status).unwrap()["temperature"], 36.5);
    }
}
