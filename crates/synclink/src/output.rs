use std::io::{IsTerminal, Write};
use std::net::SocketAddr;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;
use synclink_peer::{LinkStatus, RecoveryPhase};
use synclink_proto::{Auth, FileTransfer, Message};

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct MessageOutput<'a> {
    event: &'static str,
    kind: &'static str,
    device_id: &'a str,
    summary: String,
    message: serde_json::Value,
    timestamp: String,
}

pub fn print_message(message: &Message, device_id: &str, format: OutputFormat) {
    let kind = message.kind().as_str();
    match format {
        OutputFormat::Json => {
            let out = MessageOutput {
                event: "message_received",
                kind,
                device_id,
                summary: summary(message),
                message: message_json(message),
                timestamp: now_unix_seconds(),
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["KIND", "DEVICE", "SUMMARY"])
                .add_row(vec![kind.to_string(), device_id.to_string(), summary(message)]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!("kind={kind} device={device_id} {}", summary(message));
        }
        OutputFormat::Raw => match synclink_proto::encode(message) {
            Ok(mut bytes) => {
                bytes.push(b'\n');
                print_raw(&bytes);
            }
            Err(err) => eprintln!("error: {err}"),
        },
    }
}

#[derive(Serialize)]
struct LinkStatusOutput {
    event: &'static str,
    connected: bool,
    connection_id: Option<u64>,
    transport: &'static str,
    quality: u8,
    attempts: u32,
    phase: &'static str,
    timestamp: String,
}

pub fn print_link_status(status: &LinkStatus, format: OutputFormat) {
    let phase = phase_name(status.phase);
    match format {
        OutputFormat::Json => {
            let out = LinkStatusOutput {
                event: "link_status",
                connected: status.connected,
                connection_id: status.connection_id,
                transport: status.transport,
                quality: status.quality,
                attempts: status.attempts,
                phase,
                timestamp: now_unix_seconds(),
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let connection = status
                .connection_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| "-".to_string());
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["CONNECTED", "CONNECTION", "QUALITY", "ATTEMPTS", "PHASE"])
                .add_row(vec![
                    status.connected.to_string(),
                    connection,
                    status.quality.to_string(),
                    status.attempts.to_string(),
                    phase.to_string(),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty | OutputFormat::Raw => {
            println!(
                "connected={} connection={:?} quality={} attempts={} phase={phase}",
                status.connected, status.connection_id, status.quality, status.attempts
            );
        }
    }
}

/// First stdout line of controller commands, so callers binding port 0
/// learn the address.
pub fn print_listening(addr: SocketAddr, format: OutputFormat) {
    match format {
        OutputFormat::Json => println!(
            "{}",
            serde_json::json!({ "event": "listening", "addr": addr.to_string() })
        ),
        _ => println!("listening on {addr}"),
    }
    let _ = std::io::stdout().flush();
}

#[derive(Serialize)]
struct SavedFileOutput<'a> {
    event: &'static str,
    path: String,
    size: u64,
    device_id: &'a str,
}

pub fn print_saved_file(path: &Path, size: u64, device_id: &str, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = SavedFileOutput {
                event: "file_saved",
                path: path.display().to_string(),
                size,
                device_id,
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        _ => println!("saved {} ({size} bytes) from {device_id}", path.display()),
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

/// One-line human summary. Never includes auth tokens or chunk payloads.
pub fn summary(message: &Message) -> String {
    match message {
        Message::Command(command) => command.name().to_string(),
        Message::Ack(ack) => match &ack.message {
            Some(text) => format!("{} {}: {text}", ack.cmd, status_word(ack.is_ok())),
            None => format!("{} {}", ack.cmd, status_word(ack.is_ok())),
        },
        Message::Status(status) => format!(
            "recording={} battery={} storage={} temperature={}",
            status.recording,
            status
                .battery
                .map(|b| format!("{b}%"))
                .unwrap_or_else(|| "unknown".to_string()),
            status.storage.as_deref().unwrap_or("unknown"),
            status
                .temperature
                .map(|t| format!("{t:.1}C"))
                .unwrap_or_else(|| "unknown".to_string()),
        ),
        Message::Hello(hello) => format!(
            "device={} capabilities={}",
            hello.device_id,
            hello.capabilities.join(",")
        ),
        Message::Auth(Auth::Authenticate { .. }) => "authenticate".to_string(),
        Message::Auth(Auth::AuthResponse { success, .. }) => {
            format!("auth_response {}", status_word(*success))
        }
        Message::FileTransfer(FileTransfer::FileInfo { name, size }) => {
            format!("{name} ({size} bytes)")
        }
        Message::FileTransfer(FileTransfer::FileChunk { seq, data }) => {
            format!("chunk {seq} ({} bytes)", data.len())
        }
        Message::FileTransfer(FileTransfer::FileEnd { name }) => format!("{name} complete"),
    }
}

fn status_word(ok: bool) -> &'static str {
    if ok {
        "ok"
    } else {
        "error"
    }
}

fn message_json(message: &Message) -> serde_json::Value {
    if let Message::Auth(Auth::Authenticate { .. }) = message {
        return serde_json::json!({ "type": "authenticate", "token": "<redacted>" });
    }
    synclink_proto::encode(message)
        .ok()
        .and_then(|bytes| serde_json::from_slice(&bytes).ok())
        .unwrap_or(serde_json::Value::Null)
}

fn phase_name(phase: RecoveryPhase) -> &'static str {
    match phase {
        RecoveryPhase::Idle => "idle",
        RecoveryPhase::Recovering => "recovering",
        RecoveryPhase::ManualInterventionRequired => "manual_intervention_required",
    }
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}

#[cfg(test)]
mod tests {
    use synclink_proto::{Ack, AuthToken, Command, DeviceStatus};

    use super::*;

    #[test]
    fn summaries_are_single_line() {
        let ack: Message = Ack::error("stop_record", "Not currently recording").into();
        assert_eq!(summary(&ack), "stop_record error: Not currently recording");

        let status: Message = DeviceStatus {
            battery: Some(85),
            storage: None,
            temperature: Some(36.54),
            recording: true,
            connected: true,
        }
        .into();
        assert_eq!(
            summary(&status),
            "recording=true battery=85% storage=unknown temperature=36.5C"
        );

        assert_eq!(summary(&Command::StopRecord.into()), "stop_record");
    }

    #[test]
    fn authenticate_token_is_never_printed() {
        let message = Message::Auth(Auth::Authenticate {
            token: AuthToken::new("s3cret"),
        });
        assert!(!summary(&message).contains("s3cret"));
        assert!(!message_json(&message).to_string().contains("s3cret"));
    }

    #[test]
    fn chunk_summary_omits_payload() {
        let message = Message::FileTransfer(FileTransfer::FileChunk {
            seq: 3,
            data: b"abcdef".to_vec(),
        });
        assert_eq!(summary(&message), "chunk 3 (6 bytes)");
    }
}
