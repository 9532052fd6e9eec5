use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{DecodeError, EncodeError};
use crate::message::{Ack, Auth, Command, DeviceStatus, FileTransfer, Hello, Message, MessageKind};

/// Single-struct messages share one tagged wrapper so `type` is written first.
#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Tagged<'a> {
    Ack(&'a Ack),
    Status(&'a DeviceStatus),
    Hello(&'a Hello),
}

/// Serialize a message to compact UTF-8 JSON.
///
/// `type` is always the first key and absent optional fields are omitted.
pub fn encode(message: &Message) -> Result<Vec<u8>, EncodeError> {
    let bytes = match message {
        Message::Command(command) => serde_json::to_vec(command)?,
        Message::Ack(ack) => serde_json::to_vec(&Tagged::Ack(ack))?,
        Message::Status(status) => serde_json::to_vec(&Tagged::Status(status))?,
        Message::Hello(hello) => serde_json::to_vec(&Tagged::Hello(hello))?,
        Message::Auth(auth) => serde_json::to_vec(auth)?,
        Message::FileTransfer(transfer) => serde_json::to_vec(transfer)?,
    };
    Ok(bytes)
}

/// Parse a payload into a message.
///
/// Unknown extra keys are ignored; everything else about the shape is
/// checked: the `type` discriminant, each required field, and field types.
pub fn decode(payload: &[u8]) -> Result<Message, DecodeError> {
    let value: Value =
        serde_json::from_slice(payload).map_err(|err| DecodeError::Malformed(err.to_string()))?;

    let Value::Object(fields) = &value else {
        return Err(DecodeError::Malformed("expected a JSON object".to_string()));
    };

    let name = match fields.get("type") {
        Some(Value::String(name)) => name,
        _ => return Err(DecodeError::MissingField("type".to_string())),
    };
    let kind =
        MessageKind::from_wire(name).ok_or_else(|| DecodeError::UnknownType(name.clone()))?;

    for field in kind.required_fields() {
        match fields.get(*field) {
            None | Some(Value::Null) => return Err(DecodeError::MissingField(field.to_string())),
            Some(_) => {}
        }
    }

    let invalid = |err: serde_json::Error| DecodeError::InvalidField {
        kind: kind.as_str(),
        reason: err.to_string(),
    };

    let message = match kind {
        MessageKind::Ack => Message::Ack(Ack::deserialize(&value).map_err(invalid)?),
        MessageKind::Status => Message::Status(DeviceStatus::deserialize(&value).map_err(invalid)?),
        MessageKind::Hello => Message::Hello(Hello::deserialize(&value).map_err(invalid)?),
        MessageKind::Authenticate | MessageKind::AuthResponse => {
            Message::Auth(Auth::deserialize(&value).map_err(invalid)?)
        }
        MessageKind::FileInfo | MessageKind::FileChunk | MessageKind::FileEnd => {
            Message::FileTransfer(FileTransfer::deserialize(&value).map_err(invalid)?)
        }
        _ => Message::Command(Command::deserialize(&value).map_err(invalid)?),
    };
    Ok(message)
}
