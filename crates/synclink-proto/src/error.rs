/// Errors produced while decoding a payload into a [`Message`](crate::Message).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// The payload is not a UTF-8 JSON object.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// A required field is absent (or `type` is absent or not a string).
    #[error("missing required field `{0}`")]
    MissingField(String),

    /// The `type` discriminant names no known message.
    #[error("unknown message type `{0}`")]
    UnknownType(String),

    /// A field is present but has the wrong JSON type or an invalid value.
    #[error("invalid field in `{kind}` message: {reason}")]
    InvalidField { kind: &'static str, reason: String },
}

/// Errors produced while encoding a [`Message`](crate::Message).
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("failed to serialize message: {0}")]
    Json(#[from] serde_json::Error),
}
