//! Seam for the external message codec.
//!
//! The router never interprets payloads. Clients that want to send commands
//! by name or read decoded telemetry plug an encoder/decoder in here and
//! keep codec failures on their side of the queues.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies a command by owning application and command name.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CommandKey {
    pub app: String,
    pub command: String,
}

impl CommandKey {
    pub fn new(app: &str, command: &str) -> Self {
        Self {
            app: app.to_owned(),
            command: command.to_owned(),
        }
    }
}

impl fmt::Display for CommandKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.app, self.command)
    }
}

/// A payload field value handed to the encoder.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub enum FieldValue {
    Int(i64),
    UInt(u64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
}

/// What the decoder recognized a telemetry frame as.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct MessageDescriptor {
    pub app: String,
    pub message: String,
    pub topic_id: u16,
}

/// Failures reported by an encoder or decoder.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum CodecError {
    #[error("unknown command {0}")]
    UnknownCommand(CommandKey),

    #[error("field `{field}` does not match the schema: {reason}")]
    FieldMismatch { field: String, reason: String },

    #[error("malformed message: {0}")]
    Malformed(String),
}

/// Turns a named command and its fields into wire bytes.
pub trait CommandEncoder: Send + Sync {
    fn encode(&self, key: &CommandKey, fields: &[(String, FieldValue)]) -> Result<Vec<u8>, CodecError>;
}

/// Turns wire bytes into a decoded telemetry message.
pub trait TelemetryDecoder: Send + Sync {
    type Message;

    fn decode(&self, bytes: &[u8]) -> Result<(MessageDescriptor, Self::Message), CodecError>;
}
