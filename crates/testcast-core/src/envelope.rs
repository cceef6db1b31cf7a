//! Message envelopes exchanged over the relay.
//!
//! Wire shape:
//!
//! ```json
//! {"kind": "output", "payload": {"message": "ok", "channel": "primary"}, "timestamp": "2025-01-01T00:00:00.000Z"}
//! ```
//!
//! Every envelope is checked with [`validate`] when it is parsed and again
//! before it is serialized. Anything that fails is never forwarded or handed
//! to a message handler.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::catalog::TestStatus;
use crate::output::{Channel, OutputLine, now_timestamp};

/// Payload message the relay sends to a connection it refuses to admit.
pub const MAX_CLIENTS_REACHED: &str = "MAX_CLIENTS_REACHED";

/// The closed set of envelope kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    /// One console line of a running test.
    Output,
    /// Test lifecycle change (`running`, `passed`, `failed`).
    Status,
    /// Relay-originated failure notice.
    Error,
}

impl EnvelopeKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Output => "output",
            Self::Status => "status",
            Self::Error => "error",
        }
    }

    pub fn from_wire(value: &str) -> Option<Self> {
        match value {
            "output" => Some(Self::Output),
            "status" => Some(Self::Status),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    /// Whether the relay passes this kind on to the other participant.
    pub const fn is_forwardable(self) -> bool {
        matches!(self, Self::Output | Self::Status)
    }
}

/// Why a candidate envelope was rejected.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("envelope is not a JSON object")]
    NotAnObject,

    #[error("missing field `{0}`")]
    MissingField(&'static str),

    #[error("field `{field}` must be a {expected}")]
    WrongType {
        field: &'static str,
        expected: &'static str,
    },

    #[error("unknown envelope kind `{0}`")]
    UnknownKind(String),

    #[error("timestamp is empty")]
    EmptyTimestamp,
}

/// Check that `candidate` has the envelope shape.
pub fn validate(candidate: &Value) -> Result<(), EnvelopeError> {
    let obj = candidate.as_object().ok_or(EnvelopeError::NotAnObject)?;

    let kind = obj
        .get("kind")
        .ok_or(EnvelopeError::MissingField("kind"))?
        .as_str()
        .ok_or(EnvelopeError::WrongType {
            field: "kind",
            expected: "string",
        })?;
    if EnvelopeKind::from_wire(kind).is_none() {
        return Err(EnvelopeError::UnknownKind(kind.to_string()));
    }

    let payload = obj
        .get("payload")
        .ok_or(EnvelopeError::MissingField("payload"))?
        .as_object()
        .ok_or(EnvelopeError::WrongType {
            field: "payload",
            expected: "object",
        })?;
    payload
        .get("message")
        .ok_or(EnvelopeError::MissingField("payload.message"))?
        .as_str()
        .ok_or(EnvelopeError::WrongType {
            field: "payload.message",
            expected: "string",
        })?;

    let timestamp = obj
        .get("timestamp")
        .ok_or(EnvelopeError::MissingField("timestamp"))?
        .as_str()
        .ok_or(EnvelopeError::WrongType {
            field: "timestamp",
            expected: "string",
        })?;
    if timestamp.is_empty() {
        return Err(EnvelopeError::EmptyTimestamp);
    }

    Ok(())
}

/// Pure predicate form of [`validate`].
pub fn is_valid(candidate: &Value) -> bool {
    validate(candidate).is_ok()
}

/// Envelope payload: a required `message` plus any extra members.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub message: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A validated, timestamped unit exchanged over the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: EnvelopeKind,
    pub payload: Payload,
    pub timestamp: String,
}

impl Envelope {
    /// Build an envelope stamped with the current time.
    pub fn new(kind: EnvelopeKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            payload: Payload {
                message: message.into(),
                extra: Map::new(),
            },
            timestamp: now_timestamp(),
        }
    }

    /// Attach an extra payload member.
    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.extra.insert(key.into(), value.into());
        self
    }

    /// `output` envelope carrying one console line. Keeps the line's own timestamp.
    pub fn output(line: &OutputLine) -> Self {
        Self {
            kind: EnvelopeKind::Output,
            payload: Payload {
                message: line.text.clone(),
                extra: Map::new(),
            },
            timestamp: line.timestamp.clone(),
        }
        .with_extra("channel", line.channel.as_str())
    }

    pub fn status(status: TestStatus) -> Self {
        Self::new(EnvelopeKind::Status, status.as_str())
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(EnvelopeKind::Error, message)
    }

    /// The envelope the relay sends to a connection beyond its capacity.
    pub fn capacity_exceeded() -> Self {
        Self::error(MAX_CLIENTS_REACHED)
    }

    /// Parse and validate a text frame.
    pub fn from_json(text: &str) -> Result<Self, EnvelopeError> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(value)
    }

    /// Validate an already-parsed value and convert it.
    pub fn from_value(value: Value) -> Result<Self, EnvelopeError> {
        validate(&value)?;
        Ok(serde_json::from_value(value)?)
    }

    /// Validate and serialize to a text frame.
    pub fn to_json(&self) -> Result<String, EnvelopeError> {
        let value = serde_json::to_value(self)?;
        validate(&value)?;
        Ok(value.to_string())
    }

    pub fn message(&self) -> &str {
        &self.payload.message
    }

    /// Source channel of an `output` envelope, when present.
    pub fn channel(&self) -> Option<Channel> {
        self.payload
            .extra
            .get("channel")
            .and_then(Value::as_str)
            .and_then(Channel::from_wire)
    }

    pub fn is_capacity_rejection(&self) -> bool {
        self.kind == EnvelopeKind::Error && self.payload.message == MAX_CLIENTS_REACHED
    }
}
