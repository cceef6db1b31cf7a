//! Channel-tagged lines of process output.

use chrono::{DateTime, Local, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Which output stream of the child process a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Standard output.
    Primary,
    /// Standard error.
    Error,
}

impl Channel {
    /// Conventional stream name, used for human-facing output.
    pub const fn label(self) -> &'static str {
        match self {
            Self::Primary => "stdout",
            Self::Error => "stderr",
        }
    }

    /// Wire name, as it appears in envelope payloads.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Error => "error",
        }
    }

    /// Parse a wire name back into a channel.
    pub fn from_wire(value: &str) -> Option<Self> {
        match value {
            "primary" => Some(Self::Primary),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// One reconstructed line of output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputLine {
    pub text: String,
    pub timestamp: String,
    pub channel: Channel,
}

impl OutputLine {
    /// Create a line stamped with the current time.
    pub fn now(text: impl Into<String>, channel: Channel) -> Self {
        Self {
            text: text.into(),
            timestamp: now_timestamp(),
            channel,
        }
    }
}

/// Current UTC time as an RFC 3339 string with millisecond precision.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Render a timestamp as a local 24-hour `HH:MM:SS` clock.
///
/// Strings that are not RFC 3339 are returned unchanged.
pub fn format_clock(timestamp: &str) -> String {
    DateTime::parse_from_rfc3339(timestamp).map_or_else(
        |_| timestamp.to_string(),
        |t| t.with_timezone(&Local).format("%H:%M:%S").to_string(),
    )
}
