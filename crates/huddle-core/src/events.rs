use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Wrapper placed around every published session event.
///
/// Envelopes are only ever transmitted, never persisted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event: String,
    pub data: serde_json::Value,
    /// ISO-8601 UTC timestamp with millisecond precision.
    pub timestamp: String,
}

impl EventEnvelope {
    /// Build an envelope stamped with the current time.
    pub fn new(event: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event: event.into(),
            data,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }
}
