//! Stream events: the wire contract between a turn and its client.
//!
//! One JSON object per event, framed as an SSE `data:` line:
//!
//! ```text
//! {"type": "status"|"token"|"error"|"done",
//!  "data": {...},
//!  "timestamp": <float seconds>,
//!  "correlation_id": "<string>"}
//! ```
//!
//! | Type | `data` | Terminal |
//! |------|--------|----------|
//! | `status` | `{stage, message?}` | no |
//! | `token` | `{text}` | no |
//! | `error` | `{error_type, message, fatal, correlation_id}` | when `fatal` |
//! | `done` | `{provider, tier, passages, elapsed_ms, ...}` | yes |

use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Discriminant of a [`StreamEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Status,
    Token,
    Error,
    Done,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status => write!(f, "status"),
            Self::Token => write!(f, "token"),
            Self::Error => write!(f, "error"),
            Self::Done => write!(f, "done"),
        }
    }
}

/// `data` of an `error` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorData {
    pub error_type: String,
    /// Already sanitised.
    pub message: String,
    pub fatal: bool,
    pub correlation_id: String,
}

/// `data` of a `done` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoneData {
    pub provider: String,
    pub tier: String,
    pub passages: usize,
    pub elapsed_ms: u64,
    #[serde(default)]
    pub fallbacks: usize,
    #[serde(default)]
    pub verified: Option<bool>,
}

/// One event on a turn's stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub data: Value,
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
    pub correlation_id: String,
}

fn now_secs() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

impl StreamEvent {
    fn new(event_type: EventType, data: Value, correlation_id: &str) -> Self {
        Self {
            event_type,
            data,
            timestamp: now_secs(),
            correlation_id: correlation_id.to_string(),
        }
    }

    /// Progress marker for a pipeline stage.
    pub fn status(correlation_id: &str, stage: &str, message: Option<&str>) -> Self {
        let mut data = json!({ "stage": stage });
        if let Some(m) = message {
            data["message"] = json!(m);
        }
        Self::new(EventType::Status, data, correlation_id)
    }

    pub fn token(correlation_id: &str, text: &str) -> Self {
        Self::new(EventType::Token, json!({ "text": text }), correlation_id)
    }

    /// `message` must already be sanitised.
    pub fn error(correlation_id: &str, error_type: &str, message: &str, fatal: bool) -> Self {
        let data = ErrorData {
            error_type: error_type.to_string(),
            message: message.to_string(),
            fatal,
            correlation_id: correlation_id.to_string(),
        };
        Self::new(
            EventType::Error,
            serde_json::to_value(data).unwrap_or(Value::Null),
            correlation_id,
        )
    }

    pub fn done(correlation_id: &str, data: &DoneData) -> Self {
        Self::new(
            EventType::Done,
            serde_json::to_value(data).unwrap_or(Value::Null),
            correlation_id,
        )
    }

    /// Text of a `token` event.
    pub fn token_text(&self) -> Option<&str> {
        match self.event_type {
            EventType::Token => self.data.get("text").and_then(Value::as_str),
            _ => None,
        }
    }

    pub fn error_data(&self) -> Option<ErrorData> {
        match self.event_type {
            EventType::Error => serde_json::from_value(self.data.clone()).ok(),
            _ => None,
        }
    }

    pub fn done_data(&self) -> Option<DoneData> {
        match self.event_type {
            EventType::Done => serde_json::from_value(self.data.clone()).ok(),
            _ => None,
        }
    }

    /// Whether nothing may follow this event.
    pub fn is_terminal(&self) -> bool {
        match self.event_type {
            EventType::Done => true,
            EventType::Error => self
                .data
                .get("fatal")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            _ => false,
        }
    }

    /// `data: <json>\n\n`.
    pub fn to_sse(&self) -> Result<String, serde_json::Error> {
        Ok(format!("data: {}\n\n", serde_json::to_string(self)?))
    }
}
