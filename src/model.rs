//! Core data model.
//!
//! Call state carried into errors, wire status codes, the custom clock used
//! for request deadlines, and the key/channel naming shared by callers and
//! workers on the same store.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Awaiting state
// ---------------------------------------------------------------------------

/// What a caller asked for. Kept alongside a pending request so failures can
/// report the originating call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwaitingState {
    pub topic: String,
    pub method: String,
    pub args: Option<Value>,
}

impl AwaitingState {
    pub fn new(topic: impl Into<String>, method: impl Into<String>, args: Option<Value>) -> Self {
        Self {
            topic: topic.into(),
            method: method.into(),
            args,
        }
    }
}

impl std::fmt::Display for AwaitingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.topic, self.method)
    }
}

// ---------------------------------------------------------------------------
// Response status
// ---------------------------------------------------------------------------

/// Status codes carried in a response envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// The handler returned a value.
    Success,
    /// The handler failed.
    Rejected,
    /// No handler is bound to the method and there is no fallback.
    UnknownMethod,
}

impl Status {
    pub fn code(self) -> u32 {
        match self {
            Status::Success => 0,
            Status::Rejected => 1,
            Status::UnknownMethod => 2,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Status::Success),
            1 => Some(Status::Rejected),
            2 => Some(Status::UnknownMethod),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Success => "success",
            Status::Rejected => "rejected",
            Status::UnknownMethod => "unknown_method",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// 2023-01-01T00:00:00Z in Unix milliseconds. Deadlines on the wire are
/// relative to this instant.
pub const EPOCH_UNIX_MS: i64 = 1_672_531_200_000;

/// Current time in milliseconds since [`EPOCH_UNIX_MS`].
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis() - EPOCH_UNIX_MS
}

// ---------------------------------------------------------------------------
// Naming
// ---------------------------------------------------------------------------

/// List holding pending requests for a topic.
pub fn queue_key(topic: &str) -> String {
    format!("@tasq:{topic}")
}

/// Channel notified whenever a request is pushed for a topic.
pub fn request_channel(topic: &str) -> String {
    format!("@tasq:s:{topic}")
}

/// Private channel a caller listens on for responses.
pub fn response_channel(caller_id: &str) -> String {
    format!("@tasq:c:{caller_id}")
}
