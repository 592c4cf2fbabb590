use std::fmt;
use serde::{Deserialize, Serialize};

/// Rate limit bucket of a client message
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageClass {
    Room,
    Cursor,
    Activity,
    Content,
    Heartbeat,
}

impl MessageClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageClass::Room => "room",
            MessageClass::Cursor => "cursor",
            MessageClass::Activity => "activity",
            MessageClass::Content => "content",
            MessageClass::Heartbeat => "heartbeat",
        }
    }
}

impl fmt::Display for MessageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a fixed-window check-and-increment
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RateLimitInfo {
    pub key: String,
    pub limit: u64,
    pub count: u64,
    pub window_ms: u64,
    /// Epoch ms at which the window resets
    pub reset_at: i64,
    pub blocked: bool,
}
