use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Response for an error
#[derive(Serialize, Deserialize, Debug)]
pub struct ErrorResponse {
    pub code: u16,
    pub status: String,
    pub error: String,
}

/// Error codes sent to websocket clients
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    AuthenticationFailed,
    InvalidFormId,
    RoomFull,
    InvalidMessageFormat,
    RateLimitExceeded,
    PermissionDenied,
    NotInRoom,
    RoomLimitExceeded,
    MessageTooLarge,
    StoreUnavailable,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::AuthenticationFailed => "AUTHENTICATION_FAILED",
            ErrorCode::InvalidFormId => "INVALID_FORM_ID",
            ErrorCode::RoomFull => "ROOM_FULL",
            ErrorCode::InvalidMessageFormat => "INVALID_MESSAGE_FORMAT",
            ErrorCode::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",
            ErrorCode::NotInRoom => "NOT_IN_ROOM",
            ErrorCode::RoomLimitExceeded => "ROOM_LIMIT_EXCEEDED",
            ErrorCode::MessageTooLarge => "MESSAGE_TOO_LARGE",
            ErrorCode::StoreUnavailable => "STORE_UNAVAILABLE",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// Payload of an `error` event
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}
