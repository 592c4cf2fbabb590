use serde_json::json;
use thiserror::Error;

use crate::models::{ErrorCode, ErrorPayload, MessageClass, RateLimitInfo};

/// Failures of the distributed state store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Bearer token verification failures
#[derive(Debug, Error, Clone, PartialEq)]
pub enum AuthError {
    #[error("missing bearer token")]
    Missing,

    #[error("invalid token: {0}")]
    Invalid(String),

    #[error("token expired")]
    Expired,

    #[error("token verification is not configured")]
    NotConfigured,
}

/// Malformed or unsupported client frames
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("message of {size} bytes exceeds the limit of {limit} bytes")]
    TooLarge { size: usize, limit: usize },

    #[error("binary frames are not supported")]
    Binary,
}

#[derive(Debug, Error)]
pub enum CollabError {
    #[error(transparent)]
    Authentication(#[from] AuthError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("rate limit exceeded for {class} messages")]
    RateLimited { class: MessageClass, info: RateLimitInfo },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("permission denied for form {0}")]
    PermissionDenied(String),

    #[error("room {0} is full")]
    RoomFull(String),

    #[error("invalid form id: {0}")]
    InvalidFormId(String),

    #[error("not a member of room {0}")]
    NotInRoom(String),

    #[error("a connection may join at most {0} rooms")]
    TooManyRooms(usize),
}

impl CollabError {
    pub fn code(&self) -> ErrorCode {
        match self {
            CollabError::Authentication(_) => ErrorCode::AuthenticationFailed,
            CollabError::Protocol(ProtocolError::TooLarge { .. }) => ErrorCode::MessageTooLarge,
            CollabError::Protocol(_) => ErrorCode::InvalidMessageFormat,
            CollabError::RateLimited { .. } => ErrorCode::RateLimitExceeded,
            CollabError::Store(StoreError::Serialization(_)) => ErrorCode::InternalError,
            CollabError::Store(_) => ErrorCode::StoreUnavailable,
            CollabError::PermissionDenied(_) => ErrorCode::PermissionDenied,
            CollabError::RoomFull(_) => ErrorCode::RoomFull,
            CollabError::InvalidFormId(_) => ErrorCode::InvalidFormId,
            CollabError::NotInRoom(_) => ErrorCode::NotInRoom,
            CollabError::TooManyRooms(_) => ErrorCode::RoomLimitExceeded,
        }
    }

    /// Payload of the `error` event sent back to the client
    pub fn to_payload(&self) -> ErrorPayload {
        let details = match self {
            CollabError::Protocol(ProtocolError::UnknownType(kind)) => Some(json!({ "type": kind })),
            CollabError::Protocol(ProtocolError::TooLarge { size, limit }) => {
                Some(json!({ "size": size, "limit": limit }))
            }
            CollabError::RateLimited { class, info } => Some(json!({
                "class": class.as_str(),
                "limit": info.limit,
                "reset_at": info.reset_at,
            })),
            CollabError::PermissionDenied(form_id)
            | CollabError::RoomFull(form_id)
            | CollabError::NotInRoom(form_id) => Some(json!({ "form_id": form_id })),
            _ => None,
        };
        ErrorPayload {
            code: self.code(),
            message: self.to_string(),
            details,
        }
    }

    pub fn is_store_failure(&self) -> bool {
        matches!(self, CollabError::Store(StoreError::Unavailable(_) | StoreError::Redis(_)))
    }
}

pub type Result<T, E = CollabError> = std::result::Result<T, E>;
