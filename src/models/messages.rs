use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::ProtocolError;
use crate::models::{MessageClass, UserDescriptor};

/// Wire envelope for every client and server message
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

impl Envelope {
    /// Build a server envelope with a fresh message id
    pub fn new<P: Serialize>(kind: &str, payload: &P) -> Self {
        Self {
            kind: kind.to_string(),
            payload: serde_json::to_value(payload).unwrap_or(Value::Null),
            timestamp: chrono::Utc::now().timestamp_millis(),
            user_id: None,
            message_id: Some(Uuid::new_v4().to_string()),
        }
    }

    /// Build an envelope attributed to the user that caused it
    pub fn from_user<P: Serialize>(kind: &str, payload: &P, user_id: &str) -> Self {
        let mut envelope = Self::new(kind, payload);
        envelope.user_id = Some(user_id.to_string());
        envelope
    }

    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(raw).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Server-sent event names
pub mod server_events {
    pub const JOINED_FORM: &str = "joined:form";
    pub const LEFT_FORM: &str = "left:form";
    pub const USER_JOINED: &str = "user:joined";
    pub const USER_LEFT: &str = "user:left";
    pub const CURSOR_UPDATE: &str = "cursor:update";
    pub const CURSOR_HIDDEN: &str = "cursor:hidden";
    pub const QUESTION_UPDATED: &str = "question:updated";
    pub const QUESTION_FOCUSED: &str = "question:focused";
    pub const QUESTION_BLURRED: &str = "question:blurred";
    pub const FORM_SAVED: &str = "form:saved";
    pub const USER_TYPING: &str = "user:typing";
    pub const USER_STOPPED_TYPING: &str = "user:stopped_typing";
    pub const HEARTBEAT_ACK: &str = "heartbeat:ack";
    pub const ERROR: &str = "error";
}

/// Every message type a client may send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEventKind {
    JoinForm,
    LeaveForm,
    CursorMove,
    CursorHide,
    QuestionUpdate,
    QuestionFocus,
    QuestionBlur,
    FormSave,
    UserTyping,
    UserStoppedTyping,
    Heartbeat,
}

impl ClientEventKind {
    pub fn from_type(kind: &str) -> Option<Self> {
        let kind = match kind {
            "join:form" => Self::JoinForm,
            "leave:form" => Self::LeaveForm,
            "cursor:move" => Self::CursorMove,
            "cursor:hide" => Self::CursorHide,
            "question:update" => Self::QuestionUpdate,
            "question:focus" => Self::QuestionFocus,
            "question:blur" => Self::QuestionBlur,
            "form:save" => Self::FormSave,
            "user:typing" => Self::UserTyping,
            "user:stopped_typing" => Self::UserStoppedTyping,
            "heartbeat" => Self::Heartbeat,
            _ => return None,
        };
        Some(kind)
    }

    /// Rate limit bucket the message is counted against
    pub fn message_class(&self) -> MessageClass {
        match self {
            Self::JoinForm | Self::LeaveForm => MessageClass::Room,
            Self::CursorMove | Self::CursorHide => MessageClass::Cursor,
            Self::QuestionFocus | Self::QuestionBlur | Self::UserTyping | Self::UserStoppedTyping => {
                MessageClass::Activity
            }
            Self::QuestionUpdate | Self::FormSave => MessageClass::Content,
            Self::Heartbeat => MessageClass::Heartbeat,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct JoinFormPayload {
    pub form_id: String,
}

/// Payload of messages that only target a room
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct RoomPayload {
    #[serde(default)]
    pub form_id: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CursorMovePayload {
    #[serde(default)]
    pub form_id: Option<String>,
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub element_id: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct QuestionUpdatePayload {
    #[serde(default)]
    pub form_id: Option<String>,
    pub question_id: String,
    pub content: Value,
    #[serde(default)]
    pub version: Option<i64>,
    #[serde(default)]
    pub update_type: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct QuestionFocusPayload {
    #[serde(default)]
    pub form_id: Option<String>,
    pub question_id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TypingPayload {
    #[serde(default)]
    pub form_id: Option<String>,
    #[serde(default)]
    pub element_id: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct HeartbeatPayload {
    /// Client send time in ms
    #[serde(default)]
    pub timestamp: Option<i64>,
}

/// A decoded client message
#[derive(Debug, Clone)]
pub enum ClientEvent {
    JoinForm(JoinFormPayload),
    LeaveForm(RoomPayload),
    CursorMove(CursorMovePayload),
    CursorHide(RoomPayload),
    QuestionUpdate(QuestionUpdatePayload),
    QuestionFocus(QuestionFocusPayload),
    QuestionBlur(QuestionFocusPayload),
    FormSave(RoomPayload),
    UserTyping(TypingPayload),
    UserStoppedTyping(TypingPayload),
    Heartbeat(HeartbeatPayload),
}

impl ClientEvent {
    pub fn decode(kind: ClientEventKind, payload: Value) -> Result<Self, ProtocolError> {
        let event = match kind {
            ClientEventKind::JoinForm => Self::JoinForm(payload_as(payload)?),
            ClientEventKind::LeaveForm => Self::LeaveForm(payload_as(payload)?),
            ClientEventKind::CursorMove => Self::CursorMove(payload_as(payload)?),
            ClientEventKind::CursorHide => Self::CursorHide(payload_as(payload)?),
            ClientEventKind::QuestionUpdate => Self::QuestionUpdate(payload_as(payload)?),
            ClientEventKind::QuestionFocus => Self::QuestionFocus(payload_as(payload)?),
            ClientEventKind::QuestionBlur => Self::QuestionBlur(payload_as(payload)?),
            ClientEventKind::FormSave => Self::FormSave(payload_as(payload)?),
            ClientEventKind::UserTyping => Self::UserTyping(payload_as(payload)?),
            ClientEventKind::UserStoppedTyping => Self::UserStoppedTyping(payload_as(payload)?),
            ClientEventKind::Heartbeat => Self::Heartbeat(payload_as(payload)?),
        };
        Ok(event)
    }
}

// A missing payload is read as an empty object so that `{"type":"leave:form"}` is valid.
fn payload_as<T: DeserializeOwned>(payload: Value) -> Result<T, ProtocolError> {
    let payload = if payload.is_null() {
        Value::Object(Default::default())
    } else {
        payload
    };
    serde_json::from_value(payload).map_err(|e| ProtocolError::InvalidPayload(e.to_string()))
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct JoinedFormMessage {
    pub form_id: String,
    pub connection_id: String,
    pub user: UserDescriptor,
    pub users: Vec<UserDescriptor>,
    pub cursors: Vec<crate::models::Cursor>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LeftFormMessage {
    pub form_id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct UserJoinedMessage {
    pub form_id: String,
    pub user: UserDescriptor,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct UserLeftMessage {
    pub form_id: String,
    pub user_id: String,
    pub reason: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CursorHiddenMessage {
    pub form_id: String,
    pub user_id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct QuestionActivityMessage {
    pub form_id: String,
    pub question_id: String,
    pub user_id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct FormSavedMessage {
    pub form_id: String,
    pub user_id: String,
    pub saved_at: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TypingMessage {
    pub form_id: String,
    pub user_id: String,
    pub element_id: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HeartbeatAckMessage {
    pub server_time: i64,
    pub latency_ms: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_client_envelope() {
        let raw = r#"{"type":"cursor:move","payload":{"form_id":"form_1","x":10,"y":20},"timestamp":5}"#;
        let envelope = Envelope::parse(raw).unwrap();
        assert_eq!(envelope.kind, "cursor:move");
        let kind = ClientEventKind::from_type(&envelope.kind).unwrap();
        assert_eq!(kind.message_class(), MessageClass::Cursor);
        match ClientEvent::decode(kind, envelope.payload).unwrap() {
            ClientEvent::CursorMove(p) => {
                assert_eq!(p.form_id.as_deref(), Some("form_1"));
                assert_eq!((p.x, p.y), (10.0, 20.0));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn missing_payload_is_an_empty_object() {
        let envelope = Envelope::parse(r#"{"type":"leave:form"}"#).unwrap();
        let event = ClientEvent::decode(ClientEventKind::LeaveForm, envelope.payload).unwrap();
        assert!(matches!(event, ClientEvent::LeaveForm(RoomPayload { form_id: None })));
    }

    #[test]
    fn unknown_type_is_not_recognised() {
        assert!(ClientEventKind::from_type("cursor:teleport").is_none());
    }

    #[test]
    fn malformed_json_is_a_protocol_error() {
        assert!(matches!(Envelope::parse("{not json"), Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn bad_payload_is_rejected() {
        let err = ClientEvent::decode(ClientEventKind::CursorMove, json!({"x": "left"})).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPayload(_)));
    }

    #[test]
    fn server_envelope_serializes_type_field() {
        let envelope = Envelope::from_user(
            server_events::USER_LEFT,
            &UserLeftMessage {
                form_id: "form_1".into(),
                user_id: "a".into(),
                reason: "left".into(),
            },
            "a",
        );
        let value: Value = serde_json::from_str(&envelope.to_json()).unwrap();
        assert_eq!(value["type"], "user:left");
        assert_eq!(value["payload"]["reason"], "left");
        assert_eq!(value["user_id"], "a");
        assert!(value["message_id"].is_string());
    }
}
