use serde::{Deserialize, Serialize};

/// A collaboration room, one per form
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Room {
    pub form_id: String,
    pub is_active: bool,
    pub max_users: usize,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Room {
    pub fn new(form_id: &str, max_users: usize, now_ms: i64) -> Self {
        Self {
            form_id: form_id.to_string(),
            is_active: true,
            max_users,
            created_at: now_ms,
            updated_at: now_ms,
        }
    }
}

/// Room summary returned by the rooms listing
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RoomSummary {
    pub form_id: String,
    pub is_active: bool,
    pub member_count: usize,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Room details with live presence
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RoomDetailsResponse {
    pub room: Room,
    pub members: Vec<crate::models::UserDescriptor>,
    pub cursors: Vec<crate::models::Cursor>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RoomListResponse {
    pub rooms: Vec<RoomSummary>,
}
