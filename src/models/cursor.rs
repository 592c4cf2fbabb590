use serde::{Deserialize, Serialize};

/// Last known cursor position of a user in a room
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Cursor {
    pub form_id: String,
    pub user_id: String,
    pub x: f64,
    pub y: f64,
    pub element_id: Option<String>,
    pub color: String,
    pub updated_at: i64,
}
