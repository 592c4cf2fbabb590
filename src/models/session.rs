use serde::{Deserialize, Serialize};

/// Per-user session, shared by all of the user's connections
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct UserSession {
    pub user_id: String,
    pub name: Option<String>,
    pub device: Option<String>,
    pub connection_ids: Vec<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub expires_at: i64,
}

/// Store record of a live websocket connection
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ConnectionRecord {
    pub id: String,
    pub user_id: String,
    pub instance_id: String,
    pub rooms: Vec<String>,
    pub connected_at: i64,
    pub last_seen: i64,
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
}
