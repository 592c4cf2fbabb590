#[cfg(test)]
pub(crate) mod contract;
pub mod keys;
pub mod memory;
pub mod redis_store;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::config::Config;
use crate::error::StoreError;
use crate::models::{ConnectionRecord, Cursor, Envelope, QuestionUpdate, RateLimitInfo, Room, UserSession};

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

/// Target of a relayed event
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum RelayScope {
    Room(String),
    User(String),
}

/// Recipients skipped when delivering an event
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Exclude {
    Nobody,
    Connection(Uuid),
    User(String),
}

/// Event published on a room or user channel for the other instances
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RelayMessage {
    /// Instance that published the event
    pub origin: String,
    pub scope: RelayScope,
    pub exclude: Exclude,
    pub envelope: Envelope,
}

pub type RelayStream = BoxStream<'static, RelayMessage>;

/// Shared state of the fleet: rooms, presence, sessions, cursors, rate counters and pub/sub.
///
/// Membership mutations are set operations, safe under concurrent calls from any instance.
/// Connection, cursor and session records carry a TTL so state left behind by a crashed
/// instance expires without a coordinator. `check_rate_limit` is atomic.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn save_room(&self, room: &Room, ttl: Duration) -> Result<(), StoreError>;
    async fn get_room(&self, form_id: &str) -> Result<Option<Room>, StoreError>;
    /// Atomically deletes the room record, its membership and its cursor index, but only
    /// while the room has no members and is either gone or inactive since `idle_since`
    /// (epoch ms) or earlier. Returns whether the room was deleted.
    async fn delete_room_if_idle(&self, form_id: &str, idle_since: i64) -> Result<bool, StoreError>;
    async fn list_rooms(&self) -> Result<Vec<Room>, StoreError>;

    /// Adds a connection of `user_id` to the room. Returns true when this is the
    /// user's first connection in the room.
    async fn add_room_member(&self, form_id: &str, user_id: &str, connection_id: &str) -> Result<bool, StoreError>;
    /// Removes a connection of `user_id` from the room. Returns true for exactly one
    /// caller: the one that removed the user's last connection.
    async fn remove_room_member(&self, form_id: &str, user_id: &str, connection_id: &str) -> Result<bool, StoreError>;
    async fn list_room_members(&self, form_id: &str) -> Result<Vec<String>, StoreError>;
    async fn list_member_connections(&self, form_id: &str, user_id: &str) -> Result<Vec<String>, StoreError>;
    /// Extends the expiry of the room's member set and of the user's connection set
    async fn refresh_room_member(&self, form_id: &str, user_id: &str) -> Result<(), StoreError>;

    async fn save_session(&self, session: &UserSession, ttl: Duration) -> Result<(), StoreError>;
    async fn get_session(&self, user_id: &str) -> Result<Option<UserSession>, StoreError>;
    async fn delete_session(&self, user_id: &str) -> Result<(), StoreError>;

    async fn save_connection(&self, record: &ConnectionRecord, ttl: Duration) -> Result<(), StoreError>;
    async fn get_connection(&self, connection_id: &str) -> Result<Option<ConnectionRecord>, StoreError>;
    async fn delete_connection(&self, connection_id: &str) -> Result<(), StoreError>;

    async fn save_cursor(&self, cursor: &Cursor, ttl: Duration) -> Result<(), StoreError>;
    async fn get_cursor(&self, form_id: &str, user_id: &str) -> Result<Option<Cursor>, StoreError>;
    async fn list_room_cursors(&self, form_id: &str) -> Result<Vec<Cursor>, StoreError>;
    async fn delete_cursor(&self, form_id: &str, user_id: &str) -> Result<(), StoreError>;

    /// Fixed window check-and-increment. The first hit starts the window.
    async fn check_rate_limit(&self, key: &str, limit: u64, window: Duration) -> Result<RateLimitInfo, StoreError>;

    /// Records an update, keeping the newest `history_len` entries per question
    async fn save_question_update(&self, update: &QuestionUpdate, history_len: usize, ttl: Duration) -> Result<(), StoreError>;
    /// Newest first
    async fn list_question_updates(&self, form_id: &str, question_id: &str) -> Result<Vec<QuestionUpdate>, StoreError>;

    async fn publish(&self, message: &RelayMessage) -> Result<(), StoreError>;
    /// Subscribes to every room and user channel
    async fn subscribe(&self) -> Result<RelayStream, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;

    async fn publish_to_room(&self, origin: &str, form_id: &str, envelope: &Envelope, exclude: Exclude) -> Result<(), StoreError> {
        self.publish(&RelayMessage {
            origin: origin.to_string(),
            scope: RelayScope::Room(form_id.to_string()),
            exclude,
            envelope: envelope.clone(),
        })
        .await
    }

    async fn publish_to_user(&self, origin: &str, user_id: &str, envelope: &Envelope, exclude: Exclude) -> Result<(), StoreError> {
        self.publish(&RelayMessage {
            origin: origin.to_string(),
            scope: RelayScope::User(user_id.to_string()),
            exclude,
            envelope: envelope.clone(),
        })
        .await
    }
}

/// Opens the store the configuration asks for.
///
/// A configured Redis that cannot be reached is an error, never a silent switch to
/// process-local state. The in-memory store is only used when no URL is configured.
pub async fn open_store(config: &Config) -> Result<Arc<dyn StateStore>, StoreError> {
    match &config.redis_url {
        Some(url) => {
            let store = RedisStore::connect(url, config.room_ttl()).await?;
            Ok(Arc::new(store))
        }
        None => {
            warn!("No Redis URL configured - using the in-memory store, state is not shared with other instances");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

/// Epoch milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
