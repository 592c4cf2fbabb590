use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, Script};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{info, warn};

use super::{keys, now_ms, RelayMessage, RelayScope, RelayStream, StateStore};
use crate::error::StoreError;
use crate::models::{ConnectionRecord, Cursor, QuestionUpdate, RateLimitInfo, Room, UserSession};

// KEYS[1] = member connections set, KEYS[2] = room members set
// ARGV[1] = user id, ARGV[2] = connection id
// Returns 1 only to the caller that removed the user's last connection.
const REMOVE_MEMBER_SCRIPT: &str = r#"
redis.call('SREM', KEYS[1], ARGV[2])
if redis.call('SCARD', KEYS[1]) == 0 then
    return redis.call('SREM', KEYS[2], ARGV[1])
end
return 0
"#;

// KEYS[1] = room record, KEYS[2] = room members set, KEYS[3] = room cursors index,
// KEYS[4] = rooms index
// ARGV[1] = form id, ARGV[2] = idle cutoff in epoch ms
// Deletes only an empty room that is gone or inactive since the cutoff.
const DELETE_IDLE_ROOM_SCRIPT: &str = r#"
if redis.call('SCARD', KEYS[2]) > 0 then
    return 0
end
local json = redis.call('GET', KEYS[1])
if json then
    local room = cjson.decode(json)
    if room.is_active or room.updated_at > tonumber(ARGV[2]) then
        return 0
    end
end
redis.call('DEL', KEYS[1], KEYS[2], KEYS[3])
redis.call('SREM', KEYS[4], ARGV[1])
return 1
"#;

/// Redis backed state store shared by every instance of the fleet
pub struct RedisStore {
    client: Client,
    conn: MultiplexedConnection,
    remove_member: Script,
    delete_idle_room: Script,
    /// Membership sets expire this long after the last join or refresh
    membership_ttl: Duration,
}

impl RedisStore {
    /// Connect to Redis and verify the connection with a PING
    pub async fn connect(url: &str, membership_ttl: Duration) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        let store = Self {
            client,
            conn,
            remove_member: Script::new(REMOVE_MEMBER_SCRIPT),
            delete_idle_room: Script::new(DELETE_IDLE_ROOM_SCRIPT),
            membership_ttl,
        };
        store.ping().await?;
        info!("Connected to Redis state store");
        Ok(store)
    }

    fn conn(&self) -> MultiplexedConnection {
        self.conn.clone()
    }

    async fn set_json<T: Serialize + Sync>(&self, key: &str, value: &T, ttl: Duration) -> Result<(), StoreError> {
        let json = serde_json::to_string(value)?;
        let mut conn = self.conn();
        let _: () = conn.set_ex(key, json, ttl_secs(ttl)).await?;
        Ok(())
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        let mut conn = self.conn();
        let json: Option<String> = conn.get(key).await?;
        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn delete_key(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let _: () = conn.del(key).await?;
        Ok(())
    }
}

// Redis expiry has second granularity, never zero
fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

fn channel_for(scope: &RelayScope) -> String {
    match scope {
        RelayScope::Room(form_id) => keys::room_channel(form_id),
        RelayScope::User(user_id) => keys::user_channel(user_id),
    }
}

#[async_trait]
impl StateStore for RedisStore {
    async fn save_room(&self, room: &Room, ttl: Duration) -> Result<(), StoreError> {
        let json = serde_json::to_string(room)?;
        let mut conn = self.conn();
        let _: () = redis::pipe()
            .atomic()
            .set_ex(keys::room(&room.form_id), json, ttl_secs(ttl))
            .ignore()
            .sadd(keys::rooms_index(), &room.form_id)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_room(&self, form_id: &str) -> Result<Option<Room>, StoreError> {
        self.get_json(&keys::room(form_id)).await
    }

    async fn delete_room_if_idle(&self, form_id: &str, idle_since: i64) -> Result<bool, StoreError> {
        let mut conn = self.conn();
        let deleted: i64 = self
            .delete_idle_room
            .key(keys::room(form_id))
            .key(keys::room_members(form_id))
            .key(keys::room_cursors(form_id))
            .key(keys::rooms_index())
            .arg(form_id)
            .arg(idle_since)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }

    async fn list_rooms(&self) -> Result<Vec<Room>, StoreError> {
        let mut conn = self.conn();
        let mut ids: Vec<String> = conn.smembers(keys::rooms_index()).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        ids.sort();
        let room_keys: Vec<String> = ids.iter().map(|id| keys::room(id)).collect();
        let values: Vec<Option<String>> = redis::cmd("MGET").arg(&room_keys).query_async(&mut conn).await?;

        let mut rooms = Vec::with_capacity(values.len());
        let mut expired = Vec::new();
        for (id, value) in ids.iter().zip(values) {
            match value {
                Some(json) => rooms.push(serde_json::from_str::<Room>(&json)?),
                None => expired.push(id.clone()),
            }
        }
        if !expired.is_empty() {
            let _: () = conn.srem(keys::rooms_index(), &expired).await?;
        }
        Ok(rooms)
    }

    async fn add_room_member(&self, form_id: &str, user_id: &str, connection_id: &str) -> Result<bool, StoreError> {
        let conns_key = keys::member_connections(form_id, user_id);
        let members_key = keys::room_members(form_id);
        let ttl = ttl_secs(self.membership_ttl) as i64;
        let mut conn = self.conn();
        let (_, added, _, _): (i64, i64, i64, i64) = redis::pipe()
            .atomic()
            .sadd(&conns_key, connection_id)
            .sadd(&members_key, user_id)
            .expire(&conns_key, ttl)
            .expire(&members_key, ttl)
            .query_async(&mut conn)
            .await?;
        Ok(added == 1)
    }

    async fn remove_room_member(&self, form_id: &str, user_id: &str, connection_id: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn();
        let removed: i64 = self
            .remove_member
            .key(keys::member_connections(form_id, user_id))
            .key(keys::room_members(form_id))
            .arg(user_id)
            .arg(connection_id)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }

    async fn list_room_members(&self, form_id: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn();
        let mut members: Vec<String> = conn.smembers(keys::room_members(form_id)).await?;
        members.sort();
        Ok(members)
    }

    async fn list_member_connections(&self, form_id: &str, user_id: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn();
        let connections: Vec<String> = conn.smembers(keys::member_connections(form_id, user_id)).await?;
        Ok(connections)
    }

    async fn refresh_room_member(&self, form_id: &str, user_id: &str) -> Result<(), StoreError> {
        let ttl = ttl_secs(self.membership_ttl) as i64;
        let mut conn = self.conn();
        let _: () = redis::pipe()
            .atomic()
            .expire(keys::member_connections(form_id, user_id), ttl)
            .ignore()
            .expire(keys::room_members(form_id), ttl)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn save_session(&self, session: &UserSession, ttl: Duration) -> Result<(), StoreError> {
        self.set_json(&keys::session(&session.user_id), session, ttl).await
    }

    async fn get_session(&self, user_id: &str) -> Result<Option<UserSession>, StoreError> {
        self.get_json(&keys::session(user_id)).await
    }

    async fn delete_session(&self, user_id: &str) -> Result<(), StoreError> {
        self.delete_key(&keys::session(user_id)).await
    }

    async fn save_connection(&self, record: &ConnectionRecord, ttl: Duration) -> Result<(), StoreError> {
        self.set_json(&keys::connection(&record.id), record, ttl).await
    }

    async fn get_connection(&self, connection_id: &str) -> Result<Option<ConnectionRecord>, StoreError> {
        self.get_json(&keys::connection(connection_id)).await
    }

    async fn delete_connection(&self, connection_id: &str) -> Result<(), StoreError> {
        self.delete_key(&keys::connection(connection_id)).await
    }

    async fn save_cursor(&self, cursor: &Cursor, ttl: Duration) -> Result<(), StoreError> {
        let json = serde_json::to_string(cursor)?;
        let index_key = keys::room_cursors(&cursor.form_id);
        let mut conn = self.conn();
        let _: () = redis::pipe()
            .atomic()
            .set_ex(keys::cursor(&cursor.form_id, &cursor.user_id), json, ttl_secs(ttl))
            .ignore()
            .sadd(&index_key, &cursor.user_id)
            .ignore()
            .expire(&index_key, ttl_secs(ttl) as i64)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_cursor(&self, form_id: &str, user_id: &str) -> Result<Option<Cursor>, StoreError> {
        self.get_json(&keys::cursor(form_id, user_id)).await
    }

    async fn list_room_cursors(&self, form_id: &str) -> Result<Vec<Cursor>, StoreError> {
        let index_key = keys::room_cursors(form_id);
        let mut conn = self.conn();
        let mut users: Vec<String> = conn.smembers(&index_key).await?;
        if users.is_empty() {
            return Ok(Vec::new());
        }
        users.sort();
        let cursor_keys: Vec<String> = users.iter().map(|u| keys::cursor(form_id, u)).collect();
        let values: Vec<Option<String>> = redis::cmd("MGET").arg(&cursor_keys).query_async(&mut conn).await?;

        let mut cursors = Vec::with_capacity(values.len());
        let mut stale = Vec::new();
        for (user_id, value) in users.iter().zip(values) {
            match value {
                Some(json) => cursors.push(serde_json::from_str::<Cursor>(&json)?),
                None => stale.push(user_id.clone()),
            }
        }
        // Index entries of expired cursors
        if !stale.is_empty() {
            let _: () = conn.srem(&index_key, &stale).await?;
        }
        Ok(cursors)
    }

    async fn delete_cursor(&self, form_id: &str, user_id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let _: () = redis::pipe()
            .atomic()
            .del(keys::cursor(form_id, user_id))
            .ignore()
            .srem(keys::room_cursors(form_id), user_id)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn check_rate_limit(&self, key: &str, limit: u64, window: Duration) -> Result<RateLimitInfo, StoreError> {
        let window_ms = (window.as_millis() as u64).max(1);
        let mut conn = self.conn();
        // The first hit creates the counter with the window as TTL, later hits only increment
        let (_, count, mut pttl): (Option<String>, u64, i64) = redis::pipe()
            .atomic()
            .cmd("SET").arg(key).arg(0).arg("NX").arg("PX").arg(window_ms)
            .cmd("INCR").arg(key)
            .cmd("PTTL").arg(key)
            .query_async(&mut conn)
            .await?;
        if pttl < 0 {
            warn!(key, "Rate limit counter without expiry, resetting its window");
            let _: () = conn.pexpire(key, window_ms as i64).await?;
            pttl = window_ms as i64;
        }
        Ok(RateLimitInfo {
            key: key.to_string(),
            limit,
            count,
            window_ms,
            reset_at: now_ms() + pttl,
            blocked: count > limit,
        })
    }

    async fn save_question_update(&self, update: &QuestionUpdate, history_len: usize, ttl: Duration) -> Result<(), StoreError> {
        let json = serde_json::to_string(update)?;
        let key = keys::question_history(&update.form_id, &update.question_id);
        let keep = history_len.max(1) as isize - 1;
        let mut conn = self.conn();
        let _: () = redis::pipe()
            .atomic()
            .lpush(&key, json)
            .ignore()
            .ltrim(&key, 0, keep)
            .ignore()
            .expire(&key, ttl_secs(ttl) as i64)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn list_question_updates(&self, form_id: &str, question_id: &str) -> Result<Vec<QuestionUpdate>, StoreError> {
        let mut conn = self.conn();
        let values: Vec<String> = conn.lrange(keys::question_history(form_id, question_id), 0, -1).await?;
        values
            .iter()
            .map(|json| serde_json::from_str(json).map_err(StoreError::from))
            .collect()
    }

    async fn publish(&self, message: &RelayMessage) -> Result<(), StoreError> {
        let json = serde_json::to_string(message)?;
        let mut conn = self.conn();
        let _: () = conn.publish(channel_for(&message.scope), json).await?;
        Ok(())
    }

    async fn subscribe(&self) -> Result<RelayStream, StoreError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.psubscribe(keys::CHANNEL_PATTERN).await?;
        info!(pattern = keys::CHANNEL_PATTERN, "Subscribed to relay channels");
        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let payload: String = match msg.get_payload() {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("Unreadable relay payload on {}: {}", msg.get_channel_name(), e);
                    return None;
                }
            };
            match serde_json::from_str::<RelayMessage>(&payload) {
                Ok(message) => Some(message),
                Err(e) => {
                    warn!("Malformed relay message on {}: {}", msg.get_channel_name(), e);
                    None
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let _pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}
