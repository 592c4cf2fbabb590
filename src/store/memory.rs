use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::Instant;
use tracing::warn;

use super::{now_ms, RelayMessage, RelayStream, StateStore};
use crate::error::StoreError;
use crate::models::{ConnectionRecord, Cursor, QuestionUpdate, RateLimitInfo, Room, UserSession};

const RELAY_CAPACITY: usize = 4096;

struct Expiring<T> {
    value: T,
    expires_at: Instant,
}

impl<T> Expiring<T> {
    fn new(value: T, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

// Connection ids a user holds in a room. Without a membership TTL it never expires.
#[derive(Default)]
struct Membership {
    connections: HashSet<String>,
    expires_at: Option<Instant>,
}

impl Membership {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

#[derive(Default)]
struct State {
    rooms: HashMap<String, Expiring<Room>>,
    // room -> user -> membership
    members: HashMap<String, HashMap<String, Membership>>,
    sessions: HashMap<String, Expiring<UserSession>>,
    connections: HashMap<String, Expiring<ConnectionRecord>>,
    cursors: HashMap<(String, String), Expiring<Cursor>>,
    counters: HashMap<String, Expiring<u64>>,
    questions: HashMap<(String, String), Expiring<VecDeque<QuestionUpdate>>>,
}

// Removes the entry when it has expired and returns a clone of the live value.
fn live_value<K, T>(map: &mut HashMap<K, Expiring<T>>, key: &K) -> Option<T>
where
    K: std::hash::Hash + Eq,
    T: Clone,
{
    let now = Instant::now();
    match map.get(key) {
        Some(entry) if entry.is_live(now) => Some(entry.value.clone()),
        Some(_) => {
            map.remove(key);
            None
        }
        None => None,
    }
}

// Drops the room's expired memberships and returns the live ones
fn live_members<'a>(state: &'a mut State, form_id: &str) -> Option<&'a mut HashMap<String, Membership>> {
    let now = Instant::now();
    let users = state.members.get_mut(form_id)?;
    users.retain(|_, membership| membership.is_live(now));
    Some(users)
}

struct Inner {
    state: Mutex<State>,
    membership_ttl: Option<Duration>,
    relay: broadcast::Sender<RelayMessage>,
    unavailable: AtomicBool,
}

/// Process-local store with the same semantics as the networked one.
///
/// Clones share state and the relay channel, so several hubs built on clones of one
/// `MemoryStore` behave like instances of a fleet.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Memberships expire `ttl` after their last join or refresh, like the Redis sets
    pub fn with_membership_ttl(ttl: Duration) -> Self {
        Self::build(Some(ttl))
    }

    fn build(membership_ttl: Option<Duration>) -> Self {
        let (relay, _) = broadcast::channel(RELAY_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                membership_ttl,
                relay,
                unavailable: AtomicBool::new(false),
            }),
        }
    }

    /// Simulates an outage: every operation fails with `StoreError::Unavailable`
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn state(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store marked unavailable".to_string()));
        }
        self.inner
            .state
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn save_room(&self, room: &Room, ttl: Duration) -> Result<(), StoreError> {
        let mut state = self.state()?;
        state.rooms.insert(room.form_id.clone(), Expiring::new(room.clone(), ttl));
        Ok(())
    }

    async fn get_room(&self, form_id: &str) -> Result<Option<Room>, StoreError> {
        let mut state = self.state()?;
        Ok(live_value(&mut state.rooms, &form_id.to_string()))
    }

    async fn delete_room_if_idle(&self, form_id: &str, idle_since: i64) -> Result<bool, StoreError> {
        let mut state = self.state()?;
        if live_members(&mut state, form_id).is_some_and(|users| !users.is_empty()) {
            return Ok(false);
        }
        if let Some(room) = live_value(&mut state.rooms, &form_id.to_string()) {
            if room.is_active || room.updated_at > idle_since {
                return Ok(false);
            }
        }
        state.rooms.remove(form_id);
        state.members.remove(form_id);
        state.cursors.retain(|(room, _), _| room != form_id);
        Ok(true)
    }

    async fn list_rooms(&self) -> Result<Vec<Room>, StoreError> {
        let mut state = self.state()?;
        let now = Instant::now();
        state.rooms.retain(|_, room| room.is_live(now));
        let mut rooms: Vec<Room> = state.rooms.values().map(|r| r.value.clone()).collect();
        rooms.sort_by(|a, b| a.form_id.cmp(&b.form_id));
        Ok(rooms)
    }

    async fn add_room_member(&self, form_id: &str, user_id: &str, connection_id: &str) -> Result<bool, StoreError> {
        let expires_at = self.inner.membership_ttl.map(|ttl| Instant::now() + ttl);
        let mut state = self.state()?;
        live_members(&mut state, form_id);
        let membership = state
            .members
            .entry(form_id.to_string())
            .or_default()
            .entry(user_id.to_string())
            .or_default();
        let first = membership.connections.is_empty();
        membership.connections.insert(connection_id.to_string());
        membership.expires_at = expires_at;
        Ok(first)
    }

    async fn remove_room_member(&self, form_id: &str, user_id: &str, connection_id: &str) -> Result<bool, StoreError> {
        let mut state = self.state()?;
        let Some(users) = live_members(&mut state, form_id) else {
            return Ok(false);
        };
        let Some(membership) = users.get_mut(user_id) else {
            return Ok(false);
        };
        membership.connections.remove(connection_id);
        if membership.connections.is_empty() {
            users.remove(user_id);
            return Ok(true);
        }
        Ok(false)
    }

    async fn list_room_members(&self, form_id: &str) -> Result<Vec<String>, StoreError> {
        let mut state = self.state()?;
        let mut members: Vec<String> = live_members(&mut state, form_id)
            .map(|users| users.keys().cloned().collect())
            .unwrap_or_default();
        members.sort();
        Ok(members)
    }

    async fn list_member_connections(&self, form_id: &str, user_id: &str) -> Result<Vec<String>, StoreError> {
        let mut state = self.state()?;
        Ok(live_members(&mut state, form_id)
            .and_then(|users| users.get(user_id))
            .map(|membership| membership.connections.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn refresh_room_member(&self, form_id: &str, user_id: &str) -> Result<(), StoreError> {
        let expires_at = self.inner.membership_ttl.map(|ttl| Instant::now() + ttl);
        let mut state = self.state()?;
        if let Some(membership) = live_members(&mut state, form_id).and_then(|users| users.get_mut(user_id)) {
            membership.expires_at = expires_at;
        }
        Ok(())
    }

    async fn save_session(&self, session: &UserSession, ttl: Duration) -> Result<(), StoreError> {
        let mut state = self.state()?;
        state.sessions.insert(session.user_id.clone(), Expiring::new(session.clone(), ttl));
        Ok(())
    }

    async fn get_session(&self, user_id: &str) -> Result<Option<UserSession>, StoreError> {
        let mut state = self.state()?;
        Ok(live_value(&mut state.sessions, &user_id.to_string()))
    }

    async fn delete_session(&self, user_id: &str) -> Result<(), StoreError> {
        self.state()?.sessions.remove(user_id);
        Ok(())
    }

    async fn save_connection(&self, record: &ConnectionRecord, ttl: Duration) -> Result<(), StoreError> {
        let mut state = self.state()?;
        state.connections.insert(record.id.clone(), Expiring::new(record.clone(), ttl));
        Ok(())
    }

    async fn get_connection(&self, connection_id: &str) -> Result<Option<ConnectionRecord>, StoreError> {
        let mut state = self.state()?;
        Ok(live_value(&mut state.connections, &connection_id.to_string()))
    }

    async fn delete_connection(&self, connection_id: &str) -> Result<(), StoreError> {
        self.state()?.connections.remove(connection_id);
        Ok(())
    }

    async fn save_cursor(&self, cursor: &Cursor, ttl: Duration) -> Result<(), StoreError> {
        let mut state = self.state()?;
        let key = (cursor.form_id.clone(), cursor.user_id.clone());
        state.cursors.insert(key, Expiring::new(cursor.clone(), ttl));
        Ok(())
    }

    async fn get_cursor(&self, form_id: &str, user_id: &str) -> Result<Option<Cursor>, StoreError> {
        let mut state = self.state()?;
        Ok(live_value(&mut state.cursors, &(form_id.to_string(), user_id.to_string())))
    }

    async fn list_room_cursors(&self, form_id: &str) -> Result<Vec<Cursor>, StoreError> {
        let mut state = self.state()?;
        let now = Instant::now();
        state.cursors.retain(|_, cursor| cursor.is_live(now));
        let mut cursors: Vec<Cursor> = state
            .cursors
            .iter()
            .filter(|((room, _), _)| room == form_id)
            .map(|(_, cursor)| cursor.value.clone())
            .collect();
        cursors.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        Ok(cursors)
    }

    async fn delete_cursor(&self, form_id: &str, user_id: &str) -> Result<(), StoreError> {
        self.state()?
            .cursors
            .remove(&(form_id.to_string(), user_id.to_string()));
        Ok(())
    }

    async fn check_rate_limit(&self, key: &str, limit: u64, window: Duration) -> Result<RateLimitInfo, StoreError> {
        let mut state = self.state()?;
        let now = Instant::now();
        let counter = state
            .counters
            .entry(key.to_string())
            .and_modify(|counter| {
                if counter.is_live(now) {
                    counter.value += 1;
                } else {
                    *counter = Expiring::new(1, window);
                }
            })
            .or_insert_with(|| Expiring::new(1, window));
        let remaining = counter.expires_at.saturating_duration_since(now);
        Ok(RateLimitInfo {
            key: key.to_string(),
            limit,
            count: counter.value,
            window_ms: window.as_millis() as u64,
            reset_at: now_ms() + remaining.as_millis() as i64,
            blocked: counter.value > limit,
        })
    }

    async fn save_question_update(&self, update: &QuestionUpdate, history_len: usize, ttl: Duration) -> Result<(), StoreError> {
        let mut state = self.state()?;
        let key = (update.form_id.clone(), update.question_id.clone());
        let now = Instant::now();
        let entry = state
            .questions
            .entry(key)
            .or_insert_with(|| Expiring::new(VecDeque::new(), ttl));
        if !entry.is_live(now) {
            entry.value.clear();
        }
        entry.value.push_front(update.clone());
        entry.value.truncate(history_len);
        entry.expires_at = now + ttl;
        Ok(())
    }

    async fn list_question_updates(&self, form_id: &str, question_id: &str) -> Result<Vec<QuestionUpdate>, StoreError> {
        let mut state = self.state()?;
        let key = (form_id.to_string(), question_id.to_string());
        Ok(live_value(&mut state.questions, &key)
            .map(|history| history.into_iter().collect())
            .unwrap_or_default())
    }

    async fn publish(&self, message: &RelayMessage) -> Result<(), StoreError> {
        drop(self.state()?);
        // No receivers is not an error, the fleet may be a single instance
        let _ = self.inner.relay.send(message.clone());
        Ok(())
    }

    async fn subscribe(&self) -> Result<RelayStream, StoreError> {
        drop(self.state()?);
        let rx = self.inner.relay.subscribe();
        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(message) => return Some((message, rx)),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Relay subscriber lagged behind");
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.state().map(|_| ())
    }
}
