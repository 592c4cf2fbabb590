use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::warn;
use uuid::Uuid;

use crate::models::Envelope;
use crate::store::Exclude;
use crate::ws::connctx::ConnCtx;

pub type Outbound = mpsc::Sender<Arc<Envelope>>;

/// Result of a non-blocking enqueue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// The outbound queue is full
    Overflow,
    /// The connection is gone
    Gone,
}

#[derive(Clone)]
pub struct ConnHandle {
    pub conn: Arc<ConnCtx>,
    pub tx: Outbound,
}

impl ConnHandle {
    fn excluded(&self, exclude: &Exclude) -> bool {
        match exclude {
            Exclude::Nobody => false,
            Exclude::Connection(id) => self.conn.id == *id,
            Exclude::User(user_id) => self.conn.user_id() == user_id,
        }
    }

    pub fn try_deliver(&self, envelope: &Arc<Envelope>) -> Delivery {
        match self.tx.try_send(envelope.clone()) {
            Ok(()) => Delivery::Delivered,
            Err(TrySendError::Full(_)) => Delivery::Overflow,
            Err(TrySendError::Closed(_)) => Delivery::Gone,
        }
    }
}

/// Process-local attachments: which connections live here and which rooms they joined.
/// Everything shared with other instances lives in the store.
#[derive(Default)]
pub struct LocalRegistry {
    connections: RwLock<HashMap<Uuid, ConnHandle>>,
    rooms: RwLock<HashMap<String, HashSet<Uuid>>>,
}

impl LocalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, conn: Arc<ConnCtx>, tx: Outbound) {
        match self.connections.write() {
            Ok(mut connections) => {
                connections.insert(conn.id, ConnHandle { conn, tx });
            }
            Err(_) => warn!("Connection registry lock poisoned"),
        }
    }

    /// Removes the connection and all of its room attachments
    pub fn unregister(&self, id: &Uuid) -> Option<ConnHandle> {
        if let Ok(mut rooms) = self.rooms.write() {
            rooms.retain(|_, members| {
                members.remove(id);
                !members.is_empty()
            });
        }
        self.connections.write().ok().and_then(|mut c| c.remove(id))
    }

    pub fn attach(&self, form_id: &str, id: Uuid) {
        if let Ok(mut rooms) = self.rooms.write() {
            rooms.entry(form_id.to_string()).or_default().insert(id);
        }
    }

    pub fn detach(&self, form_id: &str, id: &Uuid) {
        if let Ok(mut rooms) = self.rooms.write() {
            if let Some(members) = rooms.get_mut(form_id) {
                members.remove(id);
                if members.is_empty() {
                    rooms.remove(form_id);
                }
            }
        }
    }

    pub fn get(&self, id: &Uuid) -> Option<ConnHandle> {
        self.connections.read().ok().and_then(|c| c.get(id).cloned())
    }

    /// Local connections attached to the room, minus the excluded ones
    pub fn room_targets(&self, form_id: &str, exclude: &Exclude) -> Vec<ConnHandle> {
        let ids: Vec<Uuid> = match self.rooms.read() {
            Ok(rooms) => rooms
                .get(form_id)
                .map(|members| members.iter().copied().collect())
                .unwrap_or_default(),
            Err(_) => return Vec::new(),
        };
        let Ok(connections) = self.connections.read() else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| connections.get(id))
            .filter(|handle| !handle.excluded(exclude))
            .cloned()
            .collect()
    }

    /// Local connections of the user, minus the excluded ones
    pub fn user_targets(&self, user_id: &str, exclude: &Exclude) -> Vec<ConnHandle> {
        let Ok(connections) = self.connections.read() else {
            return Vec::new();
        };
        connections
            .values()
            .filter(|handle| handle.conn.user_id() == user_id && !handle.excluded(exclude))
            .cloned()
            .collect()
    }

    pub fn connections(&self) -> Vec<Arc<ConnCtx>> {
        self.connections
            .read()
            .map(|c| c.values().map(|h| h.conn.clone()).collect())
            .unwrap_or_default()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().map(|c| c.len()).unwrap_or(0)
    }

    pub fn user_count(&self) -> usize {
        self.connections
            .read()
            .map(|c| c.values().map(|h| h.conn.user_id().to_string()).collect::<HashSet<_>>().len())
            .unwrap_or(0)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.read().map(|r| r.len()).unwrap_or(0)
    }
}
