use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use axum::extract::ws::close_code;
use axum::http::HeaderMap;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::models::{ConnectionRecord, UserDescriptor};
use crate::services::auth_service::Claims;
use crate::store::now_ms;

/// Client details captured at the upgrade
#[derive(Debug, Clone, Default)]
pub struct DeviceInfo {
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
}

impl DeviceInfo {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.to_string())
        };
        Self {
            user_agent: header("user-agent"),
            ip_address: header("x-forwarded-for")
                .and_then(|v| v.split(',').next().map(|ip| ip.trim().to_string()))
                .or_else(|| header("x-real-ip")),
        }
    }
}

/// Why a connection is being torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ClientClosed,
    SlowConsumer,
    IdleTimeout,
    Shutdown,
    StoreFailure,
}

impl CloseReason {
    pub fn close_code(&self) -> u16 {
        match self {
            CloseReason::ClientClosed => close_code::NORMAL,
            CloseReason::SlowConsumer => close_code::POLICY,
            CloseReason::IdleTimeout | CloseReason::Shutdown => close_code::AWAY,
            CloseReason::StoreFailure => close_code::ERROR,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::ClientClosed => "client closed",
            CloseReason::SlowConsumer => "slow consumer",
            CloseReason::IdleTimeout => "idle timeout",
            CloseReason::Shutdown => "server shutting down",
            CloseReason::StoreFailure => "state store unavailable",
        }
    }
}

/// A live websocket connection on this instance
pub struct ConnCtx {
    pub id: Uuid,
    pub user: UserDescriptor,
    pub claims: Claims,
    pub device: DeviceInfo,
    pub connected_at: i64,
    rooms: Mutex<BTreeSet<String>>,
    last_seen: AtomicI64,
    closed: AtomicBool,
    close_reason: Mutex<Option<CloseReason>>,
    cancel: CancellationToken,
}

impl ConnCtx {
    pub fn new(claims: Claims, device: DeviceInfo) -> Self {
        let now = now_ms();
        Self {
            id: Uuid::new_v4(),
            user: UserDescriptor::new(&claims.sub, claims.display_name()),
            claims,
            device,
            connected_at: now,
            rooms: Mutex::new(BTreeSet::new()),
            last_seen: AtomicI64::new(now),
            closed: AtomicBool::new(false),
            close_reason: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user.id
    }

    pub fn rooms(&self) -> Vec<String> {
        self.rooms
            .lock()
            .map(|rooms| rooms.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.lock().map(|rooms| rooms.len()).unwrap_or(0)
    }

    pub fn in_room(&self, form_id: &str) -> bool {
        self.rooms
            .lock()
            .map(|rooms| rooms.contains(form_id))
            .unwrap_or(false)
    }

    /// Returns false when the room was already joined
    pub fn add_room(&self, form_id: &str) -> bool {
        self.rooms
            .lock()
            .map(|mut rooms| rooms.insert(form_id.to_string()))
            .unwrap_or(false)
    }

    /// Returns false when the room was not joined
    pub fn remove_room(&self, form_id: &str) -> bool {
        self.rooms
            .lock()
            .map(|mut rooms| rooms.remove(form_id))
            .unwrap_or(false)
    }

    /// The only joined room, if there is exactly one
    pub fn single_room(&self) -> Option<String> {
        let rooms = self.rooms.lock().ok()?;
        if rooms.len() == 1 {
            rooms.iter().next().cloned()
        } else {
            None
        }
    }

    pub fn touch(&self) {
        self.last_seen.store(now_ms(), Ordering::Relaxed);
    }

    pub fn last_seen(&self) -> i64 {
        self.last_seen.load(Ordering::Relaxed)
    }

    pub fn idle_for(&self) -> Duration {
        Duration::from_millis((now_ms() - self.last_seen()).max(0) as u64)
    }

    /// Request the connection to close. The first reason given wins.
    pub fn close(&self, reason: CloseReason) {
        if let Ok(mut current) = self.close_reason.lock() {
            current.get_or_insert(reason);
        }
        self.cancel.cancel();
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.lock().ok().and_then(|reason| *reason)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Marks the connection closed. Only the first caller gets true.
    pub fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn to_record(&self, instance_id: &str) -> ConnectionRecord {
        ConnectionRecord {
            id: self.id.to_string(),
            user_id: self.user.id.clone(),
            instance_id: instance_id.to_string(),
            rooms: self.rooms(),
            connected_at: self.connected_at,
            last_seen: self.last_seen(),
            user_agent: self.device.user_agent.clone(),
            ip_address: self.device.ip_address.clone(),
        }
    }
}
