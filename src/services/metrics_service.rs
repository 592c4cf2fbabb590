use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use tracing::{error, info, warn};

use crate::models::MetricsResponse;
use crate::store::StateStore;

/// Process counters of the collaboration engine
pub struct Metrics {
    instance_id: String,
    started_at: Instant,
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    messages_received: AtomicU64,
    messages_broadcast: AtomicU64,
    messages_delivered: AtomicU64,
    messages_dropped: AtomicU64,
    messages_relayed_in: AtomicU64,
    rate_limited: AtomicU64,
    slow_consumer_evictions: AtomicU64,
    errors: AtomicU64,
    store_degraded: AtomicBool,
    // (time, messages_received) at the previous snapshot
    last_sample: Mutex<(Instant, u64)>,
}

impl Metrics {
    pub fn new(instance_id: &str) -> Self {
        let now = Instant::now();
        Self {
            instance_id: instance_id.to_string(),
            started_at: now,
            total_connections: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            messages_broadcast: AtomicU64::new(0),
            messages_delivered: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            messages_relayed_in: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
            slow_consumer_evictions: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            store_degraded: AtomicBool::new(false),
            last_sample: Mutex::new((now, 0)),
        }
    }

    pub fn connection_opened(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        // Never wraps below zero
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_broadcast(&self) {
        self.messages_broadcast.fetch_add(1, Ordering::Relaxed);
    }

    pub fn messages_delivered(&self, n: u64) {
        self.messages_delivered.fetch_add(n, Ordering::Relaxed);
    }

    pub fn message_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_relayed_in(&self) {
        self.messages_relayed_in.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn slow_consumer_evicted(&self) {
        self.slow_consumer_evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the outcome of a store operation. Flips the degraded flag on transitions.
    pub fn store_result(&self, ok: bool) {
        let was_degraded = self.store_degraded.swap(!ok, Ordering::SeqCst);
        if was_degraded && ok {
            info!("✅ State store recovered");
        } else if !was_degraded && !ok {
            error!("❌ State store unavailable, marking engine as degraded");
        }
    }

    pub fn is_store_degraded(&self) -> bool {
        self.store_degraded.load(Ordering::SeqCst)
    }

    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    fn messages_per_second(&self) -> f64 {
        let received = self.messages_received.load(Ordering::Relaxed);
        let now = Instant::now();
        let Ok(mut sample) = self.last_sample.lock() else {
            return 0.0;
        };
        let elapsed = now.duration_since(sample.0).as_secs_f64();
        let rate = if elapsed > 0.0 {
            received.saturating_sub(sample.1) as f64 / elapsed
        } else {
            0.0
        };
        *sample = (now, received);
        rate
    }

    /// Counters plus fleet wide room totals read from the store
    pub async fn snapshot(&self, store: &dyn StateStore, local_rooms: usize) -> MetricsResponse {
        let (total_rooms, active_rooms) = match store.list_rooms().await {
            Ok(rooms) => {
                self.store_result(true);
                let active = rooms.iter().filter(|r| r.is_active).count();
                (rooms.len() as u64, active as u64)
            }
            Err(e) => {
                warn!("Failed to list rooms for metrics: {}", e);
                self.store_result(false);
                (0, 0)
            }
        };

        MetricsResponse {
            instance_id: self.instance_id.clone(),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            total_rooms,
            active_rooms,
            local_rooms: local_rooms as u64,
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_broadcast: self.messages_broadcast.load(Ordering::Relaxed),
            messages_delivered: self.messages_delivered.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            messages_relayed_in: self.messages_relayed_in.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            slow_consumer_evictions: self.slow_consumer_evictions.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            messages_per_second: self.messages_per_second(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            store_degraded: self.is_store_degraded(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Room;
    use crate::store::MemoryStore;
    use std::time::Duration;

    #[tokio::test]
    async fn snapshot_counts_rooms_from_the_store() {
        let store = MemoryStore::new();
        store.save_room(&Room::new("form_1", 10, 0), Duration::from_secs(60)).await.unwrap();
        let mut idle = Room::new("form_2", 10, 0);
        idle.is_active = false;
        store.save_room(&idle, Duration::from_secs(60)).await.unwrap();

        let metrics = Metrics::new("i1");
        metrics.connection_opened();
        metrics.connection_opened();
        metrics.connection_closed();
        let snapshot = metrics.snapshot(&store, 1).await;
        assert_eq!(snapshot.total_connections, 2);
        assert_eq!(snapshot.active_connections, 1);
        assert_eq!(snapshot.total_rooms, 2);
        assert_eq!(snapshot.active_rooms, 1);
        assert!(!snapshot.store_degraded);
    }

    #[tokio::test]
    async fn store_outage_marks_degraded_until_recovery() {
        let store = MemoryStore::new();
        let metrics = Metrics::new("i1");
        store.set_unavailable(true);
        assert!(metrics.snapshot(&store, 0).await.store_degraded);
        store.set_unavailable(false);
        assert!(!metrics.snapshot(&store, 0).await.store_degraded);
    }

    #[test]
    fn active_connections_never_underflow() {
        let metrics = Metrics::new("i1");
        metrics.connection_closed();
        assert_eq!(metrics.active_connections(), 0);
    }
}
