use serde::{Deserialize, Serialize};

/// Engine counters for observability consumers
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct MetricsResponse {
    pub instance_id: String,
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_rooms: u64,
    pub active_rooms: u64,
    pub local_rooms: u64,
    pub messages_received: u64,
    pub messages_broadcast: u64,
    pub messages_delivered: u64,
    pub messages_dropped: u64,
    pub messages_relayed_in: u64,
    pub rate_limited: u64,
    pub slow_consumer_evictions: u64,
    pub errors: u64,
    pub messages_per_second: f64,
    pub uptime_secs: u64,
    pub store_degraded: bool,
}
