use serde::{Deserialize, Serialize};

use crate::models::MetricsResponse;

/// Response for diagnostics information
#[derive(Serialize, Deserialize)]
pub struct DiagnosticsResponse {
    pub metrics: MetricsResponse,
    pub n_local_connections: u32,
    pub n_local_users: u32,
    pub n_cached_tokens: u64,
    pub cpu_usage: f32,
    pub memory_alloc: u64,
    pub memory_total: u64,
    pub memory_free: u64,
}
