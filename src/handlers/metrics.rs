use std::sync::Arc;

use axum::{extract::State, Json};
use tracing::debug;

use crate::models::MetricsResponse;
use crate::ws::hub::CollabHub;

/// Connection, room and throughput counters
pub async fn metrics(State(hub): State<Arc<CollabHub>>) -> Json<MetricsResponse> {
    debug!("Metrics requested");
    Json(hub.metrics_snapshot().await)
}
