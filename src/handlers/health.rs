use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Json};
use tracing::{debug, warn};

use crate::models::HealthResponse;
use crate::ws::hub::CollabHub;

/// Health check endpoint
pub async fn health_check(State(hub): State<Arc<CollabHub>>) -> Json<HealthResponse> {
    debug!("Health check requested");
    Json(HealthResponse {
        status: "ok".to_string(),
        message: "Server is running".to_string(),
        instance_id: hub.instance_id().to_string(),
    })
}

/// Readiness check endpoint, degraded while the state store is unreachable
pub async fn ready_check(State(hub): State<Arc<CollabHub>>) -> (StatusCode, Json<HealthResponse>) {
    debug!("Readiness check requested");
    let ping = hub.store().ping().await;
    hub.metrics().store_result(ping.is_ok());

    let (status, message) = match ping {
        Ok(()) if hub.is_shutting_down() => (StatusCode::SERVICE_UNAVAILABLE, "Server is shutting down".to_string()),
        Ok(()) => (StatusCode::OK, "Service is ready".to_string()),
        Err(e) => {
            warn!("Readiness check failed: {}", e);
            (StatusCode::SERVICE_UNAVAILABLE, format!("State store unavailable: {}", e))
        }
    };
    let label = if status == StatusCode::OK { "ok" } else { "degraded" };
    (
        status,
        Json(HealthResponse {
            status: label.to_string(),
            message,
            instance_id: hub.instance_id().to_string(),
        }),
    )
}
