use crate::{auth::auth, models::{DiagnosticsResponse, ErrorResponse}, services::auth_service::Claims, ws::hub::CollabHub};
use axum::{extract::{State, Extension}, http::StatusCode, Json};
use std::sync::Arc;
use std::sync::{Mutex, OnceLock};
use sysinfo::System;
use tracing::info;

static SYSTEM_MONITOR: OnceLock<Mutex<System>> = OnceLock::new();

/// Engine metrics plus process resource usage
pub async fn diagnostics(
    State(hub): State<Arc<CollabHub>>,
    Extension(claims): Extension<Claims>,
) -> Result<(StatusCode, Json<DiagnosticsResponse>), (StatusCode, Json<ErrorResponse>)> {

    // Ensure the user is an admin
    auth::ensure_admin(&claims)?;

    // Engine counters
    let metrics = hub.metrics_snapshot().await;
    let n_local_connections = hub.registry().connection_count() as u32;
    let n_local_users = hub.registry().user_count() as u32;
    let n_cached_tokens = hub.verifier().cached_tokens();

    // System stats
    let (cpu_usage, memory_alloc, memory_free, memory_total) = {
        let sys_lock = SYSTEM_MONITOR.get_or_init(|| {
            Mutex::new(System::new_all())
        });
        match sys_lock.lock() {
            Ok(mut sys) => {
                sys.refresh_cpu();
                sys.refresh_memory();
                (
                    sys.global_cpu_info().cpu_usage(),
                    sys.used_memory(),
                    sys.free_memory(),
                    sys.total_memory(),
                )
            }
            Err(_) => (0.0, 0, 0, 0)
        }
    };

    info!(
        "Diagnostics: CPU: {:.2}%, Mem: {}/{} MB (Free: {} MB), Conn: {}, Rooms: {}",
        cpu_usage,
        memory_alloc / 1024 / 1024,
        memory_total / 1024 / 1024,
        memory_free / 1024 / 1024,
        n_local_connections,
        metrics.local_rooms
    );

    Ok((
        StatusCode::OK,
        Json(DiagnosticsResponse {
            metrics,
            n_local_connections,
            n_local_users,
            n_cached_tokens,
            cpu_usage,
            memory_alloc,
            memory_total,
            memory_free,
        }),
    ))
}
