use std::sync::Arc;

use axum::{
    extract::{Extension, Path, State},
    http::StatusCode,
    Json,
};
use tracing::{error, info};

use crate::auth::auth;
use crate::error::StoreError;
use crate::models::{ErrorResponse, RoomDetailsResponse, RoomListResponse, RoomSummary};
use crate::services::auth_service::Claims;
use crate::services::presence_service::validate_form_id;
use crate::ws::hub::CollabHub;

fn store_failure(hub: &CollabHub, e: StoreError) -> (StatusCode, Json<ErrorResponse>) {
    error!("State store error: {}", e);
    hub.metrics().store_result(false);
    let status = StatusCode::SERVICE_UNAVAILABLE;
    (status, Json(ErrorResponse {
        code: status.as_u16(),
        status: status.to_string(),
        error: format!("State store unavailable: {}", e),
    }))
}

/// List active rooms with their member counts
pub async fn list_rooms(
    State(hub): State<Arc<CollabHub>>,
    Extension(claims): Extension<Claims>,
) -> Result<(StatusCode, Json<RoomListResponse>), (StatusCode, Json<ErrorResponse>)> {

    // Only admins see every room
    auth::ensure_admin(&claims)?;

    let store = hub.store();
    let rooms = store.list_rooms().await.map_err(|e| store_failure(&hub, e))?;
    let mut summaries = Vec::with_capacity(rooms.len());
    for room in rooms.into_iter().filter(|r| r.is_active) {
        let members = store
            .list_room_members(&room.form_id)
            .await
            .map_err(|e| store_failure(&hub, e))?;
        summaries.push(RoomSummary {
            form_id: room.form_id,
            is_active: room.is_active,
            member_count: members.len(),
            created_at: room.created_at,
            updated_at: room.updated_at,
        });
    }

    info!("Listing {} active rooms", summaries.len());
    Ok((StatusCode::OK, Json(RoomListResponse { rooms: summaries })))
}

/// Room record with its members and live cursors
pub async fn room_details(
    State(hub): State<Arc<CollabHub>>,
    Extension(claims): Extension<Claims>,
    Path(form_id): Path<String>,
) -> Result<(StatusCode, Json<RoomDetailsResponse>), (StatusCode, Json<ErrorResponse>)> {

    // 1. Validate the form id
    if validate_form_id(&form_id).is_err() {
        let status = StatusCode::BAD_REQUEST;
        return Err((status, Json(ErrorResponse {
            code: status.as_u16(),
            status: status.to_string(),
            error: format!("Invalid form id '{}'", form_id),
        })));
    }

    // 2. Ensure the user may view the form
    auth::ensure_form_access(&claims, &form_id, hub.config().enforce_form_permissions)?;

    // 3. Load the room
    let store = hub.store();
    let room = match store.get_room(&form_id).await.map_err(|e| store_failure(&hub, e))? {
        Some(room) => room,
        None => {
            let status = StatusCode::NOT_FOUND;
            return Err((status, Json(ErrorResponse {
                code: status.as_u16(),
                status: status.to_string(),
                error: format!("Room '{}' not found", form_id),
            })));
        }
    };

    // 4. Presence
    let members = hub
        .presence()
        .room_users(&form_id)
        .await
        .map_err(|e| store_failure(&hub, e))?;
    let cursors = store
        .list_room_cursors(&form_id)
        .await
        .map_err(|e| store_failure(&hub, e))?;

    Ok((StatusCode::OK, Json(RoomDetailsResponse { room, members, cursors })))
}
