use std::sync::Arc;

use axum::{
    extract::{Extension, Path, State},
    http::StatusCode,
    Json,
};
use tracing::error;

use crate::auth::auth;
use crate::models::{ErrorResponse, UserSession};
use crate::services::auth_service::Claims;
use crate::ws::hub::CollabHub;

/// Session of a user. Users may read their own, admins any.
pub async fn session_details(
    State(hub): State<Arc<CollabHub>>,
    Extension(claims): Extension<Claims>,
    Path(user_id): Path<String>,
) -> Result<(StatusCode, Json<UserSession>), (StatusCode, Json<ErrorResponse>)> {

    auth::ensure_self_or_admin(&claims, &user_id)?;

    match hub.store().get_session(&user_id).await {
        Ok(Some(session)) => Ok((StatusCode::OK, Json(session))),
        Ok(None) => {
            let status = StatusCode::NOT_FOUND;
            Err((status, Json(ErrorResponse {
                code: status.as_u16(),
                status: status.to_string(),
                error: format!("No session for user '{}'", user_id),
            })))
        }
        Err(e) => {
            error!("Failed to load session for {}: {}", user_id, e);
            hub.metrics().store_result(false);
            let status = StatusCode::SERVICE_UNAVAILABLE;
            Err((status, Json(ErrorResponse {
                code: status.as_u16(),
                status: status.to_string(),
                error: format!("State store unavailable: {}", e),
            })))
        }
    }
}
