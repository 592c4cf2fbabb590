use std::sync::Arc;

use tracing::debug;

use crate::error::CollabError;
use crate::models::{CursorMovePayload, RoomPayload};
use crate::ws::connctx::ConnCtx;
use crate::ws::hub::CollabHub;

/// Handle a `cursor:move` message
pub async fn handle_cursor_move_message(
    hub: &CollabHub,
    conn: &Arc<ConnCtx>,
    payload: CursorMovePayload,
) -> Result<(), CollabError> {
    let form_id = hub.presence().resolve_room(conn, payload.form_id.as_deref())?;
    debug!(user_id = conn.user_id(), form_id, x = payload.x, y = payload.y, "Cursor moved");
    hub.presence().move_cursor(conn, &form_id, &payload).await?;
    Ok(())
}

/// Handle a `cursor:hide` message
pub async fn handle_cursor_hide_message(
    hub: &CollabHub,
    conn: &Arc<ConnCtx>,
    payload: RoomPayload,
) -> Result<(), CollabError> {
    let form_id = hub.presence().resolve_room(conn, payload.form_id.as_deref())?;
    hub.presence().hide_cursor(conn, &form_id).await
}
