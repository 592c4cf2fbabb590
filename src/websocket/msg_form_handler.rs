use std::sync::Arc;

use tracing::info;

use crate::error::CollabError;
use crate::models::{server_events, Envelope, FormSavedMessage, RoomPayload};
use crate::store::{now_ms, Exclude};
use crate::ws::connctx::ConnCtx;
use crate::ws::hub::CollabHub;

/// Handle a `form:save` message. Persisting the form is the form service's job,
/// the room only learns that a save happened.
pub async fn handle_form_save_message(
    hub: &CollabHub,
    conn: &Arc<ConnCtx>,
    payload: RoomPayload,
) -> Result<(), CollabError> {
    let form_id = hub.presence().resolve_room(conn, payload.form_id.as_deref())?;
    if !hub.presence().can_edit(conn, &form_id) {
        return Err(CollabError::PermissionDenied(form_id));
    }
    info!("Form {} saved by {}", form_id, conn.user_id());

    let envelope = Envelope::from_user(
        server_events::FORM_SAVED,
        &FormSavedMessage {
            form_id: form_id.clone(),
            user_id: conn.user_id().to_string(),
            saved_at: now_ms(),
        },
        conn.user_id(),
    );
    hub.dispatcher()
        .broadcast_to_room(&form_id, envelope, Exclude::Nobody)
        .await?;
    Ok(())
}
