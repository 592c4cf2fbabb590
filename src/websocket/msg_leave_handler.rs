use std::sync::Arc;

use tracing::info;

use crate::error::CollabError;
use crate::models::{server_events, Envelope, LeftFormMessage, RoomPayload};
use crate::ws::connctx::ConnCtx;
use crate::ws::hub::CollabHub;

/// Handle a `leave:form` message
pub async fn handle_leave_message(
    hub: &CollabHub,
    conn: &Arc<ConnCtx>,
    payload: RoomPayload,
) -> Result<(), CollabError> {
    let form_id = hub.presence().resolve_room(conn, payload.form_id.as_deref())?;
    info!("User {} leaving form {}", conn.user_id(), form_id);

    hub.presence().leave(conn, &form_id).await?;

    hub.dispatcher()
        .reply(&conn.id, Envelope::new(server_events::LEFT_FORM, &LeftFormMessage { form_id }));
    Ok(())
}
