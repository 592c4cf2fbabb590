use std::sync::Arc;

use tracing::info;

use crate::error::CollabError;
use crate::models::{server_events, Envelope, JoinFormPayload};
use crate::ws::connctx::ConnCtx;
use crate::ws::hub::CollabHub;

/// Handle a `join:form` message
pub async fn handle_join_message(
    hub: &CollabHub,
    conn: &Arc<ConnCtx>,
    payload: JoinFormPayload,
) -> Result<(), CollabError> {
    info!("User {} joining form {}", conn.user_id(), payload.form_id);

    let joined = hub.presence().join(conn, &payload.form_id).await?;

    // The joining connection gets the room state, the others got `user:joined`
    hub.dispatcher()
        .reply(&conn.id, Envelope::new(server_events::JOINED_FORM, &joined));
    Ok(())
}
