use std::sync::Arc;

use crate::error::CollabError;
use crate::models::{Envelope, TypingMessage, TypingPayload};
use crate::store::Exclude;
use crate::ws::connctx::ConnCtx;
use crate::ws::hub::CollabHub;

/// Handle `user:typing` and `user:stopped_typing`, mirrored to the other users
pub async fn handle_typing_message(
    hub: &CollabHub,
    conn: &Arc<ConnCtx>,
    payload: TypingPayload,
    event: &str,
) -> Result<(), CollabError> {
    let form_id = hub.presence().resolve_room(conn, payload.form_id.as_deref())?;
    let envelope = Envelope::from_user(
        event,
        &TypingMessage {
            form_id: form_id.clone(),
            user_id: conn.user_id().to_string(),
            element_id: payload.element_id,
        },
        conn.user_id(),
    );
    hub.dispatcher()
        .broadcast_to_room(&form_id, envelope, Exclude::User(conn.user_id().to_string()))
        .await?;
    Ok(())
}
