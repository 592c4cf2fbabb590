use std::sync::Arc;

use tracing::info;

use crate::error::CollabError;
use crate::models::{
    server_events, Envelope, QuestionActivityMessage, QuestionFocusPayload, QuestionUpdate, QuestionUpdatePayload,
};
use crate::store::{now_ms, Exclude};
use crate::ws::connctx::ConnCtx;
use crate::ws::hub::CollabHub;

/// Handle a `question:update` message.
///
/// The update is recorded in the question's history and broadcast to the whole room,
/// sender included, so every member sees the order in which the server received edits.
/// Concurrent edits of one question resolve to the latest arrival.
pub async fn handle_question_update_message(
    hub: &CollabHub,
    conn: &Arc<ConnCtx>,
    payload: QuestionUpdatePayload,
) -> Result<(), CollabError> {
    let form_id = hub.presence().resolve_room(conn, payload.form_id.as_deref())?;
    if !hub.presence().can_edit(conn, &form_id) {
        return Err(CollabError::PermissionDenied(form_id));
    }
    info!("Question {} of form {} updated by {}", payload.question_id, form_id, conn.user_id());

    let update = QuestionUpdate {
        form_id: form_id.clone(),
        question_id: payload.question_id,
        user_id: conn.user_id().to_string(),
        update_type: payload.update_type.unwrap_or_else(|| "content".to_string()),
        content: payload.content,
        version: payload.version,
        timestamp: now_ms(),
    };
    let config = hub.config();
    hub.store()
        .save_question_update(&update, config.question_history_len, config.question_history_ttl())
        .await?;

    let envelope = Envelope::from_user(server_events::QUESTION_UPDATED, &update, conn.user_id());
    hub.dispatcher()
        .broadcast_to_room(&form_id, envelope, Exclude::Nobody)
        .await?;
    Ok(())
}

/// Handle `question:focus` and `question:blur`, mirrored to the rest of the room
pub async fn handle_question_activity_message(
    hub: &CollabHub,
    conn: &Arc<ConnCtx>,
    payload: QuestionFocusPayload,
    event: &str,
) -> Result<(), CollabError> {
    let form_id = hub.presence().resolve_room(conn, payload.form_id.as_deref())?;
    let envelope = Envelope::from_user(
        event,
        &QuestionActivityMessage {
            form_id: form_id.clone(),
            question_id: payload.question_id,
            user_id: conn.user_id().to_string(),
        },
        conn.user_id(),
    );
    hub.dispatcher()
        .broadcast_to_room(&form_id, envelope, Exclude::Connection(conn.id))
        .await?;
    Ok(())
}
