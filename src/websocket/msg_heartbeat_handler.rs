use std::sync::Arc;

use tracing::debug;

use crate::error::CollabError;
use crate::models::{server_events, Envelope, HeartbeatAckMessage, HeartbeatPayload};
use crate::store::now_ms;
use crate::ws::connctx::ConnCtx;
use crate::ws::hub::CollabHub;

/// Handle a `heartbeat` message: refresh expiries and answer with the server time
pub async fn handle_heartbeat_message(
    hub: &CollabHub,
    conn: &Arc<ConnCtx>,
    payload: HeartbeatPayload,
    sent_at: i64,
) -> Result<(), CollabError> {
    hub.touch_connection(conn).await?;

    let server_time = now_ms();
    let client_time = payload.timestamp.or(Some(sent_at).filter(|t| *t > 0));
    let ack = HeartbeatAckMessage {
        server_time,
        latency_ms: client_time.map(|t| (server_time - t).max(0)),
    };
    debug!(connection_id = %conn.id, latency_ms = ?ack.latency_ms, "Heartbeat");
    hub.dispatcher()
        .reply(&conn.id, Envelope::new(server_events::HEARTBEAT_ACK, &ack));
    Ok(())
}
