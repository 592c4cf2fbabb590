use std::sync::Arc;

use tracing::debug;

use crate::ws::connctx::ConnCtx;
use crate::ws::hub::CollabHub;

/// Runs the disconnect cascade when the owning socket future is dropped
/// before it could run it itself.
pub struct ConnectionGuard {
    hub: Arc<CollabHub>,
    conn: Arc<ConnCtx>,
}

impl ConnectionGuard {
    pub fn new(hub: Arc<CollabHub>, conn: Arc<ConnCtx>) -> Self {
        Self { hub, conn }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if self.conn.is_closed() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        debug!(connection_id = %self.conn.id, "Socket task dropped, scheduling cleanup");
        let hub = self.hub.clone();
        let conn = self.conn.clone();
        runtime.spawn(async move {
            hub.disconnect(&conn).await;
        });
    }
}
