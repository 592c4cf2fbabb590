use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::Envelope;
use crate::services::metrics_service::Metrics;
use crate::store::{Exclude, RelayMessage, RelayScope, StateStore};
use crate::ws::connctx::CloseReason;
use crate::ws::registry::{ConnHandle, Delivery, LocalRegistry};

/// Fans events out to local connections and to the other instances.
///
/// Local delivery never blocks: each recipient has its own bounded queue and a full
/// queue evicts that recipient alone. Events received from other instances are only
/// delivered locally and never published again.
pub struct Dispatcher {
    instance_id: String,
    registry: Arc<LocalRegistry>,
    store: Arc<dyn StateStore>,
    metrics: Arc<Metrics>,
}

impl Dispatcher {
    pub fn new(
        instance_id: &str,
        registry: Arc<LocalRegistry>,
        store: Arc<dyn StateStore>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            registry,
            store,
            metrics,
        }
    }

    /// Deliver to the room's local members, then publish for the rest of the fleet
    pub async fn broadcast_to_room(&self, form_id: &str, envelope: Envelope, exclude: Exclude) -> Result<usize, StoreError> {
        let envelope = Arc::new(envelope);
        let targets = self.registry.room_targets(form_id, &exclude);
        let delivered = self.fan_out(&targets, &envelope);
        self.metrics.message_broadcast();

        let published = self
            .store
            .publish_to_room(&self.instance_id, form_id, &envelope, exclude)
            .await;
        self.metrics.store_result(published.is_ok());
        published?;
        Ok(delivered)
    }

    /// Deliver to every connection of the user, on any instance
    pub async fn send_to_user(&self, user_id: &str, envelope: Envelope, exclude: Exclude) -> Result<usize, StoreError> {
        let envelope = Arc::new(envelope);
        let targets = self.registry.user_targets(user_id, &exclude);
        let delivered = self.fan_out(&targets, &envelope);

        let published = self
            .store
            .publish_to_user(&self.instance_id, user_id, &envelope, exclude)
            .await;
        self.metrics.store_result(published.is_ok());
        published?;
        Ok(delivered)
    }

    /// Direct message to a single local connection
    pub fn reply(&self, connection_id: &Uuid, envelope: Envelope) -> Delivery {
        let Some(handle) = self.registry.get(connection_id) else {
            return Delivery::Gone;
        };
        let envelope = Arc::new(envelope);
        let delivery = self.deliver(&handle, &envelope);
        if delivery == Delivery::Delivered {
            self.metrics.messages_delivered(1);
        }
        delivery
    }

    /// Local delivery of an event published by another instance
    pub fn deliver_remote(&self, message: RelayMessage) -> usize {
        if message.origin == self.instance_id {
            return 0;
        }
        self.metrics.message_relayed_in();
        let targets = match &message.scope {
            RelayScope::Room(form_id) => self.registry.room_targets(form_id, &message.exclude),
            RelayScope::User(user_id) => self.registry.user_targets(user_id, &message.exclude),
        };
        let envelope = Arc::new(message.envelope);
        self.fan_out(&targets, &envelope)
    }

    fn fan_out(&self, targets: &[ConnHandle], envelope: &Arc<Envelope>) -> usize {
        let delivered = targets
            .iter()
            .filter(|handle| self.deliver(handle, envelope) == Delivery::Delivered)
            .count();
        self.metrics.messages_delivered(delivered as u64);
        delivered
    }

    fn deliver(&self, handle: &ConnHandle, envelope: &Arc<Envelope>) -> Delivery {
        let delivery = handle.try_deliver(envelope);
        match delivery {
            Delivery::Delivered => {}
            Delivery::Overflow => {
                self.metrics.message_dropped();
                if !handle.conn.is_cancelled() {
                    warn!(
                        connection_id = %handle.conn.id,
                        user_id = handle.conn.user_id(),
                        "Outbound queue full, evicting slow consumer"
                    );
                    self.metrics.slow_consumer_evicted();
                    handle.conn.close(CloseReason::SlowConsumer);
                }
            }
            Delivery::Gone => {
                debug!(connection_id = %handle.conn.id, "Dropping message for closed connection");
                self.metrics.message_dropped();
            }
        }
        delivery
    }
}
