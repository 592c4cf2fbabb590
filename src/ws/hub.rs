use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{AuthError, CollabError, ProtocolError, StoreError};
use crate::models::{server_events, ClientEvent, ClientEventKind, Envelope, MetricsResponse, UserSession};
use crate::services::auth_service::{Claims, TokenVerifier};
use crate::services::metrics_service::Metrics;
use crate::services::presence_service::{PresenceService, DISCONNECTED};
use crate::services::ratelimit_service::{RateLimiter, RateLimits};
use crate::store::{now_ms, RelayStream, StateStore};
use crate::websocket::handler::dispatch_event;
use crate::ws::connctx::{CloseReason, ConnCtx, DeviceInfo};
use crate::ws::dispatcher::Dispatcher;
use crate::ws::registry::LocalRegistry;

const RELAY_BACKOFF_MIN: Duration = Duration::from_secs(1);
const RELAY_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// The collaboration engine of one instance
pub struct CollabHub {
    config: Arc<Config>,
    instance_id: String,
    store: Arc<dyn StateStore>,
    verifier: Arc<dyn TokenVerifier>,
    registry: Arc<LocalRegistry>,
    dispatcher: Arc<Dispatcher>,
    limiter: RateLimiter,
    presence: PresenceService,
    metrics: Arc<Metrics>,
    shutdown: CancellationToken,
}

impl CollabHub {
    pub fn new(config: Config, store: Arc<dyn StateStore>, verifier: Arc<dyn TokenVerifier>) -> Arc<Self> {
        let instance_id = config
            .instance_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let metrics = Arc::new(Metrics::new(&instance_id));
        let registry = Arc::new(LocalRegistry::new());
        let dispatcher = Arc::new(Dispatcher::new(
            &instance_id,
            registry.clone(),
            store.clone(),
            metrics.clone(),
        ));
        let limiter = RateLimiter::new(store.clone(), RateLimits::from_config(&config));
        let presence = PresenceService::new(
            &config,
            &instance_id,
            store.clone(),
            registry.clone(),
            dispatcher.clone(),
        );
        info!("Collaboration hub created for instance {}", instance_id);

        Arc::new(Self {
            config: Arc::new(config),
            instance_id,
            store,
            verifier,
            registry,
            dispatcher,
            limiter,
            presence,
            metrics,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn verifier(&self) -> &Arc<dyn TokenVerifier> {
        &self.verifier
    }

    pub fn registry(&self) -> &LocalRegistry {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn presence(&self) -> &PresenceService {
        &self.presence
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Stop accepting work. Connections drain and close on their own.
    pub fn shutdown(&self) {
        info!("Shutting down collaboration hub {}", self.instance_id);
        self.shutdown.cancel();
    }

    pub fn authenticate(&self, token: &str) -> Result<Claims, AuthError> {
        self.verifier.verify(token)
    }

    pub async fn metrics_snapshot(&self) -> MetricsResponse {
        self.metrics
            .snapshot(self.store.as_ref(), self.registry.room_count())
            .await
    }

    /// Register an authenticated connection. Returns its context and the receiving end
    /// of its outbound queue.
    pub async fn connect(
        self: &Arc<Self>,
        claims: Claims,
        device: DeviceInfo,
    ) -> Result<(Arc<ConnCtx>, mpsc::Receiver<Arc<Envelope>>), CollabError> {
        let conn = Arc::new(ConnCtx::new(claims, device));
        let (tx, rx) = mpsc::channel(self.config.outbound_queue_capacity);
        self.registry.register(conn.clone(), tx);

        let persisted = async {
            self.presence.save_connection(&conn).await?;
            self.attach_session(&conn).await
        }
        .await;
        self.metrics.store_result(persisted.is_ok());
        if let Err(e) = persisted {
            error!("Failed to persist connection {}: {}", conn.id, e);
            self.registry.unregister(&conn.id);
            conn.mark_closed();
            return Err(e.into());
        }
        self.metrics.connection_opened();

        // The cascade runs however the connection ends: socket closed, eviction, idle
        let hub = self.clone();
        let watched = conn.clone();
        tokio::spawn(async move {
            watched.cancelled().await;
            hub.disconnect(&watched).await;
        });

        info!(connection_id = %conn.id, user_id = conn.user_id(), "Connection registered");
        Ok((conn, rx))
    }

    /// Process one inbound text frame. Errors are answered to the sender only.
    pub async fn handle_frame(&self, conn: &Arc<ConnCtx>, raw: &str) {
        self.metrics.message_received();
        conn.touch();
        if let Err(e) = self.process_frame(conn, raw).await {
            self.reply_error(conn, &e);
        }
    }

    async fn process_frame(&self, conn: &Arc<ConnCtx>, raw: &str) -> Result<(), CollabError> {
        // 1. Oversized frames are not parsed
        let limit = self.config.max_message_size;
        if raw.len() > limit {
            return Err(ProtocolError::TooLarge { size: raw.len(), limit }.into());
        }

        // 2. Envelope and type
        let envelope = Envelope::parse(raw)?;
        let kind = ClientEventKind::from_type(&envelope.kind)
            .ok_or_else(|| ProtocolError::UnknownType(envelope.kind.clone()))?;

        // 3. Rate limit per message class
        self.limiter.enforce(conn.user_id(), kind.message_class()).await?;

        // 4. Typed payload and handler
        let event = ClientEvent::decode(kind, envelope.payload)?;
        let result = dispatch_event(self, conn, event, envelope.timestamp).await;
        if result.is_ok() {
            self.metrics.store_result(true);
        }
        result
    }

    /// Send an `error` event to the connection
    pub fn reply_error(&self, conn: &ConnCtx, err: &CollabError) {
        match err {
            CollabError::RateLimited { .. } => self.metrics.rate_limited(),
            _ => self.metrics.error(),
        }
        if err.is_store_failure() {
            self.metrics.store_result(false);
            error!(connection_id = %conn.id, "Store failure while handling message: {}", err);
        } else {
            debug!(connection_id = %conn.id, "Rejected message: {}", err);
        }
        self.dispatcher
            .reply(&conn.id, Envelope::new(server_events::ERROR, &err.to_payload()));
    }

    /// Refresh the connection record, its room memberships and the session expiry
    pub async fn touch_connection(&self, conn: &ConnCtx) -> Result<(), StoreError> {
        let result = async {
            self.presence.save_connection(conn).await?;
            self.presence.refresh_memberships(conn).await?;
            self.attach_session(conn).await
        }
        .await;
        self.metrics.store_result(result.is_ok());
        result
    }

    /// Cleanup cascade. Safe to call any number of times.
    pub async fn disconnect(&self, conn: &Arc<ConnCtx>) {
        if !conn.mark_closed() {
            return;
        }
        conn.close(CloseReason::ClientClosed);
        let reason = conn.close_reason().unwrap_or(CloseReason::ClientClosed);

        // 1. Leave every room, announcing the departure
        if let Err(e) = self.presence.leave_all(conn, DISCONNECTED).await {
            warn!("Incomplete room cleanup for {}: {}", conn.id, e);
        }

        // 2. Drop the connection record and the session link
        let mut cleaned = self.store.delete_connection(&conn.id.to_string()).await;
        if cleaned.is_ok() {
            cleaned = self.detach_session(conn).await;
        }
        self.metrics.store_result(cleaned.is_ok());
        if let Err(e) = cleaned {
            // Records expire on their own
            warn!("Failed to remove records of connection {}: {}", conn.id, e);
        }

        // 3. Local state and metrics
        self.registry.unregister(&conn.id);
        self.metrics.connection_closed();
        info!(
            connection_id = %conn.id,
            user_id = conn.user_id(),
            reason = reason.as_str(),
            "Connection closed"
        );
    }

    async fn attach_session(&self, conn: &ConnCtx) -> Result<(), StoreError> {
        let now = now_ms();
        let ttl = self.config.session_ttl();
        let connection_id = conn.id.to_string();
        let mut session = self
            .store
            .get_session(conn.user_id())
            .await?
            .unwrap_or_else(|| UserSession {
                user_id: conn.user_id().to_string(),
                name: None,
                device: None,
                connection_ids: Vec::new(),
                created_at: now,
                updated_at: now,
                expires_at: now,
            });
        if !session.connection_ids.contains(&connection_id) {
            session.connection_ids.push(connection_id);
        }
        session.name = Some(conn.user.name.clone());
        session.device = conn.device.user_agent.clone();
        session.updated_at = now;
        session.expires_at = now + ttl.as_millis() as i64;
        self.store.save_session(&session, ttl).await
    }

    async fn detach_session(&self, conn: &ConnCtx) -> Result<(), StoreError> {
        let Some(mut session) = self.store.get_session(conn.user_id()).await? else {
            return Ok(());
        };
        let connection_id = conn.id.to_string();
        session.connection_ids.retain(|id| id != &connection_id);

        // Forget connections that died with their instance
        let mut live = Vec::with_capacity(session.connection_ids.len());
        for id in session.connection_ids.drain(..) {
            if self.store.get_connection(&id).await?.is_some() {
                live.push(id);
            }
        }
        session.connection_ids = live;

        if session.connection_ids.is_empty() {
            self.store.delete_session(conn.user_id()).await
        } else {
            session.updated_at = now_ms();
            let ttl = self.config.session_ttl();
            self.store.save_session(&session, ttl).await
        }
    }

    /// Subscribe to the relay channels and spawn the relay task.
    /// The first subscription is made before returning.
    pub async fn spawn_relay(self: &Arc<Self>) -> JoinHandle<()> {
        let initial = match self.store.subscribe().await {
            Ok(stream) => Some(stream),
            Err(e) => {
                error!("Failed to subscribe to relay channels: {}", e);
                self.metrics.store_result(false);
                None
            }
        };
        let hub = self.clone();
        tokio::spawn(async move { hub.run_relay(initial).await })
    }

    async fn run_relay(&self, mut stream: Option<RelayStream>) {
        let mut backoff = RELAY_BACKOFF_MIN;
        loop {
            if let Some(mut relay) = stream.take() {
                backoff = RELAY_BACKOFF_MIN;
                loop {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return,
                        next = relay.next() => match next {
                            Some(message) => {
                                self.dispatcher.deliver_remote(message);
                            }
                            None => {
                                warn!("Relay subscription ended");
                                self.metrics.store_result(false);
                                break;
                            }
                        }
                    }
                }
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(RELAY_BACKOFF_MAX);

            match self.store.subscribe().await {
                Ok(relay) => {
                    info!("Relay subscription restored");
                    self.metrics.store_result(true);
                    stream = Some(relay);
                }
                Err(e) => {
                    error!("Failed to resubscribe to relay channels: {}", e);
                    self.metrics.store_result(false);
                }
            }
        }
    }

    /// Spawn the periodic sweeper
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let hub = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(hub.config.cleanup_interval());
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = hub.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        hub.sweep_once().await;
                    }
                }
            }
            debug!("Sweeper stopped");
        })
    }

    pub async fn sweep_once(&self) {
        match self.presence.sweep().await {
            Ok(report) => {
                self.metrics.store_result(true);
                if report.orphans_removed > 0 || report.rooms_deleted > 0 {
                    info!(
                        "Sweep: {} rooms checked, {} orphans removed, {} rooms deleted",
                        report.rooms_checked, report.orphans_removed, report.rooms_deleted
                    );
                }
            }
            Err(e) => {
                error!("Sweep failed: {}", e);
                self.metrics.store_result(false);
            }
        }
    }

    /// Wait until every local connection is gone or the timeout passes
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.registry.connection_count() > 0 {
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    "{} connections still open after drain timeout",
                    self.registry.connection_count()
                );
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        true
    }
}
