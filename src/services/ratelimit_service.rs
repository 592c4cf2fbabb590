use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::config::Config;
use crate::error::{CollabError, StoreError};
use crate::models::{MessageClass, RateLimitInfo};
use crate::store::{keys, StateStore};

/// Fixed window limits per message class
#[derive(Debug, Clone)]
pub struct RateLimits {
    pub window: Duration,
    pub room: u64,
    pub cursor: u64,
    pub activity: u64,
    pub content: u64,
    pub heartbeat: u64,
}

impl RateLimits {
    pub fn from_config(config: &Config) -> Self {
        Self {
            window: config.rate_limit_window(),
            room: config.rate_limit_for(MessageClass::Room),
            cursor: config.rate_limit_for(MessageClass::Cursor),
            activity: config.rate_limit_for(MessageClass::Activity),
            content: config.rate_limit_for(MessageClass::Content),
            heartbeat: config.rate_limit_for(MessageClass::Heartbeat),
        }
    }

    pub fn limit_for(&self, class: MessageClass) -> u64 {
        match class {
            MessageClass::Room => self.room,
            MessageClass::Cursor => self.cursor,
            MessageClass::Activity => self.activity,
            MessageClass::Content => self.content,
            MessageClass::Heartbeat => self.heartbeat,
        }
    }
}

/// Per-user rate limiting on top of the store's atomic counters.
/// Counters are shared by the whole fleet.
pub struct RateLimiter {
    store: Arc<dyn StateStore>,
    limits: RateLimits,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn StateStore>, limits: RateLimits) -> Self {
        Self { store, limits }
    }

    /// Count one message of `class` for the user
    pub async fn check(&self, user_id: &str, class: MessageClass) -> Result<RateLimitInfo, StoreError> {
        let key = keys::rate_limit(user_id, class.as_str());
        self.store
            .check_rate_limit(&key, self.limits.limit_for(class), self.limits.window)
            .await
    }

    /// Like `check`, but a blocked result becomes `CollabError::RateLimited`
    pub async fn enforce(&self, user_id: &str, class: MessageClass) -> Result<RateLimitInfo, CollabError> {
        let info = self.check(user_id, class).await?;
        if info.blocked {
            debug!(user_id, class = class.as_str(), count = info.count, "Rate limit exceeded");
            return Err(CollabError::RateLimited { class, info });
        }
        Ok(info)
    }

    pub fn limits(&self) -> &RateLimits {
        &self.limits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn limiter(store: MemoryStore) -> RateLimiter {
        let limits = RateLimits {
            window: Duration::from_secs(10),
            room: 2,
            cursor: 5,
            activity: 5,
            content: 5,
            heartbeat: 5,
        };
        RateLimiter::new(Arc::new(store), limits)
    }

    #[tokio::test(start_paused = true)]
    async fn classes_are_counted_separately() {
        let limiter = limiter(MemoryStore::new());
        limiter.enforce("u1", MessageClass::Room).await.unwrap();
        limiter.enforce("u1", MessageClass::Room).await.unwrap();
        let err = limiter.enforce("u1", MessageClass::Room).await.unwrap_err();
        assert!(matches!(err, CollabError::RateLimited { class: MessageClass::Room, .. }));

        // Other classes and other users are unaffected
        assert!(limiter.enforce("u1", MessageClass::Cursor).await.is_ok());
        assert!(limiter.enforce("u2", MessageClass::Room).await.is_ok());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(limiter.enforce("u1", MessageClass::Room).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn instances_share_counters() {
        let store = MemoryStore::new();
        let a = limiter(store.clone());
        let b = limiter(store);
        a.enforce("u1", MessageClass::Room).await.unwrap();
        b.enforce("u1", MessageClass::Room).await.unwrap();
        assert!(a.enforce("u1", MessageClass::Room).await.is_err());
        assert!(b.enforce("u1", MessageClass::Room).await.is_err());
    }

    #[tokio::test]
    async fn store_outage_is_reported() {
        let store = MemoryStore::new();
        let limiter = limiter(store.clone());
        store.set_unavailable(true);
        let err = limiter.enforce("u1", MessageClass::Cursor).await.unwrap_err();
        assert!(err.is_store_failure());
    }
}
