//! Counter store with graceful degradation.
//!
//! Calls go to the primary store. When it errors, the call is served by an
//! in-process fallback instead and the store enters degraded mode. Degraded
//! counts are approximate and per-instance; the first successful primary
//! call leaves degraded mode again.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use super::{CounterStore, CounterValue, InProcessCounterStore};
use crate::error::CounterError;

pub struct ResilientCounterStore {
    primary: Arc<dyn CounterStore>,
    fallback: InProcessCounterStore,
    degraded: AtomicBool,
    /// Number of primary failures since startup.
    failures: AtomicU64,
}

impl ResilientCounterStore {
    pub fn new(primary: Arc<dyn CounterStore>) -> Self {
        Self {
            primary,
            fallback: InProcessCounterStore::new(),
            degraded: AtomicBool::new(false),
            failures: AtomicU64::new(0),
        }
    }

    /// Purely local counting. Never degrades.
    pub fn local() -> Self {
        Self::new(Arc::new(InProcessCounterStore::new()))
    }

    /// True while calls are being served by the in-process fallback.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn primary_name(&self) -> &str {
        self.primary.name()
    }

    fn on_primary_error(&self, op: &str, error: &CounterError) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        if !self.degraded.swap(true, Ordering::SeqCst) {
            warn!(
                store = self.primary.name(),
                op,
                error = %error,
                "Counter store unavailable, entering degraded mode (in-process counting)"
            );
        }
    }

    fn on_primary_ok(&self) {
        if self.degraded.swap(false, Ordering::SeqCst) {
            info!(
                store = self.primary.name(),
                "Counter store reachable again, leaving degraded mode"
            );
        }
    }
}

#[async_trait]
impl CounterStore for ResilientCounterStore {
    fn name(&self) -> &str {
        "resilient"
    }

    async fn get(&self, key: &str, now: DateTime<Utc>) -> Result<Option<CounterValue>, CounterError> {
        match self.primary.get(key, now).await {
            Ok(value) => {
                self.on_primary_ok();
                Ok(value)
            }
            Err(e) => {
                self.on_primary_error("get", &e);
                self.fallback.get(key, now).await
            }
        }
    }

    async fn increment(
        &self,
        key: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<CounterValue, CounterError> {
        match self.primary.increment(key, expires_at, now).await {
            Ok(value) => {
                self.on_primary_ok();
                Ok(value)
            }
            Err(e) => {
                self.on_primary_error("increment", &e);
                self.fallback.increment(key, expires_at, now).await
            }
        }
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, CounterError> {
        let local = self.fallback.purge_expired(now).await?;
        match self.primary.purge_expired(now).await {
            Ok(removed) => Ok(removed + local),
            Err(e) => {
                self.on_primary_error("purge_expired", &e);
                Ok(local)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    /// Primary that can be switched off.
    struct FlakyStore {
        inner: InProcessCounterStore,
        down: AtomicBool,
    }

    impl FlakyStore {
        fn new() -> Self {
            Self {
                inner: InProcessCounterStore::new(),
                down: AtomicBool::new(false),
            }
        }

        fn check(&self) -> Result<(), CounterError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(CounterError::Unavailable {
                    store: "flaky".into(),
                    reason: "connection refused".into(),
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl CounterStore for FlakyStore {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn get(&self, key: &str, now: DateTime<Utc>) -> Result<Option<CounterValue>, CounterError> {
            self.check()?;
            self.inner.get(key, now).await
        }

        async fn increment(
            &self,
            key: &str,
            expires_at: DateTime<Utc>,
            now: DateTime<Utc>,
        ) -> Result<CounterValue, CounterError> {
            self.check()?;
            self.inner.increment(key, expires_at, now).await
        }

        async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, CounterError> {
            self.check()?;
            self.inner.purge_expired(now).await
        }
    }

    #[tokio::test]
    async fn degrades_and_recovers() {
        let primary = Arc::new(FlakyStore::new());
        let store = ResilientCounterStore::new(primary.clone());
        let now = Utc::now();
        let expires = now + Duration::seconds(60);

        store.increment("k", expires, now).await.unwrap();
        assert!(!store.is_degraded());

        primary.down.store(true, Ordering::SeqCst);
        let value = store.increment("k", expires, now).await.unwrap();
        assert!(store.is_degraded());
        // Fallback counts from scratch.
        assert_eq!(value.count, 1);
        assert_eq!(store.get("k", now).await.unwrap().unwrap().count, 1);
        assert_eq!(store.failure_count(), 2);

        primary.down.store(false, Ordering::SeqCst);
        let value = store.get("k", now).await.unwrap().unwrap();
        assert!(!store.is_degraded());
        assert_eq!(value.count, 1);
    }

    #[tokio::test]
    async fn local_store_never_degrades() {
        let store = ResilientCounterStore::local();
        let now = Utc::now();
        for _ in 0..3 {
            store.increment("k", now + Duration::seconds(1), now).await.unwrap();
        }
        assert!(!store.is_degraded());
        assert_eq!(store.primary_name(), "in_process");
    }
}
