//! In-process counter store. Scoped to the running instance.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{CounterStore, CounterValue};
use crate::error::CounterError;

/// Counters held in a mutex-guarded map.
#[derive(Default)]
pub struct InProcessCounterStore {
    counters: Mutex<HashMap<String, CounterValue>>,
}

impl InProcessCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tracked keys, expired ones included.
    pub async fn len(&self) -> usize {
        self.counters.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.counters.lock().await.is_empty()
    }
}

#[async_trait]
impl CounterStore for InProcessCounterStore {
    fn name(&self) -> &str {
        "in_process"
    }

    async fn get(&self, key: &str, now: DateTime<Utc>) -> Result<Option<CounterValue>, CounterError> {
        let counters = self.counters.lock().await;
        Ok(counters.get(key).filter(|v| !v.is_expired(now)).copied())
    }

    async fn increment(
        &self,
        key: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<CounterValue, CounterError> {
        let mut counters = self.counters.lock().await;
        let value = counters
            .entry(key.to_string())
            .and_modify(|v| {
                if v.is_expired(now) {
                    *v = CounterValue {
                        count: 1,
                        expires_at,
                    };
                } else {
                    v.count += 1;
                }
            })
            .or_insert(CounterValue {
                count: 1,
                expires_at,
            });
        Ok(*value)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, CounterError> {
        let mut counters = self.counters.lock().await;
        let before = counters.len();
        counters.retain(|_, v| !v.is_expired(now));
        Ok(before - counters.len())
    }
}
