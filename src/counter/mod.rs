//! Counter store: key to counter map with expiry, the basis of rate limiting.
//!
//! Two conforming backends are chosen at startup: `SqlCounterStore` (shared
//! between instances through the database) and `InProcessCounterStore`
//! (local to this process). `ResilientCounterStore` wraps the primary and
//! falls back to a local store while the primary is unreachable, exposing
//! that degraded mode as an explicit flag.
//!
//! Counts only grow within a window. A counter returns to zero only when
//! its expiry passes; there is no reset operation.

pub mod memory;
pub mod resilient;
pub mod sql;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CounterError;

pub use memory::InProcessCounterStore;
pub use resilient::ResilientCounterStore;
pub use sql::SqlCounterStore;

/// Current value of a counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterValue {
    pub count: u64,
    pub expires_at: DateTime<Utc>,
}

impl CounterValue {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &str;

    /// Read a live counter. Expired or missing counters read as `None`.
    async fn get(&self, key: &str, now: DateTime<Utc>) -> Result<Option<CounterValue>, CounterError>;

    /// Add one to a counter and return the new value.
    ///
    /// A missing or expired counter starts over at 1 with `expires_at`;
    /// a live counter keeps its original expiry.
    async fn increment(
        &self,
        key: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<CounterValue, CounterError>;

    /// Drop expired counters. Returns how many were removed.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, CounterError>;
}
