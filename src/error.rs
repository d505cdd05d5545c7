//! Error types for the dispatch engine.
//!
//! Policy outcomes (compliance violations, exhausted rate limits, "no rule
//! matched") are plain values, not errors. The enums here cover real
//! failures: configuration, storage, transport and queue problems.

use std::time::Duration;

use uuid::Uuid;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Invalid prohibited-content pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
}

/// Repository (contacts, rules, templates, logs, queue items) errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Counter store errors. Any of these puts the rate limiter in degraded mode.
#[derive(Debug, thiserror::Error)]
pub enum CounterError {
    #[error("Counter store {store} unavailable: {reason}")]
    Unavailable { store: String, reason: String },

    #[error("Counter store {store} returned malformed data: {reason}")]
    Malformed { store: String, reason: String },
}

/// Transport errors from the messaging gateway.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Gateway {name} send failed: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("Gateway {name} rejected the message ({status}): {body}")]
    Rejected {
        name: String,
        status: u16,
        body: String,
    },

    #[error("Gateway {name} rate limited, retry after {retry_after:?}")]
    RateLimited {
        name: String,
        retry_after: Option<Duration>,
    },

    #[error("Gateway send timed out after {0:?}")]
    Timeout(Duration),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Dispatch queue errors.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Queue at capacity ({depth} in flight), retry after {retry_after_secs}s")]
    Backpressure { depth: usize, retry_after_secs: u64 },

    #[error("Queue item {id} not found")]
    NotFound { id: Uuid },

    #[error("Queue item {id} is {state}, cannot transition to {target}")]
    InvalidTransition {
        id: Uuid,
        state: String,
        target: String,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}
