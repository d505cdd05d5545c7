//! Engage Dispatch: compliance-gated automated WhatsApp dispatch engine.

pub mod api;
pub mod clock;
pub mod compliance;
pub mod config;
pub mod counter;
pub mod dispatch;
pub mod error;
pub mod model;
pub mod pipeline;
pub mod ratelimit;
pub mod rules;
pub mod store;
