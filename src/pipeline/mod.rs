//! Message pipeline.
//!
//! Every inbound message flows through:
//! 1. `ComplianceGate::record_inbound()`: conversation window, always
//! 2. `ComplianceGate::evaluate()`: consent, window, hours, content
//! 3. `RateLimiter::check_contact()`: per-contact, tier and global windows
//! 4. `RuleMatcher::match_message()`: highest-priority eligible rule
//! 5. `DispatchQueue::enqueue()`: ordered per contact, retried with backoff
//!
//! Nothing reaches the gateway without passing steps 2 and 3.

pub mod processor;
pub mod types;

pub use processor::MessageProcessor;
pub use types::{InboundMessage, OutboundRequest, PipelineOutcome};
