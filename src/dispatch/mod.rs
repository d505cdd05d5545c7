//! Outbound delivery: queue items, the dispatch queue and gateways.

pub mod gateway;
pub mod model;
pub mod queue;

pub use gateway::{Gateway, LogGateway, SendCommand, SendReceipt, WhatsAppCloudGateway};
pub use model::{
    DispatchEvent, EnqueueReceipt, OutboundDraft, OutboundQueueItem, QueueStatus, TemplateRef,
};
pub use queue::{DispatchQueue, spawn_retention_task};
