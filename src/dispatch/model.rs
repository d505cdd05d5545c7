//! Outbound queue item state machine and observer events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Delivery status of an outbound item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    /// Accepted, waiting for its lane.
    Queued,
    /// Gateway call in flight.
    Sending,
    /// Delivered to the gateway.
    Sent,
    /// Last attempt failed. Terminal once attempts are exhausted.
    Failed,
}

impl QueueStatus {
    /// Check if this status allows transitioning to another one.
    pub fn can_transition_to(&self, target: QueueStatus) -> bool {
        use QueueStatus::*;

        matches!(
            (self, target),
            (Queued, Sending) |
            (Sending, Sent) | (Sending, Failed) |
            // Automatic retry
            (Failed, Sending) |
            // Manual retry of an exhausted item
            (Failed, Queued)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "queued" => Some(Self::Queued),
            "sending" => Some(Self::Sending),
            "sent" => Some(Self::Sent),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to the template an item was rendered from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateRef {
    pub id: i64,
    pub name: String,
    pub language: String,
}

/// An approved outbound reply, before the queue accepts it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundDraft {
    pub contact_id: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<TemplateRef>,
    /// Originating rule; `None` for manual sends.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<i64>,
    /// Outside the conversation window only a pre-approved template may go out.
    #[serde(default)]
    pub requires_template: bool,
}

impl OutboundDraft {
    pub fn text(contact_id: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            contact_id: contact_id.into(),
            body: body.into(),
            template: None,
            rule_id: None,
            requires_template: false,
        }
    }
}

/// Persisted outbound item. Durability lives here, not in the event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundQueueItem {
    pub id: Uuid,
    pub contact_id: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<TemplateRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<i64>,
    #[serde(default)]
    pub requires_template: bool,
    pub status: QueueStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub queued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Gateway message id once sent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_message_id: Option<String>,
}

impl OutboundQueueItem {
    pub fn from_draft(draft: OutboundDraft, max_attempts: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            contact_id: draft.contact_id,
            body: draft.body,
            template: draft.template,
            rule_id: draft.rule_id,
            requires_template: draft.requires_template,
            status: QueueStatus::Queued,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            queued_at: now,
            last_attempt_at: None,
            error: None,
            gateway_message_id: None,
        }
    }

    /// Sent, or failed with every attempt used.
    pub fn is_terminal(&self) -> bool {
        match self.status {
            QueueStatus::Sent => true,
            QueueStatus::Failed => self.attempts >= self.max_attempts,
            QueueStatus::Queued | QueueStatus::Sending => false,
        }
    }

    /// Move to `target`, returning the rejected pair on an illegal transition.
    pub fn transition_to(&mut self, target: QueueStatus) -> Result<(), (QueueStatus, QueueStatus)> {
        if !self.status.can_transition_to(target) {
            return Err((self.status, target));
        }
        self.status = target;
        Ok(())
    }
}

/// Result of a successful `enqueue`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueReceipt {
    pub accepted: bool,
    pub item_id: Uuid,
    /// 1-based position among in-flight items.
    pub position: usize,
    pub estimated_seconds: u64,
}

/// Best-effort notifications for observers (UI, logs).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DispatchEvent {
    #[serde(rename = "message_queued")]
    Queued {
        item: OutboundQueueItem,
        position: usize,
        estimated_seconds: u64,
    },
    #[serde(rename = "message:sending")]
    Sending {
        id: Uuid,
        contact_id: String,
        attempt: u32,
    },
    #[serde(rename = "message:sent")]
    Sent {
        id: Uuid,
        contact_id: String,
        attempts: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        gateway_message_id: Option<String>,
    },
    #[serde(rename = "message:failed")]
    Failed {
        id: Uuid,
        contact_id: String,
        attempts: u32,
        error: String,
        /// No more automatic retries; waiting for a manual retry.
        terminal: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry_in_ms: Option<u64>,
    },
}

impl DispatchEvent {
    pub fn item_id(&self) -> Uuid {
        match self {
            Self::Queued { item, .. } => item.id,
            Self::Sending { id, .. } | Self::Sent { id, .. } | Self::Failed { id, .. } => *id,
        }
    }
}
