//! Shared types for the dispatch pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::compliance::{Direction, ViolationReason};
use crate::dispatch::EnqueueReceipt;
use crate::ratelimit::LimitReason;

// ── Inbound message ─────────────────────────────────────────────────

/// Inbound message event produced by the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Sender phone number, in any common format. Canonicalized on entry.
    pub contact_id: String,
    pub body: String,
    /// When the gateway received the message.
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default = "inbound")]
    pub direction: Direction,
    /// Profile name from the gateway, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

fn inbound() -> Direction {
    Direction::Inbound
}

impl InboundMessage {
    pub fn new(contact_id: impl Into<String>, body: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            contact_id: contact_id.into(),
            body: body.into(),
            timestamp,
            direction: Direction::Inbound,
            name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

// ── Operator outbound request ───────────────────────────────────────

/// Operator or campaign send that did not come from a rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundRequest {
    pub contact_id: String,
    /// Free-form body. Ignored when `template_id` is set.
    #[serde(default)]
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<i64>,
    /// `operator_reply` or `business_initiated`.
    #[serde(default = "business_initiated")]
    pub direction: Direction,
    /// Operator/admin caller: skips business hours.
    #[serde(default)]
    pub admin: bool,
    /// With `admin`, also skips the system-wide rate limit.
    #[serde(default)]
    pub emergency: bool,
}

fn business_initiated() -> Direction {
    Direction::BusinessInitiated
}

impl OutboundRequest {
    pub fn text(contact_id: impl Into<String>, body: impl Into<String>, direction: Direction) -> Self {
        Self {
            contact_id: contact_id.into(),
            body: body.into(),
            template_id: None,
            direction,
            admin: false,
            emergency: false,
        }
    }

    pub fn template(contact_id: impl Into<String>, template_id: i64) -> Self {
        Self {
            template_id: Some(template_id),
            ..Self::text(contact_id, "", Direction::BusinessInitiated)
        }
    }

    pub fn as_admin(mut self, emergency: bool) -> Self {
        self.admin = true;
        self.emergency = emergency;
        self
    }
}

// ── Outcome ─────────────────────────────────────────────────────────

/// Terminal result of one pipeline run. Every run ends in exactly one of
/// these; none of them is a process-level error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PipelineOutcome {
    /// Stopped by the compliance gate.
    Rejected {
        contact_id: String,
        reason: ViolationReason,
    },
    /// A rate-limit window is exhausted.
    RateLimited {
        contact_id: String,
        reason: LimitReason,
        retry_after_secs: u64,
    },
    /// The dispatch queue is at capacity.
    QueueFull {
        contact_id: String,
        retry_after_secs: u64,
    },
    /// No rule answered. The conversation window was still recorded.
    NoRuleMatched {
        contact_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        window_expires_at: Option<DateTime<Utc>>,
    },
    /// A reply was accepted by the dispatch queue.
    Dispatched {
        contact_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rule_id: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        template_id: Option<i64>,
        receipt: EnqueueReceipt,
    },
    /// An opt-in or opt-out keyword was applied.
    ConsentUpdated { contact_id: String, opt_in: bool },
    /// Internal failure, contained to this message.
    Failed {
        contact_id: String,
        stage: String,
        error: String,
    },
}

impl PipelineOutcome {
    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Rejected { .. } => "rejected",
            Self::RateLimited { .. } => "rate_limited",
            Self::QueueFull { .. } => "queue_full",
            Self::NoRuleMatched { .. } => "no_rule_matched",
            Self::Dispatched { .. } => "dispatched",
            Self::ConsentUpdated { .. } => "consent_updated",
            Self::Failed { .. } => "failed",
        }
    }

    /// Seconds to wait before trying again, for throttling outcomes.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_secs, .. } | Self::QueueFull { retry_after_secs, .. } => {
                Some(*retry_after_secs)
            }
            _ => None,
        }
    }

    pub fn contact_id(&self) -> &str {
        match self {
            Self::Rejected { contact_id, .. }
            | Self::RateLimited { contact_id, .. }
            | Self::QueueFull { contact_id, .. }
            | Self::NoRuleMatched { contact_id, .. }
            | Self::Dispatched { contact_id, .. }
            | Self::ConsentUpdated { contact_id, .. }
            | Self::Failed { contact_id, .. } => contact_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_message_defaults() {
        let msg: InboundMessage =
            serde_json::from_str(r#"{"contact_id": "0812", "body": "halo"}"#).unwrap();
        assert_eq!(msg.direction, Direction::Inbound);
        assert!(msg.name.is_none());
    }

    #[test]
    fn outcome_tags() {
        let outcome = PipelineOutcome::RateLimited {
            contact_id: "6281".into(),
            reason: LimitReason::GlobalRateLimit,
            retry_after_secs: 12,
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["outcome"], "rate_limited");
        assert_eq!(json["reason"], "global_rate_limit");
        assert_eq!(outcome.retry_after_secs(), Some(12));

        let rejected = PipelineOutcome::Rejected {
            contact_id: "6281".into(),
            reason: ViolationReason::OptedOut,
        };
        assert_eq!(serde_json::to_value(&rejected).unwrap()["reason"], "opted_out");
    }

    #[test]
    fn outbound_request_defaults_to_business_initiated() {
        let req: OutboundRequest =
            serde_json::from_str(r#"{"contact_id": "6281", "body": "promo"}"#).unwrap();
        assert_eq!(req.direction, Direction::BusinessInitiated);
        assert!(!req.admin && !req.emergency);
    }
}
