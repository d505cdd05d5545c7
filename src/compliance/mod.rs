//! Compliance gate: opt-in, conversation window, business hours, spam.
//!
//! Outbound permission checks fail closed: anything the gate cannot verify
//! is rejected. The inbound side effect (extending the conversation window)
//! fails open, so a store outage never loses track of a customer message.

pub mod hours;
pub mod spam;

use std::sync::Arc;

use chrono::Duration;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::ComplianceConfig;
use crate::error::{ConfigError, StoreError};
use crate::model::{Contact, ContactPatch, normalize_body};
use crate::store::Repository;

pub use hours::BusinessHours;
pub use spam::{DuplicateTracker, ProhibitedContent};

/// Who is sending, and why.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Customer to business.
    Inbound,
    /// Rule-selected answer to an inbound message.
    AutomatedReply,
    /// Human operator answering a customer.
    OperatorReply,
    /// Broadcast or campaign message not answering anything.
    BusinessInitiated,
}

impl Direction {
    pub fn is_outbound(&self) -> bool {
        !matches!(self, Self::Inbound)
    }

    /// Replies inside an open window are exempt from business hours.
    pub fn is_reply(&self) -> bool {
        matches!(self, Self::AutomatedReply | Self::OperatorReply)
    }

    /// Business-driven content needs the contact's consent.
    pub fn requires_opt_in(&self) -> bool {
        matches!(self, Self::AutomatedReply | Self::BusinessInitiated)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::AutomatedReply => "automated_reply",
            Self::OperatorReply => "operator_reply",
            Self::BusinessInitiated => "business_initiated",
        }
    }
}

/// Why the gate rejected a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationReason {
    OptedOut,
    WindowClosed,
    OutsideBusinessHours,
    DuplicateMessage,
    ProhibitedContent,
    /// Contact state could not be read.
    StoreUnavailable,
    /// The store is healthy but has no such contact.
    UnknownContact,
}

impl ViolationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OptedOut => "opted_out",
            Self::WindowClosed => "window_closed",
            Self::OutsideBusinessHours => "outside_business_hours",
            Self::DuplicateMessage => "duplicate_message",
            Self::ProhibitedContent => "prohibited_content",
            Self::StoreUnavailable => "store_unavailable",
            Self::UnknownContact => "unknown_contact",
        }
    }
}

impl std::fmt::Display for ViolationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input to `ComplianceGate::evaluate`.
#[derive(Debug, Clone)]
pub struct ComplianceRequest<'a> {
    pub contact: &'a Contact,
    pub direction: Direction,
    pub body: &'a str,
    /// The body is a platform pre-approved template.
    pub approved_template: bool,
    /// Operator/admin override of the business-hours check.
    pub admin_override: bool,
}

impl<'a> ComplianceRequest<'a> {
    pub fn new(contact: &'a Contact, direction: Direction, body: &'a str) -> Self {
        Self {
            contact,
            direction,
            body,
            approved_template: false,
            admin_override: false,
        }
    }

    pub fn with_approved_template(mut self, approved: bool) -> Self {
        self.approved_template = approved;
        self
    }

    pub fn with_admin_override(mut self, admin_override: bool) -> Self {
        self.admin_override = admin_override;
        self
    }
}

/// Result of a compliance evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceDecision {
    pub allowed: bool,
    /// Outside the window: only a pre-approved template may be sent.
    pub requires_template: bool,
    pub within_window: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<ViolationReason>,
}

impl ComplianceDecision {
    fn allow(within_window: bool) -> Self {
        Self {
            allowed: true,
            requires_template: !within_window,
            within_window,
            reason: None,
        }
    }

    fn reject(reason: ViolationReason, within_window: bool) -> Self {
        Self {
            allowed: false,
            requires_template: !within_window,
            within_window,
            reason: Some(reason),
        }
    }
}

/// Consent change requested by an inbound keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentChange {
    OptIn,
    OptOut,
}

pub struct ComplianceGate {
    repo: Arc<dyn Repository>,
    clock: Arc<dyn Clock>,
    window: Duration,
    hours: BusinessHours,
    duplicates: DuplicateTracker,
    prohibited: ProhibitedContent,
    opt_out_keywords: Vec<String>,
    opt_in_keywords: Vec<String>,
}

impl ComplianceGate {
    pub fn new(
        config: &ComplianceConfig,
        repo: Arc<dyn Repository>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        let window = to_chrono(config.window, "ENGAGE_WINDOW_HOURS")?;
        let duplicate_window = to_chrono(config.duplicate_window, "ENGAGE_DUPLICATE_WINDOW_MINUTES")?;

        Ok(Self {
            repo,
            clock,
            window,
            hours: BusinessHours::from_config(&config.business_hours),
            duplicates: DuplicateTracker::new(duplicate_window),
            prohibited: ProhibitedContent::new(&config.prohibited_patterns)?,
            opt_out_keywords: config.opt_out_keywords.iter().map(|k| normalize_body(k)).collect(),
            opt_in_keywords: config.opt_in_keywords.iter().map(|k| normalize_body(k)).collect(),
        })
    }

    pub fn business_hours(&self) -> &BusinessHours {
        &self.hours
    }

    /// Record an inbound message: `window_expires_at = now + window`.
    ///
    /// Runs for every inbound message regardless of what happens next. On a
    /// store failure the update is applied to the returned copy only and the
    /// pipeline carries on.
    pub async fn record_inbound(&self, contact: &Contact) -> Contact {
        let now = self.clock.now();
        let patch = ContactPatch::inbound(now, now + self.window);

        match self.repo.update_contact(&contact.id, &patch).await {
            Ok(updated) => updated,
            Err(e) => {
                warn!(
                    contact = %contact.id,
                    error = %e,
                    "Failed to persist conversation window, continuing with local copy"
                );
                let mut local = contact.clone();
                local.apply(&patch);
                local
            }
        }
    }

    /// Whether an inbound body is exactly a consent keyword.
    pub fn consent_change(&self, body: &str) -> Option<ConsentChange> {
        let normalized = normalize_body(body);
        if self.opt_out_keywords.iter().any(|k| *k == normalized) {
            Some(ConsentChange::OptOut)
        } else if self.opt_in_keywords.iter().any(|k| *k == normalized) {
            Some(ConsentChange::OptIn)
        } else {
            None
        }
    }

    pub async fn apply_consent(
        &self,
        contact: &Contact,
        change: ConsentChange,
    ) -> Result<Contact, StoreError> {
        let now = self.clock.now();
        let patch = match change {
            ConsentChange::OptIn => ContactPatch::opt_in(now),
            ConsentChange::OptOut => ContactPatch::opt_out(now),
        };
        self.repo.update_contact(&contact.id, &patch).await
    }

    /// Evaluate one message against the compliance policy.
    ///
    /// Inbound messages are only screened for content. Outbound messages go
    /// through opt-in, window, business hours and content checks in that
    /// order; the first failure decides the reason.
    pub async fn evaluate(&self, request: &ComplianceRequest<'_>) -> ComplianceDecision {
        let now = self.clock.now();
        let contact = request.contact;
        let within_window = contact.within_window(now);

        if request.direction == Direction::Inbound {
            return match self.screen_inbound(&contact.id, request.body).await {
                Some(reason) => ComplianceDecision::reject(reason, within_window),
                None => ComplianceDecision::allow(within_window),
            };
        }

        if request.direction.requires_opt_in() && !contact.opt_in {
            return self.rejected(request, ViolationReason::OptedOut, within_window);
        }

        if !within_window && !request.approved_template {
            return self.rejected(request, ViolationReason::WindowClosed, within_window);
        }

        let exempt_reply = request.direction.is_reply() && within_window;
        if !exempt_reply && !request.admin_override && !self.hours.is_open(now) {
            return self.rejected(request, ViolationReason::OutsideBusinessHours, within_window);
        }

        if self.prohibited.first_match(request.body).is_some() {
            return self.rejected(request, ViolationReason::ProhibitedContent, within_window);
        }

        ComplianceDecision::allow(within_window)
    }

    /// Load the contact and evaluate. An unreadable contact is rejected.
    pub async fn evaluate_contact(
        &self,
        contact_id: &str,
        direction: Direction,
        body: &str,
        approved_template: bool,
        admin_override: bool,
    ) -> (Option<Contact>, ComplianceDecision) {
        let found = match self.repo.get_contact(contact_id).await {
            Ok(found) => found,
            Err(e) => {
                warn!(contact = %contact_id, error = %e, "Contact lookup failed, rejecting send");
                return (None, ComplianceDecision::reject(ViolationReason::StoreUnavailable, false));
            }
        };

        // Unknown contacts are judged as new ones: no consent, no window.
        let contact = found
            .clone()
            .unwrap_or_else(|| Contact::new(contact_id, self.clock.now()));
        let request = ComplianceRequest::new(&contact, direction, body)
            .with_approved_template(approved_template)
            .with_admin_override(admin_override);
        let decision = self.evaluate(&request).await;
        (found, decision)
    }

    /// Prohibited content first, then duplicates. Only non-prohibited
    /// bodies are remembered for duplicate detection.
    async fn screen_inbound(&self, contact_id: &str, body: &str) -> Option<ViolationReason> {
        if let Some(pattern) = self.prohibited.first_match(body) {
            debug!(contact = %contact_id, pattern, "Inbound body matches prohibited pattern");
            return Some(ViolationReason::ProhibitedContent);
        }

        let normalized = normalize_body(body);
        if self
            .duplicates
            .check_and_record(contact_id, &normalized, self.clock.now())
            .await
        {
            debug!(contact = %contact_id, "Duplicate inbound body");
            return Some(ViolationReason::DuplicateMessage);
        }
        None
    }

    fn rejected(
        &self,
        request: &ComplianceRequest<'_>,
        reason: ViolationReason,
        within_window: bool,
    ) -> ComplianceDecision {
        debug!(
            contact = %request.contact.id,
            direction = request.direction.as_str(),
            reason = reason.as_str(),
            "Compliance check failed"
        );
        ComplianceDecision::reject(reason, within_window)
    }

    /// Drop duplicate-tracking state for quiet contacts.
    pub async fn purge(&self) -> usize {
        self.duplicates.purge(self.clock.now()).await
    }
}

fn to_chrono(value: std::time::Duration, key: &str) -> Result<Duration, ConfigError> {
    Duration::from_std(value).map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}
