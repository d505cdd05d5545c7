//! Message processor: runs one message through gate, limiter, matcher, queue.
//!
//! Flow for an inbound message:
//! 1. Canonicalize the contact and load or create it
//! 2. Record the conversation window (always, even if nothing else happens)
//! 3. Consent keywords → update opt-in, stop
//! 4. Compliance: inbound screen, then permission for an automated reply
//! 5. Rate limiter check
//! 6. Rule matcher → template
//! 7. Enqueue the rendered reply, then count it against the limits and log
//!    the rule as matched (or skipped when the reply was not queued)
//!
//! Messages of one contact are processed one at a time; different contacts
//! run concurrently.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::compliance::{ComplianceGate, ComplianceRequest, Direction, ViolationReason};
use crate::dispatch::{DispatchQueue, OutboundDraft, TemplateRef};
use crate::error::DispatchError;
use crate::model::{Contact, Template, TriggerOutcome, canonicalize_phone};
use crate::pipeline::types::{InboundMessage, OutboundRequest, PipelineOutcome};
use crate::ratelimit::{LimitOverride, RateLimiter};
use crate::rules::RuleMatcher;
use crate::store::Repository;

/// Messages processed in parallel by `process_batch`.
const BATCH_CONCURRENCY: usize = 16;

/// Lock map size above which idle per-contact locks are dropped.
const LOCK_PRUNE_THRESHOLD: usize = 1024;

pub struct MessageProcessor {
    repo: Arc<dyn Repository>,
    gate: Arc<ComplianceGate>,
    limiter: Arc<RateLimiter>,
    matcher: Arc<RuleMatcher>,
    queue: Arc<DispatchQueue>,
    clock: Arc<dyn Clock>,
    contact_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl MessageProcessor {
    pub fn new(
        repo: Arc<dyn Repository>,
        gate: Arc<ComplianceGate>,
        limiter: Arc<RateLimiter>,
        matcher: Arc<RuleMatcher>,
        queue: Arc<DispatchQueue>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            repo,
            gate,
            limiter,
            matcher,
            queue,
            clock,
            contact_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn matcher(&self) -> &Arc<RuleMatcher> {
        &self.matcher
    }

    pub fn queue(&self) -> &Arc<DispatchQueue> {
        &self.queue
    }

    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repo
    }

    /// Process a single inbound message through the full pipeline.
    pub async fn process(&self, message: InboundMessage) -> PipelineOutcome {
        let Some(contact_id) = canonicalize_phone(&message.contact_id) else {
            warn!(raw = %message.contact_id, "Inbound message with unusable contact id");
            return failed(&message.contact_id, "validation", "invalid contact id");
        };
        if message.direction != Direction::Inbound {
            return failed(&contact_id, "validation", "expected an inbound message");
        }

        let lock = self.contact_lock(&contact_id).await;
        let _guard = lock.lock().await;

        info!(
            contact = %contact_id,
            received_at = %message.timestamp,
            "Processing inbound message"
        );
        let outcome = self.process_locked(&contact_id, &message).await;
        log_outcome(&outcome);
        outcome
    }

    async fn process_locked(&self, contact_id: &str, message: &InboundMessage) -> PipelineOutcome {
        let (contact, loaded) = self.load_or_create(contact_id, message.name.as_deref()).await;

        // Window tracking never depends on anything below.
        let contact = self.gate.record_inbound(&contact).await;
        if !loaded {
            return rejected(contact_id, ViolationReason::StoreUnavailable);
        }

        if let Some(change) = self.gate.consent_change(&message.body) {
            return match self.gate.apply_consent(&contact, change).await {
                Ok(updated) => PipelineOutcome::ConsentUpdated {
                    contact_id: contact_id.to_string(),
                    opt_in: updated.opt_in,
                },
                Err(e) => failed(contact_id, "consent", e),
            };
        }

        let screen = self
            .gate
            .evaluate(&ComplianceRequest::new(&contact, Direction::Inbound, &message.body))
            .await;
        if let Some(reason) = screen.reason {
            return rejected(contact_id, reason);
        }

        // Permission for an automated reply, before any rule is looked at.
        let permission = self
            .gate
            .evaluate(&ComplianceRequest::new(&contact, Direction::AutomatedReply, ""))
            .await;
        if let Some(reason) = permission.reason {
            return rejected(contact_id, reason);
        }

        if let Err(limited) = self.limiter.check_contact(&contact, LimitOverride::default()).await {
            return PipelineOutcome::RateLimited {
                contact_id: contact_id.to_string(),
                reason: limited.reason,
                retry_after_secs: limited.retry_after_secs,
            };
        }

        let found = match self.matcher.match_message(&message.body, &contact).await {
            Ok(Some(found)) => found,
            Ok(None) => {
                return PipelineOutcome::NoRuleMatched {
                    contact_id: contact_id.to_string(),
                    window_expires_at: contact.window_expires_at,
                };
            }
            Err(e) => return failed(contact_id, "rule_matcher", e),
        };

        let body = found.template.render(&contact);
        let reply = ComplianceRequest::new(&contact, Direction::AutomatedReply, &body)
            .with_approved_template(found.template.is_approved);
        if let Some(reason) = self.gate.evaluate(&reply).await.reason {
            self.record_trigger(found.rule.id, &contact, TriggerOutcome::Skipped("reply_rejected".into()))
                .await;
            return rejected(contact_id, reason);
        }

        let draft = OutboundDraft {
            contact_id: contact_id.to_string(),
            body,
            template: Some(template_ref(&found.template)),
            rule_id: Some(found.rule.id),
            requires_template: permission.requires_template,
        };
        let outcome = self
            .enqueue(&contact, draft, Some(found.rule.id), Some(found.template.id))
            .await;
        let trigger = match &outcome {
            PipelineOutcome::Dispatched { .. } => TriggerOutcome::Matched,
            PipelineOutcome::QueueFull { .. } => TriggerOutcome::Skipped("queue_full".into()),
            _ => TriggerOutcome::Skipped("dispatch_failed".into()),
        };
        self.record_trigger(found.rule.id, &contact, trigger).await;
        outcome
    }

    /// Trigger-log write after the reply's fate is known. The outcome stands
    /// even if the log cannot be written.
    async fn record_trigger(&self, rule_id: i64, contact: &Contact, outcome: TriggerOutcome) {
        if let Err(e) = self.matcher.record_outcome(rule_id, contact, outcome).await {
            warn!(rule_id, contact = %contact.id, error = %e, "Failed to write rule trigger log");
        }
    }

    /// Send an operator or business-initiated message through the same
    /// compliance, limit and queue path.
    pub async fn submit_outbound(&self, request: OutboundRequest) -> PipelineOutcome {
        let Some(contact_id) = canonicalize_phone(&request.contact_id) else {
            return failed(&request.contact_id, "validation", "invalid contact id");
        };
        if !request.direction.is_outbound() {
            return failed(&contact_id, "validation", "expected an outbound direction");
        }

        let lock = self.contact_lock(&contact_id).await;
        let _guard = lock.lock().await;

        info!(
            contact = %contact_id,
            direction = request.direction.as_str(),
            template_id = ?request.template_id,
            admin = request.admin,
            "Processing outbound request"
        );
        let outcome = self.submit_locked(&contact_id, &request).await;
        log_outcome(&outcome);
        outcome
    }

    async fn submit_locked(&self, contact_id: &str, request: &OutboundRequest) -> PipelineOutcome {
        let template = match request.template_id {
            Some(id) => match self.repo.get_template(id).await {
                Ok(Some(template)) if template.is_active => Some(template),
                Ok(_) => return failed(contact_id, "template", format!("template {id} unavailable")),
                Err(e) => return failed(contact_id, "template", e),
            },
            None => None,
        };
        let approved = template.as_ref().is_some_and(|t| t.is_approved);
        let raw_body = template.as_ref().map_or(request.body.as_str(), |t| t.body.as_str());
        if raw_body.trim().is_empty() {
            return failed(contact_id, "validation", "empty message body");
        }

        let (contact, decision) = self
            .gate
            .evaluate_contact(contact_id, request.direction, raw_body, approved, request.admin)
            .await;
        if let Some(reason) = decision.reason {
            return rejected(contact_id, reason);
        }
        // Allowed for a contact the store does not know (an approved template
        // needs no consent). There is no one to send to.
        let Some(contact) = contact else {
            return rejected(contact_id, ViolationReason::UnknownContact);
        };

        let privileges = LimitOverride {
            admin: request.admin,
            emergency: request.emergency,
        };
        if let Err(limited) = self.limiter.check_contact(&contact, privileges).await {
            return PipelineOutcome::RateLimited {
                contact_id: contact_id.to_string(),
                reason: limited.reason,
                retry_after_secs: limited.retry_after_secs,
            };
        }

        let body = match &template {
            Some(t) => t.render(&contact),
            None => request.body.clone(),
        };
        let draft = OutboundDraft {
            contact_id: contact_id.to_string(),
            body,
            template: template.as_ref().map(template_ref),
            rule_id: None,
            requires_template: decision.requires_template,
        };
        self.enqueue(&contact, draft, None, template.as_ref().map(|t| t.id))
            .await
    }

    /// Process many messages concurrently. Results keep the input order.
    pub async fn process_batch(&self, messages: Vec<InboundMessage>) -> Vec<PipelineOutcome> {
        let count = messages.len();
        info!(count, "Processing message batch");

        let outcomes: Vec<PipelineOutcome> = futures::stream::iter(messages)
            .map(|message| self.process(message))
            .buffered(BATCH_CONCURRENCY)
            .collect()
            .await;

        let dispatched = outcomes
            .iter()
            .filter(|o| matches!(o, PipelineOutcome::Dispatched { .. }))
            .count();
        info!(total = count, dispatched, "Batch processing complete");
        outcomes
    }

    async fn enqueue(
        &self,
        contact: &Contact,
        draft: OutboundDraft,
        rule_id: Option<i64>,
        template_id: Option<i64>,
    ) -> PipelineOutcome {
        match self.queue.enqueue(draft).await {
            Ok(receipt) => {
                // Counted only once the queue has accepted the send.
                self.limiter.record(contact).await;
                PipelineOutcome::Dispatched {
                    contact_id: contact.id.clone(),
                    rule_id,
                    template_id,
                    receipt,
                }
            }
            Err(DispatchError::Backpressure { retry_after_secs, .. }) => PipelineOutcome::QueueFull {
                contact_id: contact.id.clone(),
                retry_after_secs,
            },
            Err(e) => failed(&contact.id, "dispatch", e),
        }
    }

    /// Existing contact, or a new one created on first contact. The flag is
    /// false when the store could not be used.
    async fn load_or_create(&self, contact_id: &str, name: Option<&str>) -> (Contact, bool) {
        match self.repo.get_contact(contact_id).await {
            Ok(Some(contact)) => (contact, true),
            Ok(None) => {
                let mut contact = Contact::new(contact_id, self.clock.now());
                if let Some(name) = name {
                    contact = contact.with_name(name);
                }
                match self.repo.insert_contact(&contact).await {
                    Ok(()) => {
                        debug!(contact = %contact_id, "Created contact on first message");
                        (contact, true)
                    }
                    Err(e) => {
                        error!(contact = %contact_id, error = %e, "Failed to create contact");
                        (contact, false)
                    }
                }
            }
            Err(e) => {
                error!(contact = %contact_id, error = %e, "Failed to load contact");
                (Contact::new(contact_id, self.clock.now()), false)
            }
        }
    }

    async fn contact_lock(&self, contact_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.contact_locks.lock().await;
        if locks.len() > LOCK_PRUNE_THRESHOLD {
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        locks
            .entry(contact_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

fn template_ref(template: &Template) -> TemplateRef {
    TemplateRef {
        id: template.id,
        name: template.name.clone(),
        language: template.language.clone(),
    }
}

fn rejected(contact_id: &str, reason: ViolationReason) -> PipelineOutcome {
    PipelineOutcome::Rejected {
        contact_id: contact_id.to_string(),
        reason,
    }
}

fn failed(contact_id: &str, stage: &str, error: impl std::fmt::Display) -> PipelineOutcome {
    PipelineOutcome::Failed {
        contact_id: contact_id.to_string(),
        stage: stage.to_string(),
        error: error.to_string(),
    }
}

fn log_outcome(outcome: &PipelineOutcome) {
    match outcome {
        PipelineOutcome::Failed { stage, error, .. } => {
            error!(contact = %outcome.contact_id(), stage = %stage, error = %error, "Pipeline failed");
        }
        PipelineOutcome::Rejected { reason, .. } => {
            info!(contact = %outcome.contact_id(), reason = reason.as_str(), "Rejected by compliance gate");
        }
        PipelineOutcome::RateLimited {
            reason,
            retry_after_secs,
            ..
        } => {
            info!(
                contact = %outcome.contact_id(),
                reason = reason.as_str(),
                retry_after_secs,
                "Rate limited"
            );
        }
        other => {
            info!(contact = %other.contact_id(), outcome = other.label(), "Pipeline finished");
        }
    }
}
