//! `Repository` trait: the engine's single async view of persisted state.
//!
//! Contacts, rules, templates, trigger logs and outbound queue items all
//! live behind this trait. Rules and templates are edited by operators
//! elsewhere; the engine only reads them. Reads are eventually consistent.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::dispatch::model::OutboundQueueItem;
use crate::error::StoreError;
use crate::model::{AutomationRule, Contact, ContactPatch, RuleTriggerLog, Template};

#[async_trait]
pub trait Repository: Send + Sync {
    // ── Contacts ────────────────────────────────────────────────────

    /// Look up a contact by canonical id.
    async fn get_contact(&self, id: &str) -> Result<Option<Contact>, StoreError>;

    /// Insert a contact. Inserting an existing id keeps the stored row.
    async fn insert_contact(&self, contact: &Contact) -> Result<(), StoreError>;

    /// Apply a partial update and return the updated contact.
    async fn update_contact(&self, id: &str, patch: &ContactPatch) -> Result<Contact, StoreError>;

    // ── Rules & templates ───────────────────────────────────────────

    /// All rules with `is_active = true`, in creation order.
    async fn list_active_rules(&self) -> Result<Vec<AutomationRule>, StoreError>;

    async fn get_template(&self, id: i64) -> Result<Option<Template>, StoreError>;

    /// Active templates in a category.
    async fn list_templates_by_category(&self, category: &str) -> Result<Vec<Template>, StoreError>;

    // ── Trigger log ─────────────────────────────────────────────────

    /// Append one trigger log entry.
    async fn log_rule_trigger(&self, entry: &RuleTriggerLog) -> Result<(), StoreError>;

    /// Timestamp of the most recent `Matched` entry for (rule, contact).
    async fn last_trigger_at(
        &self,
        rule_id: i64,
        contact_id: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Number of `Matched` entries for (rule, contact).
    async fn count_triggers(&self, rule_id: i64, contact_id: &str) -> Result<u32, StoreError>;

    /// Trigger log for a contact, oldest first.
    async fn list_trigger_logs(&self, contact_id: &str) -> Result<Vec<RuleTriggerLog>, StoreError>;

    // ── Outbound queue ──────────────────────────────────────────────

    /// Insert or replace a queue item.
    async fn save_queue_item(&self, item: &OutboundQueueItem) -> Result<(), StoreError>;

    /// Items not yet in a terminal state, oldest first.
    async fn list_unfinished_queue_items(&self) -> Result<Vec<OutboundQueueItem>, StoreError>;
}
