//! In-memory `Repository` for tests and single-instance setups.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::dispatch::model::OutboundQueueItem;
use crate::error::StoreError;
use crate::model::{
    AutomationRule, Contact, ContactPatch, RuleTriggerLog, Template, TriggerOutcome,
};
use crate::store::traits::Repository;

#[derive(Default)]
struct State {
    contacts: HashMap<String, Contact>,
    rules: Vec<AutomationRule>,
    templates: HashMap<i64, Template>,
    trigger_logs: Vec<RuleTriggerLog>,
    queue: Vec<OutboundQueueItem>,
    queue_index: HashMap<Uuid, usize>,
}

/// Repository held entirely in process memory.
///
/// `set_unavailable(true)` makes every call fail with
/// `StoreError::Unavailable`, which is how tests drive the fail-open /
/// fail-closed paths.
#[derive(Default)]
pub struct InMemoryRepository {
    state: RwLock<State>,
    unavailable: AtomicBool,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Add or replace a rule (operator-side operation).
    pub async fn upsert_rule(&self, rule: AutomationRule) {
        let mut state = self.state.write().await;
        match state.rules.iter_mut().find(|r| r.id == rule.id) {
            Some(existing) => *existing = rule,
            None => state.rules.push(rule),
        }
    }

    /// Add or replace a template (operator-side operation).
    pub async fn upsert_template(&self, template: Template) {
        self.state.write().await.templates.insert(template.id, template);
    }

    /// Snapshot of the whole trigger log.
    pub async fn trigger_logs(&self) -> Vec<RuleTriggerLog> {
        self.state.read().await.trigger_logs.clone()
    }

    /// Snapshot of persisted queue items in insertion order.
    pub async fn queue_items(&self) -> Vec<OutboundQueueItem> {
        self.state.read().await.queue.clone()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store marked unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn get_contact(&self, id: &str) -> Result<Option<Contact>, StoreError> {
        self.check_available()?;
        Ok(self.state.read().await.contacts.get(id).cloned())
    }

    async fn insert_contact(&self, contact: &Contact) -> Result<(), StoreError> {
        self.check_available()?;
        self.state
            .write()
            .await
            .contacts
            .entry(contact.id.clone())
            .or_insert_with(|| contact.clone());
        Ok(())
    }

    async fn update_contact(&self, id: &str, patch: &ContactPatch) -> Result<Contact, StoreError> {
        self.check_available()?;
        let mut state = self.state.write().await;
        let contact = state.contacts.get_mut(id).ok_or_else(|| StoreError::NotFound {
            entity: "contact".into(),
            id: id.into(),
        })?;
        contact.apply(patch);
        Ok(contact.clone())
    }

    async fn list_active_rules(&self) -> Result<Vec<AutomationRule>, StoreError> {
        self.check_available()?;
        Ok(self
            .state
            .read()
            .await
            .rules
            .iter()
            .filter(|r| r.is_active)
            .cloned()
            .collect())
    }

    async fn get_template(&self, id: i64) -> Result<Option<Template>, StoreError> {
        self.check_available()?;
        Ok(self.state.read().await.templates.get(&id).cloned())
    }

    async fn list_templates_by_category(&self, category: &str) -> Result<Vec<Template>, StoreError> {
        self.check_available()?;
        let state = self.state.read().await;
        let mut templates: Vec<Template> = state
            .templates
            .values()
            .filter(|t| t.is_active && t.category == category)
            .cloned()
            .collect();
        templates.sort_by_key(|t| t.id);
        Ok(templates)
    }

    async fn log_rule_trigger(&self, entry: &RuleTriggerLog) -> Result<(), StoreError> {
        self.check_available()?;
        self.state.write().await.trigger_logs.push(entry.clone());
        Ok(())
    }

    async fn last_trigger_at(
        &self,
        rule_id: i64,
        contact_id: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.check_available()?;
        Ok(self
            .state
            .read()
            .await
            .trigger_logs
            .iter()
            .filter(|l| {
                l.rule_id == Some(rule_id)
                    && l.contact_id == contact_id
                    && l.outcome == TriggerOutcome::Matched
            })
            .map(|l| l.timestamp)
            .max())
    }

    async fn count_triggers(&self, rule_id: i64, contact_id: &str) -> Result<u32, StoreError> {
        self.check_available()?;
        let count = self
            .state
            .read()
            .await
            .trigger_logs
            .iter()
            .filter(|l| {
                l.rule_id == Some(rule_id)
                    && l.contact_id == contact_id
                    && l.outcome == TriggerOutcome::Matched
            })
            .count();
        Ok(count as u32)
    }

    async fn list_trigger_logs(&self, contact_id: &str) -> Result<Vec<RuleTriggerLog>, StoreError> {
        self.check_available()?;
        Ok(self
            .state
            .read()
            .await
            .trigger_logs
            .iter()
            .filter(|l| l.contact_id == contact_id)
            .cloned()
            .collect())
    }

    async fn save_queue_item(&self, item: &OutboundQueueItem) -> Result<(), StoreError> {
        self.check_available()?;
        let mut state = self.state.write().await;
        match state.queue_index.get(&item.id).copied() {
            Some(idx) => state.queue[idx] = item.clone(),
            None => {
                let idx = state.queue.len();
                state.queue.push(item.clone());
                state.queue_index.insert(item.id, idx);
            }
        }
        Ok(())
    }

    async fn list_unfinished_queue_items(&self) -> Result<Vec<OutboundQueueItem>, StoreError> {
        self.check_available()?;
        Ok(self
            .state
            .read()
            .await
            .queue
            .iter()
            .filter(|i| !i.is_terminal())
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::model::{OutboundDraft, QueueStatus};

    #[tokio::test]
    async fn insert_does_not_overwrite() {
        let repo = InMemoryRepository::new();
        let now = Utc::now();
        repo.insert_contact(&Contact::new("6281", now).with_opt_in(true)).await.unwrap();
        repo.insert_contact(&Contact::new("6281", now)).await.unwrap();
        assert!(repo.get_contact("6281").await.unwrap().unwrap().opt_in);
    }

    #[tokio::test]
    async fn update_missing_contact_is_not_found() {
        let repo = InMemoryRepository::new();
        let err = repo
            .update_contact("nobody", &ContactPatch::opt_in(Utc::now()))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn only_active_rules_are_listed() {
        let repo = InMemoryRepository::new();
        let now = Utc::now();
        repo.upsert_rule(AutomationRule::keyword(1, "a", 10, &["x"], 1, now)).await;
        repo.upsert_rule(AutomationRule::keyword(2, "b", 10, &["x"], 1, now).inactive()).await;
        let rules = repo.list_active_rules().await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].id, 1);
    }

    #[tokio::test]
    async fn trigger_queries_only_count_matches() {
        let repo = InMemoryRepository::new();
        let now = Utc::now();
        for outcome in [
            TriggerOutcome::Matched,
            TriggerOutcome::Skipped("cooldown".into()),
            TriggerOutcome::Matched,
        ] {
            repo.log_rule_trigger(&RuleTriggerLog {
                rule_id: Some(7),
                contact_id: "6281".into(),
                timestamp: now,
                outcome,
            })
            .await
            .unwrap();
        }
        assert_eq!(repo.count_triggers(7, "6281").await.unwrap(), 2);
        assert_eq!(repo.last_trigger_at(7, "6281").await.unwrap(), Some(now));
        assert_eq!(repo.count_triggers(7, "other").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unavailable_fails_every_call() {
        let repo = InMemoryRepository::new();
        repo.set_unavailable(true);
        assert!(matches!(
            repo.get_contact("6281").await,
            Err(StoreError::Unavailable(_))
        ));
        repo.set_unavailable(false);
        assert!(repo.get_contact("6281").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_queue_item_upserts() {
        let repo = InMemoryRepository::new();
        let mut item = OutboundQueueItem::from_draft(OutboundDraft::text("6281", "hi"), 3, Utc::now());
        repo.save_queue_item(&item).await.unwrap();
        item.transition_to(QueueStatus::Sending).unwrap();
        item.transition_to(QueueStatus::Sent).unwrap();
        repo.save_queue_item(&item).await.unwrap();

        let items = repo.queue_items().await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].status, QueueStatus::Sent);
        assert!(repo.list_unfinished_queue_items().await.unwrap().is_empty());
    }
}
