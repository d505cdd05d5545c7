//! Rule matcher: picks at most one automation rule and template per message.
//!
//! Active rules are evaluated highest priority first (ties in creation
//! order). Content matching short-circuits on the first eligible rule. A rule
//! whose content matches but whose cooldown, trigger cap or template rules it
//! out is logged as skipped and evaluation moves on to the next rule.
//!
//! The winning rule is not logged here. The caller records `matched` once the
//! reply has actually been queued, or a skip reason when it was not, so
//! cooldowns and trigger caps only count replies that went out.

pub mod templates;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Duration;
use serde::Serialize;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::error::StoreError;
use crate::model::{
    AutomationRule, Contact, RuleMatcherKind, RuleTriggerLog, Template, TriggerOutcome,
    normalize_body,
};
use crate::store::Repository;

pub use templates::{score_template, select_template};

/// Process-wide automation on/off switch, toggled by operators.
#[derive(Debug)]
pub struct MasterSwitch {
    enabled: AtomicBool,
}

impl MasterSwitch {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Set the switch, returning the previous state.
    pub fn set(&self, enabled: bool) -> bool {
        let previous = self.enabled.swap(enabled, Ordering::SeqCst);
        if previous != enabled {
            info!(enabled, "Automation master switch changed");
        }
        previous
    }
}

impl Default for MasterSwitch {
    fn default() -> Self {
        Self::new(true)
    }
}

/// The winning rule and the template it answers with.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleMatch {
    pub rule: AutomationRule,
    pub template: Template,
    /// Keyword-overlap score for template-category rules.
    pub confidence: Option<f32>,
}

/// Content-level candidate before per-contact checks.
enum Candidate {
    TemplateId(i64),
    Scored(Template, f32),
}

pub struct RuleMatcher {
    repo: Arc<dyn Repository>,
    clock: Arc<dyn Clock>,
    switch: Arc<MasterSwitch>,
    min_confidence: f32,
}

impl RuleMatcher {
    pub fn new(
        repo: Arc<dyn Repository>,
        clock: Arc<dyn Clock>,
        switch: Arc<MasterSwitch>,
        min_confidence: f32,
    ) -> Self {
        Self {
            repo,
            clock,
            switch,
            min_confidence,
        }
    }

    pub fn master_switch(&self) -> &Arc<MasterSwitch> {
        &self.switch
    }

    /// Find the rule that answers `body` for `contact`.
    ///
    /// `Ok(None)` is the normal "no automated reply" outcome. Store errors
    /// are returned so the caller can drop the reply.
    pub async fn match_message(
        &self,
        body: &str,
        contact: &Contact,
    ) -> Result<Option<RuleMatch>, StoreError> {
        if !self.switch.is_enabled() {
            debug!(contact = %contact.id, "Automation disabled, skipping rule evaluation");
            return Ok(None);
        }

        let normalized = normalize_body(body);
        let mut rules: Vec<AutomationRule> = self
            .repo
            .list_active_rules()
            .await?
            .into_iter()
            .filter(|r| r.is_active)
            .collect();
        // Stable: equal priorities keep creation order.
        rules.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });

        for rule in rules {
            let Some(candidate) = self.content_match(&rule, &normalized).await? else {
                continue;
            };

            if let Some(reason) = self.contact_block(&rule, contact).await? {
                debug!(rule_id = rule.id, contact = %contact.id, reason, "Rule skipped");
                self.log(Some(rule.id), contact, TriggerOutcome::Skipped(reason.into()))
                    .await?;
                continue;
            }

            let (template, confidence) = match candidate {
                Candidate::Scored(template, score) => (template, Some(score)),
                Candidate::TemplateId(id) => match self.repo.get_template(id).await? {
                    Some(template) if template.is_active => (template, None),
                    _ => {
                        debug!(rule_id = rule.id, template_id = id, "Rule template unavailable");
                        self.log(
                            Some(rule.id),
                            contact,
                            TriggerOutcome::Skipped("template_unavailable".into()),
                        )
                        .await?;
                        continue;
                    }
                },
            };

            info!(
                rule_id = rule.id,
                rule = %rule.name,
                template_id = template.id,
                contact = %contact.id,
                "Rule selected"
            );
            return Ok(Some(RuleMatch {
                rule,
                template,
                confidence,
            }));
        }

        self.log(None, contact, TriggerOutcome::NoMatch).await?;
        info!(contact = %contact.id, "No rule matched");
        Ok(None)
    }

    /// Record what became of a selected rule's reply.
    pub async fn record_outcome(
        &self,
        rule_id: i64,
        contact: &Contact,
        outcome: TriggerOutcome,
    ) -> Result<(), StoreError> {
        self.log(Some(rule_id), contact, outcome).await
    }

    async fn content_match(
        &self,
        rule: &AutomationRule,
        normalized: &str,
    ) -> Result<Option<Candidate>, StoreError> {
        match &rule.matcher {
            RuleMatcherKind::Keyword {
                keywords,
                template_id,
            } => {
                let hit = keywords
                    .iter()
                    .map(|k| normalize_body(k))
                    .any(|k| !k.is_empty() && normalized.contains(&k));
                Ok(hit.then_some(Candidate::TemplateId(*template_id)))
            }
            RuleMatcherKind::TemplateCategory {
                category,
                min_confidence,
            } => {
                let templates = self.repo.list_templates_by_category(category).await?;
                let threshold = min_confidence.unwrap_or(self.min_confidence);
                Ok(select_template(&templates, normalized, threshold)
                    .map(|(template, score)| Candidate::Scored(template.clone(), score)))
            }
        }
    }

    /// Per-contact reason to skip a rule: cooldown or trigger cap.
    async fn contact_block(
        &self,
        rule: &AutomationRule,
        contact: &Contact,
    ) -> Result<Option<&'static str>, StoreError> {
        if rule.cooldown_minutes > 0 {
            if let Some(last) = self.repo.last_trigger_at(rule.id, &contact.id).await? {
                let cooldown = Duration::minutes(i64::from(rule.cooldown_minutes));
                if self.clock.now() - last < cooldown {
                    return Ok(Some("cooldown"));
                }
            }
        }

        if rule.max_triggers_per_contact > 0 {
            let count = self.repo.count_triggers(rule.id, &contact.id).await?;
            if count >= rule.max_triggers_per_contact {
                return Ok(Some("max_triggers"));
            }
        }

        Ok(None)
    }

    async fn log(
        &self,
        rule_id: Option<i64>,
        contact: &Contact,
        outcome: TriggerOutcome,
    ) -> Result<(), StoreError> {
        let entry = RuleTriggerLog {
            rule_id,
            contact_id: contact.id.clone(),
            timestamp: self.clock.now(),
            outcome,
        };
        self.repo.log_rule_trigger(&entry).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    use crate::clock::ManualClock;
    use crate::store::InMemoryRepository;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 3, 0, 0).unwrap()
    }

    struct Fixture {
        repo: Arc<InMemoryRepository>,
        clock: Arc<ManualClock>,
        matcher: RuleMatcher,
    }

    fn fixture() -> Fixture {
        let repo = Arc::new(InMemoryRepository::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let matcher = RuleMatcher::new(
            repo.clone(),
            clock.clone(),
            Arc::new(MasterSwitch::new(true)),
            0.7,
        );
        Fixture {
            repo,
            clock,
            matcher,
        }
    }

    /// Select a rule and record it as sent, the way the processor does after enqueue.
    async fn select_and_send(f: &Fixture, body: &str, contact: &Contact) -> Option<RuleMatch> {
        let found = f.matcher.match_message(body, contact).await.unwrap()?;
        f.matcher
            .record_outcome(found.rule.id, contact, TriggerOutcome::Matched)
            .await
            .unwrap();
        Some(found)
    }

    async fn add_template(repo: &InMemoryRepository, id: i64) {
        repo.upsert_template(Template::new(id, format!("t{id}"), "general", format!("reply {id}")))
            .await;
    }

    #[tokio::test]
    async fn highest_priority_wins() {
        let f = fixture();
        for (id, priority) in [(1, 10), (2, 90), (3, 50)] {
            add_template(&f.repo, id).await;
            f.repo
                .upsert_rule(AutomationRule::keyword(id, format!("r{id}"), priority, &["halo"], id, t0()))
                .await;
        }
        let contact = Contact::new("6281", t0());

        let found = f.matcher.match_message("Halo kak", &contact).await.unwrap().unwrap();
        assert_eq!(found.rule.id, 2);
        assert_eq!(found.template.id, 2);
    }

    #[tokio::test]
    async fn equal_priority_keeps_creation_order() {
        let f = fixture();
        add_template(&f.repo, 1).await;
        add_template(&f.repo, 2).await;
        f.repo
            .upsert_rule(AutomationRule::keyword(2, "later", 50, &["halo"], 2, t0() + Duration::minutes(1)))
            .await;
        f.repo
            .upsert_rule(AutomationRule::keyword(1, "earlier", 50, &["halo"], 1, t0()))
            .await;

        let found = f
            .matcher
            .match_message("halo", &Contact::new("6281", t0()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.rule.id, 1);
    }

    #[tokio::test]
    async fn cooldown_skips_to_next_rule() {
        let f = fixture();
        add_template(&f.repo, 1).await;
        add_template(&f.repo, 2).await;
        f.repo
            .upsert_rule(AutomationRule::keyword(1, "promo", 90, &["paket"], 1, t0()).with_cooldown(30))
            .await;
        f.repo
            .upsert_rule(AutomationRule::keyword(2, "fallback", 10, &["paket"], 2, t0()))
            .await;
        let contact = Contact::new("6281", t0());

        let first = select_and_send(&f, "paket", &contact).await.unwrap();
        assert_eq!(first.rule.id, 1);

        f.clock.advance(Duration::minutes(10));
        let second = select_and_send(&f, "paket", &contact).await.unwrap();
        assert_eq!(second.rule.id, 2);

        f.clock.advance(Duration::minutes(21));
        let third = select_and_send(&f, "paket", &contact).await.unwrap();
        assert_eq!(third.rule.id, 1);

        let logs = f.repo.trigger_logs().await;
        let outcomes: Vec<_> = logs.iter().map(|l| (l.rule_id, l.outcome.label())).collect();
        assert_eq!(
            outcomes,
            vec![
                (Some(1), "matched"),
                (Some(1), "skipped"),
                (Some(2), "matched"),
                (Some(1), "matched"),
            ]
        );
    }

    #[tokio::test]
    async fn max_triggers_per_contact() {
        let f = fixture();
        add_template(&f.repo, 1).await;
        f.repo
            .upsert_rule(AutomationRule::keyword(1, "once", 50, &["info"], 1, t0()).with_max_triggers(1))
            .await;
        let contact = Contact::new("6281", t0());

        assert!(select_and_send(&f, "info", &contact).await.is_some());
        assert!(select_and_send(&f, "info", &contact).await.is_none());
        // Another contact has its own cap.
        let other = Contact::new("6282", t0());
        assert!(select_and_send(&f, "info", &other).await.is_some());
    }

    #[tokio::test]
    async fn selection_alone_does_not_consume_cap() {
        let f = fixture();
        add_template(&f.repo, 1).await;
        f.repo
            .upsert_rule(AutomationRule::keyword(1, "once", 50, &["info"], 1, t0()).with_max_triggers(1))
            .await;
        let contact = Contact::new("6281", t0());

        let found = f.matcher.match_message("info", &contact).await.unwrap().unwrap();
        f.matcher
            .record_outcome(found.rule.id, &contact, TriggerOutcome::Skipped("queue_full".into()))
            .await
            .unwrap();

        // The reply never went out, so the rule is still available.
        assert!(select_and_send(&f, "info", &contact).await.is_some());
        let labels: Vec<_> = f.repo.trigger_logs().await.iter().map(|l| l.outcome.label()).collect();
        assert_eq!(labels, vec!["skipped", "matched"]);
    }

    #[tokio::test]
    async fn no_match_is_logged() {
        let f = fixture();
        add_template(&f.repo, 1).await;
        f.repo
            .upsert_rule(AutomationRule::keyword(1, "promo", 50, &["paket"], 1, t0()))
            .await;

        let found = f
            .matcher
            .match_message("terima kasih", &Contact::new("6281", t0()))
            .await
            .unwrap();
        assert!(found.is_none());

        let logs = f.repo.trigger_logs().await;
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].rule_id, None);
        assert_eq!(logs[0].outcome, TriggerOutcome::NoMatch);
    }

    #[tokio::test]
    async fn inactive_rules_and_templates_are_skipped() {
        let f = fixture();
        add_template(&f.repo, 1).await;
        f.repo
            .upsert_template(Template::new(2, "t2", "general", "gone").inactive())
            .await;
        f.repo
            .upsert_rule(AutomationRule::keyword(1, "off", 90, &["halo"], 1, t0()).inactive())
            .await;
        f.repo
            .upsert_rule(AutomationRule::keyword(2, "stale template", 80, &["halo"], 2, t0()))
            .await;
        f.repo
            .upsert_rule(AutomationRule::keyword(3, "ok", 10, &["halo"], 1, t0()))
            .await;

        let found = f
            .matcher
            .match_message("halo", &Contact::new("6281", t0()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.rule.id, 3);

        let logs = f.repo.trigger_logs().await;
        assert_eq!(
            logs[0].outcome,
            TriggerOutcome::Skipped("template_unavailable".into())
        );
    }

    #[tokio::test]
    async fn template_category_rule() {
        let f = fixture();
        f.repo
            .upsert_template(
                Template::new(10, "umroh", "paket", "Paket umroh kami...")
                    .with_keywords(&["paket", "umroh"]),
            )
            .await;
        f.repo
            .upsert_template(
                Template::new(11, "haji", "paket", "Paket haji kami...")
                    .with_keywords(&["paket", "haji", "plus"]),
            )
            .await;
        f.repo
            .upsert_rule(AutomationRule::template_category(1, "paket", 50, "paket", t0()))
            .await;

        let found = f
            .matcher
            .match_message("Info paket umroh dong", &Contact::new("6281", t0()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.template.id, 10);
        assert_eq!(found.confidence, Some(1.0));
    }

    #[tokio::test]
    async fn master_switch_off_yields_no_match() {
        let f = fixture();
        add_template(&f.repo, 1).await;
        f.repo
            .upsert_rule(AutomationRule::keyword(1, "promo", 50, &["halo"], 1, t0()))
            .await;
        assert!(f.matcher.master_switch().set(false));

        let found = f
            .matcher
            .match_message("halo", &Contact::new("6281", t0()))
            .await
            .unwrap();
        assert!(found.is_none());
        assert!(f.repo.trigger_logs().await.is_empty());
    }

    #[tokio::test]
    async fn store_errors_propagate() {
        let f = fixture();
        f.repo.set_unavailable(true);
        let result = f.matcher.match_message("halo", &Contact::new("6281", t0())).await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
    }
}
