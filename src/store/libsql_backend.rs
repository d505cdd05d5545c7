//! libSQL backend: async `Repository` implementation.
//!
//! Supports local file and in-memory databases. The same connection is
//! shared with `SqlCounterStore`, so one database file holds both the
//! relational state and the shared rate counters.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dispatch::model::{OutboundQueueItem, QueueStatus, TemplateRef};
use crate::error::StoreError;
use crate::model::{
    AutomationRule, Contact, ContactPatch, RuleMatcherKind, RuleTriggerLog, Template, Tier,
    TriggerOutcome,
};
use crate::store::migrations;
use crate::store::traits::Repository;

/// libSQL database backend.
///
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlRepository {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlRepository {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Unavailable(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Unavailable(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                StoreError::Unavailable(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, StoreError> {
        let conn = db
            .connect()
            .map_err(|e| StoreError::Unavailable(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(&backend.conn).await?;
        Ok(backend)
    }

    /// Shared connection, handed to `SqlCounterStore`.
    pub fn connection(&self) -> Connection {
        self.conn.clone()
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    // ── Operator-side writes ────────────────────────────────────────

    /// Insert or replace an automation rule.
    pub async fn upsert_rule(&self, rule: &AutomationRule) -> Result<(), StoreError> {
        let (matcher_type, keywords, template_id, category, min_confidence) = match &rule.matcher {
            RuleMatcherKind::Keyword {
                keywords,
                template_id,
            } => (
                "keyword",
                serde_json::to_string(keywords)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?,
                libsql::Value::Integer(*template_id),
                libsql::Value::Null,
                libsql::Value::Null,
            ),
            RuleMatcherKind::TemplateCategory {
                category,
                min_confidence,
            } => (
                "template_category",
                "[]".to_string(),
                libsql::Value::Null,
                libsql::Value::Text(category.clone()),
                min_confidence
                    .map(|c| libsql::Value::Real(c as f64))
                    .unwrap_or(libsql::Value::Null),
            ),
        };

        self.conn()
            .execute(
                "INSERT OR REPLACE INTO automation_rules (id, name, priority, is_active, matcher_type, keywords, template_id, category, min_confidence, cooldown_minutes, max_triggers_per_contact, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    rule.id,
                    rule.name.clone(),
                    rule.priority as i64,
                    rule.is_active as i64,
                    matcher_type,
                    keywords,
                    template_id,
                    category,
                    min_confidence,
                    rule.cooldown_minutes as i64,
                    rule.max_triggers_per_contact as i64,
                    fmt_datetime(rule.created_at),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("upsert_rule: {e}")))?;
        Ok(())
    }

    /// Insert or replace a template.
    pub async fn upsert_template(&self, template: &Template) -> Result<(), StoreError> {
        let keywords = serde_json::to_string(&template.keywords)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO templates (id, name, category, body, keywords, priority, is_active, is_approved, language) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    template.id,
                    template.name.clone(),
                    template.category.clone(),
                    template.body.clone(),
                    keywords,
                    template.priority as i64,
                    template.is_active as i64,
                    template.is_approved as i64,
                    template.language.clone(),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("upsert_template: {e}")))?;
        Ok(())
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format: RFC 3339, UTC, millisecond precision.
pub(crate) fn fmt_datetime(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
pub(crate) fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn opt_datetime(row: &libsql::Row, idx: i32) -> Option<DateTime<Utc>> {
    row.get::<String>(idx).ok().map(|s| parse_datetime(&s))
}

fn opt_datetime_value(dt: Option<DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(dt) => libsql::Value::Text(fmt_datetime(dt)),
        None => libsql::Value::Null,
    }
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_int(v: Option<i64>) -> libsql::Value {
    match v {
        Some(v) => libsql::Value::Integer(v),
        None => libsql::Value::Null,
    }
}

fn parse_keywords(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_else(|e| {
        warn!(error = %e, "Malformed keyword list, treating as empty");
        Vec::new()
    })
}

const CONTACT_COLUMNS: &str = "id, name, opt_in, opted_in_at, opted_out_at, tier, last_customer_message_at, window_expires_at, created_at";

fn row_to_contact(row: &libsql::Row) -> Result<Contact, libsql::Error> {
    Ok(Contact {
        id: row.get(0)?,
        name: row.get::<String>(1).ok(),
        opt_in: row.get::<i64>(2)? != 0,
        opted_in_at: opt_datetime(row, 3),
        opted_out_at: opt_datetime(row, 4),
        tier: Tier::from_name(&row.get::<String>(5).unwrap_or_default()),
        last_customer_message_at: opt_datetime(row, 6),
        window_expires_at: opt_datetime(row, 7),
        created_at: parse_datetime(&row.get::<String>(8)?),
    })
}

const RULE_COLUMNS: &str = "id, name, priority, is_active, matcher_type, keywords, template_id, category, min_confidence, cooldown_minutes, max_triggers_per_contact, created_at";

fn row_to_rule(row: &libsql::Row) -> Result<AutomationRule, libsql::Error> {
    let matcher_type: String = row.get(4)?;
    let matcher = match matcher_type.as_str() {
        "template_category" => RuleMatcherKind::TemplateCategory {
            category: row.get::<String>(7).unwrap_or_default(),
            min_confidence: row.get::<f64>(8).ok().map(|c| c as f32),
        },
        _ => RuleMatcherKind::Keyword {
            keywords: parse_keywords(&row.get::<String>(5).unwrap_or_default()),
            template_id: row.get::<i64>(6).unwrap_or(0),
        },
    };

    Ok(AutomationRule {
        id: row.get(0)?,
        name: row.get(1)?,
        priority: row.get::<i64>(2)? as i32,
        is_active: row.get::<i64>(3)? != 0,
        matcher,
        cooldown_minutes: row.get::<i64>(9).unwrap_or(0).max(0) as u32,
        max_triggers_per_contact: row.get::<i64>(10).unwrap_or(0).max(0) as u32,
        created_at: parse_datetime(&row.get::<String>(11)?),
    })
}

const TEMPLATE_COLUMNS: &str = "id, name, category, body, keywords, priority, is_active, is_approved, language";

fn row_to_template(row: &libsql::Row) -> Result<Template, libsql::Error> {
    Ok(Template {
        id: row.get(0)?,
        name: row.get(1)?,
        category: row.get(2)?,
        body: row.get(3)?,
        keywords: parse_keywords(&row.get::<String>(4).unwrap_or_default()),
        priority: row.get::<i64>(5).unwrap_or(0) as i32,
        is_active: row.get::<i64>(6)? != 0,
        is_approved: row.get::<i64>(7).unwrap_or(0) != 0,
        language: row.get::<String>(8).unwrap_or_else(|_| "id".into()),
    })
}

fn outcome_to_columns(outcome: &TriggerOutcome) -> (&'static str, Option<&str>) {
    match outcome {
        TriggerOutcome::Matched => ("matched", None),
        TriggerOutcome::Skipped(detail) => ("skipped", Some(detail.as_str())),
        TriggerOutcome::NoMatch => ("no_match", None),
    }
}

fn columns_to_outcome(outcome: &str, detail: Option<String>) -> TriggerOutcome {
    match outcome {
        "matched" => TriggerOutcome::Matched,
        "skipped" => TriggerOutcome::Skipped(detail.unwrap_or_default()),
        _ => TriggerOutcome::NoMatch,
    }
}

const QUEUE_COLUMNS: &str = "id, contact_id, body, template_id, template_name, template_language, rule_id, requires_template, status, attempts, max_attempts, queued_at, last_attempt_at, error, gateway_message_id";

fn row_to_queue_item(row: &libsql::Row) -> Result<OutboundQueueItem, libsql::Error> {
    let id_str: String = row.get(0)?;
    let template = match (row.get::<i64>(3).ok(), row.get::<String>(4).ok()) {
        (Some(id), Some(name)) => Some(TemplateRef {
            id,
            name,
            language: row.get::<String>(5).unwrap_or_else(|_| "id".into()),
        }),
        _ => None,
    };
    let status_str: String = row.get(8)?;

    Ok(OutboundQueueItem {
        id: Uuid::parse_str(&id_str).unwrap_or_default(),
        contact_id: row.get(1)?,
        body: row.get(2)?,
        template,
        rule_id: row.get::<i64>(6).ok(),
        requires_template: row.get::<i64>(7).unwrap_or(0) != 0,
        status: QueueStatus::from_name(&status_str).unwrap_or(QueueStatus::Failed),
        attempts: row.get::<i64>(9).unwrap_or(0).max(0) as u32,
        max_attempts: row.get::<i64>(10).unwrap_or(1).max(1) as u32,
        queued_at: parse_datetime(&row.get::<String>(11)?),
        last_attempt_at: opt_datetime(row, 12),
        error: row.get::<String>(13).ok(),
        gateway_message_id: row.get::<String>(14).ok(),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Repository for LibSqlRepository {
    async fn get_contact(&self, id: &str) -> Result<Option<Contact>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get_contact: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_contact(&row)
                .map(Some)
                .map_err(|e| StoreError::Serialization(format!("contact row: {e}"))),
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("get_contact: {e}"))),
        }
    }

    async fn insert_contact(&self, contact: &Contact) -> Result<(), StoreError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT OR IGNORE INTO contacts ({CONTACT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
                ),
                params![
                    contact.id.clone(),
                    opt_text(contact.name.as_deref()),
                    contact.opt_in as i64,
                    opt_datetime_value(contact.opted_in_at),
                    opt_datetime_value(contact.opted_out_at),
                    contact.tier.as_str(),
                    opt_datetime_value(contact.last_customer_message_at),
                    opt_datetime_value(contact.window_expires_at),
                    fmt_datetime(contact.created_at),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("insert_contact: {e}")))?;
        debug!(contact = %contact.id, "Contact inserted");
        Ok(())
    }

    async fn update_contact(&self, id: &str, patch: &ContactPatch) -> Result<Contact, StoreError> {
        let mut contact = self.get_contact(id).await?.ok_or_else(|| StoreError::NotFound {
            entity: "contact".into(),
            id: id.into(),
        })?;
        contact.apply(patch);

        self.conn()
            .execute(
                "UPDATE contacts SET opt_in = ?2, opted_in_at = ?3, opted_out_at = ?4, tier = ?5, last_customer_message_at = ?6, window_expires_at = ?7 WHERE id = ?1",
                params![
                    id,
                    contact.opt_in as i64,
                    opt_datetime_value(contact.opted_in_at),
                    opt_datetime_value(contact.opted_out_at),
                    contact.tier.as_str(),
                    opt_datetime_value(contact.last_customer_message_at),
                    opt_datetime_value(contact.window_expires_at),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("update_contact: {e}")))?;
        Ok(contact)
    }

    async fn list_active_rules(&self) -> Result<Vec<AutomationRule>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {RULE_COLUMNS} FROM automation_rules WHERE is_active = 1 ORDER BY created_at ASC, id ASC"
                ),
                (),
            )
            .await
            .map_err(|e| StoreError::Query(format!("list_active_rules: {e}")))?;

        let mut rules = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_rule(&row) {
                Ok(rule) => rules.push(rule),
                Err(e) => warn!("Skipping rule row: {e}"),
            }
        }
        Ok(rules)
    }

    async fn get_template(&self, id: i64) -> Result<Option<Template>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TEMPLATE_COLUMNS} FROM templates WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get_template: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_template(&row)
                .map(Some)
                .map_err(|e| StoreError::Serialization(format!("template row: {e}"))),
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("get_template: {e}"))),
        }
    }

    async fn list_templates_by_category(&self, category: &str) -> Result<Vec<Template>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TEMPLATE_COLUMNS} FROM templates WHERE category = ?1 AND is_active = 1 ORDER BY id ASC"
                ),
                params![category],
            )
            .await
            .map_err(|e| StoreError::Query(format!("list_templates_by_category: {e}")))?;

        let mut templates = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_template(&row) {
                Ok(t) => templates.push(t),
                Err(e) => warn!("Skipping template row: {e}"),
            }
        }
        Ok(templates)
    }

    async fn log_rule_trigger(&self, entry: &RuleTriggerLog) -> Result<(), StoreError> {
        let (outcome, detail) = outcome_to_columns(&entry.outcome);
        self.conn()
            .execute(
                "INSERT INTO rule_trigger_logs (rule_id, contact_id, timestamp, outcome, detail) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    opt_int(entry.rule_id),
                    entry.contact_id.clone(),
                    fmt_datetime(entry.timestamp),
                    outcome,
                    opt_text(detail),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("log_rule_trigger: {e}")))?;
        Ok(())
    }

    async fn last_trigger_at(
        &self,
        rule_id: i64,
        contact_id: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT MAX(timestamp) FROM rule_trigger_logs WHERE rule_id = ?1 AND contact_id = ?2 AND outcome = 'matched'",
                params![rule_id, contact_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("last_trigger_at: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(opt_datetime(&row, 0)),
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("last_trigger_at: {e}"))),
        }
    }

    async fn count_triggers(&self, rule_id: i64, contact_id: &str) -> Result<u32, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM rule_trigger_logs WHERE rule_id = ?1 AND contact_id = ?2 AND outcome = 'matched'",
                params![rule_id, contact_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("count_triggers: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).unwrap_or(0).max(0) as u32),
            Ok(None) => Ok(0),
            Err(e) => Err(StoreError::Query(format!("count_triggers: {e}"))),
        }
    }

    async fn list_trigger_logs(&self, contact_id: &str) -> Result<Vec<RuleTriggerLog>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT rule_id, contact_id, timestamp, outcome, detail FROM rule_trigger_logs WHERE contact_id = ?1 ORDER BY id ASC",
                params![contact_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("list_trigger_logs: {e}")))?;

        let mut logs = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let outcome: String = row.get::<String>(3).unwrap_or_default();
            logs.push(RuleTriggerLog {
                rule_id: row.get::<i64>(0).ok(),
                contact_id: row.get::<String>(1).unwrap_or_default(),
                timestamp: parse_datetime(&row.get::<String>(2).unwrap_or_default()),
                outcome: columns_to_outcome(&outcome, row.get::<String>(4).ok()),
            });
        }
        Ok(logs)
    }

    async fn save_queue_item(&self, item: &OutboundQueueItem) -> Result<(), StoreError> {
        let (template_id, template_name, template_language) = match &item.template {
            Some(t) => (
                libsql::Value::Integer(t.id),
                libsql::Value::Text(t.name.clone()),
                libsql::Value::Text(t.language.clone()),
            ),
            None => (libsql::Value::Null, libsql::Value::Null, libsql::Value::Null),
        };

        self.conn()
            .execute(
                &format!(
                    "INSERT OR REPLACE INTO outbound_queue ({QUEUE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
                ),
                params![
                    item.id.to_string(),
                    item.contact_id.clone(),
                    item.body.clone(),
                    template_id,
                    template_name,
                    template_language,
                    opt_int(item.rule_id),
                    item.requires_template as i64,
                    item.status.as_str(),
                    item.attempts as i64,
                    item.max_attempts as i64,
                    fmt_datetime(item.queued_at),
                    opt_datetime_value(item.last_attempt_at),
                    opt_text(item.error.as_deref()),
                    opt_text(item.gateway_message_id.as_deref()),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("save_queue_item: {e}")))?;
        Ok(())
    }

    async fn list_unfinished_queue_items(&self) -> Result<Vec<OutboundQueueItem>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {QUEUE_COLUMNS} FROM outbound_queue WHERE status IN ('queued', 'sending') OR (status = 'failed' AND attempts < max_attempts) ORDER BY queued_at ASC"
                ),
                (),
            )
            .await
            .map_err(|e| StoreError::Query(format!("list_unfinished_queue_items: {e}")))?;

        let mut items = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_queue_item(&row) {
                Ok(item) => items.push(item),
                Err(e) => warn!("Skipping queue row: {e}"),
            }
        }
        Ok(items)
    }
}
