//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::StoreError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS contacts (
                id TEXT PRIMARY KEY,
                name TEXT,
                opt_in INTEGER NOT NULL DEFAULT 0,
                opted_in_at TEXT,
                opted_out_at TEXT,
                tier TEXT NOT NULL DEFAULT 'basic',
                last_customer_message_at TEXT,
                window_expires_at TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS templates (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                category TEXT NOT NULL,
                body TEXT NOT NULL,
                keywords TEXT NOT NULL DEFAULT '[]',
                priority INTEGER NOT NULL DEFAULT 0,
                is_active INTEGER NOT NULL DEFAULT 1,
                is_approved INTEGER NOT NULL DEFAULT 0,
                language TEXT NOT NULL DEFAULT 'id'
            );
            CREATE INDEX IF NOT EXISTS idx_templates_category ON templates(category);

            CREATE TABLE IF NOT EXISTS automation_rules (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                is_active INTEGER NOT NULL DEFAULT 1,
                matcher_type TEXT NOT NULL,
                keywords TEXT NOT NULL DEFAULT '[]',
                template_id INTEGER,
                category TEXT,
                min_confidence REAL,
                cooldown_minutes INTEGER NOT NULL DEFAULT 0,
                max_triggers_per_contact INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_rules_active ON automation_rules(is_active);

            CREATE TABLE IF NOT EXISTS rule_trigger_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                rule_id INTEGER,
                contact_id TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                outcome TEXT NOT NULL,
                detail TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_trigger_logs_rule_contact
                ON rule_trigger_logs(rule_id, contact_id, outcome);
            CREATE INDEX IF NOT EXISTS idx_trigger_logs_contact ON rule_trigger_logs(contact_id);

            CREATE TABLE IF NOT EXISTS outbound_queue (
                id TEXT PRIMARY KEY,
                contact_id TEXT NOT NULL,
                body TEXT NOT NULL,
                template_id INTEGER,
                template_name TEXT,
                template_language TEXT,
                rule_id INTEGER,
                requires_template INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'queued',
                attempts INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL DEFAULT 3,
                queued_at TEXT NOT NULL,
                last_attempt_at TEXT,
                error TEXT,
                gateway_message_id TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_outbound_status ON outbound_queue(status);
            CREATE INDEX IF NOT EXISTS idx_outbound_contact ON outbound_queue(contact_id);
        "#,
    },
    Migration {
        version: 2,
        name: "rate_counters",
        sql: r#"
            CREATE TABLE IF NOT EXISTS rate_counters (
                key TEXT PRIMARY KEY,
                count INTEGER NOT NULL DEFAULT 0,
                expires_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_rate_counters_expires ON rate_counters(expires_at);
        "#,
    },
];

/// Run all pending migrations against the given connection.
///
/// Creates the `_migrations` table if it doesn't exist.
pub async fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| StoreError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                StoreError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    tracing::debug!(
        version = get_current_version(conn).await?,
        "Database migrations complete"
    );

    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, StoreError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| StoreError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| StoreError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => row
            .get::<i64>(0)
            .map_err(|e| StoreError::Migration(format!("Failed to parse migration version: {e}"))),
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| StoreError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}
