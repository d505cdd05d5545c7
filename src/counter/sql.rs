//! Shared counter store on the libSQL database.
//!
//! Every instance pointed at the same database sees the same counters. The
//! increment is a single upsert, so concurrent increments never lose counts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, params};

use super::{CounterStore, CounterValue};
use crate::error::CounterError;
use crate::store::libsql_backend::{fmt_datetime, parse_datetime};

const STORE_NAME: &str = "sql";

pub struct SqlCounterStore {
    conn: Connection,
}

impl SqlCounterStore {
    /// Use a connection whose database already has the `rate_counters` table.
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    fn unavailable(e: impl std::fmt::Display) -> CounterError {
        CounterError::Unavailable {
            store: STORE_NAME.into(),
            reason: e.to_string(),
        }
    }

    fn malformed(e: impl std::fmt::Display) -> CounterError {
        CounterError::Malformed {
            store: STORE_NAME.into(),
            reason: e.to_string(),
        }
    }
}

fn row_to_value(row: &libsql::Row) -> Result<CounterValue, CounterError> {
    let count: i64 = row.get(0).map_err(SqlCounterStore::malformed)?;
    let expires: String = row.get(1).map_err(SqlCounterStore::malformed)?;
    Ok(CounterValue {
        count: count.max(0) as u64,
        expires_at: parse_datetime(&expires),
    })
}

#[async_trait]
impl CounterStore for SqlCounterStore {
    fn name(&self) -> &str {
        STORE_NAME
    }

    async fn get(&self, key: &str, now: DateTime<Utc>) -> Result<Option<CounterValue>, CounterError> {
        let mut rows = self
            .conn
            .query(
                "SELECT count, expires_at FROM rate_counters WHERE key = ?1 AND expires_at > ?2",
                params![key, fmt_datetime(now)],
            )
            .await
            .map_err(Self::unavailable)?;

        match rows.next().await.map_err(Self::unavailable)? {
            Some(row) => row_to_value(&row).map(Some),
            None => Ok(None),
        }
    }

    async fn increment(
        &self,
        key: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<CounterValue, CounterError> {
        let mut rows = self
            .conn
            .query(
                "INSERT INTO rate_counters (key, count, expires_at) VALUES (?1, 1, ?2)
                 ON CONFLICT(key) DO UPDATE SET
                    count = CASE WHEN rate_counters.expires_at <= ?3 THEN 1 ELSE rate_counters.count + 1 END,
                    expires_at = CASE WHEN rate_counters.expires_at <= ?3 THEN excluded.expires_at ELSE rate_counters.expires_at END
                 RETURNING count, expires_at",
                params![key, fmt_datetime(expires_at), fmt_datetime(now)],
            )
            .await
            .map_err(Self::unavailable)?;

        match rows.next().await.map_err(Self::unavailable)? {
            Some(row) => row_to_value(&row),
            None => Err(Self::malformed("upsert returned no row")),
        }
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, CounterError> {
        let removed = self
            .conn
            .execute(
                "DELETE FROM rate_counters WHERE expires_at <= ?1",
                params![fmt_datetime(now)],
            )
            .await
            .map_err(Self::unavailable)?;
        Ok(removed as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    use crate::store::LibSqlRepository;

    async fn store() -> (LibSqlRepository, SqlCounterStore) {
        let repo = LibSqlRepository::new_memory().await.unwrap();
        let store = SqlCounterStore::new(repo.connection());
        (repo, store)
    }

    #[tokio::test]
    async fn increments_and_expires() {
        let (_repo, store) = store().await;
        let now = Utc::now();
        let expires = now + Duration::seconds(60);

        assert_eq!(store.get("k", now).await.unwrap(), None);
        assert_eq!(store.increment("k", expires, now).await.unwrap().count, 1);
        assert_eq!(store.increment("k", expires, now).await.unwrap().count, 2);
        assert_eq!(store.get("k", now).await.unwrap().unwrap().count, 2);

        let later = expires + Duration::seconds(1);
        assert_eq!(store.get("k", later).await.unwrap(), None);
        let fresh = store
            .increment("k", later + Duration::seconds(60), later)
            .await
            .unwrap();
        assert_eq!(fresh.count, 1);
    }

    #[tokio::test]
    async fn purge_deletes_expired_rows() {
        let (_repo, store) = store().await;
        let now = Utc::now();
        store.increment("a", now + Duration::seconds(1), now).await.unwrap();
        store.increment("b", now + Duration::seconds(300), now).await.unwrap();
        assert_eq!(store.purge_expired(now + Duration::seconds(10)).await.unwrap(), 1);
        assert!(store.get("b", now).await.unwrap().is_some());
    }
}
