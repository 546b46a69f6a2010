//! Ledger trait and implementations.

use crate::error::LedgerResult;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::RwLock;
use std::time::Duration;

/// Identifies one object across runs.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LedgerKey {
    pub bucket: String,
    pub key: String,
}

impl LedgerKey {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for LedgerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

/// Durable set of objects whose remediation already succeeded.
///
/// Implementations synchronize internally; callers share one instance
/// across every worker.
#[async_trait]
pub trait IdempotencyLedger: Send + Sync + 'static {
    async fn contains(&self, key: &LedgerKey) -> LedgerResult<bool>;

    /// Record `key`. Adding a key twice is not an error.
    async fn add(&self, key: &LedgerKey) -> LedgerResult<()>;

    /// Static identifier for the ledger type, used in logs.
    fn backend_name(&self) -> &'static str;
}

/// SQLite-backed ledger that survives restarts.
pub struct SqliteLedger {
    pool: Pool<Sqlite>,
}

impl SqliteLedger {
    /// Open (creating if needed) the ledger database at `path`.
    pub async fn new(path: impl AsRef<Path>) -> LedgerResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            // One writer at a time; object workers funnel through this connection.
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let ledger = Self { pool };
        ledger.migrate().await?;
        tracing::debug!(path = %path.display(), "Opened idempotency ledger");
        Ok(ledger)
    }

    async fn migrate(&self) -> LedgerResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS done_objects (
                bucket TEXT NOT NULL,
                object_key TEXT NOT NULL,
                done_at INTEGER NOT NULL,
                PRIMARY KEY (bucket, object_key)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Number of recorded objects.
    pub async fn len(&self) -> LedgerResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM done_objects")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    pub async fn is_empty(&self) -> LedgerResult<bool> {
        Ok(self.len().await? == 0)
    }
}

#[async_trait]
impl IdempotencyLedger for SqliteLedger {
    async fn contains(&self, key: &LedgerKey) -> LedgerResult<bool> {
        let found: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM done_objects WHERE bucket = ? AND object_key = ?)",
        )
        .bind(&key.bucket)
        .bind(&key.key)
        .fetch_one(&self.pool)
        .await?;
        Ok(found)
    }

    async fn add(&self, key: &LedgerKey) -> LedgerResult<()> {
        let now = time::OffsetDateTime::now_utc().unix_timestamp();
        sqlx::query(
            "INSERT INTO done_objects (bucket, object_key, done_at) VALUES (?, ?, ?) \
             ON CONFLICT (bucket, object_key) DO NOTHING",
        )
        .bind(&key.bucket)
        .bind(&key.key)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "sqlite"
    }
}

/// Process-lifetime ledger.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    keys: RwLock<HashSet<LedgerKey>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.keys
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl IdempotencyLedger for MemoryLedger {
    async fn contains(&self, key: &LedgerKey) -> LedgerResult<bool> {
        Ok(self
            .keys
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(key))
    }

    async fn add(&self, key: &LedgerKey) -> LedgerResult<()> {
        self.keys
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key.clone());
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_ledger_contains_after_add() {
        let ledger = MemoryLedger::new();
        let key = LedgerKey::new("bucket", "a/b");
        assert!(!ledger.contains(&key).await.unwrap());
        ledger.add(&key).await.unwrap();
        ledger.add(&key).await.unwrap();
        assert!(ledger.contains(&key).await.unwrap());
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_key_columns_do_not_collide() {
        // "a-b" + "c" and "a" + "b-c" concatenate to the same string.
        let left = LedgerKey::new("a-b", "c");
        let right = LedgerKey::new("a", "b-c");
        assert_ne!(left, right);
    }
}
