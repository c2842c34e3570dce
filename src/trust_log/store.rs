use sqlx::sqlite::SqlitePool;
use std::path::Path;
use tokio::sync::Mutex;

use super::entry::{ChainReport, GENESIS_HASH, TrustLogEntry, verify_chain};
use super::payload::{TrustPayload, TrustRecord};
use super::TrustLogKind;
use crate::error::TrustLogError;

const TRUST_LOG_SCHEMA_VERSION: u32 = 1;

/// Append-only hash-chained log backed by its own sqlite database.
///
/// The step number is the primary key, so the table is an arena indexed by
/// position; rows are only ever inserted.
pub struct TrustLog {
    pool: SqlitePool,
    kind: TrustLogKind,
    append_lock: Mutex<()>,
}

impl TrustLog {
    pub async fn open(path: &Path, kind: TrustLogKind) -> anyhow::Result<Self> {
        let pool = crate::storage::open_pool(path).await?;
        Ok(Self::with_pool(pool, kind, &path.display().to_string()).await?)
    }

    pub async fn in_memory(kind: TrustLogKind) -> anyhow::Result<Self> {
        let pool = crate::storage::open_memory_pool().await?;
        Ok(Self::with_pool(pool, kind, ":memory:").await?)
    }

    pub async fn with_pool(
        pool: SqlitePool,
        kind: TrustLogKind,
        label: &str,
    ) -> Result<Self, TrustLogError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS trust_log_meta (
                 key   TEXT PRIMARY KEY,
                 value TEXT NOT NULL
             )",
        )
        .execute(&pool)
        .await?;

        let stored_version = meta_value(&pool, "schema_version").await?;
        match stored_version {
            Some(value) if value != TRUST_LOG_SCHEMA_VERSION.to_string() => {
                return Err(TrustLogError::SchemaVersion {
                    stored: value,
                    expected: TRUST_LOG_SCHEMA_VERSION,
                });
            }
            Some(_) => {}
            None => {
                set_meta(&pool, "schema_version", &TRUST_LOG_SCHEMA_VERSION.to_string()).await?;
            }
        }

        match meta_value(&pool, "log_kind").await? {
            Some(found) if found != kind.to_string() => {
                return Err(TrustLogError::KindMismatch {
                    path: label.to_string(),
                    expected: kind.to_string(),
                    found,
                });
            }
            Some(_) => {}
            None => set_meta(&pool, "log_kind", &kind.to_string()).await?,
        }

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS trust_log (
                 step         INTEGER PRIMARY KEY,
                 content      TEXT NOT NULL,
                 content_hash TEXT NOT NULL,
                 prev_hash    TEXT NOT NULL,
                 hash         TEXT NOT NULL
             )",
        )
        .execute(&pool)
        .await?;

        Ok(Self {
            pool,
            kind,
            append_lock: Mutex::new(()),
        })
    }

    pub fn kind(&self) -> TrustLogKind {
        self.kind
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Serialize `payload` with a timestamp and chain it onto the head.
    pub async fn append(&self, payload: TrustPayload) -> Result<TrustLogEntry, TrustLogError> {
        let content = serde_json::to_string(&TrustRecord::now(payload))?;
        self.append_content(content).await
    }

    async fn append_content(&self, content: String) -> Result<TrustLogEntry, TrustLogError> {
        let _guard = self.append_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let head: Option<(i64, String)> =
            sqlx::query_as("SELECT step, hash FROM trust_log ORDER BY step DESC LIMIT 1")
                .fetch_optional(&mut *tx)
                .await?;
        let (prev_step, prev_hash) = match head {
            Some((step, hash)) => {
                let step = u64::try_from(step).map_err(|_| TrustLogError::MalformedHead { step })?;
                (step, hash)
            }
            None => (0, GENESIS_HASH.to_string()),
        };

        let entry = TrustLogEntry::seal(prev_step + 1, content, &prev_hash);
        sqlx::query(
            "INSERT INTO trust_log (step, content, content_hash, prev_hash, hash)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(i64::try_from(entry.step).map_err(|_| TrustLogError::MalformedHead {
            step: i64::MAX,
        })?)
        .bind(&entry.content)
        .bind(&entry.content_hash)
        .bind(&entry.prev_hash)
        .bind(&entry.hash)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        tracing::trace!(log = %self.kind, step = entry.step, "trust_log.append");
        Ok(entry)
    }

    /// All entries in step order.
    pub async fn entries(&self) -> Result<Vec<TrustLogEntry>, TrustLogError> {
        let rows: Vec<(i64, String, String, String, String)> = sqlx::query_as(
            "SELECT step, content, content_hash, prev_hash, hash FROM trust_log ORDER BY step ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_entry).collect()
    }

    /// The last `limit` entries, still in step order.
    pub async fn tail(&self, limit: usize) -> Result<Vec<TrustLogEntry>, TrustLogError> {
        let rows: Vec<(i64, String, String, String, String)> = sqlx::query_as(
            "SELECT step, content, content_hash, prev_hash, hash FROM (
                 SELECT * FROM trust_log ORDER BY step DESC LIMIT $1
             ) ORDER BY step ASC",
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_entry).collect()
    }

    pub async fn len(&self) -> Result<u64, TrustLogError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM trust_log")
            .fetch_one(&self.pool)
            .await?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    pub async fn verify(&self) -> Result<ChainReport, TrustLogError> {
        let entries = self.entries().await?;
        Ok(verify_chain(&entries))
    }
}

fn row_to_entry(
    (step, content, content_hash, prev_hash, hash): (i64, String, String, String, String),
) -> Result<TrustLogEntry, TrustLogError> {
    Ok(TrustLogEntry {
        step: u64::try_from(step).map_err(|_| TrustLogError::MalformedHead { step })?,
        content,
        content_hash,
        prev_hash,
        hash,
    })
}

async fn meta_value(pool: &SqlitePool, key: &str) -> Result<Option<String>, TrustLogError> {
    let row: Option<(String,)> = sqlx::query_as("SELECT value FROM trust_log_meta WHERE key = $1")
        .bind(key)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|(value,)| value))
}

async fn set_meta(pool: &SqlitePool, key: &str, value: &str) -> Result<(), TrustLogError> {
    sqlx::query("INSERT INTO trust_log_meta (key, value) VALUES ($1, $2)")
        .bind(key)
        .bind(value)
        .execute(pool)
        .await?;
    Ok(())
}
