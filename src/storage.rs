use anyhow::{Context, Result};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open (creating if missing) a WAL-mode sqlite database at `path`.
pub async fn open_pool(path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("create state directory {}", parent.display()))?;
    }

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(BUSY_TIMEOUT);

    SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await
        .with_context(|| format!("open sqlite database {}", path.display()))
}

/// Single-connection in-memory database. The connection is pinned so the
/// data lives as long as the pool.
pub async fn open_memory_pool() -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
    SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
        .context("open in-memory sqlite database")
}

/// Check or stamp the schema version recorded under `key`.
///
/// A database stamped with another version is refused; there is no
/// in-place migration.
pub async fn ensure_schema_version(pool: &SqlitePool, key: &str, version: u32) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS warden_schema_meta (
             key   TEXT PRIMARY KEY,
             value TEXT NOT NULL
         )",
    )
    .execute(pool)
    .await
    .context("create warden_schema_meta table")?;

    let stored: Option<(String,)> =
        sqlx::query_as("SELECT value FROM warden_schema_meta WHERE key = $1")
            .bind(key)
            .fetch_optional(pool)
            .await
            .with_context(|| format!("load schema version {key}"))?;

    if let Some((value,)) = stored {
        let parsed = value
            .parse::<u32>()
            .with_context(|| format!("invalid schema version value for {key}: {value}"))?;
        anyhow::ensure!(
            parsed == version,
            "incompatible {key}: stored={parsed}, expected={version}. remove the database and restart."
        );
        return Ok(());
    }

    sqlx::query("INSERT INTO warden_schema_meta (key, value) VALUES ($1, $2)")
        .bind(key)
        .bind(version.to_string())
        .execute(pool)
        .await
        .with_context(|| format!("persist schema version {key}"))?;
    Ok(())
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
