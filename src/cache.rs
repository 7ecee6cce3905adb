//! Local cache of the last observed property views.
//!
//! A store writes the view of a property after every successful read and
//! reads it back once at startup, so it can serve data while the
//! coordination service is unreachable. Entries are keyed by property name
//! and carry the wall-clock time the view was observed; an entry is never
//! replaced by an older observation. An absent property is cached as a
//! tombstone (`value = None`).
//!
//! Backed by SQLite in WAL mode, one database file per store root.

use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::{debug, info};

use crate::error::Result;

/// A cached property view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedView {
    pub name: String,
    /// Serialized view, `None` if the property did not exist.
    pub value: Option<Vec<u8>>,
    pub observed_at: SystemTime,
}

/// Durable mirror of property views.
#[async_trait]
pub trait PropertyCache: Send + Sync {
    /// Store a view observed at `observed_at`. Returns false if a newer
    /// observation is already cached.
    async fn put_at(&self, name: &str, value: Option<&[u8]>, observed_at: SystemTime) -> Result<bool>;

    /// Store a view observed now.
    async fn put(&self, name: &str, value: Option<&[u8]>) -> Result<bool> {
        self.put_at(name, value, SystemTime::now()).await
    }

    /// Last cached view of a property.
    async fn get(&self, name: &str) -> Result<Option<CachedView>>;
}

/// SQLite implementation of [`PropertyCache`].
#[derive(Debug, Clone)]
pub struct SqliteCache {
    pool: SqlitePool,
}

impl SqliteCache {
    /// Open or create a cache database at the given path.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "opening property cache");

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await?;

        let cache = Self { pool };
        cache.init_schema().await?;
        Ok(cache)
    }

    /// Create an in-memory cache (for testing).
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let cache = Self { pool };
        cache.init_schema().await?;
        Ok(cache)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS property_cache (
                name TEXT PRIMARY KEY NOT NULL,
                value BLOB,
                observed_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        debug!("property cache schema initialized");
        Ok(())
    }

    fn to_millis(time: SystemTime) -> i64 {
        time.duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }

    fn from_millis(millis: i64) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(millis.max(0) as u64)
    }

    fn row_to_view((name, value, observed_at): (String, Option<Vec<u8>>, i64)) -> CachedView {
        CachedView {
            name,
            value,
            observed_at: Self::from_millis(observed_at),
        }
    }
}

#[async_trait]
impl PropertyCache for SqliteCache {
    async fn put_at(&self, name: &str, value: Option<&[u8]>, observed_at: SystemTime) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO property_cache (name, value, observed_at)
            VALUES (?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                value = excluded.value,
                observed_at = excluded.observed_at
            WHERE excluded.observed_at >= property_cache.observed_at
            "#,
        )
        .bind(name)
        .bind(value)
        .bind(Self::to_millis(observed_at))
        .execute(&self.pool)
        .await?;

        let stored = result.rows_affected() > 0;
        if !stored {
            debug!(name = %name, "ignoring cache write older than cached view");
        }
        Ok(stored)
    }

    async fn get(&self, name: &str) -> Result<Option<CachedView>> {
        let row: Option<(String, Option<Vec<u8>>, i64)> = sqlx::query_as(
            "SELECT name, value, observed_at FROM property_cache WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Self::row_to_view))
    }
}
