use super::DedupStore;
use crate::identity::ArticleIdentity;
use crate::types::{DigestError, FeedCacheHeader, Result, SeenRecord};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::Row;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS seen (
        feed_url TEXT NOT NULL,
        identity TEXT NOT NULL,
        first_seen_at TEXT NOT NULL,
        PRIMARY KEY (feed_url, identity)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS feeds (
        feed_url TEXT PRIMARY KEY,
        etag TEXT,
        last_modified TEXT,
        last_checked_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_seen_feed_time ON seen (feed_url, first_seen_at)",
];

/// SQLite-backed store. Every write is a committed transaction in a
/// WAL-journaled database with `synchronous=FULL`, so it is on disk when the
/// call returns and survives an unclean shutdown.
pub struct SqliteDedupStore {
    pool: SqlitePool,
    db_path: PathBuf,
}

impl SqliteDedupStore {
    /// Open (creating if needed) the store at `db_path` and verify its integrity.
    pub async fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();

        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(Duration::from_secs(5));

        // One connection: the store belongs to a single sequential run.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let check: String = sqlx::query_scalar("PRAGMA quick_check")
            .fetch_one(&pool)
            .await?;
        if check != "ok" {
            pool.close().await;
            return Err(DigestError::StoreIntegrity(format!(
                "{} failed integrity check: {}",
                db_path.display(),
                check
            )));
        }

        for migration in MIGRATIONS {
            sqlx::query(migration).execute(&pool).await?;
        }

        info!(path = %db_path.display(), "Opened dedup store");
        Ok(Self { pool, db_path })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DigestError::StoreIntegrity(format!("bad timestamp {raw:?}: {e}")))
}

#[async_trait]
impl DedupStore for SqliteDedupStore {
    async fn has_seen(&self, feed_url: &str, identity: &ArticleIdentity) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM seen WHERE feed_url = ? AND identity = ? LIMIT 1")
            .bind(feed_url)
            .bind(identity.as_str())
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.is_some())
    }

    async fn seen_record(
        &self,
        feed_url: &str,
        identity: &ArticleIdentity,
    ) -> Result<Option<SeenRecord>> {
        let row = sqlx::query(
            "SELECT first_seen_at FROM seen WHERE feed_url = ? AND identity = ?",
        )
        .bind(feed_url)
        .bind(identity.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let first_seen_at: String = row.try_get("first_seen_at")?;
                Ok(Some(SeenRecord {
                    feed_url: feed_url.to_string(),
                    identity: identity.clone(),
                    first_seen_at: parse_timestamp(&first_seen_at)?,
                }))
            }
            None => Ok(None),
        }
    }

    async fn mark_seen(
        &self,
        feed_url: &str,
        identity: &ArticleIdentity,
        seen_at: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO seen (feed_url, identity, first_seen_at) VALUES (?, ?, ?)",
        )
        .bind(feed_url)
        .bind(identity.as_str())
        .bind(format_timestamp(seen_at))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            debug!(feed = feed_url, identity = %identity, "Article already marked seen");
        }
        Ok(())
    }

    async fn last_seen_at(&self, feed_url: &str) -> Result<Option<DateTime<Utc>>> {
        let latest: Option<String> =
            sqlx::query_scalar("SELECT MAX(first_seen_at) FROM seen WHERE feed_url = ?")
                .bind(feed_url)
                .fetch_one(&self.pool)
                .await?;

        latest.as_deref().map(parse_timestamp).transpose()
    }

    async fn get_cache_header(&self, feed_url: &str) -> Result<Option<FeedCacheHeader>> {
        let row = sqlx::query(
            "SELECT etag, last_modified, last_checked_at FROM feeds WHERE feed_url = ?",
        )
        .bind(feed_url)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let last_checked_at: String = row.try_get("last_checked_at")?;
                Ok(Some(FeedCacheHeader {
                    feed_url: feed_url.to_string(),
                    etag: row.try_get("etag")?,
                    last_modified: row.try_get("last_modified")?,
                    last_checked_at: parse_timestamp(&last_checked_at)?,
                }))
            }
            None => Ok(None),
        }
    }

    async fn set_cache_header(
        &self,
        feed_url: &str,
        etag: Option<&str>,
        last_modified: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO feeds (feed_url, etag, last_modified, last_checked_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(feed_url) DO UPDATE SET
                etag = excluded.etag,
                last_modified = excluded.last_modified,
                last_checked_at = excluded.last_checked_at
            "#,
        )
        .bind(feed_url)
        .bind(etag)
        .bind(last_modified)
        .bind(format_timestamp(Utc::now()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        debug!(path = %self.db_path.display(), "Closed dedup store");
        Ok(())
    }
}
