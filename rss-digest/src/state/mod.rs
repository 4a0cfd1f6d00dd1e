//! Dedup Store: which articles were already reported, and the HTTP validators
//! of every feed.
//!
//! Two independent record kinds share the feed URL as key prefix. Seen records
//! are only ever appended; cache headers are overwritten on every run.

mod memory;
mod sqlite;

pub use memory::MemoryDedupStore;
pub use sqlite::SqliteDedupStore;

use crate::identity::ArticleIdentity;
use crate::types::{FeedCacheHeader, Result, SeenRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[async_trait]
pub trait DedupStore: Send + Sync {
    async fn has_seen(&self, feed_url: &str, identity: &ArticleIdentity) -> Result<bool>;

    async fn seen_record(
        &self,
        feed_url: &str,
        identity: &ArticleIdentity,
    ) -> Result<Option<SeenRecord>>;

    /// Record an article as reported. A key that is already present keeps its
    /// original `first_seen_at`; the call is then a no-op.
    async fn mark_seen(
        &self,
        feed_url: &str,
        identity: &ArticleIdentity,
        seen_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Most recent `first_seen_at` among the feed's seen records.
    async fn last_seen_at(&self, feed_url: &str) -> Result<Option<DateTime<Utc>>>;

    async fn get_cache_header(&self, feed_url: &str) -> Result<Option<FeedCacheHeader>>;

    /// Replace the feed's validators and stamp `last_checked_at` with now.
    async fn set_cache_header(
        &self,
        feed_url: &str,
        etag: Option<&str>,
        last_modified: Option<&str>,
    ) -> Result<()>;

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
