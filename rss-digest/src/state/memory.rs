use super::DedupStore;
use crate::identity::ArticleIdentity;
use crate::types::{FeedCacheHeader, Result, SeenRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Non-persistent store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryDedupStore {
    seen: RwLock<HashMap<(String, ArticleIdentity), DateTime<Utc>>>,
    headers: RwLock<HashMap<String, FeedCacheHeader>>,
}

impl MemoryDedupStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seen_count(&self) -> usize {
        self.seen.read().await.len()
    }
}

fn key(feed_url: &str, identity: &ArticleIdentity) -> (String, ArticleIdentity) {
    (feed_url.to_string(), identity.clone())
}

#[async_trait]
impl DedupStore for MemoryDedupStore {
    async fn has_seen(&self, feed_url: &str, identity: &ArticleIdentity) -> Result<bool> {
        Ok(self.seen.read().await.contains_key(&key(feed_url, identity)))
    }

    async fn seen_record(
        &self,
        feed_url: &str,
        identity: &ArticleIdentity,
    ) -> Result<Option<SeenRecord>> {
        let seen = self.seen.read().await;
        Ok(seen.get(&key(feed_url, identity)).map(|first_seen_at| SeenRecord {
            feed_url: feed_url.to_string(),
            identity: identity.clone(),
            first_seen_at: *first_seen_at,
        }))
    }

    async fn mark_seen(
        &self,
        feed_url: &str,
        identity: &ArticleIdentity,
        seen_at: DateTime<Utc>,
    ) -> Result<()> {
        self.seen
            .write()
            .await
            .entry(key(feed_url, identity))
            .or_insert(seen_at);
        Ok(())
    }

    async fn last_seen_at(&self, feed_url: &str) -> Result<Option<DateTime<Utc>>> {
        let seen = self.seen.read().await;
        Ok(seen
            .iter()
            .filter(|((feed, _), _)| feed == feed_url)
            .map(|(_, at)| *at)
            .max())
    }

    async fn get_cache_header(&self, feed_url: &str) -> Result<Option<FeedCacheHeader>> {
        Ok(self.headers.read().await.get(feed_url).cloned())
    }

    async fn set_cache_header(
        &self,
        feed_url: &str,
        etag: Option<&str>,
        last_modified: Option<&str>,
    ) -> Result<()> {
        let header = FeedCacheHeader {
            feed_url: feed_url.to_string(),
            etag: etag.map(str::to_string),
            last_modified: last_modified.map(str::to_string),
            last_checked_at: Utc::now(),
        };
        self.headers.write().await.insert(feed_url.to_string(), header);
        Ok(())
    }
}
