use crate::types::{
    ArticleCandidate, EnrichedArticle, FeedCacheHeader, FeedFetch, FeedTarget, ReportHandle,
    ReportHeader, Result,
};
use async_trait::async_trait;
use chrono::{DateTime, Local};
use std::path::PathBuf;

/// Source of raw feed bodies (HTTP in production, canned bytes in tests)
#[async_trait]
pub trait FeedSource: Send + Sync {
    /// Conditionally fetch a feed. The cache header, when present, supplies
    /// the validators for `If-None-Match` / `If-Modified-Since`.
    async fn fetch_feed(&self, url: &str, cache: Option<&FeedCacheHeader>) -> Result<FeedFetch>;
}

/// Supplements a candidate with data from its landing page.
#[async_trait]
pub trait PageEnricher: Send + Sync {
    /// Never fails: when the page is unreachable or unreadable the result
    /// carries only the feed's fields and the reason in `enrichment_error`.
    async fn enrich(&self, candidate: ArticleCandidate) -> EnrichedArticle;
}

#[async_trait]
pub trait Translator: Send + Sync {
    fn name(&self) -> &str;

    async fn translate(&self, text: &str, target_language: &str) -> Result<String>;
}

/// Writes the per-feed report, one entry at a time.
#[async_trait]
pub trait ReportRenderer: Send + Sync {
    /// Start the feed's report. `entries` of the returned handle may already be
    /// non-zero when entries of an earlier, unfinished report were carried over.
    async fn begin(
        &self,
        feed: &FeedTarget,
        run_started_at: DateTime<Local>,
    ) -> Result<ReportHandle>;

    async fn append_entry(
        &self,
        handle: &mut ReportHandle,
        article: &EnrichedArticle,
    ) -> Result<()>;

    /// Assemble the final report file and return its path.
    async fn finalize(&self, handle: ReportHandle, header: &ReportHeader) -> Result<PathBuf>;

    /// Drop a report that will not be finalized.
    async fn discard(&self, _handle: ReportHandle) -> Result<()> {
        Ok(())
    }
}
