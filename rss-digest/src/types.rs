use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::identity::ArticleIdentity;

/// One item read from a feed. Nothing is deduplicated at this stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArticleCandidate {
    pub feed_url: String,
    pub raw_guid: Option<String>,
    pub link: Option<String>,
    pub doi: Option<String>,
    pub title: String,
    pub published_at: Option<DateTime<Utc>>,
    pub summary: Option<String>,
    /// Journal name carried by the feed itself (RDF `prism:publicationName`).
    pub journal: Option<String>,
}

impl ArticleCandidate {
    pub fn new(feed_url: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            feed_url: feed_url.into(),
            raw_guid: None,
            link: None,
            doi: None,
            title: title.into(),
            published_at: None,
            summary: None,
            journal: None,
        }
    }

    pub fn with_guid(mut self, guid: impl Into<String>) -> Self {
        self.raw_guid = Some(guid.into());
        self
    }

    pub fn with_link(mut self, link: impl Into<String>) -> Self {
        self.link = Some(link.into());
        self
    }

    pub fn with_doi(mut self, doi: impl Into<String>) -> Self {
        self.doi = Some(doi.into());
        self
    }

    pub fn with_published_at(mut self, published_at: DateTime<Utc>) -> Self {
        self.published_at = Some(published_at);
        self
    }
}

/// A candidate plus whatever its landing page and the translator added.
///
/// Lives only for the duration of a run; the rendered report is its only trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichedArticle {
    pub candidate: ArticleCandidate,
    pub title_en: String,
    pub journal_name: Option<String>,
    pub article_type: Option<String>,
    pub doi: Option<String>,
    pub published: Option<String>,
    pub article_url: Option<String>,
    pub abstract_en: Option<String>,
    pub title_cn: Option<String>,
    pub abstract_cn: Option<String>,
    /// Why the landing page contributed nothing, when it didn't.
    pub enrichment_error: Option<String>,
}

impl EnrichedArticle {
    /// Builds the partial record used when the landing page cannot be read.
    pub fn from_candidate(candidate: ArticleCandidate) -> Self {
        Self {
            title_en: candidate.title.clone(),
            journal_name: candidate.journal.clone(),
            article_type: None,
            doi: candidate.doi.clone(),
            published: candidate
                .published_at
                .map(|dt| dt.format("%Y-%m-%d").to_string()),
            article_url: candidate.link.clone(),
            abstract_en: None,
            title_cn: None,
            abstract_cn: None,
            enrichment_error: None,
            candidate,
        }
    }

    pub fn with_enrichment_error(mut self, error: &DigestError) -> Self {
        self.enrichment_error = Some(error.to_string());
        self
    }

    pub fn is_partial(&self) -> bool {
        self.enrichment_error.is_some()
    }
}

/// Persistent record of an article that made it into a report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeenRecord {
    pub feed_url: String,
    pub identity: ArticleIdentity,
    pub first_seen_at: DateTime<Utc>,
}

/// HTTP validators remembered per feed for conditional requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedCacheHeader {
    pub feed_url: String,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub last_checked_at: DateTime<Utc>,
}

/// A configured feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedTarget {
    pub url: String,
    /// Overrides the display name derived from the feed's articles.
    pub name: Option<String>,
}

impl FeedTarget {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            name: None,
        }
    }

    pub fn named(url: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            name: Some(name.into()),
        }
    }
}

/// HTTP client settings shared by feed and page fetches.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub user_agent: String,
    pub timeout: Duration,
    /// Extra attempts after the first failed feed fetch. Page fetches never retry.
    pub max_retries: u32,
    pub retry_delay: Duration,
    /// Cap on any response body, feed or landing page.
    pub max_feed_size_mb: usize,
    pub max_redirects: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout: Duration::from_secs(25),
            max_retries: 2,
            retry_delay: Duration::from_millis(500),
            max_feed_size_mb: 10,
            max_redirects: 10,
        }
    }
}

pub const DEFAULT_USER_AGENT: &str = "rss-digest/0.1";

/// Result of a conditional feed request.
#[derive(Debug, Clone)]
pub enum FeedFetch {
    NotModified,
    Fetched(FetchedFeed),
}

#[derive(Debug, Clone)]
pub struct FetchedFeed {
    pub body: Vec<u8>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub http_status: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeedDialect {
    Rss2,
    Atom,
    Rdf,
}

#[derive(Debug)]
pub struct ParsedFeed {
    pub dialect: FeedDialect,
    pub title: Option<String>,
    pub candidates: Vec<ArticleCandidate>,
}

/// A report being written for one feed during a run.
#[derive(Debug)]
pub struct ReportHandle {
    pub feed_url: String,
    /// File the entries are appended to until the report is finalized.
    pub staging_path: PathBuf,
    pub run_started_at: DateTime<Local>,
    /// Entries staged so far, including any carried over from an unfinished report.
    pub entries: usize,
}

/// What the report header needs, known only once every entry has been rendered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportHeader {
    pub display_name: String,
    pub last_new_at: Option<DateTime<Utc>>,
}

#[derive(Debug, thiserror::Error)]
pub enum DigestError {
    #[error("Failed to fetch feed {url}: {reason}")]
    FeedFetch { url: String, reason: String },

    #[error("Failed to parse feed {url}: {reason}")]
    FeedParse { url: String, reason: String },

    #[error("Failed to fetch page {url}: {reason}")]
    PageFetch { url: String, reason: String },

    #[error("Failed to read page {url}: {reason}")]
    PageParse { url: String, reason: String },

    #[error("Translation failed: {0}")]
    Translation(String),

    #[error("Dedup store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("Dedup store integrity error: {0}")]
    StoreIntegrity(String),

    #[error("Report rendering failed: {0}")]
    Render(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DigestError {
    /// Only store failures may end a run early: past them dedup can't be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DigestError::Store(_) | DigestError::StoreIntegrity(_))
    }
}

pub type Result<T> = std::result::Result<T, DigestError>;
