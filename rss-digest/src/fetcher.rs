use crate::traits::FeedSource;
use crate::types::{DigestError, FeedCacheHeader, FeedFetch, FetchConfig, FetchedFeed, Result};
use async_trait::async_trait;
use backoff::{backoff::Backoff, exponential::ExponentialBackoff, SystemClock};
use reqwest::header::{HeaderMap, ACCEPT, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use reqwest::{Client, Response, StatusCode};
use std::time::Instant;
use tracing::{debug, info, warn};

const FEED_ACCEPT: &str = concat!(
    "application/rss+xml, application/atom+xml, application/rdf+xml, ",
    "application/xml;q=0.9, text/xml;q=0.9, */*;q=0.8"
);
const PAGE_ACCEPT: &str = "text/html, application/xhtml+xml;q=0.9, */*;q=0.8";

/// Outcome of a single feed request that did not produce a body.
enum AttemptError {
    /// Connection failure or 5xx: worth another try.
    Transient(String),
    Permanent(String),
}

pub struct Fetcher {
    client: Client,
    config: FetchConfig,
}

impl Fetcher {
    pub fn new(config: FetchConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.timeout)
            .gzip(true)
            .deflate(true)
            .brotli(true)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()?;

        Ok(Self { client, config })
    }

    /// Conditional GET of a feed with bounded retry on transient failures.
    pub async fn fetch_feed(
        &self,
        url: &str,
        cache: Option<&FeedCacheHeader>,
    ) -> Result<FeedFetch> {
        let etag = cache.and_then(|c| c.etag.as_deref());
        let last_modified = cache.and_then(|c| c.last_modified.as_deref());
        let start_time = Instant::now();

        debug!(feed = url, etag, last_modified, "Fetching feed");

        let mut backoff: ExponentialBackoff<SystemClock> = ExponentialBackoff {
            current_interval: self.config.retry_delay,
            initial_interval: self.config.retry_delay,
            max_interval: self.config.retry_delay * 32,
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        };

        let mut attempt = 0;
        loop {
            match self.attempt_feed(url, etag, last_modified).await {
                Ok(fetch) => {
                    match &fetch {
                        FeedFetch::NotModified => debug!(feed = url, "Feed not modified"),
                        FeedFetch::Fetched(feed) => info!(
                            feed = url,
                            bytes = feed.body.len(),
                            elapsed_ms = start_time.elapsed().as_millis() as u64,
                            "Fetched feed"
                        ),
                    }
                    return Ok(fetch);
                }
                Err(AttemptError::Transient(reason)) if attempt < self.config.max_retries => {
                    attempt += 1;
                    let delay = backoff.next_backoff().unwrap_or(self.config.retry_delay);
                    warn!(
                        feed = url,
                        attempt,
                        error = %reason,
                        "Feed fetch failed, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(AttemptError::Transient(reason)) | Err(AttemptError::Permanent(reason)) => {
                    return Err(DigestError::FeedFetch {
                        url: url.to_string(),
                        reason,
                    });
                }
            }
        }
    }

    async fn attempt_feed(
        &self,
        url: &str,
        etag: Option<&str>,
        last_modified: Option<&str>,
    ) -> std::result::Result<FeedFetch, AttemptError> {
        let mut request = self.client.get(url).header(ACCEPT, FEED_ACCEPT);

        if let Some(etag) = etag {
            request = request.header(IF_NONE_MATCH, etag);
        }
        if let Some(last_modified) = last_modified {
            request = request.header(IF_MODIFIED_SINCE, last_modified);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_connect() {
                AttemptError::Transient(describe(&e))
            } else {
                AttemptError::Permanent(describe(&e))
            }
        })?;

        let status = response.status();
        if status == StatusCode::NOT_MODIFIED {
            return Ok(FeedFetch::NotModified);
        }
        if status.is_server_error() {
            return Err(AttemptError::Transient(format!("HTTP {status}")));
        }
        if !status.is_success() {
            return Err(AttemptError::Permanent(format!("HTTP {status}")));
        }

        let new_etag = header_value(response.headers(), ETAG);
        let new_last_modified = header_value(response.headers(), LAST_MODIFIED);

        let body = read_limited(response, self.config.max_feed_size_mb, "feed")
            .await
            .map_err(AttemptError::Permanent)?;

        Ok(FeedFetch::Fetched(FetchedFeed {
            body,
            etag: new_etag,
            last_modified: new_last_modified,
            http_status: status.as_u16(),
        }))
    }

    /// One GET of an article landing page. No retry.
    pub async fn fetch_page(&self, url: &str) -> Result<String> {
        debug!(url, "Fetching landing page");

        let page_error = |reason: String| DigestError::PageFetch {
            url: url.to_string(),
            reason,
        };

        let response = self
            .client
            .get(url)
            .header(ACCEPT, PAGE_ACCEPT)
            .send()
            .await
            .map_err(|e| page_error(describe(&e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(page_error(format!("HTTP {status}")));
        }

        // Pages get the same cap as feeds.
        let body = read_limited(response, self.config.max_feed_size_mb, "page")
            .await
            .map_err(page_error)?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }
}

#[async_trait]
impl FeedSource for Fetcher {
    async fn fetch_feed(&self, url: &str, cache: Option<&FeedCacheHeader>) -> Result<FeedFetch> {
        Fetcher::fetch_feed(self, url, cache).await
    }
}

/// Read a body chunk by chunk, giving up once it exceeds `limit_mb` megabytes.
async fn read_limited(
    mut response: Response,
    limit_mb: usize,
    what: &str,
) -> std::result::Result<Vec<u8>, String> {
    let limit = limit_mb * 1024 * 1024;
    let too_large = |size: usize| format!("{what} too large: {size} bytes (limit {limit_mb}MB)");

    if let Some(content_length) = response.content_length() {
        if content_length > limit as u64 {
            return Err(too_large(content_length as usize));
        }
    }

    let mut body = Vec::new();
    while let Some(chunk) = response.chunk().await.map_err(|e| describe(&e))? {
        if body.len() + chunk.len() > limit {
            return Err(too_large(body.len() + chunk.len()));
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

fn header_value(headers: &HeaderMap, name: reqwest::header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn describe(error: &reqwest::Error) -> String {
    if error.is_timeout() {
        "request timed out".to_string()
    } else if error.is_connect() {
        format!("connection failed: {error}")
    } else {
        error.to_string()
    }
}
