use crate::identity::{self, ArticleIdentity};
use crate::parser::FeedParser;
use crate::state::DedupStore;
use crate::traits::{FeedSource, PageEnricher, ReportRenderer, Translator};
use crate::types::{
    ArticleCandidate, EnrichedArticle, FeedFetch, FeedTarget, FetchedFeed, ReportHandle,
    ReportHeader, Result,
};
use crate::utils::links::host_of;
use chrono::{DateTime, Local, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Knobs of the orchestrator itself; everything else lives in the collaborators.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Minimum pause between consecutive HTTP fetches (feeds and landing pages).
    pub fetch_delay: Duration,
    /// Minimum pause between consecutive translation calls.
    pub translation_delay: Duration,
    pub target_language: String,
    /// Write a "No new articles" report for feeds with nothing new.
    pub write_empty_reports: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            fetch_delay: Duration::ZERO,
            translation_delay: Duration::ZERO,
            target_language: "Simplified Chinese".to_string(),
            write_empty_reports: true,
        }
    }
}

/// The collaborators a run is composed of.
pub struct PipelineParts {
    pub feeds: Arc<dyn FeedSource>,
    pub enricher: Arc<dyn PageEnricher>,
    pub translator: Option<Arc<dyn Translator>>,
    pub renderer: Arc<dyn ReportRenderer>,
    pub store: Arc<dyn DedupStore>,
}

/// An article that was processed but could not be put in the report.
/// It is not marked seen and will be retried on the next run.
#[derive(Debug, Clone)]
pub struct ArticleFailure {
    pub identity: ArticleIdentity,
    pub title: String,
    pub error: String,
}

#[derive(Debug, Clone)]
pub enum FeedStatus {
    Reported {
        /// `None` when the feed had nothing new and empty reports are disabled.
        report_path: Option<PathBuf>,
        new_articles: usize,
        skipped: usize,
        partial: usize,
        translation_fallbacks: usize,
        failed: Vec<ArticleFailure>,
    },
    NotModified,
    Failed {
        error: String,
    },
}

#[derive(Debug, Clone)]
pub struct FeedReport {
    pub feed_url: String,
    pub status: FeedStatus,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Local>,
    pub feeds: Vec<FeedReport>,
}

impl RunSummary {
    pub fn report(&self, feed_url: &str) -> Option<&FeedReport> {
        self.feeds.iter().find(|f| f.feed_url == feed_url)
    }

    pub fn report_paths(&self) -> Vec<&PathBuf> {
        self.feeds
            .iter()
            .filter_map(|f| match &f.status {
                FeedStatus::Reported { report_path, .. } => report_path.as_ref(),
                _ => None,
            })
            .collect()
    }

    pub fn failed_feeds(&self) -> usize {
        self.feeds
            .iter()
            .filter(|f| matches!(f.status, FeedStatus::Failed { .. }))
            .count()
    }

    pub fn new_articles(&self) -> usize {
        self.feeds
            .iter()
            .map(|f| match &f.status {
                FeedStatus::Reported { new_articles, .. } => *new_articles,
                _ => 0,
            })
            .sum()
    }

    /// One line per feed, then the totals.
    pub fn log(&self) {
        for feed in &self.feeds {
            match &feed.status {
                FeedStatus::Reported {
                    report_path,
                    new_articles,
                    skipped,
                    partial,
                    translation_fallbacks,
                    failed,
                } => info!(
                    feed = %feed.feed_url,
                    new_articles,
                    skipped,
                    partial,
                    translation_fallbacks,
                    failed = failed.len(),
                    report = %report_path
                        .as_ref()
                        .map(|p| p.display().to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    "Feed done"
                ),
                FeedStatus::NotModified => info!(feed = %feed.feed_url, "Feed not modified"),
                FeedStatus::Failed { error } => {
                    info!(feed = %feed.feed_url, error = %error, "Feed failed")
                }
            }
        }
        info!(
            run_id = %self.run_id,
            feeds = self.feeds.len(),
            failed = self.failed_feeds(),
            new_articles = self.new_articles(),
            reports = self.report_paths().len(),
            "Run summary"
        );
    }
}

/// Enforces a minimum gap between consecutive calls of one kind.
struct Pacer {
    delay: Duration,
    last: Option<Instant>,
}

impl Pacer {
    fn new(delay: Duration) -> Self {
        Self { delay, last: None }
    }

    async fn wait(&mut self) {
        if let Some(last) = self.last {
            let elapsed = last.elapsed();
            if elapsed < self.delay {
                tokio::time::sleep(self.delay - elapsed).await;
            }
        }
        self.last = Some(Instant::now());
    }
}

#[derive(Debug, Default)]
struct FeedCounts {
    new_articles: usize,
    skipped: usize,
    partial: usize,
    translation_fallbacks: usize,
    failed: Vec<ArticleFailure>,
    journals: Vec<String>,
}

/// Drives one run: every feed in order, every candidate of a feed in order.
pub struct DigestPipeline {
    settings: PipelineSettings,
    parser: FeedParser,
    feeds: Arc<dyn FeedSource>,
    enricher: Arc<dyn PageEnricher>,
    translator: Option<Arc<dyn Translator>>,
    renderer: Arc<dyn ReportRenderer>,
    store: Arc<dyn DedupStore>,
}

impl DigestPipeline {
    pub fn new(settings: PipelineSettings, parts: PipelineParts) -> Self {
        Self {
            settings,
            parser: FeedParser::new(),
            feeds: parts.feeds,
            enricher: parts.enricher,
            translator: parts.translator,
            renderer: parts.renderer,
            store: parts.store,
        }
    }

    /// Process every feed once. A failing feed is recorded in the summary and
    /// the run moves on; only a store failure ends the run with an error.
    pub async fn run(&self, feeds: &[FeedTarget]) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("run", %run_id);
        self.run_feeds(run_id, feeds).instrument(span).await
    }

    async fn run_feeds(&self, run_id: Uuid, feeds: &[FeedTarget]) -> Result<RunSummary> {
        let started_at = Local::now();
        info!(feeds = feeds.len(), "Starting run");

        let mut summary = RunSummary {
            run_id,
            started_at,
            feeds: Vec::with_capacity(feeds.len()),
        };
        let mut fetch_pacer = Pacer::new(self.settings.fetch_delay);
        let mut translation_pacer = Pacer::new(self.settings.translation_delay);

        for feed in feeds {
            let outcome = self
                .process_feed(feed, started_at, &mut fetch_pacer, &mut translation_pacer)
                .instrument(info_span!("feed", url = %feed.url))
                .await;

            let status = match outcome {
                Ok(status) => status,
                Err(e) if e.is_fatal() => {
                    error!(feed = %feed.url, error = %e, "Dedup store failed, aborting run");
                    summary.feeds.push(FeedReport {
                        feed_url: feed.url.clone(),
                        status: FeedStatus::Failed { error: e.to_string() },
                    });
                    summary.log();
                    return Err(e);
                }
                Err(e) => {
                    warn!(feed = %feed.url, error = %e, "Feed failed");
                    FeedStatus::Failed { error: e.to_string() }
                }
            };

            summary.feeds.push(FeedReport {
                feed_url: feed.url.clone(),
                status,
            });
        }

        Ok(summary)
    }

    async fn process_feed(
        &self,
        feed: &FeedTarget,
        run_started_at: DateTime<Local>,
        fetch_pacer: &mut Pacer,
        translation_pacer: &mut Pacer,
    ) -> Result<FeedStatus> {
        let cache = self.store.get_cache_header(&feed.url).await?;

        fetch_pacer.wait().await;
        let fetched = match self.feeds.fetch_feed(&feed.url, cache.as_ref()).await? {
            FeedFetch::NotModified => {
                let (etag, last_modified) = cache
                    .as_ref()
                    .map(|c| (c.etag.as_deref(), c.last_modified.as_deref()))
                    .unwrap_or((None, None));
                self.store
                    .set_cache_header(&feed.url, etag, last_modified)
                    .await?;
                info!(feed = %feed.url, "Not modified since last run, skipping");
                return Ok(FeedStatus::NotModified);
            }
            FeedFetch::Fetched(fetched) => fetched,
        };

        // On a parse failure the cache header stays as it was so the next run
        // downloads the body again.
        let parsed = self.parser.parse_feed(&fetched.body, &feed.url)?;

        let mut report = self.renderer.begin(feed, run_started_at).await?;

        let counts = match self
            .process_candidates(
                feed,
                parsed.candidates,
                &mut report,
                fetch_pacer,
                translation_pacer,
            )
            .await
        {
            Ok(counts) => counts,
            Err(e) => {
                // Entries rendered so far were marked seen; keep them.
                if report.entries > 0 {
                    let header = ReportHeader {
                        display_name: self.display_name(feed, &[], parsed.title.as_deref()),
                        last_new_at: None,
                    };
                    if let Err(finalize_err) = self.renderer.finalize(report, &header).await {
                        warn!(
                            feed = %feed.url,
                            error = %finalize_err,
                            "Could not save partial report"
                        );
                    }
                } else if let Err(discard_err) = self.renderer.discard(report).await {
                    debug!(feed = %feed.url, error = %discard_err, "Could not discard report");
                }
                return Err(e);
            }
        };

        let stored = self.update_feed_state(&feed.url, &fetched).await;
        let header = ReportHeader {
            display_name: self.display_name(feed, &counts.journals, parsed.title.as_deref()),
            last_new_at: stored.as_ref().ok().copied().flatten(),
        };

        // Entries carried over from an interrupted run count as content.
        let finalized = if report.entries == 0 && !self.settings.write_empty_reports {
            self.renderer.discard(report).await.map(|()| None)
        } else {
            self.renderer.finalize(report, &header).await.map(Some)
        };

        // A store failure outranks a render failure: it ends the run.
        stored?;
        let report_path = finalized?;

        Ok(FeedStatus::Reported {
            report_path,
            new_articles: counts.new_articles,
            skipped: counts.skipped,
            partial: counts.partial,
            translation_fallbacks: counts.translation_fallbacks,
            failed: counts.failed,
        })
    }

    async fn process_candidates(
        &self,
        feed: &FeedTarget,
        candidates: Vec<ArticleCandidate>,
        report: &mut ReportHandle,
        fetch_pacer: &mut Pacer,
        translation_pacer: &mut Pacer,
    ) -> Result<FeedCounts> {
        let mut counts = FeedCounts::default();

        for candidate in candidates {
            let identity = identity::resolve(&candidate);
            if self.store.has_seen(&feed.url, &identity).await? {
                debug!(identity = %identity, title = %candidate.title, "Already seen");
                counts.skipped += 1;
                continue;
            }
            if identity.is_fallback() {
                debug!(
                    identity = %identity,
                    title = %candidate.title,
                    "No DOI, GUID or link; using fallback identity"
                );
            }

            fetch_pacer.wait().await;
            let mut article = self.enricher.enrich(candidate).await;
            if article.is_partial() {
                counts.partial += 1;
            }

            counts.translation_fallbacks += self.translate(&mut article, translation_pacer).await;

            if let Err(e) = self.renderer.append_entry(report, &article).await {
                warn!(
                    identity = %identity,
                    error = %e,
                    "Could not render article; it stays unseen"
                );
                counts.failed.push(ArticleFailure {
                    identity,
                    title: article.title_en,
                    error: e.to_string(),
                });
                continue;
            }

            self.store.mark_seen(&feed.url, &identity, Utc::now()).await?;
            debug!(identity = %identity, title = %article.title_en, "New article reported");

            if let Some(journal) = article.journal_name {
                counts.journals.push(journal);
            }
            counts.new_articles += 1;
        }

        Ok(counts)
    }

    /// Fill the translated fields. Returns how many calls fell back to the original text.
    async fn translate(&self, article: &mut EnrichedArticle, pacer: &mut Pacer) -> usize {
        let Some(translator) = self.translator.as_deref() else {
            return 0;
        };
        let mut fallbacks = 0;

        let (title, fell_back) = self.translate_text(translator, &article.title_en, pacer).await;
        article.title_cn = title;
        fallbacks += usize::from(fell_back);

        if let Some(abstract_en) = article.abstract_en.clone() {
            let (text, fell_back) = self.translate_text(translator, &abstract_en, pacer).await;
            article.abstract_cn = text;
            fallbacks += usize::from(fell_back);
        }

        fallbacks
    }

    async fn translate_text(
        &self,
        translator: &dyn Translator,
        text: &str,
        pacer: &mut Pacer,
    ) -> (Option<String>, bool) {
        if text.trim().is_empty() {
            return (None, false);
        }

        pacer.wait().await;
        match translator.translate(text, &self.settings.target_language).await {
            Ok(translated) => (Some(translated), false),
            Err(e) => {
                warn!(
                    translator = translator.name(),
                    error = %e,
                    "Translation failed, keeping original text"
                );
                (Some(text.to_string()), true)
            }
        }
    }

    async fn update_feed_state(
        &self,
        feed_url: &str,
        fetched: &FetchedFeed,
    ) -> Result<Option<DateTime<Utc>>> {
        self.store
            .set_cache_header(feed_url, fetched.etag.as_deref(), fetched.last_modified.as_deref())
            .await?;
        self.store.last_seen_at(feed_url).await
    }

    /// Configured name, else the most common journal of this run's articles,
    /// else the feed's own title, else the feed's host.
    fn display_name(
        &self,
        feed: &FeedTarget,
        journals: &[String],
        channel_title: Option<&str>,
    ) -> String {
        feed.name
            .clone()
            .or_else(|| majority(journals))
            .or_else(|| channel_title.map(str::to_string))
            .or_else(|| host_of(&feed.url))
            .unwrap_or_else(|| feed.url.clone())
    }
}

/// Most frequent value; ties go to the one that appeared first.
fn majority(values: &[String]) -> Option<String> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    let mut order: Vec<&str> = Vec::new();
    for value in values {
        let count = counts.entry(value.as_str()).or_insert(0);
        if *count == 0 {
            order.push(value.as_str());
        }
        *count += 1;
    }

    let mut best: Option<(&str, usize)> = None;
    for value in order {
        let count = counts.get(value).copied().unwrap_or(0);
        if best.map_or(true, |(_, best_count)| count > best_count) {
            best = Some((value, count));
        }
    }
    best.map(|(value, _)| value.to_string())
}
