use crate::traits::ReportRenderer;
use crate::types::{DigestError, EnrichedArticle, FeedTarget, ReportHandle, ReportHeader, Result};
use crate::utils::text::sanitize_filename;
use async_trait::async_trait;
use chrono::{DateTime, Local};
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

const FILE_STAMP: &str = "%Y%m%d_%H%M%S";
const STAGING_EXT: &str = ".part";
const ENTRY_MARKER: &str = "<!-- entry -->\n";

/// Writes one Markdown report per feed and run.
///
/// Entries go to a hidden staging file in the output directory as soon as
/// they are rendered (flushed to disk before `append_entry` returns); the
/// final `{prefix}_{display_name}_{YYYYMMDD_HHMMSS}.md` is assembled from it
/// on finalize, once the header is known.
///
/// Staging files are named after the feed, so a file left behind by a run
/// that never reached finalize is picked up by the next `begin` for that feed
/// and its entries carried into the new report. Those entries were already
/// marked seen and would otherwise never be reported.
pub struct MarkdownRenderer {
    out_dir: PathBuf,
    prefix: String,
    target_language: String,
}

impl MarkdownRenderer {
    pub fn new(
        out_dir: impl Into<PathBuf>,
        prefix: impl Into<String>,
        target_language: impl Into<String>,
    ) -> Self {
        Self {
            out_dir: out_dir.into(),
            prefix: prefix.into(),
            target_language: target_language.into(),
        }
    }

    /// One staged entry: the marker, the title on its own line, then the body.
    /// Numbers are assigned on finalize, once every entry of the report is known.
    fn stage_entry(&self, article: &EnrichedArticle) -> String {
        let mut out = String::from(ENTRY_MARKER);
        out.push_str(&article.title_en);
        out.push_str("\n\n");

        let fields = [
            (format!("Title ({})", self.target_language), &article.title_cn),
            ("Journal".to_string(), &article.journal_name),
            ("Type".to_string(), &article.article_type),
            ("Publication date".to_string(), &article.published),
            ("DOI".to_string(), &article.doi),
            ("Article URL".to_string(), &article.article_url),
        ];
        for (label, value) in fields {
            if let Some(value) = value.as_deref().filter(|v| !v.is_empty()) {
                let _ = write!(out, "**{label}**: {value}\n\n");
            }
        }

        if let Some(text) = article.abstract_en.as_deref().filter(|v| !v.is_empty()) {
            let _ = write!(out, "**Abstract (EN)**:\n\n{text}\n\n");
        }
        if let Some(text) = article.abstract_cn.as_deref().filter(|v| !v.is_empty()) {
            let _ = write!(out, "**Abstract ({})**:\n\n{text}\n\n", self.target_language);
        }
        if let Some(reason) = &article.enrichment_error {
            let _ = write!(out, "_Landing page unavailable: {reason}_\n\n");
        }

        out.push_str("---\n\n");
        out
    }

    fn render_header(&self, header: &ReportHeader, run_started_at: &DateTime<Local>) -> String {
        let today = run_started_at.format("%Y-%m-%d").to_string();
        let last_new = header
            .last_new_at
            .map(|at| at.with_timezone(&Local).format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| today.clone());
        format!(
            "# {} RSS Report - {} - {}\n\n",
            header.display_name, last_new, today
        )
    }

    async fn create_report_file(&self, stem: &str) -> Result<(PathBuf, fs::File)> {
        for attempt in 1..=100u32 {
            let name = if attempt == 1 {
                format!("{stem}.md")
            } else {
                format!("{stem}_{attempt}.md")
            };
            let path = self.out_dir.join(name);
            match OpenOptions::new().write(true).create_new(true).open(&path).await {
                Ok(file) => return Ok((path, file)),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(DigestError::Render(format!(
            "no free report file name for {stem} in {}",
            self.out_dir.display()
        )))
    }
}

fn feed_key(feed_url: &str) -> String {
    let digest = format!("{:x}", Sha256::digest(feed_url.as_bytes()));
    digest[..12].to_string()
}

fn staging_name(feed_url: &str, run_started_at: &DateTime<Local>) -> String {
    format!(
        ".{}_{}_{}{STAGING_EXT}",
        feed_key(feed_url),
        run_started_at.format(FILE_STAMP),
        Uuid::new_v4().simple()
    )
}

fn count_entries(staged: &str) -> usize {
    staged.matches(ENTRY_MARKER).count()
}

/// Number the staged entries in order and return them with their count.
fn assemble_entries(staged: &str) -> (usize, String) {
    let mut body = String::with_capacity(staged.len());
    let mut count = 0;
    for chunk in staged.split(ENTRY_MARKER).filter(|c| !c.is_empty()) {
        let (title, rest) = chunk.split_once("\n\n").unwrap_or((chunk, ""));
        count += 1;
        let _ = write!(body, "**{count}. {title}**\n\n{rest}");
    }
    (count, body)
}

impl MarkdownRenderer {
    /// Staging files of `feed_url` still lying in the output directory, oldest first.
    async fn leftover_staging(&self, feed_url: &str) -> Result<Vec<PathBuf>> {
        let prefix = format!(".{}_", feed_key(feed_url));
        let mut found = Vec::new();

        let mut dir = fs::read_dir(&self.out_dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.starts_with(&prefix) && name.ends_with(STAGING_EXT) {
                found.push(entry.path());
            }
        }

        found.sort();
        Ok(found)
    }
}

#[async_trait]
impl ReportRenderer for MarkdownRenderer {
    async fn begin(
        &self,
        feed: &FeedTarget,
        run_started_at: DateTime<Local>,
    ) -> Result<ReportHandle> {
        fs::create_dir_all(&self.out_dir).await?;
        let leftovers = self.leftover_staging(&feed.url).await?;

        let staging_path = self.out_dir.join(staging_name(&feed.url, &run_started_at));
        let mut file = fs::File::create(&staging_path).await?;

        let mut entries = 0;
        for path in &leftovers {
            // A run killed mid-write may leave invalid UTF-8 at the tail.
            let staged = String::from_utf8_lossy(&fs::read(path).await?).into_owned();
            entries += count_entries(&staged);
            file.write_all(staged.as_bytes()).await?;
        }
        file.sync_all().await?;

        for path in &leftovers {
            fs::remove_file(path).await?;
        }
        if entries > 0 {
            warn!(
                feed = %feed.url,
                recovered = entries,
                "Carrying entries of an interrupted run into this report"
            );
        }
        debug!(feed = %feed.url, staging = %staging_path.display(), "Started report");

        Ok(ReportHandle {
            feed_url: feed.url.clone(),
            staging_path,
            run_started_at,
            entries,
        })
    }

    async fn append_entry(
        &self,
        handle: &mut ReportHandle,
        article: &EnrichedArticle,
    ) -> Result<()> {
        let entry = self.stage_entry(article);

        let mut file = OpenOptions::new()
            .append(true)
            .open(&handle.staging_path)
            .await?;
        file.write_all(entry.as_bytes()).await?;
        file.sync_data().await?;

        handle.entries += 1;
        Ok(())
    }

    async fn finalize(&self, handle: ReportHandle, header: &ReportHeader) -> Result<PathBuf> {
        let staged = fs::read(&handle.staging_path).await?;
        let (entries, body) = assemble_entries(&String::from_utf8_lossy(&staged));

        let mut report = self.render_header(header, &handle.run_started_at);
        if entries == 0 {
            report.push_str("No new articles today.\n");
        } else {
            report.push_str(&body);
        }

        let stem = format!(
            "{}_{}_{}",
            self.prefix,
            sanitize_filename(&header.display_name, "report"),
            handle.run_started_at.format(FILE_STAMP)
        );
        let (path, mut file) = self.create_report_file(&stem).await?;
        file.write_all(report.as_bytes()).await?;
        file.sync_all().await?;

        fs::remove_file(&handle.staging_path).await?;
        info!(feed = %handle.feed_url, path = %path.display(), entries, "Report written");
        Ok(path)
    }

    async fn discard(&self, handle: ReportHandle) -> Result<()> {
        match fs::remove_file(&handle.staging_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
