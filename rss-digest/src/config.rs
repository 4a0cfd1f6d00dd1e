use crate::pipeline::PipelineSettings;
use crate::types::{DigestError, FeedTarget, FetchConfig, Result, DEFAULT_USER_AGENT};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

pub const API_KEY_ENV: &str = "OPENAI_API_KEY";

/// Immutable run configuration, loaded once at start-up.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub feeds: Vec<FeedEntry>,
    #[serde(default = "default_out_dir")]
    pub out_dir: PathBuf,
    #[serde(default = "default_db")]
    pub db: PathBuf,
    #[serde(default)]
    pub translator: TranslatorBackend,
    #[serde(default)]
    pub openai: OpenAiConfig,
    #[serde(default = "default_target_language")]
    pub target_language: String,
    /// Seconds.
    #[serde(default = "default_http_timeout")]
    pub http_timeout: u64,
    /// Seconds between consecutive HTTP fetches, feeds and landing pages alike.
    #[serde(default = "default_sleep_between_fetches")]
    pub sleep_between_fetches: f64,
    #[serde(default = "default_sleep_between_translations")]
    pub sleep_between_translations: f64,
    #[serde(default = "default_report_prefix")]
    pub report_prefix: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_max_feed_size_mb")]
    pub max_feed_size_mb: usize,
    #[serde(default = "default_true")]
    pub write_empty_reports: bool,
}

/// A feed as written in the config: a bare URL or `{ "url": ..., "name": ... }`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum FeedEntry {
    Url(String),
    Target {
        url: String,
        #[serde(default)]
        name: Option<String>,
    },
}

impl From<&FeedEntry> for FeedTarget {
    fn from(entry: &FeedEntry) -> Self {
        match entry {
            FeedEntry::Url(url) => FeedTarget::new(url.trim()),
            FeedEntry::Target { url, name } => FeedTarget {
                url: url.trim().to_string(),
                name: name
                    .as_deref()
                    .map(str::trim)
                    .filter(|n| !n.is_empty())
                    .map(str::to_string),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranslatorBackend {
    #[default]
    None,
    OpenAi,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
    #[serde(default = "default_openai_model")]
    pub model: String,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_openai_base_url(),
            model: default_openai_model(),
        }
    }
}

fn default_out_dir() -> PathBuf {
    PathBuf::from("./reports")
}

fn default_db() -> PathBuf {
    PathBuf::from("./rss_state.db")
}

fn default_target_language() -> String {
    "Simplified Chinese".to_string()
}

fn default_http_timeout() -> u64 {
    25
}

fn default_sleep_between_fetches() -> f64 {
    0.5
}

fn default_sleep_between_translations() -> f64 {
    0.4
}

fn default_report_prefix() -> String {
    "rss_report".to_string()
}

fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_delay_ms() -> u64 {
    500
}

fn default_max_feed_size_mb() -> usize {
    10
}

fn default_true() -> bool {
    true
}

fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_openai_model() -> String {
    "gpt-4o-mini".to_string()
}

impl Config {
    /// Read, fill from the environment and validate a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            DigestError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let mut config = Self::from_json_str(&raw)?;

        if config.openai.api_key.is_none() {
            config.openai.api_key = std::env::var(API_KEY_ENV)
                .ok()
                .filter(|key| !key.trim().is_empty());
        }

        config.validate()?;
        debug!(path = %path.display(), feeds = config.feeds.len(), "Loaded configuration");
        Ok(config)
    }

    /// Parse without touching the environment or validating.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| DigestError::Config(format!("invalid config: {e}")))
    }

    pub fn validate(&self) -> Result<()> {
        let targets = self.feed_targets();
        if targets.is_empty() {
            return Err(DigestError::Config("no feeds configured".to_string()));
        }
        if let Some(blank) = targets.iter().position(|t| t.url.is_empty()) {
            return Err(DigestError::Config(format!("feed #{} has an empty url", blank + 1)));
        }
        if self.translator == TranslatorBackend::OpenAi
            && self.openai.api_key.as_deref().map_or(true, |k| k.trim().is_empty())
        {
            return Err(DigestError::Config(format!(
                "translator \"openai\" needs openai.api_key or {API_KEY_ENV}"
            )));
        }
        if !self.sleep_between_fetches.is_finite()
            || !self.sleep_between_translations.is_finite()
            || self.sleep_between_fetches < 0.0
            || self.sleep_between_translations < 0.0
        {
            return Err(DigestError::Config(
                "sleep values must be non-negative seconds".to_string(),
            ));
        }
        if self.report_prefix.trim().is_empty() {
            return Err(DigestError::Config("report_prefix must not be empty".to_string()));
        }
        Ok(())
    }

    /// Configured feeds in file order.
    pub fn feed_targets(&self) -> Vec<FeedTarget> {
        self.feeds.iter().map(FeedTarget::from).collect()
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout.max(1))
    }

    pub fn fetch_config(&self) -> FetchConfig {
        FetchConfig {
            user_agent: self.user_agent.clone(),
            timeout: self.http_timeout(),
            max_retries: self.max_retries,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            max_feed_size_mb: self.max_feed_size_mb,
            ..FetchConfig::default()
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            fetch_delay: Duration::from_secs_f64(self.sleep_between_fetches),
            translation_delay: Duration::from_secs_f64(self.sleep_between_translations),
            target_language: self.target_language.clone(),
            write_empty_reports: self.write_empty_reports,
        }
    }
}
