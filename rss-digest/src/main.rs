use anyhow::{Context, Result};
use clap::Parser;
use rss_digest::{
    build_translator, Config, DedupStore, DigestPipeline, Fetcher, HttpPageEnricher,
    MarkdownRenderer, PipelineParts, SqliteDedupStore,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Poll journal feeds once and write a Markdown digest per feed.
#[derive(Debug, Parser)]
#[command(name = "rss-digest", version)]
struct Cli {
    /// JSON configuration file
    #[arg(short, long, env = "PIPELINE_CONFIG", default_value = "config.json")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;

    info!(feeds = config.feeds.len(), out_dir = %config.out_dir.display(), "Starting RSS digest");

    let store = Arc::new(
        SqliteDedupStore::open(&config.db)
            .await
            .with_context(|| format!("opening dedup store {}", config.db.display()))?,
    );
    let fetcher = Arc::new(Fetcher::new(config.fetch_config()).context("building HTTP client")?);
    let translator = build_translator(&config).context("configuring translator")?;
    let renderer = Arc::new(MarkdownRenderer::new(
        config.out_dir.clone(),
        config.report_prefix.clone(),
        config.target_language.clone(),
    ));

    let pipeline = DigestPipeline::new(
        config.pipeline_settings(),
        PipelineParts {
            feeds: fetcher.clone(),
            enricher: Arc::new(HttpPageEnricher::new(fetcher)),
            translator,
            renderer,
            store: store.clone(),
        },
    );

    let outcome = pipeline.run(&config.feed_targets()).await;

    if let Err(e) = store.close().await {
        error!(error = %e, "Failed to close dedup store");
    }

    let summary = outcome.context("run aborted")?;
    summary.log();
    for path in summary.report_paths() {
        info!("Report written to {}", path.display());
    }

    info!("RSS digest finished");
    Ok(())
}
