pub mod config;
pub mod enricher;
pub mod fetcher;
pub mod identity;
pub mod parser;
pub mod pipeline;
pub mod render;
pub mod state;
pub mod traits;
pub mod translate;
pub mod types;
pub mod utils;

pub use config::Config;
pub use enricher::HttpPageEnricher;
pub use fetcher::Fetcher;
pub use identity::{resolve, ArticleIdentity, IdentityKind};
pub use parser::FeedParser;
pub use pipeline::{DigestPipeline, FeedStatus, PipelineParts, PipelineSettings, RunSummary};
pub use render::MarkdownRenderer;
pub use state::{DedupStore, MemoryDedupStore, SqliteDedupStore};
pub use translate::{build_translator, OpenAiTranslator};
pub use types::*;
