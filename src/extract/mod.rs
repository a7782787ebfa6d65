pub mod browser_scrape;
pub mod heuristics;
pub mod http_fetch;
pub mod llm;
pub mod pipeline;
pub mod reader;
pub mod record;


pub use browser_scrape::BrowserScrapeExtractor;
pub use heuristics::{PageAnalysis, PageAnalyzer};
pub use http_fetch::HttpFetchExtractor;
pub use llm::LlmExtractor;
pub use pipeline::{merge_attempts, ExtractionPipeline, MergedFields};
pub use reader::{PageTextSource, ReaderProxy};
pub use record::{AttemptStatus, Confidence, ExtractionAttempt, PageCapture, Price, ProductFields, ProductRecord, Stage};

use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::error::{LinkBotError, RecoveryStrategy, Result};
use crate::profiles::SiteProfile;

/// Inputs one stage sees.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub url: Url,
    pub profile: Option<SiteProfile>,
    /// Page content published by an earlier stage, if any.
    pub capture: Option<PageCapture>,
}

/// One strategy in the fallback chain.
#[async_trait]
pub trait Extractor: Send + Sync {
    fn stage(&self) -> Stage;

    /// Upper bound for a single attempt; the pipeline may grant less.
    fn timeout(&self) -> Duration;

    /// Ordinary failures come back as a failed attempt. `Err` is reserved
    /// for faults that should abort the whole extraction.
    async fn attempt(&self, ctx: &StageContext) -> Result<ExtractionAttempt>;
}

/// Turns a stage-local error into a failed attempt, passing real faults through.
pub(crate) fn absorb(stage: Stage, err: LinkBotError) -> Result<ExtractionAttempt> {
    match err.recovery_strategy() {
        RecoveryStrategy::RetryWithBackoff | RecoveryStrategy::NextStage => {
            debug!("Stage {} failed: {}", stage, err);
            Ok(ExtractionAttempt::failed(stage, err.to_string()))
        }
        _ => Err(err),
    }
}

/// Validates a URL as an absolute http(s) product link.
pub fn parse_product_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw.trim()).map_err(|e| LinkBotError::InvalidUrl(format!("{}: {}", raw, e)))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(LinkBotError::InvalidUrl(raw.to_string()));
    }
    Ok(url)
}
