use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;
use url::Url;

use crate::browser::PageRenderer;
use crate::error::Result;
use crate::extract::heuristics::PageAnalyzer;
use crate::extract::record::{ExtractionAttempt, Stage};
use crate::extract::{absorb, Extractor, StageContext};

/// Renders the page in a fresh browser tab, then analyzes the live DOM.
pub struct BrowserScrapeExtractor {
    renderer: Arc<dyn PageRenderer>,
    analyzer: Arc<PageAnalyzer>,
    timeout: Duration,
}

impl BrowserScrapeExtractor {
    pub fn new(renderer: Arc<dyn PageRenderer>, analyzer: Arc<PageAnalyzer>, timeout: Duration) -> Self {
        Self {
            renderer,
            analyzer,
            timeout,
        }
    }
}

#[async_trait]
impl Extractor for BrowserScrapeExtractor {
    fn stage(&self) -> Stage {
        Stage::BrowserScrape
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn attempt(&self, ctx: &StageContext) -> Result<ExtractionAttempt> {
        let started = Instant::now();
        let page = match self.renderer.render(&ctx.url, self.timeout).await {
            Ok(page) => page,
            Err(e) => return absorb(self.stage(), e).map(|a| a.with_elapsed(started.elapsed())),
        };

        let final_url = Url::parse(&page.final_url).unwrap_or_else(|_| ctx.url.clone());
        let mut analysis = self.analyzer.analyze(&page.html, &final_url, ctx.profile.as_ref());
        if analysis.capture.title.is_none() {
            analysis.capture.title = page.title;
        }

        let attempt = ExtractionAttempt::from_fields(self.stage(), analysis.fields, analysis.confidence, analysis.blocked)
            .with_capture(analysis.capture)
            .with_elapsed(started.elapsed());
        info!(
            "Browser scrape of {} finished with {:?} (profile: {})",
            ctx.url,
            attempt.status,
            ctx.profile.is_some()
        );
        Ok(attempt)
    }
}
