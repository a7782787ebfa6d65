use async_trait::async_trait;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, USER_AGENT};
use reqwest::Client;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use url::Url;

use crate::browser::UserAgentGenerator;
use crate::error::{LinkBotError, Result};
use crate::extract::heuristics::PageAnalyzer;
use crate::extract::record::{ExtractionAttempt, Stage};
use crate::extract::{absorb, Extractor, StageContext};

/// Fetches raw HTML without running scripts.
pub struct HttpFetchExtractor {
    client: Client,
    analyzer: Arc<PageAnalyzer>,
    user_agents: UserAgentGenerator,
    timeout: Duration,
}

impl HttpFetchExtractor {
    pub fn new(analyzer: Arc<PageAnalyzer>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .map_err(|e| LinkBotError::NetworkError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            analyzer,
            user_agents: UserAgentGenerator::new(),
            timeout,
        })
    }

    async fn fetch(&self, url: &Url) -> Result<(reqwest::StatusCode, Url, String)> {
        let profile = self.user_agents.random_profile();
        let response = self
            .client
            .get(url.clone())
            .header(USER_AGENT, profile.user_agent)
            .header(ACCEPT_LANGUAGE, profile.accept_language)
            .header(ACCEPT, "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8")
            .send()
            .await?;

        let status = response.status();
        let final_url = response.url().clone();
        let body = response.text().await?;
        debug!("Fetched {} -> {} ({} bytes, {})", url, final_url, body.len(), status);
        Ok((status, final_url, body))
    }
}

#[async_trait]
impl Extractor for HttpFetchExtractor {
    fn stage(&self) -> Stage {
        Stage::HttpFetch
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn attempt(&self, ctx: &StageContext) -> Result<ExtractionAttempt> {
        let started = Instant::now();
        let (status, final_url, body) = match self.fetch(&ctx.url).await {
            Ok(fetched) => fetched,
            Err(e) => return absorb(self.stage(), e).map(|a| a.with_elapsed(started.elapsed())),
        };

        if body.trim().is_empty() {
            return Ok(ExtractionAttempt::failed(self.stage(), format!("empty response (HTTP {})", status))
                .with_elapsed(started.elapsed()));
        }

        let analysis = self.analyzer.analyze(&body, &final_url, ctx.profile.as_ref());
        let blocked = analysis.blocked || status.as_u16() == 403 || status.as_u16() == 429;
        let mut attempt = ExtractionAttempt::from_fields(self.stage(), analysis.fields, analysis.confidence, blocked)
            .with_capture(analysis.capture)
            .with_elapsed(started.elapsed());

        if attempt.is_failed() && !status.is_success() {
            attempt.error = Some(format!("HTTP {}", status));
        }
        info!("HTTP fetch of {} finished with {:?}", ctx.url, attempt.status);
        Ok(attempt)
    }
}
