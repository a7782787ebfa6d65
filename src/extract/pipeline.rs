use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::browser::PageRenderer;
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::diagnostics::AttemptSink;
use crate::error::{LinkBotError, Result};
use crate::extract::heuristics::PageAnalyzer;
use crate::extract::record::{Confidence, ExtractionAttempt, PageCapture, ProductFields, ProductRecord, Stage};
use crate::extract::{
    parse_product_url, BrowserScrapeExtractor, Extractor, HttpFetchExtractor, LlmExtractor, ReaderProxy, StageContext,
};
use crate::llm::{LlmClient, RateLimiter};
use crate::profiles::{SiteProfile, SiteProfileStore};

/// Merge result before it is stamped into a `ProductRecord`.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedFields {
    pub fields: ProductFields,
    pub confidence: Confidence,
    pub source_stage: Stage,
}

/// Field-level, additive merge of stage outputs in the order they ran.
///
/// A field is taken from the first stage that resolved it and never
/// overwritten. Prices and currency travel together: the stage that supplies
/// the first price also fixes the currency, and a later stage may only fill
/// the missing half of the pair when its currency agrees or is unknown.
/// Returns `None` when no stage resolved a title or a price.
pub fn merge_attempts(attempts: &[ExtractionAttempt]) -> Option<MergedFields> {
    let mut fields = ProductFields::default();
    let mut contributors: Vec<(Stage, Confidence)> = Vec::new();

    for attempt in attempts.iter().filter(|a| !a.is_failed()) {
        let offered = &attempt.fields;
        let mut contributed = false;

        if fields.title.is_none() && offered.title.is_some() {
            fields.title = offered.title.clone();
            contributed = true;
        }

        if !fields.has_price() {
            if offered.has_price() {
                fields.sale_price = offered.sale_price;
                fields.original_price = offered.original_price;
                fields.currency = offered.currency.clone();
                contributed = true;
            }
        } else {
            let compatible = match (&fields.currency, &offered.currency) {
                (Some(ours), Some(theirs)) => ours.eq_ignore_ascii_case(theirs),
                _ => true,
            };
            if compatible {
                if fields.sale_price.is_none() {
                    if let Some(sale) = offered.sale_price.filter(|s| fields.original_price.map_or(true, |o| *s < o)) {
                        fields.sale_price = Some(sale);
                        contributed = true;
                    }
                }
                if fields.original_price.is_none() {
                    if let Some(original) = offered.original_price.filter(|o| fields.sale_price.map_or(true, |s| *o > s)) {
                        fields.original_price = Some(original);
                        contributed = true;
                    }
                }
            } else {
                debug!(
                    "Ignoring {} prices in {:?}, record currency is {:?}",
                    attempt.stage, offered.currency, fields.currency
                );
            }
        }

        if fields.image_url.is_none() && offered.image_url.is_some() {
            fields.image_url = offered.image_url.clone();
        }

        if contributed {
            contributors.push((attempt.stage, attempt.confidence));
        }
    }

    if !fields.has_any_required() {
        return None;
    }

    let weakest = contributors
        .iter()
        .map(|(_, confidence)| *confidence)
        .min()
        .unwrap_or(Confidence::Low);
    let confidence = if fields.has_required() { weakest } else { Confidence::Low };
    let source_stage = contributors.last().map(|(stage, _)| *stage)?;

    Some(MergedFields {
        fields,
        confidence,
        source_stage,
    })
}

/// Ordered fallback over extraction stages under one overall deadline.
pub struct ExtractionPipeline {
    stages: Vec<Arc<dyn Extractor>>,
    profiles: Arc<SiteProfileStore>,
    deadline: Duration,
    sink: Option<Arc<dyn AttemptSink>>,
    clock: Arc<dyn Clock>,
}

impl ExtractionPipeline {
    pub fn new(stages: Vec<Arc<dyn Extractor>>, profiles: Arc<SiteProfileStore>, deadline: Duration) -> Self {
        Self {
            stages,
            profiles,
            deadline,
            sink: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Wires the standard chain: browser scrape, HTTP fetch, then the LLM
    /// fallback when a client is supplied.
    pub fn from_config(
        config: &Config,
        renderer: Arc<dyn PageRenderer>,
        llm: Option<Arc<dyn LlmClient>>,
        profiles: Arc<SiteProfileStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let extraction = &config.extraction;
        let analyzer = Arc::new(PageAnalyzer::new()?);

        let mut stages: Vec<Arc<dyn Extractor>> = vec![
            Arc::new(BrowserScrapeExtractor::new(renderer, analyzer.clone(), extraction.browser_timeout)),
            Arc::new(HttpFetchExtractor::new(analyzer, extraction.http_timeout)?),
        ];

        match llm {
            Some(client) => {
                let limiter = Arc::new(RateLimiter::new(
                    "llm",
                    config.llm.max_calls_per_window,
                    config.llm.window,
                    config.llm.max_in_flight,
                    clock.clone(),
                ));
                let mut llm_stage =
                    LlmExtractor::new(client, limiter, config.llm.max_page_chars, extraction.llm_timeout);
                if config.llm.reader_fallback {
                    let reader = ReaderProxy::new(config.llm.reader_proxy.clone(), config.llm.reader_timeout)?;
                    llm_stage = llm_stage.with_reader(Arc::new(reader), config.llm.reader_min_chars);
                }
                stages.push(Arc::new(llm_stage));
            }
            None => info!("No LLM credential configured, llm_fallback stage disabled"),
        }

        Ok(Self::new(stages, profiles, extraction.pipeline_deadline).with_clock(clock))
    }

    pub fn with_sink(mut self, sink: Arc<dyn AttemptSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn stages(&self) -> Vec<Stage> {
        self.stages.iter().map(|s| s.stage()).collect()
    }

    /// Extracts a product record, using the site profile registered for the URL's domain.
    pub async fn extract(&self, raw_url: &str) -> Result<ProductRecord> {
        let url = parse_product_url(raw_url)?;
        let profile = self.profiles.lookup(&url).cloned();
        self.extract_with_profile(url, profile).await
    }

    pub async fn extract_with_profile(&self, url: Url, profile: Option<SiteProfile>) -> Result<ProductRecord> {
        info!(
            "Starting extraction for {} ({} stages, profile: {})",
            url,
            self.stages.len(),
            profile.is_some()
        );

        let deadline_at = Instant::now() + self.deadline;
        let mut attempts: Vec<ExtractionAttempt> = Vec::new();
        let mut capture: Option<PageCapture> = None;
        let mut deadline_hit = false;

        for (index, stage) in self.stages.iter().enumerate() {
            let remaining = deadline_at.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!("Extraction deadline reached before {} for {}", stage.stage(), url);
                deadline_hit = true;
                break;
            }
            let budget = stage.timeout().min(remaining);

            let ctx = StageContext {
                url: url.clone(),
                profile: profile.clone(),
                capture: capture.clone(),
            };

            debug!("Running stage {} with {:?} budget", stage.stage(), budget);
            let started = Instant::now();
            let attempt = match tokio::time::timeout(budget, stage.attempt(&ctx)).await {
                Ok(Ok(attempt)) => attempt,
                Ok(Err(e)) => {
                    error!("Stage {} aborted extraction of {}: {}", stage.stage(), url, e);
                    return Err(e);
                }
                Err(_) => {
                    // the stage future is dropped here, releasing whatever it held
                    if budget < stage.timeout() {
                        deadline_hit = true;
                    }
                    let timeout = LinkBotError::StageTimeout {
                        stage: stage.stage().to_string(),
                        timeout: budget,
                    };
                    warn!("{}", timeout);
                    ExtractionAttempt::failed(stage.stage(), timeout.to_string())
                }
            };
            let attempt = if attempt.elapsed.is_zero() {
                attempt.with_elapsed(started.elapsed())
            } else {
                attempt
            };

            info!(
                "Stage {} for {}: {:?} ({:?}, {:?})",
                attempt.stage, url, attempt.status, attempt.confidence, attempt.elapsed
            );
            if capture.is_none() {
                capture = attempt.capture.clone();
            }
            self.record(&url, index + 1, &attempt).await;
            attempts.push(attempt);

            if let Some(merged) = merge_attempts(&attempts) {
                if merged.fields.has_required() && merged.confidence >= Confidence::Medium {
                    debug!("Stopping after {} with {:?} confidence", stage.stage(), merged.confidence);
                    break;
                }
            }
            if deadline_hit {
                break;
            }
        }

        let merged = match merge_attempts(&attempts) {
            Some(merged) => merged,
            None => {
                warn!("Every stage failed for {}", url);
                return Err(LinkBotError::ExtractionFailed {
                    url: url.to_string(),
                    attempts: attempts.iter().map(ExtractionAttempt::summary).collect(),
                });
            }
        };

        let confidence = if deadline_hit {
            merged.confidence.min(Confidence::Low)
        } else {
            merged.confidence
        };

        let record = ProductRecord {
            url: url.to_string(),
            title: merged.fields.title,
            original_price: merged.fields.original_price,
            sale_price: merged.fields.sale_price,
            currency: merged.fields.currency,
            image_url: merged.fields.image_url,
            confidence,
            source_stage: merged.source_stage,
            extracted_at: self.clock.now(),
        };
        info!(
            "Extracted {}: title={:?} sale={:?} original={:?} confidence={:?} via {}",
            url, record.title, record.sale_price, record.original_price, record.confidence, record.source_stage
        );
        Ok(record)
    }

    async fn record(&self, url: &Url, sequence: usize, attempt: &ExtractionAttempt) {
        if let Some(sink) = &self.sink {
            if let Err(e) = sink.record(url, sequence, attempt).await {
                warn!("Failed to record {} attempt for {}: {}", attempt.stage, url, e);
            }
        }
    }
}
