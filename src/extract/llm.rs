use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::{LinkBotError, Result};
use crate::extract::heuristics::{infer_currency, is_acceptable_title};
use crate::extract::reader::PageTextSource;
use crate::extract::record::{Confidence, ExtractionAttempt, PageCapture, Price, ProductFields, Stage};
use crate::extract::{absorb, Extractor, StageContext};
use crate::llm::{CompletionRequest, LlmClient, RateLimiter};

const SYSTEM_PROMPT: &str = "You extract product information from e-commerce pages. \
Scan the provided title, metadata and text for the product name and its prices. \
Look for patterns such as '$99.99', 'Was $200', 'Now $150' and currency symbols. \
Never guess: use null for anything not present in the content. \
Return only a JSON object with the keys product_title (string or null), \
original_price (string number or null), sale_price (string number or null) \
and currency (ISO code or null).";

const REQUIRED_KEYS: [&str; 3] = ["product_title", "original_price", "sale_price"];

/// Meta entries worth forwarding to the model.
const FORWARDED_META: &[&str] = &[
    "og:title",
    "og:description",
    "description",
    "product:price:amount",
    "product:price:currency",
    "price",
];

/// Last-resort stage: asks a language model to read the captured page.
pub struct LlmExtractor {
    client: Arc<dyn LlmClient>,
    limiter: Arc<RateLimiter>,
    max_page_chars: usize,
    timeout: Duration,
    reader: Option<(Arc<dyn PageTextSource>, usize)>,
}

impl LlmExtractor {
    pub fn new(client: Arc<dyn LlmClient>, limiter: Arc<RateLimiter>, max_page_chars: usize, timeout: Duration) -> Self {
        Self {
            client,
            limiter,
            max_page_chars,
            timeout,
            reader: None,
        }
    }

    /// Pages that were blocked, or captured fewer than `min_chars` of text,
    /// are refetched through `reader` before prompting.
    pub fn with_reader(mut self, reader: Arc<dyn PageTextSource>, min_chars: usize) -> Self {
        self.reader = Some((reader, min_chars));
        self
    }

    async fn prompt_capture(&self, ctx: &StageContext) -> Option<PageCapture> {
        let capture = ctx.capture.clone();
        if let Some((reader, min_chars)) = &self.reader {
            let thin = capture
                .as_ref()
                .map_or(true, |c| c.blocked || c.text.trim().chars().count() < *min_chars);
            if thin {
                match reader.fetch_text(&ctx.url).await {
                    Ok(text) if text.chars().count() >= *min_chars => {
                        info!("Using reader text for {} ({} chars)", ctx.url, text.chars().count());
                        let mut replaced = capture.unwrap_or_else(|| PageCapture {
                            final_url: ctx.url.to_string(),
                            ..Default::default()
                        });
                        if replaced.blocked {
                            // the challenge page's title and meta describe the block, not the product
                            replaced.title = None;
                            replaced.meta.clear();
                            replaced.blocked = false;
                        }
                        replaced.text = text;
                        return Some(replaced);
                    }
                    Ok(text) => debug!("Reader text for {} too short ({} chars)", ctx.url, text.chars().count()),
                    Err(e) => warn!("Reader fallback for {} failed: {}", ctx.url, e),
                }
            }
        }
        capture.filter(|c| !c.text.trim().is_empty() || c.title.is_some())
    }

    fn build_request(&self, capture: &PageCapture) -> CompletionRequest {
        let text: String = capture.text.trim().chars().take(self.max_page_chars).collect();
        let meta: Map<String, Value> = capture
            .meta
            .iter()
            .filter(|(key, _)| FORWARDED_META.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), Value::String(value.clone())))
            .collect();

        let user = format!(
            "Extract product information from this e-commerce page.\n\n\
             URL: {}\nPage title: {}\nPage metadata: {}\nBlocked: {}\nPage content: {}\n\n\
             If several prices appear, the lowest is the sale_price and the highest the original_price. \
             Prices are numbers only, e.g. \"79.99\".",
            capture.final_url,
            capture.title.as_deref().unwrap_or(""),
            Value::Object(meta),
            capture.blocked,
            text
        );

        CompletionRequest {
            system: SYSTEM_PROMPT.to_string(),
            user,
            temperature: 0.1,
            max_tokens: 300,
            json_mode: true,
        }
    }
}

#[async_trait]
impl Extractor for LlmExtractor {
    fn stage(&self) -> Stage {
        Stage::LlmFallback
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn attempt(&self, ctx: &StageContext) -> Result<ExtractionAttempt> {
        let started = Instant::now();
        let Some(capture) = self.prompt_capture(ctx).await else {
            return Ok(ExtractionAttempt::failed(self.stage(), "no page content captured by earlier stages")
                .with_elapsed(started.elapsed()));
        };

        let permit = match self.limiter.try_acquire() {
            Ok(permit) => permit,
            Err(e) => {
                warn!("LLM call for {} refused: {}", ctx.url, e);
                return absorb(self.stage(), e);
            }
        };
        debug!(
            "LLM call admitted on bucket {} ({} left in window)",
            permit.ticket.bucket, permit.ticket.remaining
        );

        let request = self.build_request(&capture);
        let content = match self.client.complete(&request).await {
            Ok(content) => content,
            Err(e) => return absorb(self.stage(), e).map(|a| a.with_elapsed(started.elapsed())),
        };
        drop(permit);

        let fields = match parse_llm_response(&content) {
            Ok(fields) => fields,
            Err(e) => {
                warn!("Discarding LLM response for {}: {}", ctx.url, e);
                debug!("Raw LLM response: {}", content);
                return Ok(ExtractionAttempt::failed(self.stage(), e.to_string()).with_elapsed(started.elapsed()));
            }
        };

        let attempt = ExtractionAttempt::from_fields(self.stage(), fields, Confidence::Low, false)
            .with_elapsed(started.elapsed());
        info!("LLM fallback for {} finished with {:?}", ctx.url, attempt.status);
        Ok(attempt)
    }
}

/// Validates the model output against the expected schema.
pub fn parse_llm_response(content: &str) -> Result<ProductFields> {
    let body = strip_code_fence(content);
    let value: Value = serde_json::from_str(body)
        .map_err(|e| LinkBotError::ParseError(format!("LLM response is not JSON: {}", e)))?;
    let object = value
        .as_object()
        .ok_or_else(|| LinkBotError::ParseError("LLM response is not a JSON object".to_string()))?;

    for key in REQUIRED_KEYS {
        match object.get(key) {
            None => return Err(LinkBotError::ParseError(format!("LLM response is missing '{}'", key))),
            Some(Value::Null | Value::String(_) | Value::Number(_)) => {}
            Some(other) => {
                return Err(LinkBotError::ParseError(format!("LLM response has invalid '{}': {}", key, other)))
            }
        }
    }
    if matches!(object.get("product_title"), Some(Value::Number(_))) {
        return Err(LinkBotError::ParseError("LLM response has a numeric product_title".to_string()));
    }

    let title = object
        .get("product_title")
        .and_then(Value::as_str)
        .map(|t| t.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|t| is_acceptable_title(t));

    let raw_sale = raw_price(object.get("sale_price"));
    let raw_original = raw_price(object.get("original_price"));
    let sale_price = raw_sale.as_deref().and_then(Price::parse);
    let original_price = raw_original.as_deref().and_then(Price::parse).filter(|o| Some(*o) != sale_price);

    let currency = object
        .get("currency")
        .and_then(Value::as_str)
        .map(|c| c.trim().to_uppercase())
        .filter(|c| c.len() == 3 && c.chars().all(|ch| ch.is_ascii_alphabetic()))
        .or_else(|| infer_currency(raw_sale.iter().chain(raw_original.iter()).map(String::as_str)));

    Ok(ProductFields {
        title,
        original_price,
        sale_price,
        currency: currency.filter(|_| sale_price.is_some() || original_price.is_some()),
        image_url: None,
    })
}

fn raw_price(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(raw) => Some(raw.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // drop the language tag line
    let rest = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    rest.trim_end().strip_suffix("```").unwrap_or(rest).trim()
}
