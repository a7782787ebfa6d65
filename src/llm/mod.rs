pub mod rate_limiter;

pub use rate_limiter::{RateLimitPermit, RateLimitTicket, RateLimiter};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::LlmConfig;
use crate::error::{LinkBotError, Result};

/// One chat-completion round trip.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub system: String,
    pub user: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Ask the service to constrain output to a JSON object.
    pub json_mode: bool,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Returns the raw assistant message content.
    async fn complete(&self, request: &CompletionRequest) -> Result<String>;
}

/// Exponential backoff for transient endpoint failures, bounded by a time budget.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total tries, counting the first.
    pub attempts: u32,
    pub backoff: Duration,
    pub budget: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, backoff: Duration, budget: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff,
            budget,
        }
    }

    /// Delay before try number `attempt + 1`.
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        self.backoff.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }

    /// Runs `operation` until it succeeds, fails permanently, or the policy runs out.
    /// A retry that could not start before the budget elapses is skipped.
    pub async fn run<T, F, Fut>(&self, label: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let mut attempt = 1;
        loop {
            let err = match operation().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            if attempt >= self.attempts || !is_transient(&err) {
                return Err(err);
            }
            let delay = self.backoff_after(attempt);
            if started.elapsed() + delay >= self.budget {
                warn!("{} failed and no time is left to retry: {}", label, err);
                return Err(err);
            }
            warn!(
                "{} failed (attempt {}/{}): {}; retrying in {:?}",
                label, attempt, self.attempts, err, delay
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

fn is_transient(err: &LinkBotError) -> bool {
    err.is_retryable() || matches!(err, LinkBotError::RateLimited { .. })
}

/// Client for OpenAI-compatible chat completion endpoints.
pub struct OpenAiClient {
    client: Client,
    api_key: String,
    model: String,
    endpoint: String,
    retry: RetryPolicy,
}

impl OpenAiClient {
    pub fn new(config: &LlmConfig, timeout: Duration) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| LinkBotError::ConfigError("llm.api_key is not set".to_string()))?;

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LinkBotError::NetworkError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_key,
            model: config.model.clone(),
            endpoint: config.endpoint.clone(),
            retry: RetryPolicy::new(config.retry_attempts, config.retry_backoff, timeout),
        })
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        let auth = format!("Bearer {}", self.api_key.trim());
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&auth).map_err(|_| LinkBotError::ConfigError("invalid LLM API key".to_string()))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    async fn send_once(&self, request: &CompletionRequest) -> Result<String> {
        let body = ChatRequest {
            model: &self.model,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            response_format: request.json_mode.then_some(ResponseFormat { kind: "json_object" }),
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &request.system,
                },
                ChatMessage {
                    role: "user",
                    content: &request.user,
                },
            ],
        };

        debug!("Calling {} with prompt of {} chars", self.model, request.user.len());
        let response = self
            .client
            .post(&self.endpoint)
            .headers(self.headers()?)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() == 429 {
            warn!("LLM endpoint rate limited the request");
            return Err(LinkBotError::RateLimited {
                bucket: "llm-endpoint".to_string(),
                retry_after: Duration::ZERO,
            });
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(LinkBotError::NetworkError(format!("LLM endpoint returned {}: {}", status, text)));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| LinkBotError::ParseError(format!("Failed to parse LLM response: {}", e)))?;

        parsed
            .choices
            .into_iter()
            .find_map(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| LinkBotError::ParseError("LLM returned empty content".to_string()))
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        self.retry.run("LLM completion", || self.send_once(request)).await
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: AssistantMessage,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    content: Option<String>,
}
