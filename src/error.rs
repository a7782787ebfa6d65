use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, LinkBotError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LinkBotError {
    #[error("Invalid URL '{0}'")]
    InvalidUrl(String),

    #[error("Extraction failed for {}: {}", .url, .attempts.join("; "))]
    ExtractionFailed { url: String, attempts: Vec<String> },

    #[error("Rate limited on bucket '{bucket}', next slot in {retry_after:?}")]
    RateLimited { bucket: String, retry_after: Duration },

    #[error("Stage {stage} timed out after {timeout:?}")]
    StageTimeout { stage: String, timeout: Duration },

    #[error("Invalid dashboard credentials: {0}")]
    InvalidCredentials(String),

    #[error("Login timed out: {0}")]
    LoginTimeout(String),

    #[error("Session unavailable: {0}")]
    SessionUnavailable(String),

    #[error("Mint timed out for {url} after {timeout:?}")]
    MintTimeout { url: String, timeout: Duration },

    #[error("Mint failed for {url}: {cause}")]
    MintFailed { url: String, cause: String },

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Browser error: {0}")]
    BrowserError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStrategy {
    /// Transient; the same operation may be repeated after a backoff.
    RetryWithBackoff,
    /// Persisted session state is unusable; run an interactive login.
    FullLogin,
    /// Stage-local failure; the pipeline moves on to the next stage.
    NextStage,
    /// Hand the error to the caller.
    Surface,
}

impl LinkBotError {
    pub fn recovery_strategy(&self) -> RecoveryStrategy {
        match self {
            LinkBotError::NetworkError(_) => RecoveryStrategy::RetryWithBackoff,
            LinkBotError::BrowserError(_) => RecoveryStrategy::RetryWithBackoff,
            LinkBotError::LoginTimeout(_) => RecoveryStrategy::RetryWithBackoff,
            LinkBotError::MintTimeout { .. } => RecoveryStrategy::RetryWithBackoff,
            LinkBotError::SessionUnavailable(_) => RecoveryStrategy::FullLogin,
            LinkBotError::RateLimited { .. } => RecoveryStrategy::NextStage,
            LinkBotError::StageTimeout { .. } => RecoveryStrategy::NextStage,
            LinkBotError::ParseError(_) => RecoveryStrategy::NextStage,
            LinkBotError::InvalidUrl(_) => RecoveryStrategy::Surface,
            LinkBotError::ExtractionFailed { .. } => RecoveryStrategy::Surface,
            LinkBotError::InvalidCredentials(_) => RecoveryStrategy::Surface,
            LinkBotError::MintFailed { .. } => RecoveryStrategy::Surface,
            LinkBotError::StorageError(_) => RecoveryStrategy::Surface,
            LinkBotError::ConfigError(_) => RecoveryStrategy::Surface,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.recovery_strategy() == RecoveryStrategy::RetryWithBackoff
    }
}

// Conversion implementations for common error types
impl From<std::io::Error> for LinkBotError {
    fn from(err: std::io::Error) -> Self {
        LinkBotError::StorageError(err.to_string())
    }
}

impl From<serde_json::Error> for LinkBotError {
    fn from(err: serde_json::Error) -> Self {
        LinkBotError::ParseError(err.to_string())
    }
}

impl From<toml::de::Error> for LinkBotError {
    fn from(err: toml::de::Error) -> Self {
        LinkBotError::ConfigError(err.to_string())
    }
}

impl From<toml::ser::Error> for LinkBotError {
    fn from(err: toml::ser::Error) -> Self {
        LinkBotError::ConfigError(err.to_string())
    }
}

impl From<config::ConfigError> for LinkBotError {
    fn from(err: config::ConfigError) -> Self {
        LinkBotError::ConfigError(err.to_string())
    }
}

impl From<reqwest::Error> for LinkBotError {
    fn from(err: reqwest::Error) -> Self {
        LinkBotError::NetworkError(err.to_string())
    }
}

impl From<url::ParseError> for LinkBotError {
    fn from(err: url::ParseError) -> Self {
        LinkBotError::InvalidUrl(err.to_string())
    }
}

impl From<chromiumoxide::error::CdpError> for LinkBotError {
    fn from(err: chromiumoxide::error::CdpError) -> Self {
        LinkBotError::BrowserError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_failures_split_into_retry_and_surface() {
        assert!(LinkBotError::LoginTimeout("slow".into()).is_retryable());
        assert!(!LinkBotError::InvalidCredentials("bad".into()).is_retryable());
        assert_eq!(
            LinkBotError::SessionUnavailable("corrupt".into()).recovery_strategy(),
            RecoveryStrategy::FullLogin
        );
    }

    #[test]
    fn test_extraction_failed_lists_every_attempt() {
        let err = LinkBotError::ExtractionFailed {
            url: "https://shop.test/p/1".into(),
            attempts: vec![
                "browser_scrape: network down".into(),
                "http_fetch: network down".into(),
            ],
        };
        let message = err.to_string();
        assert!(message.contains("browser_scrape: network down"));
        assert!(message.contains("http_fetch: network down"));
    }
}
