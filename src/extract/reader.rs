use async_trait::async_trait;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, USER_AGENT};
use reqwest::Client;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::browser::UserAgentGenerator;
use crate::error::{LinkBotError, Result};

const CONTENT_MARKER: &str = "Markdown Content:";

/// Plain-text rendition of a page from somewhere other than the page itself.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PageTextSource: Send + Sync {
    async fn fetch_text(&self, url: &Url) -> Result<String>;
}

/// Reader service that returns pages as text: `GET <prefix><product url>`.
pub struct ReaderProxy {
    client: Client,
    prefix: String,
    user_agents: UserAgentGenerator,
}

impl ReaderProxy {
    pub fn new(prefix: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LinkBotError::NetworkError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            prefix: prefix.into(),
            user_agents: UserAgentGenerator::new(),
        })
    }

    fn reader_url(&self, url: &Url) -> String {
        format!("{}{}", self.prefix, url)
    }
}

#[async_trait]
impl PageTextSource for ReaderProxy {
    async fn fetch_text(&self, url: &Url) -> Result<String> {
        let profile = self.user_agents.random_profile();
        let response = self
            .client
            .get(self.reader_url(url))
            .header(USER_AGENT, profile.user_agent)
            .header(ACCEPT_LANGUAGE, profile.accept_language)
            .header(ACCEPT, "text/plain")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(LinkBotError::NetworkError(format!("reader proxy returned {} for {}", status, url)));
        }
        let body = response.text().await?;
        debug!("Reader proxy returned {} bytes for {}", body.len(), url);
        Ok(reader_content(&body).to_string())
    }
}

/// Strips the reader's header block, keeping what follows the content marker.
pub fn reader_content(body: &str) -> &str {
    match body.find(CONTENT_MARKER) {
        Some(idx) => body[idx + CONTENT_MARKER.len()..].trim(),
        None => body.trim(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reader_content_skips_header_block() {
        let body = "Title: Desk Lamp\nURL Source: https://shop.test/p/1\n\nMarkdown Content:\n# Desk Lamp\nNow $30\n";
        assert_eq!(reader_content(body), "# Desk Lamp\nNow $30");
    }

    #[test]
    fn test_reader_content_without_marker_is_whole_body() {
        assert_eq!(reader_content("  Desk Lamp $30 \n"), "Desk Lamp $30");
    }

    #[test]
    fn test_reader_url_appends_product_url() {
        let proxy = ReaderProxy::new("https://r.jina.ai/", Duration::from_secs(5)).unwrap();
        let url = Url::parse("https://shop.test/p/1?color=red").unwrap();
        assert_eq!(proxy.reader_url(&url), "https://r.jina.ai/https://shop.test/p/1?color=red");
    }
}
