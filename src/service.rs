use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::config::ServiceConfig;
use crate::error::{LinkBotError, Result};
use crate::extract::{ExtractionPipeline, ProductRecord};
use crate::minter::{AffiliateLinkRequest, LinkMinter};

const URL_PATTERN: &str = r#"https?://[^\s<>"'`]+"#;

/// Everything the chat formatter needs to answer one message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkReply {
    pub id: Uuid,
    pub source_url: String,
    pub product: Option<ProductRecord>,
    pub extraction_error: Option<String>,
    pub affiliate: AffiliateLinkRequest,
}

impl LinkReply {
    pub fn is_complete(&self) -> bool {
        self.product.is_some() && self.affiliate.result_link.is_some()
    }
}

/// Turns chat messages into product records plus affiliate links.
pub struct LinkService {
    pipeline: Arc<ExtractionPipeline>,
    minter: Arc<LinkMinter>,
    excluded_hosts: Vec<String>,
    permits: Arc<Semaphore>,
    url_pattern: Regex,
}

impl LinkService {
    pub fn new(pipeline: Arc<ExtractionPipeline>, minter: Arc<LinkMinter>, config: &ServiceConfig) -> Result<Self> {
        if config.max_concurrent_requests == 0 {
            return Err(LinkBotError::ConfigError(
                "service.max_concurrent_requests must be greater than 0".to_string(),
            ));
        }
        let url_pattern = Regex::new(URL_PATTERN)
            .map_err(|e| LinkBotError::ConfigError(format!("Invalid URL pattern: {}", e)))?;

        Ok(Self {
            pipeline,
            minter,
            excluded_hosts: config
                .excluded_hosts
                .iter()
                .map(|host| host.trim().trim_start_matches("www.").to_lowercase())
                .collect(),
            permits: Arc::new(Semaphore::new(config.max_concurrent_requests)),
            url_pattern,
        })
    }

    /// First http(s) link in `message` that is not already an affiliate link.
    pub fn find_product_url(&self, message: &str) -> Option<Url> {
        let candidate = self.url_pattern.find(message)?;
        let raw = candidate
            .as_str()
            .trim_end_matches(|c: char| matches!(c, '.' | ',' | ';' | ':' | '!' | '?' | ')' | ']' | '>'));

        let url = Url::parse(raw).ok()?;
        let host = url.host_str()?.to_lowercase();
        if self.is_excluded(&host) {
            debug!("Ignoring link to excluded host {}", host);
            return None;
        }
        Some(url)
    }

    fn is_excluded(&self, host: &str) -> bool {
        let host = host.trim_start_matches("www.");
        self.excluded_hosts
            .iter()
            .any(|excluded| host == excluded || host.ends_with(&format!(".{}", excluded)))
    }

    /// `Ok(None)` when the message carries no product link.
    pub async fn handle_message(&self, message: &str) -> Result<Option<LinkReply>> {
        let Some(url) = self.find_product_url(message) else {
            return Ok(None);
        };
        self.process_url(url).await.map(Some)
    }

    pub async fn process_url(&self, url: Url) -> Result<LinkReply> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| LinkBotError::ConfigError(format!("Request limiter closed: {}", e)))?;

        let source_url = url.to_string();
        info!("Processing {}", source_url);

        let (extraction, mint) = tokio::join!(self.pipeline.extract(&source_url), self.minter.mint(&source_url));

        let (product, extraction_error) = match extraction {
            Ok(record) => (Some(record), None),
            Err(e) => {
                warn!("Extraction failed for {}: {}", source_url, e);
                (None, Some(e.to_string()))
            }
        };
        let affiliate = match mint {
            Ok(request) => request,
            Err(e) => {
                warn!("Minting failed for {}: {}", source_url, e);
                AffiliateLinkRequest::pending(source_url.as_str(), self.minter.session().profile_id()).fail(&e)
            }
        };

        Ok(LinkReply {
            id: Uuid::new_v4(),
            source_url,
            product,
            extraction_error,
            affiliate,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    use crate::extract::{Confidence, ExtractionAttempt, Extractor, Price, ProductFields, Stage, StageContext};
    use crate::minter::MintStatus;
    use crate::profiles::SiteProfileStore;
    use crate::session::testing::FakeDashboard;
    use crate::session::{Credentials, FileSessionStore, LoginPolicy, SessionManager};

    struct StaticExtractor {
        fields: ProductFields,
    }

    #[async_trait]
    impl Extractor for StaticExtractor {
        fn stage(&self) -> Stage {
            Stage::BrowserScrape
        }

        fn timeout(&self) -> Duration {
            Duration::from_secs(1)
        }

        async fn attempt(&self, _ctx: &StageContext) -> Result<ExtractionAttempt> {
            Ok(ExtractionAttempt::from_fields(
                Stage::BrowserScrape,
                self.fields.clone(),
                Confidence::High,
                false,
            ))
        }
    }

    fn service(fields: ProductFields, dashboard: FakeDashboard) -> (LinkService, TempDir) {
        let temp_dir = tempdir().unwrap();
        let pipeline = ExtractionPipeline::new(
            vec![Arc::new(StaticExtractor { fields })],
            Arc::new(SiteProfileStore::default()),
            Duration::from_secs(2),
        );
        let session = SessionManager::new(
            "creator",
            Box::new(dashboard),
            Arc::new(FileSessionStore::new(temp_dir.path())),
            Credentials::new("creator@example.com", "hunter2"),
            LoginPolicy {
                attempts: 1,
                backoff: Duration::from_millis(1),
                timeout: Duration::from_secs(1),
            },
        );
        let minter = LinkMinter::new(Arc::new(session), Duration::from_secs(1));
        let service = LinkService::new(Arc::new(pipeline), Arc::new(minter), &ServiceConfig::default()).unwrap();
        (service, temp_dir)
    }

    fn lamp() -> ProductFields {
        ProductFields {
            title: Some("Brass Desk Lamp".to_string()),
            original_price: Price::parse("59.99"),
            sale_price: Price::parse("39.99"),
            currency: Some("USD".to_string()),
            image_url: None,
        }
    }

    #[test]
    fn test_find_product_url_skips_affiliate_hosts_and_punctuation() {
        let (dashboard, _log) = FakeDashboard::new();
        let (service, _dir) = service(lamp(), dashboard);

        let url = service
            .find_product_url("look at this (https://shop.test/p/lamp?ref=chat).")
            .unwrap();
        assert_eq!(url.as_str(), "https://shop.test/p/lamp?ref=chat");

        assert!(service.find_product_url("https://mavely.app.link/e/AbCdEfGhIjK").is_none());
        assert!(service.find_product_url("https://www.joinmavely.com/x9Y8z7").is_none());
        assert!(service.find_product_url("no links here").is_none());
    }

    #[tokio::test]
    async fn test_handle_message_combines_record_and_link() {
        let (dashboard, log) = FakeDashboard::new();
        let (service, _dir) = service(lamp(), dashboard);

        let reply = service
            .handle_message("deal! https://shop.test/p/lamp")
            .await
            .unwrap()
            .unwrap();

        assert!(reply.is_complete());
        let product = reply.product.unwrap();
        assert_eq!(product.title.as_deref(), Some("Brass Desk Lamp"));
        assert_eq!(product.discount_percent(), Some(33));
        assert_eq!(reply.affiliate.status, MintStatus::Success);
        assert_eq!(log.submissions(), vec!["https://shop.test/p/lamp".to_string()]);
    }

    #[tokio::test]
    async fn test_failures_are_reported_per_half() {
        let (dashboard, _log) = FakeDashboard::new();
        let dashboard =
            dashboard.with_login_results(vec![Err(LinkBotError::InvalidCredentials("rejected".to_string()))]);
        let (service, _dir) = service(ProductFields::default(), dashboard);

        let reply = service.process_url(Url::parse("https://shop.test/p/empty").unwrap()).await.unwrap();

        assert!(reply.product.is_none());
        assert!(reply.extraction_error.unwrap().contains("Extraction failed"));
        assert_eq!(reply.affiliate.status, MintStatus::Failed);
        assert_eq!(reply.affiliate.session_ref, "creator");
        assert!(reply.affiliate.error.unwrap().contains("credentials"));
    }

    #[tokio::test]
    async fn test_message_without_link_is_ignored() {
        let (dashboard, log) = FakeDashboard::new();
        let (service, _dir) = service(lamp(), dashboard);

        assert!(service.handle_message("good morning").await.unwrap().is_none());
        assert!(log.submissions().is_empty());
    }
}
