use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::emulation::{SetDeviceMetricsOverrideParams, SetUserAgentOverrideParams};
use chromiumoxide::cdp::browser_protocol::page::AddScriptToEvaluateOnNewDocumentParams;
use chromiumoxide::page::Page;
use futures::StreamExt;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

use crate::browser::stealth::{generate_stealth_script, FingerprintRandomizer, UserAgentGenerator};
use crate::config::StealthConfig;
use crate::error::{LinkBotError, Result};

const LAUNCH_ATTEMPTS: u32 = 3;
const NEW_PAGE_TIMEOUT: Duration = Duration::from_secs(10);

/// Final state of a rendered page.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedPage {
    pub final_url: String,
    pub title: Option<String>,
    pub html: String,
}

/// Anything that can load a URL with scripts executed and hand back the DOM.
#[async_trait]
pub trait PageRenderer: Send + Sync {
    async fn render(&self, url: &Url, timeout: Duration) -> Result<RenderedPage>;
}

/// A browser tab that is closed on every exit path.
///
/// `close()` closes it in place; dropping it unclosed (error, timeout or a
/// cancelled future) hands the close to a background task.
pub struct ScopedPage {
    id: Uuid,
    page: Option<Page>,
}

impl ScopedPage {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn page(&self) -> Result<&Page> {
        self.page
            .as_ref()
            .ok_or_else(|| LinkBotError::BrowserError(format!("Page {} already closed", self.id)))
    }

    pub async fn close(mut self) -> Result<()> {
        if let Some(page) = self.page.take() {
            page.close()
                .await
                .map_err(|e| LinkBotError::BrowserError(format!("Failed to close page {}: {}", self.id, e)))?;
            debug!("Closed page {}", self.id);
        }
        Ok(())
    }
}

impl Drop for ScopedPage {
    fn drop(&mut self) {
        if let Some(page) = self.page.take() {
            let id = self.id;
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        if let Err(e) = page.close().await {
                            warn!("Failed to close abandoned page {}: {}", id, e);
                        } else {
                            debug!("Closed abandoned page {}", id);
                        }
                    });
                }
                Err(_) => warn!("Page {} dropped outside a runtime, left to browser shutdown", id),
            }
        }
    }
}

/// Owns one headless Chromium process and hands out stealth-configured pages.
pub struct BrowserManager {
    browser: Mutex<Browser>,
    handler_task: JoinHandle<()>,
    stealth: StealthConfig,
    user_agents: UserAgentGenerator,
    fingerprints: FingerprintRandomizer,
    settle: Duration,
}

impl BrowserManager {
    pub async fn launch(stealth: StealthConfig, settle: Duration) -> Result<Self> {
        let (browser, handler_task) = Self::create_browser(&stealth).await?;

        Ok(Self {
            browser: Mutex::new(browser),
            handler_task,
            stealth,
            user_agents: UserAgentGenerator::new(),
            fingerprints: FingerprintRandomizer::new(),
            settle,
        })
    }

    async fn create_browser(stealth: &StealthConfig) -> Result<(Browser, JoinHandle<()>)> {
        info!("Launching browser (headless: {})", stealth.headless);

        // unique profile dir per process avoids singleton lock clashes
        let user_data_dir: PathBuf = std::env::temp_dir().join(format!(
            "affiliate-linkbot-{}-{}",
            std::process::id(),
            Uuid::new_v4()
        ));
        std::fs::create_dir_all(&user_data_dir).map_err(|e| {
            LinkBotError::BrowserError(format!("Failed to create profile dir {:?}: {}", user_data_dir, e))
        })?;

        let mut builder = BrowserConfig::builder()
            .no_sandbox()
            .user_data_dir(&user_data_dir)
            .args(vec![
                "--disable-gpu",
                "--disable-dev-shm-usage",
                "--disable-extensions",
                "--mute-audio",
                "--no-first-run",
                "--disable-default-apps",
                "--disable-sync",
                "--disable-background-timer-throttling",
                "--disable-renderer-backgrounding",
                "--disable-blink-features=AutomationControlled",
                "--log-level=3",
            ]);

        if !stealth.headless {
            builder = builder.with_head();
        }
        if stealth.fingerprint_randomization {
            builder = builder.args(vec!["--disable-canvas-aa", "--disable-2d-canvas-clip-aa"]);
        }

        let browser_config = builder
            .build()
            .map_err(|e| LinkBotError::BrowserError(format!("Failed to create browser config: {}", e)))?;

        let mut last_error = String::new();
        for attempt in 1..=LAUNCH_ATTEMPTS {
            match Browser::launch(browser_config.clone()).await {
                Ok((browser, mut handler)) => {
                    info!("Browser launched on attempt {}", attempt);

                    let handler_task = tokio::spawn(async move {
                        while let Some(event) = handler.next().await {
                            if let Err(e) = event {
                                let message = e.to_string();
                                // chromium emits events chromiumoxide cannot decode
                                if message.contains("data did not match any variant") {
                                    debug!("Ignoring undecodable CDP message: {}", e);
                                } else {
                                    warn!("Browser handler error: {}", e);
                                }
                            }
                        }
                        debug!("Browser handler task ended");
                    });

                    return Ok((browser, handler_task));
                }
                Err(e) => {
                    error!("Browser launch attempt {} failed: {}", attempt, e);
                    last_error = e.to_string();
                    if attempt < LAUNCH_ATTEMPTS {
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        }

        Err(LinkBotError::BrowserError(format!(
            "Failed to launch browser after {} attempts: {}",
            LAUNCH_ATTEMPTS, last_error
        )))
    }

    /// Opens a blank tab with the stealth profile applied.
    pub async fn open_page(&self) -> Result<ScopedPage> {
        let id = Uuid::new_v4();
        let page = {
            let browser = self.browser.lock().await;
            match tokio::time::timeout(NEW_PAGE_TIMEOUT, browser.new_page("about:blank")).await {
                Ok(Ok(page)) => page,
                Ok(Err(e)) => return Err(LinkBotError::BrowserError(format!("Failed to create new page: {}", e))),
                Err(_) => return Err(LinkBotError::BrowserError("Timeout creating new page".to_string())),
            }
        };
        let scoped = ScopedPage { id, page: Some(page) };
        self.apply_stealth(scoped.page()?).await?;

        debug!("Opened page {}", id);
        Ok(scoped)
    }

    async fn apply_stealth(&self, page: &Page) -> Result<()> {
        let profile = if self.stealth.randomize_user_agents {
            self.user_agents.random_chromium_profile()
        } else {
            self.user_agents.default_profile()
        };
        let fingerprint = self.fingerprints.generate_fingerprint(profile);

        if self.stealth.fingerprint_randomization {
            let device_metrics = SetDeviceMetricsOverrideParams::builder()
                .width(fingerprint.viewport.width as i64)
                .height(fingerprint.viewport.height as i64)
                .device_scale_factor(1.0)
                .mobile(false)
                .build()
                .map_err(|e| LinkBotError::BrowserError(format!("Failed to build device metrics: {}", e)))?;
            page.execute(device_metrics).await?;
        }

        let user_agent = SetUserAgentOverrideParams::builder()
            .user_agent(profile.user_agent)
            .accept_language(profile.accept_language)
            .platform(profile.platform)
            .build()
            .map_err(|e| LinkBotError::BrowserError(format!("Failed to build user agent params: {}", e)))?;
        page.execute(user_agent).await?;

        page.execute(AddScriptToEvaluateOnNewDocumentParams::new(generate_stealth_script(&fingerprint)))
            .await?;
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down browser");
        let mut browser = self.browser.lock().await;
        browser.close().await?;
        let _ = browser.wait().await;
        self.handler_task.abort();
        Ok(())
    }
}

#[async_trait]
impl PageRenderer for BrowserManager {
    async fn render(&self, url: &Url, timeout: Duration) -> Result<RenderedPage> {
        let scoped = self.open_page().await?;
        let page = scoped.page()?;

        let loaded = tokio::time::timeout(timeout, async {
            page.goto(url.as_str()).await?;
            page.wait_for_navigation().await?;
            Ok::<_, LinkBotError>(())
        })
        .await;
        match loaded {
            Ok(result) => result?,
            Err(_) => {
                return Err(LinkBotError::BrowserError(format!(
                    "Navigation to {} timed out after {:?}",
                    url, timeout
                )))
            }
        }

        // client-side rendered prices often arrive after the load event
        tokio::time::sleep(self.settle).await;
        let _ = page
            .evaluate("window.scrollTo(0, document.body.scrollHeight / 2)")
            .await;

        let html = page.content().await?;
        let final_url = page.url().await?.unwrap_or_else(|| url.to_string());
        let title = page.get_title().await?;

        scoped.close().await?;
        debug!("Rendered {} ({} bytes)", final_url, html.len());

        Ok(RenderedPage { final_url, title, html })
    }
}
