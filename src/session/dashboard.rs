use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::network::{ClearBrowserCookiesParams, CookieParam};
use chromiumoxide::page::Page;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::browser::{BrowserManager, ScopedPage};
use crate::config::DashboardConfig;
use crate::error::{LinkBotError, Result};
use crate::session::store::SessionBlob;
use crate::session::{Credentials, DashboardDriver, MintOutcome};

const LINK_INPUT_SELECTORS: &[&str] = &[
    "input[placeholder*='Enter URL']",
    "input[aria-label*='Enter URL']",
    "input[name='url']",
    "input[type='url']",
    "header input",
];

const EMAIL_SELECTORS: &[&str] = &[
    "input[name='email']",
    "input[type='email']",
    "input#email",
    "input[autocomplete='username']",
];

const PASSWORD_SELECTORS: &[&str] = &[
    "input[name='password']",
    "input[type='password']",
    "input#password",
    "input[autocomplete='current-password']",
];

const SUBMIT_SELECTORS: &[&str] = &["button[type='submit']", "form button"];

const MODAL_CLOSE_SELECTORS: &[&str] = &[
    "button[aria-label='Close']",
    "[role='dialog'] button[aria-label*='close' i]",
    "button[aria-label*='dismiss' i]",
    "[data-testid='close-button']",
];

/// Phrases the login form shows when it rejects the credentials.
const REJECTION_MARKERS: &[&str] = &[
    "invalid email or password",
    "incorrect password",
    "incorrect email",
    "invalid credentials",
    "wrong password",
];

/// Cookie fields accepted back by `Network.setCookies`.
const COOKIE_FIELDS: &[&str] = &["name", "value", "domain", "path", "secure", "httpOnly", "sameSite", "expires"];

const POLL_INTERVAL: Duration = Duration::from_millis(500);
const INDICATOR_WAIT: Duration = Duration::from_secs(8);
const REDIRECT_WAIT: Duration = Duration::from_secs(30);
const MODAL_POLLS: u32 = 10;

/// Drives the creator dashboard through a dedicated Chromium tab.
pub struct ChromiumDashboard {
    browser: Arc<BrowserManager>,
    page: Option<ScopedPage>,
    home_url: String,
    login_url: String,
    link_patterns: Vec<Regex>,
}

impl ChromiumDashboard {
    pub fn new(browser: Arc<BrowserManager>, config: &DashboardConfig) -> Result<Self> {
        let link_patterns = config
            .affiliate_link_patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern)
                    .map_err(|e| LinkBotError::ConfigError(format!("Invalid affiliate link pattern '{}': {}", pattern, e)))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            browser,
            page: None,
            home_url: config.home_url.clone(),
            login_url: config.login_url.clone(),
            link_patterns,
        })
    }

    async fn page(&mut self) -> Result<&Page> {
        if self.page.is_none() {
            let scoped = self.browser.open_page().await?;
            info!("Opened dashboard page {}", scoped.id());
            self.page = Some(scoped);
        }
        match &self.page {
            Some(scoped) => scoped.page(),
            None => Err(LinkBotError::BrowserError("Dashboard page unavailable".to_string())),
        }
    }

    async fn navigate(&mut self, url: &str) -> Result<()> {
        let page = self.page().await?;
        page.goto(url).await?;
        page.wait_for_navigation().await?;
        Ok(())
    }

    async fn current_url(&mut self) -> Result<String> {
        Ok(self.page().await?.url().await?.unwrap_or_default())
    }

    async fn on_login_page(&mut self) -> Result<bool> {
        let url = self.current_url().await?;
        Ok(is_login_url(&url, &self.login_url))
    }

    /// First selector present on the page, polling until `wait` runs out.
    async fn wait_for_any(&mut self, selectors: &[&str], wait: Duration) -> Result<Option<String>> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let page = self.page().await?;
            for selector in selectors {
                if page.find_element(*selector).await.is_ok() {
                    return Ok(Some(selector.to_string()));
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn fill(&mut self, selector: &str, value: &str) -> Result<()> {
        let page = self.page().await?;
        let element = page.find_element(selector).await?;
        element.click().await?;
        page.evaluate(format!(
            "(() => {{ const el = document.querySelector({}); if (el) {{ el.value = ''; }} }})()",
            js_string(selector)
        ))
        .await?;
        element.type_str(value).await?;
        Ok(())
    }

    async fn body_text(&mut self) -> Result<String> {
        let value = self
            .page()
            .await?
            .evaluate("document.body ? document.body.innerText : ''")
            .await?;
        Ok(value.into_value::<String>().unwrap_or_default())
    }

    async fn dismiss_modals(&mut self) -> Result<()> {
        let page = self.page().await?;
        for selector in MODAL_CLOSE_SELECTORS {
            if let Ok(button) = page.find_element(*selector).await {
                debug!("Dismissing dashboard modal via {}", selector);
                if let Err(e) = button.click().await {
                    debug!("Modal close button {} not clickable: {}", selector, e);
                }
            }
        }
        Ok(())
    }

    /// Text and link targets of any open dialog.
    async fn dialog_contents(&mut self) -> Result<Option<String>> {
        let value = self
            .page()
            .await?
            .evaluate(
                r#"(() => {
                    const dialog = document.querySelector("[role='dialog']");
                    if (!dialog) { return null; }
                    const hrefs = Array.from(dialog.querySelectorAll('a[href]')).map(a => a.href);
                    const fields = Array.from(dialog.querySelectorAll('input')).map(i => i.value);
                    return [dialog.innerText, ...hrefs, ...fields].join('\n');
                })()"#,
            )
            .await?;
        Ok(value.into_value::<Option<String>>().unwrap_or(None))
    }

    fn find_link(&self, text: &str) -> Option<String> {
        find_affiliate_link(&self.link_patterns, text)
    }
}

#[async_trait]
impl DashboardDriver for ChromiumDashboard {
    async fn restore_state(&mut self, blob: &SessionBlob) -> Result<()> {
        let cookies = cookie_params(&blob.payload)?;
        let count = cookies.len();
        self.page().await?.set_cookies(cookies).await?;
        debug!("Restored {} dashboard cookies", count);
        Ok(())
    }

    async fn export_state(&mut self) -> Result<serde_json::Value> {
        let cookies = self.page().await?.get_cookies().await?;
        debug!("Exporting {} dashboard cookies", cookies.len());
        Ok(serde_json::to_value(cookies)?)
    }

    async fn check_logged_in(&mut self) -> Result<bool> {
        let home_url = self.home_url.clone();
        self.navigate(&home_url).await?;
        if self.on_login_page().await? {
            return Ok(false);
        }
        Ok(self.wait_for_any(LINK_INPUT_SELECTORS, INDICATOR_WAIT).await?.is_some())
    }

    async fn login(&mut self, credentials: &Credentials) -> Result<()> {
        if !credentials.is_complete() {
            return Err(LinkBotError::InvalidCredentials(
                "dashboard email or password not configured".to_string(),
            ));
        }

        let login_url = self.login_url.clone();
        self.navigate(&login_url).await?;

        let email_field = self
            .wait_for_any(EMAIL_SELECTORS, INDICATOR_WAIT)
            .await?
            .ok_or_else(|| LinkBotError::BrowserError("Could not locate the dashboard email field".to_string()))?;
        self.fill(&email_field, &credentials.email).await?;

        let password_field = self
            .wait_for_any(PASSWORD_SELECTORS, INDICATOR_WAIT)
            .await?
            .ok_or_else(|| LinkBotError::BrowserError("Could not locate the dashboard password field".to_string()))?;
        self.fill(&password_field, &credentials.password).await?;

        let submit = self
            .wait_for_any(SUBMIT_SELECTORS, POLL_INTERVAL)
            .await?
            .ok_or_else(|| LinkBotError::BrowserError("Could not locate the dashboard login button".to_string()))?;
        self.page().await?.find_element(submit.as_str()).await?.click().await?;

        let deadline = tokio::time::Instant::now() + REDIRECT_WAIT;
        while tokio::time::Instant::now() < deadline {
            tokio::time::sleep(POLL_INTERVAL).await;
            if !self.on_login_page().await? {
                info!("Dashboard login redirected away from the login page");
                return Ok(());
            }
            let text = self.body_text().await?.to_lowercase();
            if let Some(marker) = REJECTION_MARKERS.iter().find(|m| text.contains(**m)) {
                return Err(LinkBotError::InvalidCredentials(format!("dashboard reported '{}'", marker)));
            }
        }

        Err(LinkBotError::LoginTimeout(format!(
            "still on the login page after {:?}",
            REDIRECT_WAIT
        )))
    }

    async fn reset(&mut self) -> Result<()> {
        if let Some(scoped) = self.page.as_ref() {
            let page = scoped.page()?;
            page.execute(ClearBrowserCookiesParams::default()).await?;
            page.goto("about:blank").await?;
        }
        Ok(())
    }

    async fn submit_link(&mut self, product_url: &str) -> Result<MintOutcome> {
        let home_url = self.home_url.clone();
        self.navigate(&home_url).await?;
        if self.on_login_page().await? {
            return Ok(MintOutcome::LoggedOut);
        }

        self.dismiss_modals().await?;
        let input = match self.wait_for_any(LINK_INPUT_SELECTORS, INDICATOR_WAIT).await? {
            Some(selector) => selector,
            None => {
                if self.on_login_page().await? {
                    return Ok(MintOutcome::LoggedOut);
                }
                return Err(LinkBotError::BrowserError(
                    "Could not find the dashboard link creation field".to_string(),
                ));
            }
        };

        self.fill(&input, product_url).await?;
        self.page().await?.find_element(input.as_str()).await?.press_key("Enter").await?;
        debug!("Submitted {} to the dashboard", product_url);

        for poll in 1..=MODAL_POLLS {
            tokio::time::sleep(Duration::from_secs(1)).await;
            if let Some(contents) = self.dialog_contents().await? {
                if let Some(link) = self.find_link(&contents) {
                    info!("Dashboard minted {} after {} polls", link, poll);
                    return Ok(MintOutcome::Minted(link));
                }
            }
            if self.on_login_page().await? {
                return Ok(MintOutcome::LoggedOut);
            }
        }

        let text = self.body_text().await?;
        if let Some(link) = self.find_link(&text) {
            return Ok(MintOutcome::Minted(link));
        }

        warn!("No affiliate link appeared for {}", product_url);
        Err(LinkBotError::BrowserError(
            "Dashboard did not return an affiliate link".to_string(),
        ))
    }
}

fn is_login_url(url: &str, login_url: &str) -> bool {
    url.starts_with(login_url) || url.to_lowercase().contains("/login")
}

/// First affiliate link in `text` matching any pattern, in pattern order.
pub fn find_affiliate_link(patterns: &[Regex], text: &str) -> Option<String> {
    patterns
        .iter()
        .find_map(|pattern| pattern.find(text))
        .map(|m| m.as_str().trim_end_matches(|c: char| c == '.' || c == ',' || c == ')').to_string())
}

fn js_string(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}

/// Turns exported cookies back into `Network.setCookies` parameters.
fn cookie_params(payload: &serde_json::Value) -> Result<Vec<CookieParam>> {
    let cookies = payload
        .as_array()
        .ok_or_else(|| LinkBotError::SessionUnavailable("persisted cookies are not a list".to_string()))?;

    cookies
        .iter()
        .map(|cookie| {
            let object = cookie
                .as_object()
                .ok_or_else(|| LinkBotError::SessionUnavailable("persisted cookie is not an object".to_string()))?;
            let session_cookie = object.get("session").and_then(|v| v.as_bool()).unwrap_or(false);

            let mut kept = serde_json::Map::new();
            for field in COOKIE_FIELDS {
                if *field == "expires" && session_cookie {
                    continue;
                }
                if let Some(value) = object.get(*field) {
                    kept.insert(field.to_string(), value.clone());
                }
            }
            serde_json::from_value(serde_json::Value::Object(kept))
                .map_err(|e| LinkBotError::SessionUnavailable(format!("unreadable persisted cookie: {}", e)))
        })
        .collect()
}
