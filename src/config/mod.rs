use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{LinkBotError, Result};

/// Prefix for environment overrides, e.g. `LINKBOT__DASHBOARD__PASSWORD`.
pub const ENV_PREFIX: &str = "LINKBOT";

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub extraction: ExtractionConfig,
    pub llm: LlmConfig,
    pub dashboard: DashboardConfig,
    pub stealth: StealthConfig,
    pub diagnostics: DiagnosticsConfig,
    pub service: ServiceConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ExtractionConfig {
    pub site_profiles: PathBuf,
    #[serde(with = "humantime_serde")]
    pub pipeline_deadline: Duration,
    #[serde(with = "humantime_serde")]
    pub browser_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub http_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub llm_timeout: Duration,
    /// Time given to client-side rendering after navigation.
    #[serde(with = "humantime_serde")]
    pub page_settle: Duration,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LlmConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub endpoint: String,
    pub max_calls_per_window: u32,
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    pub max_in_flight: usize,
    pub max_page_chars: usize,
    /// Tries per completion, counting the first; transient failures only.
    pub retry_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub retry_backoff: Duration,
    /// Refetch blocked or near-empty pages through a reader proxy before prompting.
    pub reader_fallback: bool,
    /// Prefix the product URL is appended to.
    pub reader_proxy: String,
    #[serde(with = "humantime_serde")]
    pub reader_timeout: Duration,
    /// Captures shorter than this (in chars) count as near-empty.
    pub reader_min_chars: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DashboardConfig {
    pub home_url: String,
    pub login_url: String,
    pub email: String,
    pub password: String,
    pub profile_id: String,
    pub session_dir: PathBuf,
    pub affiliate_link_patterns: Vec<String>,
    #[serde(with = "humantime_serde")]
    pub login_timeout: Duration,
    pub login_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub login_backoff: Duration,
    #[serde(with = "humantime_serde")]
    pub mint_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub validation_interval: Duration,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StealthConfig {
    pub headless: bool,
    pub randomize_user_agents: bool,
    pub fingerprint_randomization: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DiagnosticsConfig {
    pub enabled: bool,
    pub directory: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub max_concurrent_requests: usize,
    pub excluded_hosts: Vec<String>,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            site_profiles: PathBuf::from("site-profiles.json"),
            pipeline_deadline: Duration::from_secs(60),
            browser_timeout: Duration::from_secs(30),
            http_timeout: Duration::from_secs(15),
            llm_timeout: Duration::from_secs(20),
            page_settle: Duration::from_secs(3),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            max_calls_per_window: 10,
            window: Duration::from_secs(60),
            max_in_flight: 2,
            max_page_chars: 4000,
            retry_attempts: 3,
            retry_backoff: Duration::from_secs(1),
            reader_fallback: true,
            reader_proxy: "https://r.jina.ai/".to_string(),
            reader_timeout: Duration::from_secs(10),
            reader_min_chars: 200,
        }
    }
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            home_url: "https://creators.mave.ly/home".to_string(),
            login_url: "https://creators.mave.ly/login".to_string(),
            email: String::new(),
            password: String::new(),
            profile_id: "dashboard-default".to_string(),
            session_dir: PathBuf::from(".linkbot-session"),
            affiliate_link_patterns: vec![
                r"https://mavely\.app\.link/e/[A-Za-z0-9]+".to_string(),
                r"https://[^\s]*joinmavely\.com/[A-Za-z0-9]+".to_string(),
            ],
            login_timeout: Duration::from_secs(45),
            login_attempts: 3,
            login_backoff: Duration::from_secs(2),
            mint_timeout: Duration::from_secs(45),
            validation_interval: Duration::from_secs(600),
        }
    }
}

impl Default for StealthConfig {
    fn default() -> Self {
        Self {
            headless: true,
            randomize_user_agents: true,
            fingerprint_randomization: true,
        }
    }
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            directory: PathBuf::from("debug-artifacts"),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 2,
            excluded_hosts: vec![
                "mavely.app.link".to_string(),
                "joinmavely.com".to_string(),
            ],
        }
    }
}

impl LlmConfig {
    pub fn is_configured(&self) -> bool {
        self.api_key
            .as_deref()
            .map(|key| !key.trim().is_empty())
            .unwrap_or(false)
    }
}

#[async_trait::async_trait]
pub trait ConfigManager {
    async fn load_config(&self) -> Result<Config>;
    async fn save_config(&self, config: &Config) -> Result<()>;
    fn validate_config(&self, config: &Config) -> Result<()>;
}

pub struct FileConfigManager {
    config_path: PathBuf,
    env_prefix: String,
}

impl FileConfigManager {
    pub fn new(config_path: PathBuf) -> Self {
        Self {
            config_path,
            env_prefix: ENV_PREFIX.to_string(),
        }
    }

    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }
}

#[async_trait::async_trait]
impl ConfigManager for FileConfigManager {
    async fn load_config(&self) -> Result<Config> {
        info!("Loading configuration from {:?}", self.config_path);

        if !self.config_path.exists() {
            warn!("Configuration file not found, creating default config at {:?}", self.config_path);
            self.create_default_config().await?;
        }

        let layered = ::config::Config::builder()
            .add_source(::config::File::from(self.config_path.clone()).format(::config::FileFormat::Toml))
            .add_source(
                ::config::Environment::with_prefix(&self.env_prefix)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;

        let config: Config = layered.try_deserialize()?;

        self.validate_config(&config)?;

        info!("Configuration loaded successfully");
        Ok(config)
    }

    fn validate_config(&self, config: &Config) -> Result<()> {
        debug!("Validating configuration");

        let extraction = &config.extraction;
        for (name, timeout) in [
            ("browser_timeout", extraction.browser_timeout),
            ("http_timeout", extraction.http_timeout),
            ("llm_timeout", extraction.llm_timeout),
        ] {
            if timeout.is_zero() {
                return Err(LinkBotError::ConfigError(format!("{} must be greater than 0", name)));
            }
            if timeout > extraction.pipeline_deadline {
                return Err(LinkBotError::ConfigError(format!(
                    "{} ({:?}) cannot exceed pipeline_deadline ({:?})",
                    name, timeout, extraction.pipeline_deadline
                )));
            }
        }

        if config.llm.max_calls_per_window == 0 {
            return Err(LinkBotError::ConfigError("llm.max_calls_per_window must be greater than 0".to_string()));
        }
        if config.llm.max_in_flight == 0 {
            return Err(LinkBotError::ConfigError("llm.max_in_flight must be greater than 0".to_string()));
        }
        if config.llm.window.is_zero() {
            return Err(LinkBotError::ConfigError("llm.window must be greater than 0".to_string()));
        }
        if config.llm.retry_attempts == 0 || config.llm.retry_attempts > 5 {
            return Err(LinkBotError::ConfigError("llm.retry_attempts must be between 1 and 5".to_string()));
        }
        if config.llm.reader_fallback {
            let proxy = &config.llm.reader_proxy;
            if !proxy.starts_with("http://") && !proxy.starts_with("https://") {
                return Err(LinkBotError::ConfigError(
                    "llm.reader_proxy must start with http:// or https://".to_string(),
                ));
            }
            if config.llm.reader_timeout.is_zero() || config.llm.reader_timeout > extraction.llm_timeout {
                return Err(LinkBotError::ConfigError(
                    "llm.reader_timeout must be greater than 0 and at most extraction.llm_timeout".to_string(),
                ));
            }
        }

        let dashboard = &config.dashboard;
        for (name, value) in [("home_url", &dashboard.home_url), ("login_url", &dashboard.login_url)] {
            if !value.starts_with("http://") && !value.starts_with("https://") {
                return Err(LinkBotError::ConfigError(format!("dashboard.{} must start with http:// or https://", name)));
            }
        }
        if dashboard.profile_id.trim().is_empty() || dashboard.profile_id.contains(['/', '\\']) {
            return Err(LinkBotError::ConfigError(format!(
                "dashboard.profile_id '{}' must be a non-empty file name",
                dashboard.profile_id
            )));
        }
        if dashboard.login_attempts == 0 || dashboard.login_attempts > 10 {
            return Err(LinkBotError::ConfigError("dashboard.login_attempts must be between 1 and 10".to_string()));
        }
        if dashboard.mint_timeout.is_zero() || dashboard.login_timeout.is_zero() {
            return Err(LinkBotError::ConfigError("dashboard timeouts must be greater than 0".to_string()));
        }
        for pattern in &dashboard.affiliate_link_patterns {
            regex::Regex::new(pattern).map_err(|e| {
                LinkBotError::ConfigError(format!("Invalid affiliate link pattern '{}': {}", pattern, e))
            })?;
        }

        if config.service.max_concurrent_requests == 0 {
            return Err(LinkBotError::ConfigError("service.max_concurrent_requests must be greater than 0".to_string()));
        }

        debug!("Configuration validation passed");
        Ok(())
    }

    async fn save_config(&self, config: &Config) -> Result<()> {
        info!("Saving configuration to {:?}", self.config_path);

        let toml_content = toml::to_string_pretty(config)?;
        fs::write(&self.config_path, toml_content)
            .map_err(|e| LinkBotError::ConfigError(format!("Failed to write config file: {}", e)))?;

        info!("Configuration saved successfully");
        Ok(())
    }
}

impl FileConfigManager {
    /// Create a default configuration file
    async fn create_default_config(&self) -> Result<()> {
        let toml_content = toml::to_string_pretty(&Config::default())?;

        if let Some(parent) = self.config_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .map_err(|e| LinkBotError::ConfigError(format!("Failed to create config directory: {}", e)))?;
            }
        }

        fs::write(&self.config_path, toml_content)
            .map_err(|e| LinkBotError::ConfigError(format!("Failed to write default config: {}", e)))?;

        info!("Default configuration file created at {:?}", self.config_path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_load_default_config() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("linkbot.toml");
        let manager = FileConfigManager::new(config_path.clone()).with_env_prefix("LINKBOT_TEST_DEFAULT");

        let config = manager.load_config().await.unwrap();

        assert!(config_path.exists());
        assert_eq!(config.llm.max_calls_per_window, 10);
        assert_eq!(config.extraction.http_timeout, Duration::from_secs(15));
        assert_eq!(config.dashboard.login_attempts, 3);
        assert!(!config.llm.is_configured());
    }

    #[tokio::test]
    async fn test_load_partial_file_with_humantime_values() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("linkbot.toml");
        fs::write(
            &config_path,
            r#"
[extraction]
pipeline_deadline = "90s"
http_timeout = "5s"

[llm]
api_key = "sk-test"
max_calls_per_window = 3
"#,
        )
        .unwrap();
        let manager = FileConfigManager::new(config_path).with_env_prefix("LINKBOT_TEST_PARTIAL");

        let config = manager.load_config().await.unwrap();

        assert_eq!(config.extraction.pipeline_deadline, Duration::from_secs(90));
        assert_eq!(config.extraction.http_timeout, Duration::from_secs(5));
        assert_eq!(config.extraction.browser_timeout, Duration::from_secs(30));
        assert_eq!(config.llm.max_calls_per_window, 3);
        assert!(config.llm.is_configured());
    }

    #[tokio::test]
    async fn test_environment_overrides_file() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("linkbot.toml");
        std::env::set_var("LINKBOT_TEST_ENV__DASHBOARD__EMAIL", "creator@example.com");
        let manager = FileConfigManager::new(config_path).with_env_prefix("LINKBOT_TEST_ENV");

        let config = manager.load_config().await.unwrap();
        std::env::remove_var("LINKBOT_TEST_ENV__DASHBOARD__EMAIL");

        assert_eq!(config.dashboard.email, "creator@example.com");
    }

    #[test]
    fn test_config_validation() {
        let manager = FileConfigManager::new(PathBuf::from("test.toml"));

        let valid_config = Config::default();
        assert!(manager.validate_config(&valid_config).is_ok());

        let mut invalid_config = Config::default();
        invalid_config.llm.max_calls_per_window = 0;
        assert!(manager.validate_config(&invalid_config).is_err());

        let mut invalid_config = Config::default();
        invalid_config.extraction.http_timeout = Duration::from_secs(600);
        assert!(manager.validate_config(&invalid_config).is_err());

        let mut invalid_config = Config::default();
        invalid_config.dashboard.home_url = "creators.example/home".to_string();
        assert!(manager.validate_config(&invalid_config).is_err());

        let mut invalid_config = Config::default();
        invalid_config.dashboard.login_attempts = 0;
        assert!(manager.validate_config(&invalid_config).is_err());

        let mut invalid_config = Config::default();
        invalid_config.dashboard.affiliate_link_patterns = vec!["(unclosed".to_string()];
        assert!(manager.validate_config(&invalid_config).is_err());

        let mut invalid_config = Config::default();
        invalid_config.llm.retry_attempts = 0;
        assert!(manager.validate_config(&invalid_config).is_err());

        let mut invalid_config = Config::default();
        invalid_config.llm.reader_proxy = "r.jina.ai".to_string();
        assert!(manager.validate_config(&invalid_config).is_err());

        let mut disabled_reader = Config::default();
        disabled_reader.llm.reader_fallback = false;
        disabled_reader.llm.reader_proxy = String::new();
        assert!(manager.validate_config(&disabled_reader).is_ok());
    }

    #[tokio::test]
    async fn test_save_then_reload() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("linkbot.toml");
        let manager = FileConfigManager::new(config_path).with_env_prefix("LINKBOT_TEST_SAVE");

        let mut config = Config::default();
        config.service.max_concurrent_requests = 4;
        config.dashboard.mint_timeout = Duration::from_secs(20);
        manager.save_config(&config).await.unwrap();

        let reloaded = manager.load_config().await.unwrap();
        assert_eq!(reloaded.service.max_concurrent_requests, 4);
        assert_eq!(reloaded.dashboard.mint_timeout, Duration::from_secs(20));
    }
}
