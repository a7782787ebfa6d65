use anyhow::Context;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use affiliate_linkbot::browser::{BrowserManager, PageRenderer};
use affiliate_linkbot::clock::{Clock, SystemClock};
use affiliate_linkbot::config::{Config, ConfigManager, FileConfigManager};
use affiliate_linkbot::diagnostics::JsonFileSink;
use affiliate_linkbot::extract::ExtractionPipeline;
use affiliate_linkbot::llm::{LlmClient, OpenAiClient};
use affiliate_linkbot::minter::LinkMinter;
use affiliate_linkbot::profiles::SiteProfileStore;
use affiliate_linkbot::service::LinkService;
use affiliate_linkbot::session::{ChromiumDashboard, Credentials, FileSessionStore, LoginPolicy, SessionManager};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries replies, logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("linkbot.toml"));
    let config = FileConfigManager::new(config_path.clone())
        .load_config()
        .await
        .with_context(|| format!("loading configuration from {}", config_path.display()))?;

    info!("Starting affiliate link bot");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let browser = Arc::new(
        BrowserManager::launch(config.stealth.clone(), config.extraction.page_settle)
            .await
            .context("launching browser")?,
    );

    let pipeline = Arc::new(build_pipeline(&config, browser.clone(), clock.clone())?);
    info!("Extraction stages: {:?}", pipeline.stages());

    let dashboard = ChromiumDashboard::new(browser.clone(), &config.dashboard)?;
    let session = Arc::new(
        SessionManager::new(
            config.dashboard.profile_id.clone(),
            Box::new(dashboard),
            Arc::new(FileSessionStore::new(config.dashboard.session_dir.clone())),
            Credentials::new(config.dashboard.email.clone(), config.dashboard.password.clone()),
            LoginPolicy::from_config(&config.dashboard),
        )
        .with_clock(clock.clone()),
    );

    if let Err(e) = session.ensure_authenticated().await {
        error!("Dashboard session not ready, mints will retry on demand: {}", e);
    }
    let (validation_task, validation_shutdown) =
        session.clone().spawn_validation_loop(config.dashboard.validation_interval);

    let minter = Arc::new(LinkMinter::new(session.clone(), config.dashboard.mint_timeout));
    let service = Arc::new(LinkService::new(pipeline, minter, &config.service)?);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut requests = JoinSet::new();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received interrupt, shutting down");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line.context("reading stdin")? else {
                    info!("Input closed, finishing in-flight requests");
                    break;
                };
                let service = service.clone();
                requests.spawn(async move {
                    match service.handle_message(&line).await {
                        Ok(Some(reply)) => match serde_json::to_string(&reply) {
                            Ok(json) => println!("{}", json),
                            Err(e) => error!("Failed to encode reply: {}", e),
                        },
                        Ok(None) => debug!("No product link in message"),
                        Err(e) => error!("Failed to handle message: {}", e),
                    }
                });
            }
        }
    }

    while let Some(joined) = requests.join_next().await {
        if let Err(e) = joined {
            warn!("Request task ended abnormally: {}", e);
        }
    }

    let _ = validation_shutdown.send(()).await;
    if let Err(e) = validation_task.await {
        warn!("Validation task ended abnormally: {}", e);
    }
    if let Err(e) = session.checkpoint().await {
        warn!("Failed to persist session on shutdown: {}", e);
    }
    browser.shutdown().await?;

    info!("Affiliate link bot stopped");
    Ok(())
}

fn build_pipeline(config: &Config, browser: Arc<BrowserManager>, clock: Arc<dyn Clock>) -> anyhow::Result<ExtractionPipeline> {
    let profiles = Arc::new(
        SiteProfileStore::load(&config.extraction.site_profiles)
            .with_context(|| format!("loading site profiles from {}", config.extraction.site_profiles.display()))?,
    );
    info!("Loaded {} site profiles", profiles.len());

    let llm: Option<Arc<dyn LlmClient>> = if config.llm.is_configured() {
        Some(Arc::new(OpenAiClient::new(&config.llm, config.extraction.llm_timeout)?))
    } else {
        None
    };

    let renderer: Arc<dyn PageRenderer> = browser;
    let mut pipeline = ExtractionPipeline::from_config(config, renderer, llm, profiles, clock)?;
    if config.diagnostics.enabled {
        info!("Writing extraction artifacts to {}", config.diagnostics.directory.display());
        pipeline = pipeline.with_sink(Arc::new(JsonFileSink::new(config.diagnostics.directory.clone())));
    }
    Ok(pipeline)
}
