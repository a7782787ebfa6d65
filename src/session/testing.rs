//! Scriptable in-memory dashboard shared by the session and minter tests.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{LinkBotError, Result};
use crate::session::store::SessionBlob;
use crate::session::{Credentials, DashboardDriver, MintOutcome};

pub(crate) enum MintStep {
    Link(String),
    LoggedOut,
    Hang,
    Fail(LinkBotError),
}

#[derive(Default)]
pub(crate) struct DriverLog {
    pub logins: AtomicUsize,
    pub restores: AtomicUsize,
    pub resets: AtomicUsize,
    pub checks: AtomicUsize,
    pub logged_in: AtomicBool,
    pub submissions: Mutex<Vec<String>>,
}

impl DriverLog {
    pub fn logins(&self) -> usize {
        self.logins.load(Ordering::SeqCst)
    }

    pub fn checks(&self) -> usize {
        self.checks.load(Ordering::SeqCst)
    }

    pub fn log_out(&self) {
        self.logged_in.store(false, Ordering::SeqCst);
    }

    pub fn submissions(&self) -> Vec<String> {
        self.submissions.lock().unwrap().clone()
    }
}

pub(crate) struct FakeDashboard {
    log: Arc<DriverLog>,
    login_results: VecDeque<Result<()>>,
    login_delay: Duration,
    restore_valid: bool,
    check_results: VecDeque<Result<()>>,
    mint_steps: VecDeque<MintStep>,
    mint_delay: Duration,
}

impl FakeDashboard {
    pub fn new() -> (Self, Arc<DriverLog>) {
        let log = Arc::new(DriverLog::default());
        let driver = Self {
            log: log.clone(),
            login_results: VecDeque::new(),
            login_delay: Duration::ZERO,
            restore_valid: false,
            check_results: VecDeque::new(),
            mint_steps: VecDeque::new(),
            mint_delay: Duration::ZERO,
        };
        (driver, log)
    }

    pub fn with_login_results(mut self, results: Vec<Result<()>>) -> Self {
        self.login_results = results.into();
        self
    }

    pub fn with_login_delay(mut self, delay: Duration) -> Self {
        self.login_delay = delay;
        self
    }

    pub fn with_valid_restore(mut self) -> Self {
        self.restore_valid = true;
        self
    }

    /// Per-call check outcomes; `Ok` means "report the real login state".
    pub fn with_check_results(mut self, results: Vec<Result<()>>) -> Self {
        self.check_results = results.into();
        self
    }

    pub fn with_mint_steps(mut self, steps: Vec<MintStep>) -> Self {
        self.mint_steps = steps.into();
        self
    }

    pub fn with_mint_delay(mut self, delay: Duration) -> Self {
        self.mint_delay = delay;
        self
    }
}

#[async_trait]
impl DashboardDriver for FakeDashboard {
    async fn restore_state(&mut self, _blob: &SessionBlob) -> Result<()> {
        self.log.restores.fetch_add(1, Ordering::SeqCst);
        if self.restore_valid {
            self.log.logged_in.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn export_state(&mut self) -> Result<serde_json::Value> {
        Ok(serde_json::json!([{"name": "sid", "value": "fake"}]))
    }

    async fn check_logged_in(&mut self) -> Result<bool> {
        self.log.checks.fetch_add(1, Ordering::SeqCst);
        if let Some(Err(e)) = self.check_results.pop_front() {
            return Err(e);
        }
        Ok(self.log.logged_in.load(Ordering::SeqCst))
    }

    async fn login(&mut self, _credentials: &Credentials) -> Result<()> {
        self.log.logins.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.login_delay).await;
        let result = self.login_results.pop_front().unwrap_or(Ok(()));
        if result.is_ok() {
            self.log.logged_in.store(true, Ordering::SeqCst);
        }
        result
    }

    async fn reset(&mut self) -> Result<()> {
        self.log.resets.fetch_add(1, Ordering::SeqCst);
        self.log.log_out();
        Ok(())
    }

    async fn submit_link(&mut self, product_url: &str) -> Result<MintOutcome> {
        let sequence = {
            let mut submissions = self.log.submissions.lock().unwrap();
            submissions.push(product_url.to_string());
            submissions.len()
        };
        tokio::time::sleep(self.mint_delay).await;

        match self.mint_steps.pop_front() {
            None => Ok(MintOutcome::Minted(format!("https://mavely.app.link/e/link{:07}", sequence))),
            Some(MintStep::Link(link)) => Ok(MintOutcome::Minted(link)),
            Some(MintStep::LoggedOut) => {
                self.log.log_out();
                Ok(MintOutcome::LoggedOut)
            }
            Some(MintStep::Hang) => {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Err(LinkBotError::BrowserError("hung submission resumed".to_string()))
            }
            Some(MintStep::Fail(err)) => Err(err),
        }
    }
}
