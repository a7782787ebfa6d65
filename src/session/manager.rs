use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::DashboardConfig;
use crate::error::{LinkBotError, RecoveryStrategy, Result};
use crate::session::store::{SessionBlob, SessionStore};
use crate::session::{Credentials, DashboardDriver, Session, SessionState};

/// Bounds on one login flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoginPolicy {
    pub attempts: u32,
    /// First backoff; doubled after each failed attempt.
    pub backoff: Duration,
    /// Per-attempt bound.
    pub timeout: Duration,
}

impl LoginPolicy {
    pub fn from_config(config: &DashboardConfig) -> Self {
        Self {
            attempts: config.login_attempts.max(1),
            backoff: config.login_backoff,
            timeout: config.login_timeout,
        }
    }

    fn backoff_after(&self, attempt: u32) -> Duration {
        self.backoff.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

struct SessionInner {
    driver: Box<dyn DashboardDriver>,
    session: Session,
    restore_attempted: bool,
    /// Outcome of the most recent finished auth flow.
    last_failure: Option<LinkBotError>,
    /// Set once the dashboard rejects the credentials; never cleared.
    rejected: Option<LinkBotError>,
}

/// Owns the single authenticated dashboard session.
///
/// All UI work happens while holding one FIFO lock, so at most one login
/// flow runs at a time and mints queue in arrival order.
pub struct SessionManager {
    profile_id: String,
    inner: Mutex<SessionInner>,
    /// Bumped every time an auth flow finishes.
    auth_epoch: AtomicU64,
    store: Arc<dyn SessionStore>,
    credentials: Credentials,
    policy: LoginPolicy,
    clock: Arc<dyn Clock>,
}

impl SessionManager {
    pub fn new(
        profile_id: impl Into<String>,
        driver: Box<dyn DashboardDriver>,
        store: Arc<dyn SessionStore>,
        credentials: Credentials,
        policy: LoginPolicy,
    ) -> Self {
        let profile_id = profile_id.into();
        Self {
            inner: Mutex::new(SessionInner {
                driver,
                session: Session::new(profile_id.clone()),
                restore_attempted: false,
                last_failure: None,
                rejected: None,
            }),
            profile_id,
            auth_epoch: AtomicU64::new(0),
            store,
            credentials,
            policy,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn profile_id(&self) -> &str {
        &self.profile_id
    }

    /// Waits for the session lock. The lease sees auth flows that finished
    /// while it was queued.
    pub async fn lease(&self) -> SessionLease<'_> {
        let observed_epoch = self.auth_epoch.load(Ordering::SeqCst);
        let inner = self.inner.lock().await;
        SessionLease {
            manager: self,
            inner,
            observed_epoch,
        }
    }

    /// Resolves once the session is authenticated or the login flow that
    /// was running on arrival has failed.
    pub async fn ensure_authenticated(&self) -> Result<()> {
        self.lease().await.ensure_authenticated().await
    }

    /// Checks the dashboard and re-authenticates if it logged us out.
    pub async fn validate(&self) -> Result<()> {
        self.lease().await.validate().await
    }

    pub async fn snapshot(&self) -> Session {
        self.inner.lock().await.session.clone()
    }

    pub async fn state(&self) -> SessionState {
        self.snapshot().await.state
    }

    /// Persists the current cookies if the session is authenticated.
    pub async fn checkpoint(&self) -> Result<()> {
        let mut lease = self.lease().await;
        if lease.inner.session.state != SessionState::Authenticated {
            debug!("Skipping checkpoint, session is {:?}", lease.inner.session.state);
            return Ok(());
        }
        self.persist(&mut lease.inner).await
    }

    /// Periodic liveness check. Send on the returned channel to stop it.
    pub fn spawn_validation_loop(self: Arc<Self>, every: Duration) -> (JoinHandle<()>, mpsc::Sender<()>) {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // the first tick fires immediately
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        debug!("Session validation task received shutdown signal");
                        break;
                    }
                    _ = interval.tick() => {
                        match self.validate().await {
                            Ok(()) => debug!("Periodic session validation passed"),
                            Err(e @ LinkBotError::InvalidCredentials(_)) => {
                                error!("Stopping session validation: {}", e);
                                break;
                            }
                            Err(e) => warn!("Periodic session validation failed: {}", e),
                        }
                    }
                }
            }
        });

        (handle, shutdown_tx)
    }

    async fn run_auth_flow(&self, inner: &mut SessionInner) -> Result<()> {
        inner.session.state = SessionState::Authenticating;

        if !inner.restore_attempted {
            inner.restore_attempted = true;
            if self.restore(inner).await? {
                return Ok(());
            }
        }

        self.login(inner).await
    }

    /// True when persisted state alone yields an authenticated session.
    async fn restore(&self, inner: &mut SessionInner) -> Result<bool> {
        let profile_id = inner.session.profile_id.clone();
        let blob = match self.store.load(&profile_id).await {
            Ok(Some(blob)) => blob,
            Ok(None) => {
                info!("No persisted session for '{}', logging in", profile_id);
                return Ok(false);
            }
            Err(e) if e.recovery_strategy() == RecoveryStrategy::FullLogin => {
                warn!("Discarding persisted session for '{}': {}", profile_id, e);
                if let Err(clear_err) = self.store.clear(&profile_id).await {
                    warn!("Failed to clear persisted session: {}", clear_err);
                }
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        let restored = match inner.driver.restore_state(&blob).await {
            Ok(()) => inner.driver.check_logged_in().await,
            Err(e) => Err(e),
        };
        match restored {
            Ok(true) => {
                info!("Restored dashboard session for '{}' saved at {}", profile_id, blob.saved_at);
                self.mark_authenticated(inner);
                Ok(true)
            }
            Ok(false) => {
                info!("Persisted session for '{}' is no longer valid", profile_id);
                inner.driver.reset().await?;
                Ok(false)
            }
            Err(e) => {
                warn!("Failed to restore session for '{}': {}", profile_id, e);
                inner.driver.reset().await?;
                Ok(false)
            }
        }
    }

    async fn login(&self, inner: &mut SessionInner) -> Result<()> {
        let mut last_error = LinkBotError::LoginTimeout("no login attempt made".to_string());

        for attempt in 1..=self.policy.attempts {
            info!("Dashboard login attempt {}/{}", attempt, self.policy.attempts);

            let result = match tokio::time::timeout(self.policy.timeout, inner.driver.login(&self.credentials)).await {
                Ok(result) => result,
                Err(_) => Err(LinkBotError::LoginTimeout(format!(
                    "attempt {} exceeded {:?}",
                    attempt, self.policy.timeout
                ))),
            };
            let result = match result {
                Ok(()) => match inner.driver.check_logged_in().await {
                    Ok(true) => Ok(()),
                    Ok(false) => Err(LinkBotError::LoginTimeout(
                        "dashboard did not show the authenticated view after login".to_string(),
                    )),
                    Err(e) => Err(e),
                },
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => {
                    self.mark_authenticated(inner);
                    if let Err(e) = self.persist(inner).await {
                        warn!("Logged in but failed to persist session: {}", e);
                    }
                    info!("Dashboard login succeeded on attempt {}", attempt);
                    return Ok(());
                }
                Err(e @ LinkBotError::InvalidCredentials(_)) => {
                    error!("Dashboard rejected credentials: {}", e);
                    inner.session.state = SessionState::Failed;
                    inner.rejected = Some(e.clone());
                    return Err(e);
                }
                Err(e) if e.is_retryable() => {
                    warn!("Login attempt {} failed: {}", attempt, e);
                    last_error = e;
                    if attempt < self.policy.attempts {
                        tokio::time::sleep(self.policy.backoff_after(attempt)).await;
                    }
                }
                Err(e) => {
                    inner.session.state = SessionState::Failed;
                    return Err(e);
                }
            }
        }

        inner.session.state = SessionState::Failed;
        Err(match last_error {
            LinkBotError::LoginTimeout(reason) => LinkBotError::LoginTimeout(format!(
                "gave up after {} attempts: {}",
                self.policy.attempts, reason
            )),
            other => other,
        })
    }

    fn mark_authenticated(&self, inner: &mut SessionInner) {
        inner.session.state = SessionState::Authenticated;
        inner.session.last_validated_at = Some(self.clock.now());
    }

    async fn persist(&self, inner: &mut SessionInner) -> Result<()> {
        let payload = inner.driver.export_state().await?;
        let blob = SessionBlob {
            profile_id: inner.session.profile_id.clone(),
            saved_at: self.clock.now(),
            payload,
        };
        self.store.save(&blob).await
    }
}

/// Exclusive access to the session and its dashboard driver.
pub struct SessionLease<'a> {
    manager: &'a SessionManager,
    inner: MutexGuard<'a, SessionInner>,
    observed_epoch: u64,
}

impl SessionLease<'_> {
    pub fn session(&self) -> &Session {
        &self.inner.session
    }

    pub fn driver(&mut self) -> &mut dyn DashboardDriver {
        self.inner.driver.as_mut()
    }

    pub async fn ensure_authenticated(&mut self) -> Result<()> {
        if let Some(rejected) = &self.inner.rejected {
            return Err(rejected.clone());
        }
        if self.inner.session.state == SessionState::Authenticated {
            return Ok(());
        }

        let current = self.manager.auth_epoch.load(Ordering::SeqCst);
        if current != self.observed_epoch {
            // a flow finished while we were queued behind it
            self.observed_epoch = current;
            if let Some(failure) = &self.inner.last_failure {
                return Err(failure.clone());
            }
        }

        let result = self.manager.run_auth_flow(&mut self.inner).await;
        self.inner.last_failure = result.as_ref().err().cloned();
        self.observed_epoch = self.manager.auth_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        result
    }

    /// Checks an authenticated session and re-authenticates only if the
    /// dashboard logged us out. A failed session reports its last failure
    /// without starting another login.
    pub async fn validate(&mut self) -> Result<()> {
        if let Some(rejected) = &self.inner.rejected {
            return Err(rejected.clone());
        }
        match self.inner.session.state {
            SessionState::Authenticated => {}
            SessionState::Failed => {
                return Err(self.inner.last_failure.clone().unwrap_or_else(|| {
                    LinkBotError::LoginTimeout("previous login flow failed".to_string())
                }));
            }
            SessionState::Expired | SessionState::Anonymous | SessionState::Authenticating => {
                return self.ensure_authenticated().await;
            }
        }

        if self.inner.driver.check_logged_in().await? {
            self.inner.session.last_validated_at = Some(self.manager.clock.now());
            return Ok(());
        }

        info!("Dashboard session expired, re-authenticating");
        self.mark_expired();
        self.ensure_authenticated().await
    }

    /// Records that the dashboard logged us out.
    pub fn mark_expired(&mut self) {
        if self.inner.session.state == SessionState::Authenticated {
            self.inner.session.state = SessionState::Expired;
        }
    }
}
