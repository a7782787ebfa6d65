pub mod dashboard;
pub mod manager;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

pub use dashboard::ChromiumDashboard;
pub use manager::{LoginPolicy, SessionLease, SessionManager};
pub use store::{FileSessionStore, SessionBlob, SessionStore};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Anonymous,
    Authenticating,
    Authenticated,
    Expired,
    /// Login retries exhausted or credentials rejected.
    Failed,
}

/// The one authenticated dashboard context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub profile_id: String,
    pub state: SessionState,
    pub last_validated_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(profile_id: impl Into<String>) -> Self {
        Self {
            profile_id: profile_id.into(),
            state: SessionState::Anonymous,
            last_validated_at: None,
        }
    }
}

#[derive(Clone)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl Credentials {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.email.trim().is_empty() && !self.password.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// What the dashboard did with a submitted product URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MintOutcome {
    Minted(String),
    /// The dashboard bounced to its login page mid-operation.
    LoggedOut,
}

/// Automation surface of the affiliate dashboard.
///
/// Implementations hold live UI state, so every call must come from the
/// holder of the session lock.
#[async_trait]
pub trait DashboardDriver: Send {
    /// Loads persisted cookies into the automation context.
    async fn restore_state(&mut self, blob: &SessionBlob) -> Result<()>;

    async fn export_state(&mut self) -> Result<serde_json::Value>;

    /// True when the authenticated-only indicator is visible.
    async fn check_logged_in(&mut self) -> Result<bool>;

    async fn login(&mut self, credentials: &Credentials) -> Result<()>;

    /// Drops cookies and page state.
    async fn reset(&mut self) -> Result<()>;

    async fn submit_link(&mut self, product_url: &str) -> Result<MintOutcome>;
}
