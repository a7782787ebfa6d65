use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{LinkBotError, Result};
use crate::extract::parse_product_url;
use crate::session::{MintOutcome, SessionLease, SessionManager, SessionState};

#[cfg(test)]
mod tests;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MintStatus {
    Pending,
    Success,
    Failed,
}

/// One submission of a product URL to the affiliate dashboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AffiliateLinkRequest {
    pub id: Uuid,
    pub source_url: String,
    /// Profile id of the session that served the request.
    pub session_ref: String,
    pub result_link: Option<String>,
    pub status: MintStatus,
    pub error: Option<String>,
    pub requested_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl AffiliateLinkRequest {
    pub fn pending(source_url: impl Into<String>, session_ref: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_url: source_url.into(),
            session_ref: session_ref.into(),
            result_link: None,
            status: MintStatus::Pending,
            error: None,
            requested_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn succeed(mut self, link: String) -> Self {
        self.result_link = Some(link);
        self.status = MintStatus::Success;
        self.completed_at = Some(Utc::now());
        self
    }

    pub fn fail(mut self, error: &LinkBotError) -> Self {
        self.status = MintStatus::Failed;
        self.error = Some(error.to_string());
        self.completed_at = Some(Utc::now());
        self
    }
}

/// Mints affiliate links through the shared dashboard session, one at a time.
pub struct LinkMinter {
    session: Arc<SessionManager>,
    mint_timeout: Duration,
}

impl LinkMinter {
    pub fn new(session: Arc<SessionManager>, mint_timeout: Duration) -> Self {
        Self { session, mint_timeout }
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    /// Submits `url` to the dashboard and returns the minted link.
    ///
    /// Callers queue on the session lock in arrival order and hold it for
    /// the whole operation, retries included.
    pub async fn mint(&self, url: &str) -> Result<AffiliateLinkRequest> {
        let url = parse_product_url(url)?;
        let source_url = url.to_string();

        debug!("Queued mint for {}", source_url);
        let mut lease = self.session.lease().await;
        let request = AffiliateLinkRequest::pending(source_url.as_str(), lease.session().profile_id.as_str());
        info!("Minting {} (request {})", source_url, request.id);

        self.prepare_session(&mut lease, &source_url).await?;
        let link = self.submit_with_retries(&mut lease, &source_url).await?;

        info!("Minted {} for {}", link, source_url);
        Ok(request.succeed(link))
    }

    /// Validates a live session or authenticates a missing one before the
    /// submit. Session check failures get one retry; auth failures pass through.
    async fn prepare_session(&self, lease: &mut SessionLease<'_>, url: &str) -> Result<()> {
        let mut retried = false;
        loop {
            let result = if lease.session().state == SessionState::Authenticated {
                lease.validate().await
            } else {
                lease.ensure_authenticated().await
            };

            match result {
                Ok(()) => return Ok(()),
                Err(e @ (LinkBotError::InvalidCredentials(_) | LinkBotError::LoginTimeout(_))) => return Err(e),
                Err(e) if e.is_retryable() && !retried => {
                    warn!("Session check before minting {} failed ({}), retrying", url, e);
                    retried = true;
                }
                Err(e) => {
                    return Err(LinkBotError::MintFailed {
                        url: url.to_string(),
                        cause: format!("session check failed: {}", e),
                    })
                }
            }
        }
    }

    async fn submit_with_retries(&self, lease: &mut SessionLease<'_>, url: &str) -> Result<String> {
        let mut navigation_retried = false;
        let mut reauthenticated = false;

        loop {
            let outcome = tokio::time::timeout(self.mint_timeout, lease.driver().submit_link(url)).await;

            let failure = match outcome {
                Ok(Ok(MintOutcome::Minted(link))) => return Ok(link),
                Ok(Ok(MintOutcome::LoggedOut)) => {
                    if reauthenticated {
                        return Err(LinkBotError::MintFailed {
                            url: url.to_string(),
                            cause: "dashboard logged out again after re-authentication".to_string(),
                        });
                    }
                    warn!("Dashboard session expired while minting {}, re-authenticating", url);
                    reauthenticated = true;
                    lease.mark_expired();
                    lease.ensure_authenticated().await.map_err(|e| LinkBotError::MintFailed {
                        url: url.to_string(),
                        cause: format!("re-authentication failed: {}", e),
                    })?;
                    continue;
                }
                Ok(Err(e)) => e,
                Err(_) => LinkBotError::MintTimeout {
                    url: url.to_string(),
                    timeout: self.mint_timeout,
                },
            };

            if reauthenticated {
                return Err(LinkBotError::MintFailed {
                    url: url.to_string(),
                    cause: format!("retry after re-authentication failed: {}", failure),
                });
            }
            if navigation_retried || !failure.is_retryable() {
                return Err(match failure {
                    timeout @ LinkBotError::MintTimeout { .. } => timeout,
                    other => LinkBotError::MintFailed {
                        url: url.to_string(),
                        cause: other.to_string(),
                    },
                });
            }

            warn!("Mint attempt for {} failed ({}), retrying with a fresh navigation", url, failure);
            navigation_retried = true;
        }
    }
}
