use std::sync::Arc;
use std::time::Duration;
use tempfile::{tempdir, TempDir};

use super::*;
use crate::session::testing::{DriverLog, FakeDashboard, MintStep};
use crate::session::{Credentials, FileSessionStore, LoginPolicy, SessionState};

fn minter(driver: FakeDashboard, mint_timeout: Duration) -> (LinkMinter, TempDir) {
    let temp_dir = tempdir().unwrap();
    let session = SessionManager::new(
        "creator",
        Box::new(driver),
        Arc::new(FileSessionStore::new(temp_dir.path())),
        Credentials::new("creator@example.com", "hunter2"),
        LoginPolicy {
            attempts: 2,
            backoff: Duration::from_millis(5),
            timeout: Duration::from_secs(2),
        },
    );
    (LinkMinter::new(Arc::new(session), mint_timeout), temp_dir)
}

fn setup(steps: Vec<MintStep>) -> (LinkMinter, Arc<DriverLog>, TempDir) {
    let (driver, log) = FakeDashboard::new();
    let (minter, temp_dir) = minter(driver.with_mint_steps(steps), Duration::from_millis(100));
    (minter, log, temp_dir)
}

#[tokio::test]
async fn test_mint_authenticates_then_returns_link() {
    let (minter, log, _dir) = setup(vec![MintStep::Link("https://mavely.app.link/e/AbCdEfGhIjK".to_string())]);

    let request = minter.mint("https://shop.test/p/lamp").await.unwrap();

    assert_eq!(request.status, MintStatus::Success);
    assert_eq!(request.result_link.as_deref(), Some("https://mavely.app.link/e/AbCdEfGhIjK"));
    assert_eq!(request.session_ref, "creator");
    assert!(request.completed_at.is_some());
    assert_eq!(log.logins(), 1);
}

#[tokio::test]
async fn test_invalid_url_never_touches_the_dashboard() {
    let (minter, log, _dir) = setup(vec![]);

    let err = minter.mint("not a url").await.unwrap_err();
    assert!(matches!(err, LinkBotError::InvalidUrl(_)));
    assert!(log.submissions().is_empty());
    assert_eq!(log.logins(), 0);
}

#[tokio::test]
async fn test_concurrent_mints_run_in_arrival_order() {
    let (driver, log) = FakeDashboard::new();
    let (minter, _dir) = minter(driver.with_mint_delay(Duration::from_millis(10)), Duration::from_secs(1));
    let urls: Vec<String> = (1..=4).map(|n| format!("https://shop.test/p/{}", n)).collect();

    let results = futures::future::join_all(urls.iter().map(|url| minter.mint(url))).await;

    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(log.submissions(), urls);
    assert_eq!(log.logins(), 1);
}

#[tokio::test]
async fn test_logout_mid_mint_reauthenticates_and_retries_once() {
    let (minter, log, _dir) = setup(vec![
        MintStep::LoggedOut,
        MintStep::Link("https://mavely.app.link/e/ZyXwVuTsRqP".to_string()),
    ]);

    let request = minter.mint("https://shop.test/p/desk").await.unwrap();

    assert_eq!(request.result_link.as_deref(), Some("https://mavely.app.link/e/ZyXwVuTsRqP"));
    assert_eq!(log.logins(), 2);
    assert_eq!(log.submissions().len(), 2);
    assert_eq!(minter.session().state().await, SessionState::Authenticated);
}

#[tokio::test]
async fn test_second_logout_surfaces_mint_failed() {
    let (minter, log, _dir) = setup(vec![MintStep::LoggedOut, MintStep::LoggedOut]);

    let err = minter.mint("https://shop.test/p/desk").await.unwrap_err();

    assert!(matches!(err, LinkBotError::MintFailed { .. }));
    assert_eq!(log.submissions().len(), 2);
}

#[tokio::test]
async fn test_timeout_is_retried_once_with_fresh_navigation() {
    let (minter, log, _dir) = setup(vec![MintStep::Hang]);

    let request = minter.mint("https://shop.test/p/chair").await.unwrap();

    assert_eq!(request.status, MintStatus::Success);
    assert_eq!(log.submissions().len(), 2);
}

#[tokio::test]
async fn test_second_timeout_surfaces_mint_timeout() {
    let (minter, log, _dir) = setup(vec![MintStep::Hang, MintStep::Hang]);

    let err = minter.mint("https://shop.test/p/chair").await.unwrap_err();

    assert!(matches!(err, LinkBotError::MintTimeout { .. }));
    assert_eq!(log.submissions().len(), 2);
}

#[tokio::test]
async fn test_non_retryable_driver_error_is_mint_failed() {
    let (minter, log, _dir) = setup(vec![MintStep::Fail(LinkBotError::ParseError("garbled dialog".to_string()))]);

    let err = minter.mint("https://shop.test/p/rug").await.unwrap_err();

    assert!(matches!(err, LinkBotError::MintFailed { .. }));
    assert_eq!(log.submissions().len(), 1);
}

#[tokio::test]
async fn test_lock_is_released_after_failure() {
    let (minter, log, _dir) = setup(vec![MintStep::Hang, MintStep::Hang]);

    assert!(minter.mint("https://shop.test/p/1").await.is_err());
    let request = tokio::time::timeout(Duration::from_secs(1), minter.mint("https://shop.test/p/2"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(request.status, MintStatus::Success);
    assert_eq!(log.submissions().len(), 3);
}

#[tokio::test]
async fn test_transient_session_check_error_before_submit_is_retried_once() {
    let (driver, log) = FakeDashboard::new();
    let driver = driver.with_check_results(vec![Ok(()), Err(LinkBotError::BrowserError("tab crashed".to_string()))]);
    let (minter, _dir) = minter(driver, Duration::from_secs(1));

    minter.mint("https://shop.test/p/1").await.unwrap();
    let request = minter.mint("https://shop.test/p/2").await.unwrap();

    assert_eq!(request.status, MintStatus::Success);
    assert_eq!(log.checks(), 3);
    assert_eq!(log.submissions().len(), 2);
}

#[tokio::test]
async fn test_repeated_session_check_error_surfaces_as_mint_failed() {
    let (driver, log) = FakeDashboard::new();
    let driver = driver.with_check_results(vec![
        Ok(()),
        Err(LinkBotError::BrowserError("tab crashed".to_string())),
        Err(LinkBotError::BrowserError("tab crashed".to_string())),
    ]);
    let (minter, _dir) = minter(driver, Duration::from_secs(1));

    minter.mint("https://shop.test/p/1").await.unwrap();
    let err = minter.mint("https://shop.test/p/2").await.unwrap_err();

    match err {
        LinkBotError::MintFailed { url, cause } => {
            assert_eq!(url, "https://shop.test/p/2");
            assert!(cause.contains("tab crashed"));
        }
        other => panic!("expected MintFailed, got {:?}", other),
    }
    assert_eq!(log.submissions().len(), 1);
}

#[tokio::test]
async fn test_rejected_credentials_pass_through_unchanged() {
    let (driver, log) = FakeDashboard::new();
    let driver = driver.with_login_results(vec![Err(LinkBotError::InvalidCredentials("rejected".to_string()))]);
    let (minter, _dir) = minter(driver, Duration::from_secs(1));

    let err = minter.mint("https://shop.test/p/1").await.unwrap_err();

    assert!(matches!(err, LinkBotError::InvalidCredentials(_)));
    assert!(log.submissions().is_empty());
}

#[test]
fn test_failed_request_records_error() {
    let err = LinkBotError::MintFailed {
        url: "https://shop.test/p/1".to_string(),
        cause: "no dialog".to_string(),
    };
    let request = AffiliateLinkRequest::pending("https://shop.test/p/1", "creator").fail(&err);
    assert_eq!(request.status, MintStatus::Failed);
    assert!(request.error.unwrap().contains("no dialog"));
    assert!(request.result_link.is_none());
}
