use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, info};

use crate::error::{LinkBotError, Result};

/// Opaque persisted dashboard state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionBlob {
    pub profile_id: String,
    pub saved_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// `Ok(None)` when nothing was saved; `SessionUnavailable` when the saved
    /// state cannot be read back.
    async fn load(&self, profile_id: &str) -> Result<Option<SessionBlob>>;
    async fn save(&self, blob: &SessionBlob) -> Result<()>;
    async fn clear(&self, profile_id: &str) -> Result<()>;
}

/// Stores each profile as `<dir>/<profile_id>.json`.
pub struct FileSessionStore {
    directory: PathBuf,
}

impl FileSessionStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    fn path_for(&self, profile_id: &str) -> PathBuf {
        self.directory.join(format!("{}.json", profile_id))
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn load(&self, profile_id: &str) -> Result<Option<SessionBlob>> {
        let path = self.path_for(profile_id);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No persisted session at {:?}", path);
                return Ok(None);
            }
            Err(e) => {
                return Err(LinkBotError::SessionUnavailable(format!("Failed to read {:?}: {}", path, e)));
            }
        };

        let blob: SessionBlob = serde_json::from_str(&content)
            .map_err(|e| LinkBotError::SessionUnavailable(format!("Corrupt session file {:?}: {}", path, e)))?;
        if blob.profile_id != profile_id {
            return Err(LinkBotError::SessionUnavailable(format!(
                "Session file {:?} belongs to profile '{}'",
                path, blob.profile_id
            )));
        }
        Ok(Some(blob))
    }

    async fn save(&self, blob: &SessionBlob) -> Result<()> {
        tokio::fs::create_dir_all(&self.directory).await?;
        let path = self.path_for(&blob.profile_id);
        let tmp_path = path.with_extension("json.tmp");

        let body = serde_json::to_vec_pretty(blob)
            .map_err(|e| LinkBotError::StorageError(format!("JSON serialization failed: {}", e)))?;
        // write-then-rename so a crash never leaves a torn file behind
        tokio::fs::write(&tmp_path, body).await?;
        tokio::fs::rename(&tmp_path, &path).await?;

        info!("Persisted session for profile '{}'", blob.profile_id);
        Ok(())
    }

    async fn clear(&self, profile_id: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(profile_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn blob(profile_id: &str) -> SessionBlob {
        SessionBlob {
            profile_id: profile_id.to_string(),
            saved_at: Utc::now(),
            payload: serde_json::json!([{"name": "sid", "value": "abc", "domain": ".dashboard.test"}]),
        }
    }

    #[tokio::test]
    async fn test_save_load_clear() {
        let temp_dir = tempdir().unwrap();
        let store = FileSessionStore::new(temp_dir.path().join("sessions"));

        assert_eq!(store.load("creator").await.unwrap(), None);

        let saved = blob("creator");
        store.save(&saved).await.unwrap();
        assert_eq!(store.load("creator").await.unwrap(), Some(saved));
        assert!(!temp_dir.path().join("sessions/creator.json.tmp").exists());

        store.clear("creator").await.unwrap();
        store.clear("creator").await.unwrap();
        assert_eq!(store.load("creator").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_session_unavailable() {
        let temp_dir = tempdir().unwrap();
        let store = FileSessionStore::new(temp_dir.path());
        std::fs::write(temp_dir.path().join("creator.json"), "{\"profile_id\": ").unwrap();

        let err = store.load("creator").await.unwrap_err();
        assert!(matches!(err, LinkBotError::SessionUnavailable(_)));
    }

    #[tokio::test]
    async fn test_foreign_profile_is_rejected() {
        let temp_dir = tempdir().unwrap();
        let store = FileSessionStore::new(temp_dir.path());
        store.save(&blob("other")).await.unwrap();
        std::fs::rename(temp_dir.path().join("other.json"), temp_dir.path().join("creator.json")).unwrap();

        assert!(matches!(
            store.load("creator").await,
            Err(LinkBotError::SessionUnavailable(_))
        ));
    }
}
