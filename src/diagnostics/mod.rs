use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::debug;
use url::Url;

use crate::error::{LinkBotError, Result};
use crate::extract::record::ExtractionAttempt;

/// Receives every extraction attempt for offline inspection.
#[async_trait]
pub trait AttemptSink: Send + Sync {
    async fn record(&self, url: &Url, sequence: usize, attempt: &ExtractionAttempt) -> Result<()>;
}

#[derive(Serialize)]
struct AttemptArtifact<'a> {
    url: &'a str,
    sequence: usize,
    recorded_at: DateTime<Utc>,
    attempt: &'a ExtractionAttempt,
}

/// Writes one pretty-printed JSON document per attempt.
pub struct JsonFileSink {
    directory: PathBuf,
}

impl JsonFileSink {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// `<sha256(url)[..16]>-<stage>-<n>.json`
    pub fn artifact_path(&self, url: &Url, sequence: usize, attempt: &ExtractionAttempt) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(url.as_str().as_bytes());
        let digest = format!("{:x}", hasher.finalize());
        self.directory
            .join(format!("{}-{}-{}.json", &digest[..16], attempt.stage, sequence))
    }
}

#[async_trait]
impl AttemptSink for JsonFileSink {
    async fn record(&self, url: &Url, sequence: usize, attempt: &ExtractionAttempt) -> Result<()> {
        let artifact = AttemptArtifact {
            url: url.as_str(),
            sequence,
            recorded_at: Utc::now(),
            attempt,
        };
        let body = serde_json::to_string_pretty(&artifact)
            .map_err(|e| LinkBotError::StorageError(format!("JSON serialization failed: {}", e)))?;

        tokio::fs::create_dir_all(&self.directory).await?;
        let path = self.artifact_path(url, sequence, attempt);
        tokio::fs::write(&path, body).await?;

        debug!("Wrote attempt artifact {:?}", path);
        Ok(())
    }
}
