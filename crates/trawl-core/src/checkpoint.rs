//! Durable collection progress for resuming interrupted runs.
//!
//! On disk a checkpoint is a small JSON document:
//!
//! ```json
//! {"seenKeys": ["k1", "k2"], "pagesProcessed": 4, "itemCount": 2, "savedAt": "2024-05-01T10:00:00Z"}
//! ```
//!
//! A checkpoint that is missing or does not parse is treated as "no
//! checkpoint": the run starts fresh instead of failing.

use std::collections::BTreeSet;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::storage::{FileStorage, Storage};

const CHECKPOINTS_PREFIX: &str = "checkpoints";

/// Snapshot of a pagination run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionCheckpoint {
    pub seen_keys: BTreeSet<String>,
    pub pages_processed: u32,
    pub item_count: u64,
    pub saved_at: DateTime<Utc>,
}

/// Reads and writes one checkpoint document in a [`Storage`] backend.
#[derive(Debug, Clone)]
pub struct CheckpointStore<S: Storage> {
    storage: S,
    key: String,
}

impl<S: Storage> CheckpointStore<S> {
    /// Checkpoint keyed by run id, stored at `checkpoints/<id>.json`.
    pub fn new(storage: S, id: &str) -> Result<Self, AppError> {
        if id.is_empty() || id.contains(['/', '\\']) || id == "." || id == ".." {
            return Err(AppError::ConfigError(format!("Invalid checkpoint id '{id}'")));
        }
        Ok(Self {
            storage,
            key: format!("{CHECKPOINTS_PREFIX}/{id}.json"),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Load the checkpoint. Missing or malformed documents yield `None`.
    pub async fn load(&self) -> Option<CollectionCheckpoint> {
        let bytes = match self.storage.read(&self.key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                tracing::info!(checkpoint = %self.key, "No checkpoint found, starting fresh");
                return None;
            }
            Err(e) => {
                tracing::warn!(checkpoint = %self.key, error = %e, "Checkpoint unreadable, starting fresh");
                return None;
            }
        };

        match serde_json::from_slice::<CollectionCheckpoint>(&bytes) {
            Ok(checkpoint) => {
                tracing::info!(
                    checkpoint = %self.key,
                    seen_keys = checkpoint.seen_keys.len(),
                    pages = checkpoint.pages_processed,
                    "Resumed from checkpoint"
                );
                Some(checkpoint)
            }
            Err(e) => {
                tracing::warn!(checkpoint = %self.key, error = %e, "Corrupt checkpoint, starting fresh");
                None
            }
        }
    }

    /// Atomically replace the stored checkpoint.
    pub async fn save(&self, checkpoint: &CollectionCheckpoint) -> Result<(), AppError> {
        let bytes = serde_json::to_vec_pretty(checkpoint)?;
        self.storage.write(&self.key, &bytes).await?;
        tracing::debug!(
            checkpoint = %self.key,
            seen_keys = checkpoint.seen_keys.len(),
            pages = checkpoint.pages_processed,
            "Checkpoint saved"
        );
        Ok(())
    }
}

impl CheckpointStore<FileStorage> {
    /// Checkpoint stored at an explicit file path.
    pub fn at_path(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let path = path.as_ref();
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                AppError::ConfigError(format!("Invalid checkpoint path {}", path.display()))
            })?;
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        Ok(Self {
            storage: FileStorage::new(dir),
            key: file_name.to_string(),
        })
    }
}
