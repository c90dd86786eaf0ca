//! Key/value byte storage behind datasets and checkpoints.
//!
//! Keys are `/`-separated relative paths (`datasets/books/records.jsonl`).
//! [`FileStorage`] maps them onto a directory tree; [`MemoryStorage`]
//! keeps everything in process.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::io::AsyncWriteExt;

use crate::error::AppError;

/// Byte storage addressed by relative keys.
pub trait Storage: Send + Sync + Clone {
    /// Read a whole value. `None` if the key does not exist.
    fn read(&self, key: &str) -> impl Future<Output = Result<Option<Vec<u8>>, AppError>> + Send;

    /// Replace a value atomically: readers see either the old or the new bytes.
    fn write(&self, key: &str, bytes: &[u8]) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Append to a value, creating it if needed. Returns once the bytes are durable.
    fn append(&self, key: &str, bytes: &[u8]) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Size of a value in bytes, `None` if absent.
    fn size(&self, key: &str) -> impl Future<Output = Result<Option<u64>, AppError>> + Send;

    /// Names of the direct children under `prefix`, sorted.
    fn list(&self, prefix: &str) -> impl Future<Output = Result<Vec<String>, AppError>> + Send;

    /// Remove `prefix` and everything beneath it. Missing prefixes are not an error.
    fn remove_prefix(&self, prefix: &str) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// Reject absolute keys and any `..`/`.` component.
fn validate_key(key: &str) -> Result<(), AppError> {
    let path = Path::new(key);
    let ok = !key.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if ok {
        Ok(())
    } else {
        Err(AppError::Storage(format!("invalid storage key '{key}'")))
    }
}

// ---------------------------------------------------------------------------
// FileStorage
// ---------------------------------------------------------------------------

/// Directory-backed storage.
#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, AppError> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    async fn ensure_parent(path: &Path) -> Result<(), AppError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AppError::storage(format!("create {}", parent.display()), e))?;
        }
        Ok(())
    }
}

impl Storage for FileStorage {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, AppError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AppError::storage(format!("read {}", path.display()), e)),
        }
    }

    async fn write(&self, key: &str, bytes: &[u8]) -> Result<(), AppError> {
        let path = self.path_for(key)?;
        Self::ensure_parent(&path).await?;

        let tmp_path = path.with_extension("tmp");
        let mut file = tokio::fs::File::create(&tmp_path)
            .await
            .map_err(|e| AppError::storage(format!("create {}", tmp_path.display()), e))?;
        file.write_all(bytes)
            .await
            .map_err(|e| AppError::storage(format!("write {}", tmp_path.display()), e))?;
        file.sync_all()
            .await
            .map_err(|e| AppError::storage(format!("sync {}", tmp_path.display()), e))?;
        drop(file);

        tokio::fs::rename(&tmp_path, &path)
            .await
            .map_err(|e| AppError::storage(format!("rename to {}", path.display()), e))
    }

    async fn append(&self, key: &str, bytes: &[u8]) -> Result<(), AppError> {
        let path = self.path_for(key)?;
        Self::ensure_parent(&path).await?;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| AppError::storage(format!("open {}", path.display()), e))?;
        file.write_all(bytes)
            .await
            .map_err(|e| AppError::storage(format!("append {}", path.display()), e))?;
        file.flush()
            .await
            .map_err(|e| AppError::storage(format!("flush {}", path.display()), e))?;
        file.sync_data()
            .await
            .map_err(|e| AppError::storage(format!("sync {}", path.display()), e))
    }

    async fn size(&self, key: &str) -> Result<Option<u64>, AppError> {
        let path = self.path_for(key)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AppError::storage(format!("stat {}", path.display()), e)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, AppError> {
        let dir = self.path_for(prefix)?;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(AppError::storage(format!("list {}", dir.display()), e)),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| AppError::storage(format!("list {}", dir.display()), e))?
        {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    async fn remove_prefix(&self, prefix: &str) -> Result<(), AppError> {
        let path = self.path_for(prefix)?;
        let meta = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(AppError::storage(format!("stat {}", path.display()), e)),
        };
        let result = if meta.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        result.map_err(|e| AppError::storage(format!("remove {}", path.display()), e))
    }
}

// ---------------------------------------------------------------------------
// MemoryStorage
// ---------------------------------------------------------------------------

/// In-process storage. Clones share the same contents.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    entries: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.entries.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned storage mutex");
            poisoned.into_inner()
        })
    }
}

fn dir_prefix(prefix: &str) -> String {
    format!("{}/", prefix.trim_end_matches('/'))
}

impl Storage for MemoryStorage {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, AppError> {
        validate_key(key)?;
        Ok(self.lock_entries().get(key).cloned())
    }

    async fn write(&self, key: &str, bytes: &[u8]) -> Result<(), AppError> {
        validate_key(key)?;
        self.lock_entries().insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn append(&self, key: &str, bytes: &[u8]) -> Result<(), AppError> {
        validate_key(key)?;
        self.lock_entries()
            .entry(key.to_string())
            .or_default()
            .extend_from_slice(bytes);
        Ok(())
    }

    async fn size(&self, key: &str) -> Result<Option<u64>, AppError> {
        validate_key(key)?;
        Ok(self.lock_entries().get(key).map(|v| v.len() as u64))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, AppError> {
        validate_key(prefix)?;
        let dir = dir_prefix(prefix);
        let entries = self.lock_entries();
        let mut names: Vec<String> = entries
            .keys()
            .filter_map(|k| k.strip_prefix(&dir))
            .filter_map(|rest| rest.split('/').next())
            .map(str::to_string)
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    async fn remove_prefix(&self, prefix: &str) -> Result<(), AppError> {
        validate_key(prefix)?;
        let dir = dir_prefix(prefix);
        self.lock_entries()
            .retain(|k, _| k != prefix && !k.starts_with(&dir));
        Ok(())
    }
}
