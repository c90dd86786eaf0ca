//! Test utilities: mock implementations of the core traits.
//!
//! Handwritten mocks for dependency injection in unit and integration tests.
//! All mocks use `Arc<Mutex<_>>` for interior mutability, so clones share
//! state and tests can assert on recorded calls.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::error::AppError;
use crate::proxy::ProxyEndpoint;
use crate::storage::{MemoryStorage, Storage};
use crate::traits::{ItemSink, PageDriver, ProxyProbe};

// ---------------------------------------------------------------------------
// ScriptedExtractor
// ---------------------------------------------------------------------------

/// Extraction closure backed by a queue of batches.
///
/// Each call pops the next scripted result. Once the script is used up it
/// keeps returning an empty batch (or the repeating error, if configured).
#[derive(Clone, Default)]
pub struct ScriptedExtractor {
    script: Arc<Mutex<VecDeque<Result<Vec<Value>, AppError>>>>,
    repeat_error: Option<String>,
    calls: Arc<Mutex<u32>>,
}

impl ScriptedExtractor {
    pub fn new(script: Vec<Result<Vec<Value>, AppError>>) -> Self {
        Self {
            script: Arc::new(Mutex::new(script.into())),
            ..Default::default()
        }
    }

    /// Fails every call with `AppError::Generic(message)`.
    pub fn repeating_error(message: &str) -> Self {
        Self {
            repeat_error: Some(message.to_string()),
            ..Default::default()
        }
    }

    pub async fn next_batch(&self) -> Result<Vec<Value>, AppError> {
        *self.calls.lock().unwrap() += 1;
        if let Some(next) = self.script.lock().unwrap().pop_front() {
            return next;
        }
        match &self.repeat_error {
            Some(message) => Err(AppError::Generic(message.clone())),
            None => Ok(Vec::new()),
        }
    }

    pub fn calls(&self) -> u32 {
        *self.calls.lock().unwrap()
    }
}

// ---------------------------------------------------------------------------
// MockDriver
// ---------------------------------------------------------------------------

/// Page driver that counts advances and reports scripted error pages.
#[derive(Clone, Default)]
pub struct MockDriver {
    advances: Arc<Mutex<u32>>,
    error_pages: Arc<Mutex<VecDeque<bool>>>,
    advance_errors: Arc<Mutex<VecDeque<AppError>>>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers for successive `is_error_page` calls; `false` afterwards.
    pub fn with_error_pages(self, flags: Vec<bool>) -> Self {
        *self.error_pages.lock().unwrap() = flags.into();
        self
    }

    /// Fail the next `advance` call with `error`.
    pub fn with_advance_error(self, error: AppError) -> Self {
        self.advance_errors.lock().unwrap().push_back(error);
        self
    }

    /// Number of `advance` calls, including failed ones.
    pub fn advances(&self) -> u32 {
        *self.advances.lock().unwrap()
    }
}

impl PageDriver for MockDriver {
    async fn advance(&self) -> Result<(), AppError> {
        *self.advances.lock().unwrap() += 1;
        match self.advance_errors.lock().unwrap().pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn is_error_page(&self) -> Result<bool, AppError> {
        Ok(self.error_pages.lock().unwrap().pop_front().unwrap_or(false))
    }
}

// ---------------------------------------------------------------------------
// RecordingSink
// ---------------------------------------------------------------------------

/// Sink that records every accepted batch.
#[derive(Clone, Default)]
pub struct RecordingSink {
    batches: Arc<Mutex<Vec<Vec<Value>>>>,
    fail_next: Arc<Mutex<Option<AppError>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the next batch with `error` without recording it.
    pub fn failing_once(self, error: AppError) -> Self {
        *self.fail_next.lock().unwrap() = Some(error);
        self
    }

    pub fn batches(&self) -> Vec<Vec<Value>> {
        self.batches.lock().unwrap().clone()
    }
}

impl ItemSink for RecordingSink {
    async fn accept(&self, items: &[Value]) -> Result<(), AppError> {
        if let Some(error) = self.fail_next.lock().unwrap().take() {
            return Err(error);
        }
        self.batches.lock().unwrap().push(items.to_vec());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MockProbe
// ---------------------------------------------------------------------------

/// How [`MockProbe`] answers for one endpoint.
#[derive(Debug, Clone)]
pub enum ProbeBehavior {
    Ok,
    Fail(String),
    /// Never completes; the caller's timeout has to fire.
    Hang,
}

/// Probe with per-endpoint scripted behavior. Unknown endpoints succeed.
#[derive(Clone, Default)]
pub struct MockProbe {
    behaviors: Arc<Mutex<HashMap<String, ProbeBehavior>>>,
    calls: Arc<Mutex<usize>>,
}

impl MockProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, endpoint: &ProxyEndpoint, behavior: ProbeBehavior) -> Self {
        self.behaviors
            .lock()
            .unwrap()
            .insert(endpoint.url().to_string(), behavior);
        self
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

impl ProxyProbe for MockProbe {
    async fn probe(&self, endpoint: &ProxyEndpoint) -> Result<(), AppError> {
        *self.calls.lock().unwrap() += 1;
        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .get(endpoint.url())
            .cloned()
            .unwrap_or(ProbeBehavior::Ok);

        match behavior {
            ProbeBehavior::Ok => Ok(()),
            ProbeBehavior::Fail(message) => Err(AppError::NetworkError(message)),
            ProbeBehavior::Hang => {
                std::future::pending::<()>().await;
                Ok(())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// FaultyStorage
// ---------------------------------------------------------------------------

/// [`MemoryStorage`] wrapper that fails scripted writes and appends.
///
/// Faults match on key suffix (`"metadata.json"`, `"records.jsonl"`) and fire once.
#[derive(Clone, Default)]
pub struct FaultyStorage {
    inner: MemoryStorage,
    failing_writes: Arc<Mutex<Vec<String>>>,
    torn_appends: Arc<Mutex<Vec<String>>>,
}

impl FaultyStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `write` to a key ending in `suffix`, leaving the old value.
    pub fn fail_next_write(self, suffix: &str) -> Self {
        self.failing_writes.lock().unwrap().push(suffix.to_string());
        self
    }

    /// Make the next `append` to a key ending in `suffix` store only half its
    /// bytes, then fail.
    pub fn tear_next_append(self, suffix: &str) -> Self {
        self.torn_appends.lock().unwrap().push(suffix.to_string());
        self
    }

    pub fn inner(&self) -> &MemoryStorage {
        &self.inner
    }

    fn take_fault(faults: &Mutex<Vec<String>>, key: &str) -> bool {
        let mut faults = faults.lock().unwrap();
        match faults.iter().position(|suffix| key.ends_with(suffix.as_str())) {
            Some(index) => {
                faults.remove(index);
                true
            }
            None => false,
        }
    }
}

impl Storage for FaultyStorage {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, AppError> {
        self.inner.read(key).await
    }

    async fn write(&self, key: &str, bytes: &[u8]) -> Result<(), AppError> {
        if Self::take_fault(&self.failing_writes, key) {
            return Err(AppError::Storage(format!("injected write failure for {key}")));
        }
        self.inner.write(key, bytes).await
    }

    async fn append(&self, key: &str, bytes: &[u8]) -> Result<(), AppError> {
        if Self::take_fault(&self.torn_appends, key) {
            self.inner.append(key, &bytes[..bytes.len() / 2]).await?;
            return Err(AppError::Storage(format!("injected torn append for {key}")));
        }
        self.inner.append(key, bytes).await
    }

    async fn size(&self, key: &str) -> Result<Option<u64>, AppError> {
        self.inner.size(key).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, AppError> {
        self.inner.list(prefix).await
    }

    async fn remove_prefix(&self, prefix: &str) -> Result<(), AppError> {
        self.inner.remove_prefix(prefix).await
    }
}
