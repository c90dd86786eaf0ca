//! Resumable collection loop for paginated / infinitely scrolling sources.
//!
//! Each round: advance the driver, extract a batch through the
//! [`RetryPolicy`], drop records whose dedup key was already seen, hand the
//! rest to the [`ItemSink`], then decide whether to keep going. Extraction
//! failures never end a run; they are counted in `errors_recovered` and
//! followed by a short cooldown.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::checkpoint::{CheckpointStore, CollectionCheckpoint};
use crate::error::AppError;
use crate::retry::RetryPolicy;
use crate::storage::{FileStorage, Storage};
use crate::traits::{ItemSink, NullSink, PageDriver};
use crate::util::millis;

/// Derives the dedup key of a record.
pub type DedupKeyFn = Arc<dyn Fn(&Value) -> String + Send + Sync>;

/// Limits and pacing for a collection run.
#[derive(Clone)]
pub struct PaginationConfig {
    pub max_pages: u32,
    pub max_items: usize,
    /// Wait after each driver advance, before extracting.
    pub scroll_delay: Duration,
    /// Consecutive rounds without new items before the source counts as exhausted.
    pub empty_rounds_limit: u32,
    /// Sleep after the driver reports an error/rate-limit page.
    pub error_page_cooldown: Duration,
    /// Sleep after a failed round.
    pub error_delay: Duration,
    /// Save a checkpoint every N pages. 0 saves only at the end of the run.
    pub checkpoint_every: u32,
    /// Stop once this many errors were recovered. `None` never stops on errors.
    pub max_errors: Option<u32>,
    /// Defaults to the record's compact JSON serialization.
    pub dedup_key: Option<DedupKeyFn>,
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            max_pages: 100,
            max_items: 10_000,
            scroll_delay: Duration::from_secs(2),
            empty_rounds_limit: 3,
            error_page_cooldown: Duration::from_secs(60),
            error_delay: Duration::from_secs(5),
            checkpoint_every: 10,
            max_errors: None,
            dedup_key: None,
        }
    }
}

impl fmt::Debug for PaginationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PaginationConfig")
            .field("max_pages", &self.max_pages)
            .field("max_items", &self.max_items)
            .field("scroll_delay", &self.scroll_delay)
            .field("empty_rounds_limit", &self.empty_rounds_limit)
            .field("error_page_cooldown", &self.error_page_cooldown)
            .field("error_delay", &self.error_delay)
            .field("checkpoint_every", &self.checkpoint_every)
            .field("max_errors", &self.max_errors)
            .field("dedup_key", &self.dedup_key.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl PaginationConfig {
    pub fn with_max_pages(mut self, max_pages: u32) -> Self {
        self.max_pages = max_pages;
        self
    }

    pub fn with_max_items(mut self, max_items: usize) -> Self {
        self.max_items = max_items;
        self
    }

    pub fn with_scroll_delay(mut self, delay: Duration) -> Self {
        self.scroll_delay = delay;
        self
    }

    pub fn with_checkpoint_every(mut self, pages: u32) -> Self {
        self.checkpoint_every = pages;
        self
    }

    pub fn with_max_errors(mut self, max_errors: u32) -> Self {
        self.max_errors = Some(max_errors);
        self
    }

    pub fn with_dedup_key<F>(mut self, key_fn: F) -> Self
    where
        F: Fn(&Value) -> String + Send + Sync + 'static,
    {
        self.dedup_key = Some(Arc::new(key_fn));
        self
    }

    /// Dedup on one top-level field, falling back to the whole record when it is absent.
    pub fn with_dedup_field(self, field: impl Into<String>) -> Self {
        let field = field.into();
        self.with_dedup_key(move |record| match record.get(&field) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => record.to_string(),
            Some(other) => other.to_string(),
        })
    }
}

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    MaxPages,
    MaxItems,
    /// Too many consecutive rounds without new items.
    Exhausted,
    Cancelled,
    ErrorBudget,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StopReason::MaxPages => "max pages reached",
            StopReason::MaxItems => "max items reached",
            StopReason::Exhausted => "list exhausted",
            StopReason::Cancelled => "cancelled",
            StopReason::ErrorBudget => "error budget spent",
        };
        write!(f, "{s}")
    }
}

/// Counters for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionStats {
    /// Items accepted during this run.
    pub total: usize,
    pub duplicates_removed: u64,
    /// Includes pages restored from a checkpoint.
    pub pages_processed: u32,
    pub errors_recovered: u32,
    pub duration_ms: u64,
    pub stop_reason: Option<StopReason>,
}

/// Items and stats returned by [`PaginationEngine::run`].
#[derive(Debug, Clone)]
pub struct CollectionResult {
    pub items: Vec<Value>,
    pub stats: CollectionStats,
}

/// Per-run options.
pub struct RunOptions<S: Storage = FileStorage> {
    /// Resume from and periodically save to this checkpoint.
    pub checkpoint: Option<CheckpointStore<S>>,
    pub cancel: Option<CancellationToken>,
}

impl RunOptions<FileStorage> {
    pub fn new() -> Self {
        Self {
            checkpoint: None,
            cancel: None,
        }
    }
}

impl Default for RunOptions<FileStorage> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Storage> RunOptions<S> {
    pub fn with_checkpoint<S2: Storage>(self, store: CheckpointStore<S2>) -> RunOptions<S2> {
        RunOptions {
            checkpoint: Some(store),
            cancel: self.cancel,
        }
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Events emitted by the engine for monitoring/logging.
#[derive(Debug, Clone)]
pub enum EngineEvent<'a> {
    Started {
        resumed_keys: usize,
        pages_processed: u32,
    },
    Progress {
        stats: &'a CollectionStats,
        added: usize,
    },
    ErrorPage {
        cooldown: Duration,
    },
    ErrorRecovered {
        error: &'a AppError,
        delay: Duration,
    },
    CheckpointSaved {
        pages_processed: u32,
    },
    CheckpointFailed {
        error: &'a AppError,
    },
    Finished {
        stats: &'a CollectionStats,
    },
}

/// Trait for receiving engine events (decoupled logging).
pub trait EngineReporter: Send + Sync {
    fn report(&self, event: EngineEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEngineReporter;

impl EngineReporter for TracingEngineReporter {
    fn report(&self, event: EngineEvent<'_>) {
        match event {
            EngineEvent::Started {
                resumed_keys,
                pages_processed,
            } => {
                tracing::info!(%resumed_keys, %pages_processed, "Collection started");
            }
            EngineEvent::Progress { stats, added } => {
                tracing::info!(
                    page = stats.pages_processed,
                    added,
                    total = stats.total,
                    duplicates = stats.duplicates_removed,
                    "Page processed"
                );
            }
            EngineEvent::ErrorPage { cooldown } => {
                tracing::warn!(cooldown_ms = millis(cooldown), "Error page detected, cooling down");
            }
            EngineEvent::ErrorRecovered { error, delay } => {
                tracing::warn!(%error, delay_ms = millis(delay), "Round failed, continuing");
            }
            EngineEvent::CheckpointSaved { pages_processed } => {
                tracing::debug!(%pages_processed, "Checkpoint saved");
            }
            EngineEvent::CheckpointFailed { error } => {
                tracing::warn!(%error, "Failed to save checkpoint");
            }
            EngineEvent::Finished { stats } => {
                tracing::info!(
                    total = stats.total,
                    pages = stats.pages_processed,
                    duplicates = stats.duplicates_removed,
                    errors = stats.errors_recovered,
                    duration_ms = stats.duration_ms,
                    reason = ?stats.stop_reason,
                    "Collection finished"
                );
            }
        }
    }
}

/// Calls a closure with the stats after every page, and logs like [`TracingEngineReporter`].
pub struct ProgressReporter<F>(pub F);

impl<F> EngineReporter for ProgressReporter<F>
where
    F: Fn(&CollectionStats) + Send + Sync,
{
    fn report(&self, event: EngineEvent<'_>) {
        if let EngineEvent::Progress { stats, .. } = &event {
            (self.0)(stats);
        }
        TracingEngineReporter.report(event);
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Single-threaded collection loop. Owns its dedup state exclusively.
pub struct PaginationEngine<D, K = NullSink, R = TracingEngineReporter>
where
    D: PageDriver,
    K: ItemSink,
    R: EngineReporter,
{
    config: PaginationConfig,
    retry: RetryPolicy,
    driver: D,
    sink: K,
    reporter: R,
    seen_keys: HashSet<String>,
    pages_processed: u32,
    item_count: u64,
}

impl<D: PageDriver> PaginationEngine<D> {
    pub fn new(config: PaginationConfig, driver: D) -> Self {
        Self {
            config,
            retry: RetryPolicy::default(),
            driver,
            sink: NullSink,
            reporter: TracingEngineReporter,
            seen_keys: HashSet::new(),
            pages_processed: 0,
            item_count: 0,
        }
    }
}

impl<D, K, R> PaginationEngine<D, K, R>
where
    D: PageDriver,
    K: ItemSink,
    R: EngineReporter,
{
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Forward each round's new items to `sink` (typically a [`Dataset`](crate::dataset::Dataset)).
    pub fn with_sink<K2: ItemSink>(self, sink: K2) -> PaginationEngine<D, K2, R> {
        PaginationEngine {
            config: self.config,
            retry: self.retry,
            driver: self.driver,
            sink,
            reporter: self.reporter,
            seen_keys: self.seen_keys,
            pages_processed: self.pages_processed,
            item_count: self.item_count,
        }
    }

    pub fn with_reporter<R2: EngineReporter>(self, reporter: R2) -> PaginationEngine<D, K, R2> {
        PaginationEngine {
            config: self.config,
            retry: self.retry,
            driver: self.driver,
            sink: self.sink,
            reporter,
            seen_keys: self.seen_keys,
            pages_processed: self.pages_processed,
            item_count: self.item_count,
        }
    }

    pub fn config(&self) -> &PaginationConfig {
        &self.config
    }

    pub fn seen_keys(&self) -> &HashSet<String> {
        &self.seen_keys
    }

    pub fn pages_processed(&self) -> u32 {
        self.pages_processed
    }

    fn dedup_key(&self, record: &Value) -> String {
        match &self.config.dedup_key {
            Some(key_fn) => key_fn(record),
            None => record.to_string(),
        }
    }

    /// Snapshot of the current progress.
    pub fn checkpoint(&self) -> CollectionCheckpoint {
        CollectionCheckpoint {
            seen_keys: self.seen_keys.iter().cloned().collect(),
            pages_processed: self.pages_processed,
            item_count: self.item_count,
            saved_at: Utc::now(),
        }
    }

    pub async fn save_checkpoint<S: Storage>(
        &self,
        store: &CheckpointStore<S>,
    ) -> Result<(), AppError> {
        store.save(&self.checkpoint()).await
    }

    /// Adopt a saved checkpoint, so previously seen keys count as duplicates.
    ///
    /// Returns `false` (and leaves the engine untouched) when there is no usable checkpoint.
    pub async fn resume<S: Storage>(&mut self, store: &CheckpointStore<S>) -> bool {
        match store.load().await {
            Some(checkpoint) => {
                self.seen_keys.extend(checkpoint.seen_keys);
                self.pages_processed = self.pages_processed.max(checkpoint.pages_processed);
                self.item_count = self.item_count.max(checkpoint.item_count);
                true
            }
            None => false,
        }
    }

    /// Run the collection loop until a stop condition is met.
    pub async fn run<F, Fut, S>(&mut self, mut extract: F, options: RunOptions<S>) -> CollectionResult
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Vec<Value>, AppError>>,
        S: Storage,
    {
        let started = tokio::time::Instant::now();
        let cancel = options.cancel.unwrap_or_default();
        let checkpoint = options.checkpoint;

        if let Some(store) = &checkpoint {
            self.resume(store).await;
        }

        self.reporter.report(EngineEvent::Started {
            resumed_keys: self.seen_keys.len(),
            pages_processed: self.pages_processed,
        });

        let mut items: Vec<Value> = Vec::new();
        let mut stats = CollectionStats {
            pages_processed: self.pages_processed,
            ..Default::default()
        };
        let mut empty_rounds: u32 = 0;

        let stop_reason = loop {
            if cancel.is_cancelled() {
                break StopReason::Cancelled;
            }
            if self.pages_processed >= self.config.max_pages {
                break StopReason::MaxPages;
            }
            if items.len() >= self.config.max_items {
                break StopReason::MaxItems;
            }
            if self
                .config
                .max_errors
                .is_some_and(|max| stats.errors_recovered >= max)
            {
                break StopReason::ErrorBudget;
            }

            let added = match self.round(&mut extract, &mut items, &mut stats).await {
                Ok(added) => added,
                Err(e) => {
                    self.recover(&e, &mut stats, &cancel).await;
                    continue;
                }
            };

            self.pages_processed += 1;
            stats.pages_processed = self.pages_processed;
            stats.total = items.len();
            self.reporter.report(EngineEvent::Progress {
                stats: &stats,
                added,
            });

            if added == 0 {
                empty_rounds += 1;
                if empty_rounds >= self.config.empty_rounds_limit {
                    break StopReason::Exhausted;
                }
            } else {
                empty_rounds = 0;
            }

            match self.driver.is_error_page().await {
                Ok(false) => {}
                Ok(true) => {
                    stats.errors_recovered += 1;
                    let cooldown = self.config.error_page_cooldown;
                    self.reporter.report(EngineEvent::ErrorPage { cooldown });
                    pause(&cancel, cooldown).await;
                }
                Err(e) => self.recover(&e, &mut stats, &cancel).await,
            }

            let every = self.config.checkpoint_every;
            if every > 0 && self.pages_processed % every == 0 {
                if let Some(store) = &checkpoint {
                    self.persist(store).await;
                }
            }
        };

        if let Some(store) = &checkpoint {
            self.persist(store).await;
        }

        stats.total = items.len();
        stats.duration_ms = millis(started.elapsed());
        stats.stop_reason = Some(stop_reason);
        self.reporter.report(EngineEvent::Finished { stats: &stats });

        CollectionResult { items, stats }
    }

    /// One advance + extraction + dedup pass. Returns the number of new items.
    async fn round<F, Fut>(
        &mut self,
        extract: &mut F,
        items: &mut Vec<Value>,
        stats: &mut CollectionStats,
    ) -> Result<usize, AppError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Vec<Value>, AppError>>,
    {
        self.driver.advance().await?;
        if !self.config.scroll_delay.is_zero() {
            tokio::time::sleep(self.config.scroll_delay).await;
        }

        let batch = self.retry.execute(&mut *extract).await?;

        let room = self.config.max_items.saturating_sub(items.len());
        let mut duplicates: u64 = 0;
        let mut batch_keys: HashSet<String> = HashSet::new();
        let mut fresh: Vec<Value> = Vec::new();

        for record in batch {
            let key = self.dedup_key(&record);
            if self.seen_keys.contains(&key) || batch_keys.contains(&key) {
                duplicates += 1;
                continue;
            }
            if fresh.len() >= room {
                // Over the item limit; leave the rest unseen for a later run.
                break;
            }
            batch_keys.insert(key);
            fresh.push(record);
        }

        if !fresh.is_empty() {
            self.sink.accept(&fresh).await?;
        }

        let added = fresh.len();
        self.seen_keys.extend(batch_keys);
        self.item_count += added as u64;
        stats.duplicates_removed += duplicates;
        items.extend(fresh);
        Ok(added)
    }

    async fn recover(&self, error: &AppError, stats: &mut CollectionStats, cancel: &CancellationToken) {
        stats.errors_recovered += 1;
        let delay = self.config.error_delay;
        self.reporter
            .report(EngineEvent::ErrorRecovered { error, delay });
        pause(cancel, delay).await;
    }

    async fn persist<S: Storage>(&self, store: &CheckpointStore<S>) {
        match self.save_checkpoint(store).await {
            Ok(()) => self.reporter.report(EngineEvent::CheckpointSaved {
                pages_processed: self.pages_processed,
            }),
            Err(e) => self
                .reporter
                .report(EngineEvent::CheckpointFailed { error: &e }),
        }
    }
}

/// Sleep for `duration`, waking early on cancellation.
async fn pause(cancel: &CancellationToken, duration: Duration) {
    tokio::select! {
        () = tokio::time::sleep(duration) => {}
        () = cancel.cancelled() => {}
    }
}
