//! Named, append-only record datasets.
//!
//! Each dataset lives under `datasets/<name>/` in a [`Storage`] backend:
//!
//! ```text
//! datasets/<name>/records.jsonl   one compact JSON record per line, append-only
//! datasets/<name>/metadata.json   {name, itemCount, createdAt, modifiedAt}
//! ```
//!
//! `itemCount` is only ever bumped after the matching append is durable, so
//! a crash can leave metadata behind the log but never ahead of it.
//! [`DatasetStore::open`] recounts the log and repairs metadata that lags.
//! A push that fails partway marks the dataset for repair, and the next
//! write or [`Dataset::get_info`] on any live handle repairs it first.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AppError;
use crate::storage::Storage;
use crate::traits::ItemSink;

const DATASETS_PREFIX: &str = "datasets";
const RECORDS_FILE: &str = "records.jsonl";
const METADATA_FILE: &str = "metadata.json";

/// Export formats supported by [`Dataset::export`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Json,
    Jsonl,
    Csv,
}

impl ExportFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Jsonl => "jsonl",
            ExportFormat::Csv => "csv",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "jsonl" | "ndjson" => Ok(ExportFormat::Jsonl),
            "csv" => Ok(ExportFormat::Csv),
            _ => Err(format!("Unknown export format: {s}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DatasetMetadata {
    name: String,
    item_count: u64,
    created_at: DateTime<Utc>,
    modified_at: DateTime<Utc>,
}

/// Summary of a dataset. Timestamps are `None` until the first write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetInfo {
    pub name: String,
    pub item_count: u64,
    pub size_bytes: u64,
    pub created_at: Option<DateTime<Utc>>,
    pub modified_at: Option<DateTime<Utc>>,
}

/// Result of [`Dataset::push_data`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PushResult {
    pub added: u64,
    pub total: u64,
}

/// A window of records in insertion order.
#[derive(Debug, Clone, Serialize)]
pub struct DataPage {
    pub items: Vec<Value>,
    pub total: u64,
    pub offset: usize,
    pub limit: usize,
}

/// Dataset names become directory names: `[A-Za-z0-9._-]+`, not `.` or `..`.
pub fn validate_dataset_name(name: &str) -> Result<(), AppError> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(AppError::InvalidDatasetName(name.to_string()))
    }
}

/// Per-dataset writer state, shared by every handle to the same name.
#[derive(Debug, Default)]
struct WriteState {
    /// The log may be ahead of the metadata or end in a torn record.
    needs_repair: bool,
}

type WriteLock = Arc<tokio::sync::Mutex<WriteState>>;

/// Opens datasets and serialises writers to the same dataset within this process.
#[derive(Clone)]
pub struct DatasetStore<S: Storage> {
    storage: S,
    write_locks: Arc<Mutex<HashMap<String, WriteLock>>>,
}

impl<S: Storage> DatasetStore<S> {
    pub fn new(storage: S) -> Self {
        Self {
            storage,
            write_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    fn lock_for(&self, name: &str) -> WriteLock {
        let mut locks = self.write_locks.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned dataset lock table");
            poisoned.into_inner()
        });
        locks.entry(name.to_string()).or_default().clone()
    }

    fn handle(&self, name: &str) -> Result<Dataset<S>, AppError> {
        validate_dataset_name(name)?;
        Ok(Dataset {
            name: name.to_string(),
            storage: self.storage.clone(),
            write_lock: self.lock_for(name),
        })
    }

    /// Open (not create) a dataset, repairing metadata that disagrees with the log.
    pub async fn open(&self, name: &str) -> Result<Dataset<S>, AppError> {
        let dataset = self.handle(name)?;
        dataset.reconcile().await?;
        Ok(dataset)
    }

    /// Handle to an existing dataset without touching storage, `None` if it was never written.
    pub async fn get(&self, name: &str) -> Result<Option<Dataset<S>>, AppError> {
        let dataset = self.handle(name)?;
        if dataset.exists().await? {
            Ok(Some(dataset))
        } else {
            Ok(None)
        }
    }

    /// Every dataset under the storage root, sorted by name.
    pub async fn list_datasets(&self) -> Result<Vec<DatasetInfo>, AppError> {
        let mut infos = Vec::new();
        for name in self.storage.list(DATASETS_PREFIX).await? {
            match self.handle(&name) {
                Ok(dataset) => infos.push(dataset.get_info().await?),
                Err(_) => tracing::debug!(%name, "Ignoring foreign entry in datasets directory"),
            }
        }
        Ok(infos)
    }
}

/// Handle to one named dataset.
#[derive(Clone)]
pub struct Dataset<S: Storage> {
    name: String,
    storage: S,
    write_lock: WriteLock,
}

impl<S: Storage> Dataset<S> {
    pub fn name(&self) -> &str {
        &self.name
    }

    fn prefix(&self) -> String {
        format!("{DATASETS_PREFIX}/{}", self.name)
    }

    fn records_key(&self) -> String {
        format!("{}/{RECORDS_FILE}", self.prefix())
    }

    fn metadata_key(&self) -> String {
        format!("{}/{METADATA_FILE}", self.prefix())
    }

    async fn load_metadata(&self) -> Result<Option<DatasetMetadata>, AppError> {
        let Some(bytes) = self.storage.read(&self.metadata_key()).await? else {
            return Ok(None);
        };
        match serde_json::from_slice(&bytes) {
            Ok(meta) => Ok(Some(meta)),
            Err(e) => {
                tracing::warn!(dataset = %self.name, error = %e, "Corrupt dataset metadata");
                Ok(None)
            }
        }
    }

    async fn store_metadata(&self, meta: &DatasetMetadata) -> Result<(), AppError> {
        let bytes = serde_json::to_vec_pretty(meta)?;
        self.storage.write(&self.metadata_key(), &bytes).await
    }

    /// Every intact record in the log. Torn or corrupt lines are skipped.
    async fn read_records(&self) -> Result<Vec<Value>, AppError> {
        match self.storage.read(&self.records_key()).await? {
            Some(bytes) => Ok(self.parse_records(&bytes)),
            None => Ok(Vec::new()),
        }
    }

    fn parse_records(&self, bytes: &[u8]) -> Vec<Value> {
        let text = String::from_utf8_lossy(bytes);
        let mut records = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(value) => records.push(value),
                Err(e) => tracing::warn!(
                    dataset = %self.name,
                    line = lineno + 1,
                    error = %e,
                    "Skipping unreadable record"
                ),
            }
        }
        records
    }

    async fn exists(&self) -> Result<bool, AppError> {
        Ok(self.storage.size(&self.records_key()).await?.is_some()
            || self.storage.size(&self.metadata_key()).await?.is_some())
    }

    async fn reconcile(&self) -> Result<(), AppError> {
        let mut state = self.write_lock.lock().await;
        self.repair().await?;
        state.needs_repair = false;
        Ok(())
    }

    async fn repair_if_needed(&self, state: &mut WriteState) -> Result<(), AppError> {
        if state.needs_repair {
            self.repair().await?;
            state.needs_repair = false;
        }
        Ok(())
    }

    /// Terminate a torn tail and recount the log into metadata. Caller holds the write lock.
    async fn repair(&self) -> Result<(), AppError> {
        let Some(bytes) = self.storage.read(&self.records_key()).await? else {
            return Ok(());
        };
        if bytes.last().is_some_and(|b| *b != b'\n') {
            // Terminate a torn trailing record so the next append starts on a fresh line.
            self.storage.append(&self.records_key(), b"\n").await?;
        }
        let physical = self.parse_records(&bytes).len() as u64;
        let now = Utc::now();

        let meta = match self.load_metadata().await? {
            Some(meta) if meta.item_count == physical => return Ok(()),
            Some(mut meta) => {
                tracing::warn!(
                    dataset = %self.name,
                    recorded = meta.item_count,
                    physical,
                    "Dataset metadata out of sync with log, repairing"
                );
                meta.item_count = physical;
                meta.modified_at = now;
                meta
            }
            None => DatasetMetadata {
                name: self.name.clone(),
                item_count: physical,
                created_at: now,
                modified_at: now,
            },
        };
        self.store_metadata(&meta).await
    }

    /// Append records, then bump metadata once the append is durable.
    ///
    /// `Ok` means the records are in the log. A failed metadata update after a
    /// durable append is logged and repaired on the next access, not returned.
    pub async fn push_data(&self, items: &[Value]) -> Result<PushResult, AppError> {
        let mut state = self.write_lock.lock().await;
        self.repair_if_needed(&mut state).await?;

        let existing = self.load_metadata().await?;
        if items.is_empty() {
            let total = existing.map(|m| m.item_count).unwrap_or(0);
            return Ok(PushResult { added: 0, total });
        }

        let mut buf = Vec::new();
        for item in items {
            serde_json::to_writer(&mut buf, item)?;
            buf.push(b'\n');
        }
        if let Err(e) = self.storage.append(&self.records_key(), &buf).await {
            state.needs_repair = true;
            return Err(e);
        }

        let now = Utc::now();
        let added = items.len() as u64;
        let meta = match existing {
            Some(mut meta) => {
                meta.item_count += added;
                meta.modified_at = now;
                meta
            }
            None => DatasetMetadata {
                name: self.name.clone(),
                item_count: added,
                created_at: now,
                modified_at: now,
            },
        };
        if let Err(e) = self.store_metadata(&meta).await {
            state.needs_repair = true;
            tracing::warn!(
                dataset = %self.name,
                error = %e,
                "Records appended but metadata update failed, repairing on next access"
            );
        }

        tracing::debug!(dataset = %self.name, added, total = meta.item_count, "Pushed records");
        Ok(PushResult {
            added,
            total: meta.item_count,
        })
    }

    /// Records `[offset, offset + limit)` in insertion order. A missing log is an empty page.
    pub async fn get_data(&self, offset: usize, limit: usize) -> Result<DataPage, AppError> {
        let records = self.read_records().await?;
        let total = records.len() as u64;
        let items = records.into_iter().skip(offset).take(limit).collect();
        Ok(DataPage {
            items,
            total,
            offset,
            limit,
        })
    }

    pub async fn get_info(&self) -> Result<DatasetInfo, AppError> {
        {
            let mut state = self.write_lock.lock().await;
            self.repair_if_needed(&mut state).await?;
        }
        let meta = self.load_metadata().await?;
        let size_bytes = self
            .storage
            .size(&self.records_key())
            .await?
            .unwrap_or(0);
        Ok(DatasetInfo {
            name: self.name.clone(),
            item_count: meta.as_ref().map(|m| m.item_count).unwrap_or(0),
            size_bytes,
            created_at: meta.as_ref().map(|m| m.created_at),
            modified_at: meta.as_ref().map(|m| m.modified_at),
        })
    }

    /// Render the whole dataset in `format`.
    pub async fn export(&self, format: ExportFormat) -> Result<String, AppError> {
        let records = self.read_records().await?;
        match format {
            ExportFormat::Json => Ok(serde_json::to_string_pretty(&records)?),
            ExportFormat::Jsonl => {
                let mut out = String::new();
                for record in &records {
                    out.push_str(&serde_json::to_string(record)?);
                    out.push('\n');
                }
                Ok(out)
            }
            ExportFormat::Csv => to_csv(&records),
        }
    }

    /// Remove the dataset and all of its records. Irreversible.
    pub async fn delete(&self) -> Result<(), AppError> {
        let mut state = self.write_lock.lock().await;
        self.storage.remove_prefix(&self.prefix()).await?;
        state.needs_repair = false;
        tracing::info!(dataset = %self.name, "Dataset deleted");
        Ok(())
    }
}

impl<S: Storage> ItemSink for Dataset<S> {
    async fn accept(&self, items: &[Value]) -> Result<(), AppError> {
        self.push_data(items).await.map(|_| ())
    }
}

// ---------------------------------------------------------------------------
// CSV export
// ---------------------------------------------------------------------------

/// Column for records that are not JSON objects.
const SCALAR_COLUMN: &str = "value";

/// Header is the union of keys in order of first appearance; missing keys are empty.
fn to_csv(records: &[Value]) -> Result<String, AppError> {
    let mut columns: Vec<String> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    for record in records {
        let keys: Vec<&str> = match record {
            Value::Object(map) => map.keys().map(String::as_str).collect(),
            _ => vec![SCALAR_COLUMN],
        };
        for key in keys {
            if seen.insert(key.to_string()) {
                columns.push(key.to_string());
            }
        }
    }

    let mut writer = csv::Writer::from_writer(Vec::new());
    if !columns.is_empty() {
        writer.write_record(&columns)?;
    }
    for record in records {
        let row: Vec<String> = columns
            .iter()
            .map(|col| match record {
                Value::Object(map) => map.get(col).map(render_cell).unwrap_or_default(),
                other if col == SCALAR_COLUMN => render_cell(other),
                _ => String::new(),
            })
            .collect();
        writer.write_record(&row)?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| AppError::CsvError(e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| AppError::CsvError(e.to_string()))
}

fn render_cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
