use serde_json::{Value, json};
use tempfile::TempDir;
use trawl_core::{DatasetStore, FileStorage};

/// A dataset store rooted in a fresh temporary directory.
///
/// Returns the directory too; dropping it deletes everything.
pub fn setup_store() -> (DatasetStore<FileStorage>, TempDir) {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let store = DatasetStore::new(FileStorage::new(dir.path()));
    (store, dir)
}

/// `count` listing records with ids starting at `first`.
pub fn listings(first: u32, count: u32) -> Vec<Value> {
    (first..first + count)
        .map(|i| json!({"id": format!("item-{i}"), "title": format!("Listing {i}"), "price": i * 10}))
        .collect()
}
