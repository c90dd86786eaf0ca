use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use trawl_core::testutil::{FaultyStorage, MockDriver, ScriptedExtractor};
use trawl_core::{
    AppError, CheckpointStore, CollectionStats, DatasetStore, NoopDriver, PaginationConfig, PaginationEngine,
    ProgressReporter, RetryConfig, RetryPolicy, RunOptions, StopReason,
};

use crate::integration::common::{listings, setup_store};

fn config() -> PaginationConfig {
    PaginationConfig::default()
        .with_scroll_delay(Duration::ZERO)
        .with_dedup_field("id")
}

/// Pages of 3 listings where each page repeats the last listing of the previous one.
fn overlapping_pages(pages: u32) -> Vec<Result<Vec<Value>, AppError>> {
    (0..pages).map(|p| Ok(listings(p * 2, 3))).collect()
}

#[tokio::test(start_paused = true)]
async fn collected_items_land_in_dataset_without_duplicates() {
    let (store, _dir) = setup_store();
    let dataset = store.open("feed").await.unwrap();
    let extractor = ScriptedExtractor::new(overlapping_pages(4));

    let mut engine = PaginationEngine::new(config().with_max_pages(4), MockDriver::new())
        .with_sink(dataset.clone());
    let result = engine
        .run(|| extractor.next_batch(), RunOptions::new())
        .await;

    assert_eq!(result.stats.stop_reason, Some(StopReason::MaxPages));
    assert_eq!(result.items.len(), 9);
    assert_eq!(result.stats.duplicates_removed, 3);

    let page = dataset.get_data(0, 100).await.unwrap();
    assert_eq!(page.items, result.items);
    assert_eq!(dataset.get_info().await.unwrap().item_count, 9);
}

#[tokio::test(start_paused = true)]
async fn cancelled_run_resumes_from_checkpoint_file() {
    let (store, dir) = setup_store();
    let dataset = store.open("resumable").await.unwrap();
    let checkpoint_path = dir.path().join("state").join("resumable.json");

    let token = CancellationToken::new();
    let stop_after_two = token.clone();
    let first = ScriptedExtractor::new(overlapping_pages(5));
    let mut engine = PaginationEngine::new(config(), MockDriver::new())
        .with_sink(dataset.clone())
        .with_reporter(ProgressReporter(move |stats: &CollectionStats| {
            if stats.pages_processed == 2 {
                stop_after_two.cancel();
            }
        }));
    let interrupted = engine
        .run(
            || first.next_batch(),
            RunOptions::new()
                .with_checkpoint(CheckpointStore::at_path(&checkpoint_path).unwrap())
                .with_cancel(token),
        )
        .await;
    assert_eq!(interrupted.stats.stop_reason, Some(StopReason::Cancelled));
    assert_eq!(interrupted.items.len(), 5);
    assert!(checkpoint_path.exists());

    // The source replays from the start; everything already stored is skipped.
    let second = ScriptedExtractor::new(overlapping_pages(6));
    let mut resumed = PaginationEngine::new(config().with_max_pages(8), MockDriver::new())
        .with_sink(dataset.clone());
    let result = resumed
        .run(
            || second.next_batch(),
            RunOptions::new().with_checkpoint(CheckpointStore::at_path(&checkpoint_path).unwrap()),
        )
        .await;

    assert_eq!(result.stats.stop_reason, Some(StopReason::MaxPages));
    assert_eq!(result.stats.pages_processed, 8);
    assert_eq!(result.items.len(), 8);
    assert_eq!(dataset.get_info().await.unwrap().item_count, 13);

    let ids: Vec<Value> = dataset
        .get_data(0, 100)
        .await
        .unwrap()
        .items
        .into_iter()
        .map(|item| item["id"].clone())
        .collect();
    let expected: Vec<Value> = (0..13).map(|i| json!(format!("item-{i}"))).collect();
    assert_eq!(ids, expected);
}

#[tokio::test(start_paused = true)]
async fn flaky_extraction_is_retried_then_recovered() {
    let extractor = ScriptedExtractor::new(vec![
        Err(AppError::Timeout(30_000)),
        Ok(listings(0, 2)),
        Err(AppError::Generic("Cannot read properties of undefined".into())),
        Ok(listings(2, 2)),
    ]);
    let retry = RetryPolicy::new(RetryConfig::default().with_jitter(Duration::ZERO));
    let mut engine =
        PaginationEngine::new(config().with_max_pages(2), NoopDriver).with_retry(retry);

    let start = tokio::time::Instant::now();
    let result = engine
        .run(|| extractor.next_batch(), RunOptions::new())
        .await;

    // Timeout: retried inside the policy (1s backoff). Unknown: recovered by the loop (5s).
    assert_eq!(result.items.len(), 4);
    assert_eq!(result.stats.errors_recovered, 1);
    assert_eq!(extractor.calls(), 4);
    assert!(start.elapsed() >= Duration::from_secs(6));
}

#[tokio::test(start_paused = true)]
async fn progress_is_reported_once_per_page() {
    let extractor = ScriptedExtractor::new(overlapping_pages(3));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let mut engine = PaginationEngine::new(config().with_max_pages(3), NoopDriver).with_reporter(
        ProgressReporter(move |stats: &CollectionStats| {
            sink.lock().unwrap().push((stats.pages_processed, stats.total));
        }),
    );

    engine
        .run(|| extractor.next_batch(), RunOptions::new())
        .await;

    assert_eq!(*seen.lock().unwrap(), vec![(1, 3), (2, 5), (3, 7)]);
}

#[tokio::test(start_paused = true)]
async fn metadata_failure_does_not_duplicate_records() {
    let storage = FaultyStorage::new().fail_next_write("metadata.json");
    let dataset = DatasetStore::new(storage.clone()).open("shaky").await.unwrap();
    let extractor = ScriptedExtractor::new(vec![
        Ok(vec![json!({"id": "a"})]),
        Ok(vec![json!({"id": "a"})]),
    ]);

    let mut engine = PaginationEngine::new(config().with_max_pages(2), MockDriver::new())
        .with_sink(dataset.clone());
    let result = engine
        .run(|| extractor.next_batch(), RunOptions::new())
        .await;

    assert_eq!(result.items, vec![json!({"id": "a"})]);
    assert_eq!(result.stats.errors_recovered, 0);
    assert_eq!(result.stats.duplicates_removed, 1);

    let page = dataset.get_data(0, 10).await.unwrap();
    assert_eq!(page.items, vec![json!({"id": "a"})]);
    assert_eq!(dataset.get_info().await.unwrap().item_count, 1);
}
