use serde_json::json;
use trawl_core::{ExportFormat, Storage};

use crate::integration::common::{listings, setup_store};

#[tokio::test]
async fn item_count_matches_records_after_many_pushes() {
    let (store, _dir) = setup_store();
    let dataset = store.open("listings").await.unwrap();

    for chunk in 0..5 {
        dataset.push_data(&listings(chunk * 3, 3)).await.unwrap();
    }

    let info = dataset.get_info().await.unwrap();
    let page = dataset.get_data(0, 100).await.unwrap();
    assert_eq!(info.item_count, 15);
    assert_eq!(page.total, 15);
    assert_eq!(page.items[0]["id"], "item-0");
    assert_eq!(page.items[14]["id"], "item-14");
    assert!(info.size_bytes > 0);
}

#[tokio::test]
async fn reopen_sees_data_written_by_earlier_handle() {
    let (store, dir) = setup_store();
    store
        .open("persisted")
        .await
        .unwrap()
        .push_data(&listings(0, 4))
        .await
        .unwrap();

    let reopened = trawl_core::DatasetStore::new(trawl_core::FileStorage::new(dir.path()))
        .open("persisted")
        .await
        .unwrap();
    assert_eq!(reopened.get_info().await.unwrap().item_count, 4);
}

#[tokio::test]
async fn crash_between_append_and_metadata_is_repaired_on_open() {
    let (store, _dir) = setup_store();
    let dataset = store.open("crashy").await.unwrap();
    dataset.push_data(&listings(0, 2)).await.unwrap();

    // Records reached the log, the process died before metadata was updated.
    store
        .storage()
        .append(
            "datasets/crashy/records.jsonl",
            b"{\"id\":\"item-2\"}\n{\"id\":\"item-3\"}\n{\"id\":\"item-",
        )
        .await
        .unwrap();

    let repaired = store.open("crashy").await.unwrap();
    assert_eq!(repaired.get_info().await.unwrap().item_count, 4);

    repaired.push_data(&[json!({"id": "item-4"})]).await.unwrap();
    let page = repaired.get_data(0, 10).await.unwrap();
    assert_eq!(page.total, 5);
    assert_eq!(page.items[4]["id"], "item-4");
    assert_eq!(repaired.get_info().await.unwrap().item_count, 5);
}

#[tokio::test]
async fn export_every_format_from_disk() {
    let (store, dir) = setup_store();
    let dataset = store.open("exports").await.unwrap();
    dataset
        .push_data(&[
            json!({"id": 1, "title": "Flat, with comma"}),
            json!({"id": 2, "tags": ["a", "b"]}),
        ])
        .await
        .unwrap();

    let as_json: Vec<serde_json::Value> =
        serde_json::from_str(&dataset.export(ExportFormat::Json).await.unwrap()).unwrap();
    assert_eq!(as_json.len(), 2);

    let jsonl = dataset.export(ExportFormat::Jsonl).await.unwrap();
    assert_eq!(jsonl.lines().count(), 2);
    let on_disk = std::fs::read_to_string(dir.path().join("datasets/exports/records.jsonl")).unwrap();
    assert_eq!(jsonl, on_disk);

    let csv = dataset.export(ExportFormat::Csv).await.unwrap();
    let mut lines = csv.lines();
    assert_eq!(lines.next(), Some("id,title,tags"));
    assert_eq!(lines.next(), Some("1,\"Flat, with comma\","));
    assert_eq!(lines.next(), Some("2,,\"[\"\"a\"\",\"\"b\"\"]\""));
}

#[tokio::test]
async fn list_and_delete() {
    let (store, dir) = setup_store();
    store.open("a").await.unwrap().push_data(&listings(0, 1)).await.unwrap();
    store.open("b").await.unwrap().push_data(&listings(0, 2)).await.unwrap();

    let names: Vec<String> = store
        .list_datasets()
        .await
        .unwrap()
        .into_iter()
        .map(|info| info.name)
        .collect();
    assert_eq!(names, vec!["a", "b"]);

    store.open("a").await.unwrap().delete().await.unwrap();
    assert!(!dir.path().join("datasets/a").exists());
    assert_eq!(store.list_datasets().await.unwrap().len(), 1);
}

#[tokio::test]
async fn rejects_path_like_names() {
    let (store, _dir) = setup_store();
    assert!(store.open("../outside").await.is_err());
    assert!(store.open("").await.is_err());
}

#[tokio::test]
async fn two_pushes_agree_across_info_and_exports() {
    let (store, _dir) = setup_store();
    let dataset = store.open("small").await.unwrap();

    let first = dataset.push_data(&[json!({"a": 1}), json!({"a": 2})]).await.unwrap();
    let second = dataset.push_data(&[json!({"a": 3})]).await.unwrap();

    assert_eq!((first.added, first.total), (2, 2));
    assert_eq!((second.added, second.total), (1, 3));
    assert_eq!(dataset.get_info().await.unwrap().item_count, 3);
    assert_eq!(dataset.export(ExportFormat::Csv).await.unwrap(), "a\n1\n2\n3\n");

    let parsed: Vec<serde_json::Value> =
        serde_json::from_str(&dataset.export(ExportFormat::Json).await.unwrap()).unwrap();
    assert_eq!(parsed, vec![json!({"a": 1}), json!({"a": 2}), json!({"a": 3})]);
}
