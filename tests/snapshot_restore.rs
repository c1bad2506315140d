use std::collections::BTreeMap;
use std::sync::Arc;

use metrix::metric::{Metric, MetricKind};
use metrix::repository::{MemoryRepository, Repository};
use metrix::snapshot::SnapshotStore;

fn as_map(metrics: Vec<Metric>) -> BTreeMap<(String, String), Metric> {
    metrics
        .into_iter()
        .map(|m| ((m.id.clone(), m.kind.to_string()), m))
        .collect()
}

#[tokio::test]
async fn restore_recovers_the_flushed_state() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("snapshot.jsonl");

    let repo: Arc<dyn Repository> = Arc::new(MemoryRepository::new());
    repo.save_or_update(Metric::counter("A", 1)).await.unwrap();
    repo.save_or_update(Metric::gauge("B", 3.14)).await.unwrap();
    let before = as_map(repo.list().await.unwrap());

    let store = SnapshotStore::new(repo, &path, 0);
    store.close().await.unwrap();

    // A fresh process: new repository, same file.
    let repo: Arc<dyn Repository> = Arc::new(MemoryRepository::new());
    let store = SnapshotStore::new(repo.clone(), &path, 0);
    let restored = store.restore().await.unwrap();
    assert_eq!(restored, 2);

    let after = as_map(repo.list().await.unwrap());
    assert_eq!(before, after);
    assert_eq!(
        repo.get("A", MetricKind::Counter).await.unwrap().delta,
        Some(1)
    );
    assert_eq!(
        repo.get("B", MetricKind::Gauge).await.unwrap().value,
        Some(3.14)
    );
}

#[tokio::test]
async fn flush_writes_one_json_line_per_metric() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("snapshot.jsonl");

    let repo: Arc<dyn Repository> = Arc::new(MemoryRepository::new());
    repo.save_or_update(Metric::counter("req", 5)).await.unwrap();
    repo.save_or_update(Metric::gauge("cpu", 0.5)).await.unwrap();

    let store = SnapshotStore::new(repo.clone(), &path, 0);
    store.flush_all().await.unwrap();

    let content = std::fs::read_to_string(&path).unwrap();
    let parsed: Vec<Metric> = content
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(as_map(parsed), as_map(repo.list().await.unwrap()));
}

#[tokio::test]
async fn later_records_override_earlier_ones_on_restore() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("snapshot.jsonl");
    std::fs::write(
        &path,
        concat!(
            "{\"id\":\"req\",\"type\":\"counter\",\"delta\":2}\n",
            "{\"id\":\"req\",\"type\":\"counter\",\"delta\":7}\n",
        ),
    )
    .unwrap();

    let repo: Arc<dyn Repository> = Arc::new(MemoryRepository::new());
    let store = SnapshotStore::new(repo.clone(), &path, 0);
    store.restore().await.unwrap();

    assert_eq!(
        repo.get("req", MetricKind::Counter).await.unwrap().delta,
        Some(7)
    );
}

#[tokio::test]
async fn missing_file_restores_to_an_empty_store() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.jsonl");

    let repo: Arc<dyn Repository> = Arc::new(MemoryRepository::new());
    let store = SnapshotStore::new(repo.clone(), &path, 0);
    assert_eq!(store.restore().await.unwrap(), 0);
    assert!(repo.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn malformed_record_aborts_restore() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("snapshot.jsonl");
    std::fs::write(
        &path,
        "{\"id\":\"ok\",\"type\":\"counter\",\"delta\":1}\nnot json at all\n",
    )
    .unwrap();

    let repo: Arc<dyn Repository> = Arc::new(MemoryRepository::new());
    let store = SnapshotStore::new(repo, &path, 0);
    assert!(store.restore().await.is_err());
}

#[tokio::test]
async fn interval_mode_rewrites_the_file_periodically() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("snapshot.jsonl");

    let repo: Arc<dyn Repository> = Arc::new(MemoryRepository::new());
    let store = Arc::new(SnapshotStore::new(repo.clone(), &path, 1));
    assert!(!store.sync_mode());
    store.start();

    repo.save_or_update(Metric::gauge("cpu", 0.25)).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(1300)).await;

    let content = std::fs::read_to_string(&path).unwrap();
    let parsed: Vec<Metric> = content
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(parsed.len(), 1);
    assert_eq!(parsed[0].value, Some(0.25));

    store.close().await.unwrap();
}

#[tokio::test]
async fn close_performs_a_final_flush() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("snapshot.jsonl");

    let repo: Arc<dyn Repository> = Arc::new(MemoryRepository::new());
    let store = Arc::new(SnapshotStore::new(repo.clone(), &path, 60));
    store.start();

    // Written after start; the 60s ticker will not fire in this test, so
    // only the close-time flush can persist it.
    repo.save_or_update(Metric::counter("req", 3)).await.unwrap();
    store.close().await.unwrap();

    let content = std::fs::read_to_string(&path).unwrap();
    assert!(content.contains("\"req\""));
}
