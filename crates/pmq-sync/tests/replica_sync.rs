use std::path::Path;
use std::time::Duration;

use pmq_core::MarketRecord;
use pmq_storage::{count_active_records, MarketWriter, ReplicaGuard, SnapshotWriter};
use pmq_sync::{snapshot_digest, FileSnapshot, ReplicaSync, SyncConfig};
use tempfile::tempdir;

fn fast_config(write: &Path, read: &Path) -> SyncConfig {
    SyncConfig {
        max_wait: Duration::from_millis(150),
        poll_interval: Duration::from_millis(10),
        ..SyncConfig::for_paths(write, read)
    }
}

async fn seed_writer(path: &Path, active: &[&str], inactive: &[&str]) {
    let writer = MarketWriter::open(path).await.expect("open writer");
    for (idx, id) in active.iter().chain(inactive.iter()).enumerate() {
        let record = MarketRecord {
            volume: Some(100.0 * (idx + 1) as f64),
            ..MarketRecord::new(*id, format!("Market {id}"))
        };
        writer.upsert_market(&record).await.expect("upsert");
    }
    let keep = active.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    writer.mark_inactive_except(&keep).await.expect("mark inactive");
    writer.close().await;
}

#[tokio::test]
async fn completed_sync_matches_writer_active_count() {
    let dir = tempdir().expect("tempdir");
    let write = dir.path().join("polymarket.db");
    let read = dir.path().join("polymarket_read.db");
    seed_writer(&write, &["a", "b", "c"], &["d"]).await;

    let sync = ReplicaSync::new(fast_config(&write, &read), ReplicaGuard::new());
    let summary = sync.run_once().await;

    assert!(summary.synced);
    assert_eq!(count_active_records(&read).await.expect("count"), 3);
    assert_eq!(
        summary.snapshot_sha256,
        Some(snapshot_digest(&read).await.expect("digest"))
    );
    assert!(!FileSnapshot::new(&write, &read).backup_path().exists());
}

#[tokio::test]
async fn held_reader_leaves_snapshot_untouched() {
    let dir = tempdir().expect("tempdir");
    let write = dir.path().join("polymarket.db");
    let read = dir.path().join("polymarket_read.db");
    seed_writer(&write, &["a"], &[]).await;

    let guard = ReplicaGuard::with_poll_interval(Duration::from_millis(10));
    let sync = ReplicaSync::new(fast_config(&write, &read), guard.clone());
    assert!(sync.run_once().await.synced);
    let before = snapshot_digest(&read).await.expect("digest");

    seed_writer(&write, &["a", "b", "c"], &[]).await;
    let _reader = guard.enter_read();
    let summary = sync.run_once().await;

    assert!(!summary.synced);
    assert_eq!(summary.snapshot_sha256, None);
    assert_eq!(snapshot_digest(&read).await.expect("digest"), before);
    assert_eq!(count_active_records(&read).await.expect("count"), 1);
}

#[tokio::test]
async fn failed_copy_restores_previous_snapshot() {
    let dir = tempdir().expect("tempdir");
    let write = dir.path().join("polymarket.db");
    let read = dir.path().join("polymarket_read.db");
    seed_writer(&write, &["a", "b"], &[]).await;

    let sync = ReplicaSync::new(fast_config(&write, &read), ReplicaGuard::new());
    assert!(sync.run_once().await.synced);
    let before = snapshot_digest(&read).await.expect("digest");

    std::fs::write(&write, b"this writer file has been clobbered by something else entirely")
        .expect("clobber writer");
    let summary = sync.run_once().await;

    assert!(!summary.synced);
    assert_eq!(snapshot_digest(&read).await.expect("digest"), before);
    assert_eq!(count_active_records(&read).await.expect("count"), 2);

    let leftovers = std::fs::read_dir(dir.path())
        .expect("read dir")
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().ends_with(".tmp"))
        .count();
    assert_eq!(leftovers, 0);
}

#[tokio::test]
async fn missing_writer_store_is_initialized_empty() {
    let dir = tempdir().expect("tempdir");
    let write = dir.path().join("nested").join("polymarket.db");
    let read = dir.path().join("replica").join("polymarket_read.db");
    let snapshot = FileSnapshot::new(&write, &read);

    snapshot.backup().await.expect("backup with no snapshot");
    let active = snapshot.copy().await.expect("copy");

    assert_eq!(active, 0);
    assert!(write.exists());
    assert_eq!(count_active_records(&read).await.expect("count"), 0);
    snapshot.discard_backup().await.expect("discard");
}
