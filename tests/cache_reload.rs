#![allow(clippy::unwrap_used, clippy::expect_used, missing_docs)]

mod common;

use std::time::Duration;

use common::{MockRemote, eventually, test_opt};
use vfs_cache::{Cache, OpenMode};

/// Write a dirty file with uploads held off, then abandon the cache without
/// shutting down: the moral equivalent of a crash with sidecars on disk.
#[tokio::test]
async fn dirty_item_survives_restart_and_uploads() {
    let tmp = tempfile::tempdir().unwrap();
    let remote = MockRemote::new();
    let payload = vec![9u8; 2 * 1024];

    {
        let mut opt = test_opt(tmp.path());
        opt.write_back_delay = Duration::from_secs(3600);
        let cache = Cache::new(remote.clone(), opt, None).await.unwrap();
        let handle = cache
            .open("crashy", OpenMode::WRITE | OpenMode::CREATE)
            .await
            .unwrap();
        handle.write(0, &payload).await.unwrap();
        handle.close().await.unwrap();
        // No shutdown: the process "dies" here.
    }
    assert!(remote.contents("crashy").is_none(), "nothing uploaded yet");

    // Second run picks the sidecar up and uploads.
    let cache = Cache::new(remote.clone(), test_opt(tmp.path()), None)
        .await
        .unwrap();
    assert!(
        eventually(Duration::from_secs(5), || async {
            remote.contents("crashy").is_some()
        })
        .await,
        "reloaded dirty item never uploaded"
    );
    assert_eq!(
        remote.contents("crashy").unwrap(),
        payload,
        "remote contents must match the pre-crash local bytes"
    );
    cache.shutdown().await;
}

#[tokio::test]
async fn backing_file_without_sidecar_is_preserved_as_dirty() {
    let tmp = tempfile::tempdir().unwrap();
    let remote = MockRemote::new();

    // Simulate a crash between write and sidecar persist: bytes on disk,
    // no metadata.
    let backing_dir = tmp.path().join("vfs/mock_remote/docs");
    std::fs::create_dir_all(&backing_dir).unwrap();
    std::fs::write(backing_dir.join("orphaned.txt"), b"recovered bytes").unwrap();

    let cache = Cache::new(remote.clone(), test_opt(tmp.path()), None)
        .await
        .unwrap();
    assert!(
        eventually(Duration::from_secs(5), || async {
            remote.contents("docs/orphaned.txt").is_some()
        })
        .await,
        "recovered bytes never uploaded"
    );
    assert_eq!(
        remote.contents("docs/orphaned.txt").unwrap(),
        b"recovered bytes",
        "the whole file must be treated as one dirty range"
    );
    cache.shutdown().await;
}

#[tokio::test]
async fn corrupt_sidecar_is_preserved_as_dirty() {
    let tmp = tempfile::tempdir().unwrap();
    let remote = MockRemote::new();

    let backing_dir = tmp.path().join("vfs/mock_remote");
    let meta_dir = tmp.path().join("vfsMeta/mock_remote");
    std::fs::create_dir_all(&backing_dir).unwrap();
    std::fs::create_dir_all(&meta_dir).unwrap();
    std::fs::write(backing_dir.join("mangled"), b"still here").unwrap();
    std::fs::write(meta_dir.join("mangled"), b"{definitely not json").unwrap();

    let cache = Cache::new(remote.clone(), test_opt(tmp.path()), None)
        .await
        .unwrap();
    assert!(
        eventually(Duration::from_secs(5), || async {
            remote.contents("mangled") == Some(b"still here".to_vec())
        })
        .await,
        "bytes behind a corrupt sidecar must survive as dirty data"
    );
    cache.shutdown().await;
}

#[tokio::test]
async fn zero_length_orphan_is_removed() {
    let tmp = tempfile::tempdir().unwrap();
    let remote = MockRemote::new();

    let backing_dir = tmp.path().join("vfs/mock_remote");
    std::fs::create_dir_all(&backing_dir).unwrap();
    std::fs::write(backing_dir.join("empty-orphan"), b"").unwrap();

    let cache = Cache::new(remote.clone(), test_opt(tmp.path()), None)
        .await
        .unwrap();
    assert!(
        !backing_dir.join("empty-orphan").exists(),
        "zero-length file with no sidecar and no remote is an orphan"
    );
    assert_eq!(cache.stats().await.items, 0);
    cache.shutdown().await;
}

#[tokio::test]
async fn valid_sidecar_without_backing_refetches_on_open() {
    let tmp = tempfile::tempdir().unwrap();
    let remote = MockRemote::new();
    remote.insert("refetch-me", b"remote truth");

    // First run caches the object.
    {
        let cache = Cache::new(remote.clone(), test_opt(tmp.path()), None)
            .await
            .unwrap();
        let handle = cache.open("refetch-me", OpenMode::READ).await.unwrap();
        let mut buf = [0u8; 12];
        handle.read(0, &mut buf).await.unwrap();
        handle.close().await.unwrap();
        cache.shutdown().await;
    }

    // Someone clears the data tree but leaves the sidecar.
    std::fs::remove_file(tmp.path().join("vfs/mock_remote/refetch-me")).unwrap();

    let cache = Cache::new(remote.clone(), test_opt(tmp.path()), None)
        .await
        .unwrap();
    assert_eq!(
        cache.stats().await.items,
        1,
        "sidecar alone keeps the item alive"
    );

    let before = remote.get_count.load(std::sync::atomic::Ordering::SeqCst);
    let handle = cache.open("refetch-me", OpenMode::READ).await.unwrap();
    let mut buf = [0u8; 12];
    handle.read(0, &mut buf).await.unwrap();
    assert_eq!(&buf[..], b"remote truth");
    assert!(
        remote.get_count.load(std::sync::atomic::Ordering::SeqCst) > before,
        "data must come back from the remote"
    );
    handle.close().await.unwrap();
    cache.shutdown().await;
}

#[tokio::test]
async fn stale_temp_files_are_cleared_on_reload() {
    let tmp = tempfile::tempdir().unwrap();
    let remote = MockRemote::new();

    let meta_dir = tmp.path().join("vfsMeta/mock_remote");
    std::fs::create_dir_all(&meta_dir).unwrap();
    std::fs::write(meta_dir.join("thing.tmp"), b"half-written sidecar").unwrap();

    let cache = Cache::new(remote.clone(), test_opt(tmp.path()), None)
        .await
        .unwrap();
    assert!(
        !meta_dir.join("thing.tmp").exists(),
        "stale atomic-write temp files must be cleaned up"
    );
    assert_eq!(cache.stats().await.items, 0, "temp files are not items");
    cache.shutdown().await;
}

#[tokio::test]
async fn clean_cached_item_survives_restart_without_refetch() {
    let tmp = tempfile::tempdir().unwrap();
    let remote = MockRemote::new();
    remote.insert("stable", b"cache me");

    {
        let cache = Cache::new(remote.clone(), test_opt(tmp.path()), None)
            .await
            .unwrap();
        let handle = cache.open("stable", OpenMode::READ).await.unwrap();
        let mut buf = [0u8; 8];
        handle.read(0, &mut buf).await.unwrap();
        handle.close().await.unwrap();
        cache.shutdown().await;
    }

    let cache = Cache::new(remote.clone(), test_opt(tmp.path()), None)
        .await
        .unwrap();
    let gets_before = remote.get_count.load(std::sync::atomic::Ordering::SeqCst);
    let handle = cache.open("stable", OpenMode::READ).await.unwrap();
    let mut buf = [0u8; 8];
    handle.read(0, &mut buf).await.unwrap();
    assert_eq!(&buf[..], b"cache me");
    assert_eq!(
        remote.get_count.load(std::sync::atomic::Ordering::SeqCst),
        gets_before,
        "present ranges from the sidecar must serve the read locally"
    );
    handle.close().await.unwrap();
    cache.shutdown().await;
}
