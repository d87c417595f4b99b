#![allow(clippy::unwrap_used, clippy::expect_used, missing_docs)]

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{MockRemote, eventually, test_opt};
use vfs_cache::{Cache, OpenMode};

#[tokio::test]
async fn close_uploads_after_delay() {
    let tmp = tempfile::tempdir().unwrap();
    let remote = MockRemote::new();
    let cache = Cache::new(remote.clone(), test_opt(tmp.path()), None)
        .await
        .unwrap();

    let payload = vec![42u8; 4 * 1024];
    let handle = cache
        .open("a", OpenMode::WRITE | OpenMode::CREATE)
        .await
        .unwrap();
    handle.write(0, &payload).await.unwrap();
    handle.close().await.unwrap();

    assert!(
        eventually(Duration::from_secs(5), || async {
            remote.contents("a").is_some()
        })
        .await,
        "object never arrived on the remote"
    );
    assert_eq!(remote.contents("a").unwrap(), payload);

    // Once uploaded the item is clean.
    assert!(
        eventually(Duration::from_secs(2), || async {
            cache.stats().await.dirty == 0
        })
        .await,
        "item should be clean after upload"
    );
    cache.shutdown().await;
}

#[tokio::test]
async fn reopen_after_upload_preserves_contents_and_mtime() {
    let tmp = tempfile::tempdir().unwrap();
    let remote = MockRemote::new();
    let cache = Cache::new(remote.clone(), test_opt(tmp.path()), None)
        .await
        .unwrap();

    let handle = cache
        .open("keep.bin", OpenMode::READ_WRITE | OpenMode::CREATE)
        .await
        .unwrap();
    handle.write(0, b"durable bytes").await.unwrap();
    let mtime = handle.mod_time().await;
    handle.close().await.unwrap();

    assert!(
        eventually(Duration::from_secs(5), || async {
            remote.contents("keep.bin").is_some()
        })
        .await,
        "upload never happened"
    );

    let stat = remote
        .stat_object("keep.bin")
        .expect("object should exist on remote");
    assert_eq!(stat.0, b"durable bytes".to_vec());
    assert_eq!(stat.1, mtime, "remote mtime should match the local mtime");

    // Re-open and read back through the cache.
    let handle = cache.open("keep.bin", OpenMode::READ).await.unwrap();
    let mut buf = [0u8; 13];
    handle.read(0, &mut buf).await.unwrap();
    assert_eq!(&buf[..], b"durable bytes");
    handle.close().await.unwrap();
    cache.shutdown().await;
}

#[tokio::test]
async fn transient_failures_retry_until_success() {
    let tmp = tempfile::tempdir().unwrap();
    let remote = MockRemote::new();
    let cache = Cache::new(remote.clone(), test_opt(tmp.path()), None)
        .await
        .unwrap();

    remote.fail_next_puts(2);
    let handle = cache
        .open("flaky", OpenMode::WRITE | OpenMode::CREATE)
        .await
        .unwrap();
    handle.write(0, b"third time lucky").await.unwrap();
    handle.close().await.unwrap();

    assert!(
        eventually(Duration::from_secs(10), || async {
            remote.contents("flaky").is_some()
        })
        .await,
        "upload never succeeded"
    );
    assert_eq!(
        remote.put_count.load(Ordering::SeqCst),
        3,
        "expected two failures and one success"
    );
    assert_eq!(remote.contents("flaky").unwrap(), b"third time lucky");

    // The delay between attempts should roughly double (50ms then 100ms,
    // +/-10% jitter plus scheduling slack).
    let starts = remote.put_starts();
    assert_eq!(starts.len(), 3);
    let first_gap = starts[1] - starts[0];
    let second_gap = starts[2] - starts[1];
    assert!(
        first_gap >= Duration::from_millis(40),
        "first backoff too short: {first_gap:?}"
    );
    assert!(
        second_gap >= Duration::from_millis(80),
        "second backoff should be about twice the first: {second_gap:?}"
    );
    cache.shutdown().await;
}

#[tokio::test]
async fn rename_before_upload_targets_new_name() {
    let tmp = tempfile::tempdir().unwrap();
    let remote = MockRemote::new();
    let mut opt = test_opt(tmp.path());
    opt.write_back_delay = Duration::from_millis(300);
    let cache = Cache::new(remote.clone(), opt, None).await.unwrap();

    let handle = cache
        .open("x", OpenMode::WRITE | OpenMode::CREATE)
        .await
        .unwrap();
    handle.write(0, b"moved bytes").await.unwrap();
    handle.close().await.unwrap();

    // Rename while the upload is still waiting out its delay.
    cache.rename("x", "y", None).await.unwrap();

    assert!(
        eventually(Duration::from_secs(5), || async {
            remote.contents("y").is_some()
        })
        .await,
        "upload never targeted the new name"
    );
    assert_eq!(remote.contents("y").unwrap(), b"moved bytes");
    assert!(
        remote.contents("x").is_none(),
        "the old name must never appear on the remote"
    );
    cache.shutdown().await;
}

#[tokio::test]
async fn rename_during_upload_reuploads_under_new_name() {
    let tmp = tempfile::tempdir().unwrap();
    let remote = MockRemote::new();
    let cache = Cache::new(remote.clone(), test_opt(tmp.path()), None)
        .await
        .unwrap();
    remote.set_put_delay(Duration::from_millis(300));

    let handle = cache
        .open("x", OpenMode::WRITE | OpenMode::CREATE)
        .await
        .unwrap();
    handle.write(0, b"slow upload").await.unwrap();
    handle.close().await.unwrap();

    // Wait until the PUT is in flight, then rename underneath it.
    assert!(
        eventually(Duration::from_secs(5), || async {
            remote.put_count.load(Ordering::SeqCst) >= 1
        })
        .await,
        "upload never started"
    );
    cache.rename("x", "y", None).await.unwrap();

    assert!(
        eventually(Duration::from_secs(10), || async {
            remote.contents("y").is_some()
        })
        .await,
        "re-upload under the new name never happened"
    );
    assert!(
        remote.contents("x").is_none(),
        "cancelled upload must not leave the old name on the remote"
    );
    cache.shutdown().await;
}

#[tokio::test]
async fn write_during_upload_schedules_second_round() {
    let tmp = tempfile::tempdir().unwrap();
    let remote = MockRemote::new();
    let cache = Cache::new(remote.clone(), test_opt(tmp.path()), None)
        .await
        .unwrap();
    remote.set_put_delay(Duration::from_millis(200));

    let handle = cache
        .open("w", OpenMode::READ_WRITE | OpenMode::CREATE)
        .await
        .unwrap();
    handle.write(0, b"aaaa").await.unwrap();
    handle.close().await.unwrap();

    // Let the first upload start, then write again through a new handle.
    assert!(
        eventually(Duration::from_secs(5), || async {
            remote.put_count.load(Ordering::SeqCst) >= 1
        })
        .await,
        "first upload never started"
    );
    let handle = cache
        .open("w", OpenMode::READ_WRITE | OpenMode::CREATE)
        .await
        .unwrap();
    handle.write(0, b"bbbb").await.unwrap();
    handle.close().await.unwrap();

    // The second write must reach the remote in a later round.
    assert!(
        eventually(Duration::from_secs(10), || async {
            remote.contents("w") == Some(b"bbbb".to_vec())
        })
        .await,
        "second round never uploaded the racing write"
    );
    assert!(
        remote.put_count.load(Ordering::SeqCst) >= 2,
        "two upload rounds expected"
    );
    cache.shutdown().await;
}

#[tokio::test]
async fn remove_while_queued_reports_pending_upload() {
    let tmp = tempfile::tempdir().unwrap();
    let remote = MockRemote::new();
    let mut opt = test_opt(tmp.path());
    opt.write_back_delay = Duration::from_secs(30);
    let cache = Cache::new(remote.clone(), opt, None).await.unwrap();

    let handle = cache
        .open("doomed", OpenMode::WRITE | OpenMode::CREATE)
        .await
        .unwrap();
    handle.write(0, b"never uploaded").await.unwrap();
    handle.close().await.unwrap();

    assert!(
        cache.remove("doomed").await,
        "remove should report the queued upload"
    );
    assert!(!cache.remove("doomed").await, "second remove finds nothing");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(
        remote.contents("doomed").is_none(),
        "removed file must not upload"
    );
    cache.shutdown().await;
}

#[tokio::test]
async fn shutdown_waits_for_in_flight_upload() {
    let tmp = tempfile::tempdir().unwrap();
    let remote = MockRemote::new();
    let cache = Cache::new(remote.clone(), test_opt(tmp.path()), None)
        .await
        .unwrap();

    let handle = cache
        .open("last", OpenMode::WRITE | OpenMode::CREATE)
        .await
        .unwrap();
    handle.write(0, b"going down").await.unwrap();
    handle.close().await.unwrap();

    // Wait for the upload to begin, then shut down; the drain must let the
    // in-flight PUT finish. (The mock ignores cancellation unless it is
    // napping, so the PUT completes.)
    assert!(
        eventually(Duration::from_secs(5), || async {
            remote.put_count.load(Ordering::SeqCst) >= 1
        })
        .await,
        "upload never started"
    );
    cache.shutdown().await;
    assert_eq!(remote.contents("last").unwrap(), b"going down");
}

#[tokio::test]
async fn virtual_entry_hook_sees_queued_items() {
    use std::sync::{Arc, Mutex};

    let tmp = tempfile::tempdir().unwrap();
    let remote = MockRemote::new();
    let seen: Arc<Mutex<Vec<(String, u64, bool)>>> = Arc::new(Mutex::new(Vec::new()));
    let seen_hook = Arc::clone(&seen);
    let hook: Arc<vfs_cache::AddVirtualFn> = Arc::new(move |name, size, is_dir| {
        seen_hook.lock().unwrap().push((name.to_owned(), size, is_dir));
        Ok(())
    });

    let mut opt = test_opt(tmp.path());
    opt.write_back_delay = Duration::from_secs(30);
    let cache = Cache::new(remote.clone(), opt, Some(hook)).await.unwrap();

    let handle = cache
        .open("ghost/file", OpenMode::WRITE | OpenMode::CREATE)
        .await
        .unwrap();
    handle.write(0, b"pending").await.unwrap();
    handle.close().await.unwrap();

    let entries = seen.lock().unwrap().clone();
    assert!(
        entries.iter().any(|(name, _, is_dir)| name == "ghost/file" && !is_dir),
        "hook should have seen the queued file, got {entries:?}"
    );
    cache.shutdown().await;
}
