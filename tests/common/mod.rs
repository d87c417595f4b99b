#![allow(dead_code, missing_docs, clippy::unwrap_used)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncReadExt as _;
use tokio_util::sync::CancellationToken;

use vfs_cache::{ByteRange, CacheOpt, Error, ObjectInfo, RemoteStore, Result};

/// One object as the mock remote stores it.
#[derive(Clone)]
pub struct RemoteObject {
    pub data: Vec<u8>,
    pub mod_time: SystemTime,
}

/// In-memory remote store with call counters and fault injection.
pub struct MockRemote {
    objects: Mutex<HashMap<String, RemoteObject>>,
    pub put_count: AtomicUsize,
    pub get_count: AtomicUsize,
    pub stat_count: AtomicUsize,
    /// Ranges requested via `get_range`, in call order.
    get_ranges: Mutex<Vec<(String, ByteRange)>>,
    /// When each `put` started, for backoff-shape assertions.
    put_starts: Mutex<Vec<Instant>>,
    /// The next N puts fail with `Transient`.
    fail_puts: AtomicUsize,
    /// Artificial latency per put / get, in milliseconds.
    put_delay_ms: AtomicU64,
    get_delay_ms: AtomicU64,
}

impl MockRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            objects: Mutex::new(HashMap::new()),
            put_count: AtomicUsize::new(0),
            get_count: AtomicUsize::new(0),
            stat_count: AtomicUsize::new(0),
            get_ranges: Mutex::new(Vec::new()),
            put_starts: Mutex::new(Vec::new()),
            fail_puts: AtomicUsize::new(0),
            put_delay_ms: AtomicU64::new(0),
            get_delay_ms: AtomicU64::new(0),
        })
    }

    /// Seed an object.
    pub fn insert(&self, name: &str, data: &[u8]) {
        self.objects.lock().unwrap().insert(
            name.to_owned(),
            RemoteObject {
                data: data.to_vec(),
                mod_time: SystemTime::now(),
            },
        );
    }

    pub fn contents(&self, name: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .get(name)
            .map(|o| o.data.clone())
    }

    /// Contents and mod time together, as a remote stat would see them.
    pub fn stat_object(&self, name: &str) -> Option<(Vec<u8>, SystemTime)> {
        self.objects
            .lock()
            .unwrap()
            .get(name)
            .map(|o| (o.data.clone(), o.mod_time))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.objects.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    /// Make the next `n` puts fail with a transient error.
    pub fn fail_next_puts(&self, n: usize) {
        self.fail_puts.store(n, Ordering::SeqCst);
    }

    pub fn set_put_delay(&self, delay: Duration) {
        self.put_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_get_delay(&self, delay: Duration) {
        self.get_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn put_starts(&self) -> Vec<Instant> {
        self.put_starts.lock().unwrap().clone()
    }

    pub fn requested_ranges(&self, name: &str) -> Vec<ByteRange> {
        self.get_ranges
            .lock()
            .unwrap()
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, r)| *r)
            .collect()
    }

    async fn nap(&self, ms: &AtomicU64, token: &CancellationToken, name: &str) -> Result<()> {
        let ms = ms.load(Ordering::SeqCst);
        if ms == 0 {
            return Ok(());
        }
        tokio::select! {
            () = tokio::time::sleep(Duration::from_millis(ms)) => Ok(()),
            () = token.cancelled() => Err(Error::cancelled(name)),
        }
    }
}

#[async_trait]
impl RemoteStore for MockRemote {
    fn id(&self) -> String {
        "mock:remote".to_owned()
    }

    async fn put(
        &self,
        name: &str,
        mut src: tokio::fs::File,
        info: &ObjectInfo,
        token: &CancellationToken,
    ) -> Result<ObjectInfo> {
        self.put_count.fetch_add(1, Ordering::SeqCst);
        self.put_starts.lock().unwrap().push(Instant::now());
        // Cancellation is only honored while napping, so tests can choose
        // deterministically whether a PUT is interruptible.
        self.nap(&self.put_delay_ms, token, name).await?;
        if self
            .fail_puts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::Transient {
                name: name.to_owned(),
                message: "injected failure".to_owned(),
            });
        }
        let mut data = Vec::new();
        src.read_to_end(&mut data)
            .await
            .map_err(|e| Error::io(name, e))?;
        // Sparse tails read back short; the logical size wins.
        data.resize(info.size as usize, 0);
        self.objects.lock().unwrap().insert(
            name.to_owned(),
            RemoteObject {
                data,
                mod_time: info.mod_time,
            },
        );
        Ok(ObjectInfo {
            size: info.size,
            mod_time: info.mod_time,
            hash: None,
        })
    }

    async fn get_range(
        &self,
        name: &str,
        range: ByteRange,
        token: &CancellationToken,
    ) -> Result<Bytes> {
        self.get_count.fetch_add(1, Ordering::SeqCst);
        self.get_ranges
            .lock()
            .unwrap()
            .push((name.to_owned(), range));
        self.nap(&self.get_delay_ms, token, name).await?;
        let objects = self.objects.lock().unwrap();
        let obj = objects.get(name).ok_or_else(|| Error::not_found(name))?;
        let start = (range.start as usize).min(obj.data.len());
        let end = (range.end as usize).min(obj.data.len());
        Ok(Bytes::copy_from_slice(&obj.data[start..end]))
    }

    async fn stat(&self, name: &str, _token: &CancellationToken) -> Result<ObjectInfo> {
        self.stat_count.fetch_add(1, Ordering::SeqCst);
        let objects = self.objects.lock().unwrap();
        let obj = objects.get(name).ok_or_else(|| Error::not_found(name))?;
        Ok(ObjectInfo {
            size: obj.data.len() as u64,
            mod_time: obj.mod_time,
            hash: None,
        })
    }

    async fn delete(&self, name: &str, _token: &CancellationToken) -> Result<()> {
        self.objects
            .lock()
            .unwrap()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::not_found(name))
    }

    async fn rename(&self, src: &str, dst: &str, _token: &CancellationToken) -> Result<()> {
        let mut objects = self.objects.lock().unwrap();
        let obj = objects.remove(src).ok_or_else(|| Error::not_found(src))?;
        objects.insert(dst.to_owned(), obj);
        Ok(())
    }

    fn supported_hashes(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Cache options tuned for fast tests: short write-back delay, cleaner only
/// when a test drives it, long validation window so stat counts are
/// deterministic.
pub fn test_opt(dir: &Path) -> CacheOpt {
    CacheOpt {
        cache_dir: dir.to_path_buf(),
        max_size: -1,
        max_age: Duration::from_secs(3600),
        poll_interval: Duration::from_secs(3600),
        write_back_delay: Duration::from_millis(50),
        max_upload_concurrency: 4,
        max_retries: 10,
        base_backoff: Duration::from_millis(50),
        max_backoff: Duration::from_secs(1),
        drain_timeout: Duration::from_secs(5),
        validate_window: Duration::from_secs(3600),
    }
}

/// Poll `cond` every 10ms until it holds or `timeout` expires.
pub async fn eventually<F, Fut>(timeout: Duration, mut cond: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if cond().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
