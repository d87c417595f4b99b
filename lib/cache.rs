//! Cache registry and cleaner loop.
//!
//! The [`Cache`] owns every item, maps canonical remote names to them, and
//! runs the background cleaner that keeps disk usage under quota. Since the
//! registry and items are tightly linked there is a total lock ordering
//! between them: the registry mutex is always taken before an item mutex,
//! never the reverse. The registry mutex is synchronous and never held
//! across an await, which makes that ordering mechanically checkable: any
//! path that calls into an item first drops the registry lock.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use bytesize::ByteSize;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::CacheOpt;
use crate::error::{Error, Result};
use crate::io;
use crate::item::{Item, ItemHandle, OpenMode};
use crate::paths;
use crate::remote::{ObjectInfo, RemoteStore};
use crate::writeback::WriteBack;

/// Callback registered at construction that surfaces queued uploads as
/// virtual directory entries: `(name, size, is_dir)`.
///
/// Invoked by the write-back scheduler while an item is pending or
/// uploading, so directory listings include the unsynced file even though
/// the remote has not observed it yet. The callback must not call back into
/// the cache; it runs under cache-internal locks.
pub type AddVirtualFn = dyn Fn(&str, u64, bool) -> Result<()> + Send + Sync;

/// A point-in-time snapshot of cache health.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    /// Items in the registry.
    pub items: usize,
    /// Items with open handles or accesses in flight.
    pub in_use: usize,
    /// Items holding unsynced local writes.
    pub dirty: usize,
    /// Uploads in flight.
    pub uploading: usize,
    /// Uploads waiting for their expiry.
    pub queued: usize,
    /// Uploads parked after exhausting retries.
    pub upload_failed: usize,
    /// Backing-file bytes on disk, as of the last `update_used`.
    pub used_bytes: u64,
    /// Configured quota, if any.
    pub quota_bytes: Option<u64>,
    /// Whether writers are currently blocked on the cleaner.
    pub out_of_space: bool,
}

struct Registry {
    items: FxHashMap<String, Arc<Item>>,
    /// Items whose reset failed (typically ENOSPC while writing the
    /// sidecar); retried on the next cleaner pass.
    err_items: FxHashMap<String, Error>,
    /// Total backing-file bytes, maintained by `update_used` and adjusted
    /// by evictions. Never touched by the IO hot path.
    used: u64,
}

/// The cache: registry, write-back scheduler and cleaner, rooted at two
/// parallel on-disk trees (`<cache_dir>/vfs/<remote>` for data,
/// `<cache_dir>/vfsMeta/<remote>` for sidecars).
pub struct Cache {
    remote: Arc<dyn RemoteStore>,
    opt: CacheOpt,
    root: PathBuf,
    meta_root: PathBuf,
    writeback: Arc<WriteBack>,
    avfn: Option<Arc<AddVirtualFn>>,
    registry: Mutex<Registry>,
    /// `true` while writers should block waiting for the cleaner.
    space_tx: watch::Sender<bool>,
    /// Wakes the cleaner out of band on ENOSPC.
    kick_tx: mpsc::Sender<()>,
    /// Latch so writers do not pile up kicks while a kicked clean runs.
    kicker: Mutex<bool>,
    token: CancellationToken,
}

impl Cache {
    /// Create the cache hierarchy for `remote`, reload anything a previous
    /// run left on disk, and start the background cleaner.
    pub async fn new(
        remote: Arc<dyn RemoteStore>,
        opt: CacheOpt,
        avfn: Option<Arc<AddVirtualFn>>,
    ) -> Result<Arc<Self>> {
        let remote_id = paths::sanitize_remote_id(&remote.id());
        let root = opt.cache_dir.join("vfs").join(&remote_id);
        let meta_root = opt.cache_dir.join("vfsMeta").join(&remote_id);
        debug!(root = %root.display(), meta_root = %meta_root.display(), "cache roots");
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| Error::io("", e))?;
        tokio::fs::create_dir_all(&meta_root)
            .await
            .map_err(|e| Error::io("", e))?;

        let token = CancellationToken::new();
        let (kick_tx, kick_rx) = mpsc::channel(1);
        let (space_tx, _) = watch::channel(false);
        let writeback = WriteBack::new(&opt, token.child_token(), avfn.clone());

        let cache = Arc::new(Self {
            remote,
            opt,
            root,
            meta_root,
            writeback,
            avfn,
            registry: Mutex::new(Registry {
                items: FxHashMap::default(),
                err_items: FxHashMap::default(),
                used: 0,
            }),
            space_tx,
            kick_tx,
            kicker: Mutex::new(false),
            token,
        });

        cache.reload().await?;
        let _ = io::remove_empty_dirs(&cache.root, true).await;
        let _ = io::remove_empty_dirs(&cache.meta_root, true).await;

        tokio::spawn(Arc::clone(&cache).cleaner(kick_rx));
        Ok(cache)
    }

    // ---- plumbing shared with items --------------------------------------

    pub(crate) fn remote(&self) -> &Arc<dyn RemoteStore> {
        &self.remote
    }

    pub(crate) fn opt(&self) -> &CacheOpt {
        &self.opt
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub(crate) fn writeback(&self) -> &WriteBack {
        &self.writeback
    }

    /// Where `name`'s backing file lives on disk.
    #[must_use]
    pub fn backing_path(&self, name: &str) -> PathBuf {
        paths::to_os_path(&self.root, name)
    }

    /// Where `name`'s sidecar lives on disk.
    #[must_use]
    pub fn meta_path(&self, name: &str) -> PathBuf {
        paths::to_os_path(&self.meta_root, name)
    }

    /// Make the parent directories for `name` in both trees.
    pub(crate) async fn mkdir_parents(&self, name: &str) -> std::io::Result<()> {
        let parent = paths::find_parent(name);
        tokio::fs::create_dir_all(paths::to_os_path(&self.root, parent)).await?;
        tokio::fs::create_dir_all(paths::to_os_path(&self.meta_root, parent)).await
    }

    // ---- registry --------------------------------------------------------

    fn get_or_create(&self, name: &str) -> Arc<Item> {
        let (item, _) = self.get_or_create_flag(name);
        item
    }

    /// Look up or create the item for a (pre-cleaned or raw) name,
    /// reporting whether it already existed.
    fn get_or_create_flag(&self, name: &str) -> (Arc<Item>, bool) {
        let name = paths::clean(name);
        let mut reg = self.registry.lock().expect("registry poisoned");
        match reg.items.get(&name) {
            Some(item) => (Arc::clone(item), true),
            None => {
                let item = Item::new(name.clone());
                reg.items.insert(name, Arc::clone(&item));
                (item, false)
            }
        }
    }

    /// Register a constructed item under `name`, returning any displaced
    /// item.
    pub(crate) fn put(&self, name: &str, item: Arc<Item>) -> Option<Arc<Item>> {
        let name = paths::clean(name);
        let mut reg = self.registry.lock().expect("registry poisoned");
        reg.items.insert(name, item)
    }

    /// Open `name` (creating the cache item if needed) for IO.
    pub async fn open(self: &Arc<Self>, name: &str, mode: OpenMode) -> Result<ItemHandle> {
        let item = self.get_or_create(name);
        item.open(self, mode).await
    }

    /// Whether `name` exists in the cache or on the remote.
    pub async fn exists(&self, name: &str) -> bool {
        let name = paths::clean(name);
        for path in [self.backing_path(&name), self.meta_path(&name)] {
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return true;
            }
        }
        self.remote.stat(&name, &self.token).await.is_ok()
    }

    /// Whether the directory exists in the cache.
    pub async fn dir_exists(&self, name: &str) -> bool {
        let name = paths::clean(name);
        tokio::fs::try_exists(self.backing_path(&name))
            .await
            .unwrap_or(false)
    }

    /// Whether `name` has open handles or accesses in flight.
    pub async fn in_use(&self, name: &str) -> bool {
        let name = paths::clean(name);
        let item = {
            let reg = self.registry.lock().expect("registry poisoned");
            reg.items.get(&name).cloned()
        };
        match item {
            Some(item) => item.in_use().await,
            None => false,
        }
    }

    /// The item for `name` if it exists **and** is dirty.
    pub async fn dirty_item(&self, name: &str) -> Option<Arc<Item>> {
        let name = paths::clean(name);
        let item = {
            let reg = self.registry.lock().expect("registry poisoned");
            reg.items.get(&name).cloned()
        }?;
        if item.is_dirty().await { Some(item) } else { None }
    }

    /// Delete `name` from the cache. Returns true if the scheduler still
    /// had it queued, i.e. it may not have finished uploading.
    pub async fn remove(&self, name: &str) -> bool {
        let name = paths::clean(name);
        let item = {
            let mut reg = self.registry.lock().expect("registry poisoned");
            reg.err_items.remove(&name);
            reg.items.remove(&name)
        };
        let Some(item) = item else {
            return false;
        };
        match item.remove(self, "file deleted").await {
            Some(id) => self.writeback.remove(id),
            None => false,
        }
    }

    /// Set the logical modification time of `name`.
    pub async fn set_mod_time(&self, name: &str, mod_time: SystemTime) {
        let item = self.get_or_create(name);
        item.set_mod_time(self, mod_time).await;
    }

    /// Rename `name` to `new_name`, moving backing file, sidecar and
    /// registry entry together. `new_remote` is the object already at the
    /// destination on the remote, when the caller knows it.
    pub async fn rename(
        self: &Arc<Self>,
        name: &str,
        new_name: &str,
        new_remote: Option<ObjectInfo>,
    ) -> Result<()> {
        let name = paths::clean(name);
        let new_name = paths::clean(new_name);
        let item = self.get_or_create(&name);
        item.rename(self, &new_name, new_remote).await?;

        let entry = {
            let mut reg = self.registry.lock().expect("registry poisoned");
            reg.items.remove(&name)
        };
        let displaced = entry.and_then(|entry| self.put(&new_name, entry));
        if let Some(old) = displaced {
            // The destination had a cache entry of its own; its files were
            // overwritten by the rename.
            let _ = old.remove(self, "displaced by rename").await;
        }
        info!(name = %name, to = %new_name, "renamed in cache");
        Ok(())
    }

    /// Rename every item under `old_dir` to live under `new_dir`.
    /// Best-effort: per-item failures are logged and the last one returned.
    pub async fn dir_rename(self: &Arc<Self>, old_dir: &str, new_dir: &str) -> Result<()> {
        let old_dir = paths::clean(old_dir);
        let new_dir = paths::clean(new_dir);
        let prefix = format!("{old_dir}/");

        let renames: Vec<String> = {
            let reg = self.registry.lock().expect("registry poisoned");
            reg.items
                .keys()
                .filter(|k| k.starts_with(&prefix))
                .cloned()
                .collect()
        };

        let mut last_err = None;
        for name in renames {
            let new_name = format!("{new_dir}/{}", &name[prefix.len()..]);
            if let Err(e) = self.rename(&name, &new_name, None).await {
                warn!(name = %name, error = %e, "dir rename: item failed");
                last_err = Some(e);
            }
        }

        let _ = io::remove_empty_dirs(&paths::to_os_path(&self.root, &old_dir), false).await;
        let _ = io::remove_empty_dirs(&paths::to_os_path(&self.meta_root, &old_dir), false).await;
        info!(dir = %old_dir, to = %new_dir, "renamed dir in cache");
        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Purge the entire cache. Idempotent.
    pub async fn cleanup(&self) -> Result<()> {
        let items = {
            let mut reg = self.registry.lock().expect("registry poisoned");
            reg.err_items.clear();
            reg.used = 0;
            std::mem::take(&mut reg.items)
        };
        for item in items.into_values() {
            if let Some(id) = item.remove(self, "cache cleanup").await {
                self.writeback.remove(id);
            }
        }
        // Empty both trees but keep their roots, so the cleaner and future
        // opens find the directories in place.
        for root in [&self.root, &self.meta_root] {
            match io::remove_dir_contents(root).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::io("", e)),
            }
        }
        Ok(())
    }

    /// Invoke the registered virtual-entry hook, if any.
    pub fn add_virtual(&self, name: &str, size: u64, is_dir: bool) -> Result<()> {
        match &self.avfn {
            Some(avfn) => avfn(name, size, is_dir),
            None => Err(Error::busy(name, "no virtual-entry hook registered")),
        }
    }

    // ---- startup reload --------------------------------------------------

    /// Walk both trees and bring everything found back into the registry.
    /// The data tree is walked first; the metadata walk mostly confirms what
    /// the first pass found but also surfaces sidecars whose backing file
    /// vanished.
    async fn reload(self: &Arc<Self>) -> Result<()> {
        for root in [self.root.clone(), self.meta_root.clone()] {
            let names = self
                .walk_names(&root)
                .await
                .map_err(|e| Error::io("", e))?;
            for name in names {
                let (item, found) = self.get_or_create_flag(&name);
                if found {
                    continue;
                }
                match item.reload(self).await {
                    Ok(true) => {}
                    Ok(false) => {
                        // Orphan; reload already removed the file.
                        let mut reg = self.registry.lock().expect("registry poisoned");
                        reg.items.remove(&paths::clean(&name));
                    }
                    Err(e) => {
                        error!(name = %name, error = %e, "failed to reload item");
                    }
                }
            }
        }
        self.update_used().await;
        Ok(())
    }

    /// Collect the relative slash-separated names of all regular files under
    /// `root`, clearing out stale atomic-write temp files on the way.
    async fn walk_names(&self, root: &Path) -> std::io::Result<Vec<String>> {
        let mut names = Vec::new();
        if !tokio::fs::try_exists(root).await? {
            return Ok(names);
        }
        let mut stack = vec![root.to_path_buf()];
        while let Some(dir) = stack.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    stack.push(path);
                    continue;
                }
                let rel: Vec<String> = path
                    .strip_prefix(root)
                    .expect("walked path is under root")
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect();
                let name = rel.join("/");
                if name.ends_with(".tmp") {
                    debug!(name = %name, "removing stale temp file");
                    let _ = tokio::fs::remove_file(&path).await;
                    continue;
                }
                names.push(name);
            }
        }
        Ok(names)
    }

    // ---- out-of-space back-pressure --------------------------------------

    /// Called by a writer that hit ENOSPC: kick the cleaner (once) and block
    /// until it clears the out-of-space flag.
    pub(crate) async fn kick_and_wait(&self) {
        {
            // The latch has its own lock so kicks do not contend with (or
            // re-fire right after) a running clean.
            let mut kicked = self.kicker.lock().expect("kicker poisoned");
            if !*kicked {
                *kicked = true;
                self.space_tx.send_replace(true);
                let _ = self.kick_tx.try_send(());
            }
        }
        let mut rx = self.space_tx.subscribe();
        loop {
            if !*rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    // ---- cleaner ---------------------------------------------------------

    /// Background task: clean at every poll interval and whenever kicked.
    async fn cleaner(self: Arc<Self>, mut kick_rx: mpsc::Receiver<()>) {
        if self.opt.poll_interval.is_zero() {
            debug!("cleaner disabled because poll interval is zero");
            return;
        }
        self.clean(false).await;
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.opt.poll_interval,
            self.opt.poll_interval,
        );
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = self.token.cancelled() => {
                    debug!("cleaner exiting");
                    return;
                }
                Some(()) = kick_rx.recv() => self.clean(true).await,
                _ = ticker.tick() => self.clean(false).await,
            }
        }
    }

    /// One cleaning pass: age out old items, then (under a quota) remove and
    /// reset least-recently-used items until usage is below quota or no
    /// further progress is possible. Bounded so a pathological cache cannot
    /// starve the loop.
    async fn clean(self: &Arc<Self>, kicked: bool) {
        if !tokio::fs::try_exists(&self.root).await.unwrap_or(false) {
            return;
        }
        self.update_used().await;
        let (old_items, old_used) = {
            let reg = self.registry.lock().expect("registry poisoned");
            (reg.items.len(), reg.used)
        };
        let quota = self.opt.quota();

        for _ in 0..4 {
            self.purge_old(self.opt.max_age).await;
            let Some(quota) = quota else { break };
            self.purge_over_quota(quota).await;
            self.purge_clean(quota).await;
            self.retry_failed_resets().await;
            let used = self.update_used().await;
            let parked = {
                let reg = self.registry.lock().expect("registry poisoned");
                reg.err_items.len()
            };
            if used <= quota && parked == 0 {
                break;
            }
        }

        if kicked {
            *self.kicker.lock().expect("kicker poisoned") = false;
        }

        // The final verdict: clear the flag and broadcast when the cache is
        // healthy again; otherwise leave it raised so writers keep blocking.
        // Only a writer's kick ever raises it.
        let (new_items, used, parked) = {
            let reg = self.registry.lock().expect("registry poisoned");
            (reg.items.len(), reg.used, reg.err_items.len())
        };
        let space_ok = quota.is_none_or(|q| used <= q) && parked == 0;
        if space_ok {
            self.space_tx.send_replace(false);
        }

        let in_use = self.total_in_use().await;
        let wb = self.writeback.stats();
        info!(
            "cleaned: objects {new_items} (was {old_items}) in use {in_use}, to upload {}, uploading {}, failed {}, total size {} (was {})",
            wb.queued,
            wb.uploading,
            wb.failed,
            ByteSize::b(used),
            ByteSize::b(old_used),
        );

        let _ = io::remove_empty_dirs(&self.root, true).await;
        let _ = io::remove_empty_dirs(&self.meta_root, true).await;
    }

    fn registry_entries(&self) -> Vec<(String, Arc<Item>)> {
        let reg = self.registry.lock().expect("registry poisoned");
        reg.items
            .iter()
            .map(|(name, item)| (name.clone(), Arc::clone(item)))
            .collect()
    }

    /// Evict every unused clean item older than `max_age`.
    async fn purge_old(self: &Arc<Self>, max_age: Duration) {
        for (name, item) in self.registry_entries() {
            let (removed, freed) = item.remove_not_in_use(self, max_age, false).await;
            if removed || freed > 0 {
                let mut reg = self.registry.lock().expect("registry poisoned");
                reg.used = reg.used.saturating_sub(freed);
                if removed {
                    reg.items.remove(&name);
                }
            }
        }
    }

    /// Remove unused items, least recently used first, until under quota.
    /// Once under quota only empty leftovers are removed.
    async fn purge_over_quota(self: &Arc<Self>, quota: u64) {
        let mut used = self.update_used().await;
        if used <= quota {
            return;
        }

        let mut candidates = Vec::new();
        for (name, item) in self.registry_entries() {
            if !item.in_use().await {
                candidates.push((item.last_access().await, name, item));
            }
        }
        candidates.sort_by_key(|(at, _, _)| *at);

        for (_, name, item) in candidates {
            let empty_only = used <= quota;
            let (removed, freed) = item.remove_not_in_use(self, Duration::ZERO, empty_only).await;
            used = used.saturating_sub(freed);
            if removed || freed > 0 {
                let mut reg = self.registry.lock().expect("registry poisoned");
                reg.used = reg.used.saturating_sub(freed);
                if removed {
                    reg.items.remove(&name);
                }
            }
        }
    }

    /// Reset clean items (drop data, keep identity), least recently used
    /// first, until under quota. Items whose reset fails are parked for the
    /// next pass. Always lets blocked writers retry afterwards; the
    /// end-of-pass verdict may raise the flag again.
    async fn purge_clean(self: &Arc<Self>, quota: u64) {
        let mut used = {
            let reg = self.registry.lock().expect("registry poisoned");
            reg.used
        };
        if used > quota {
            let mut candidates = Vec::new();
            for (name, item) in self.registry_entries() {
                if !item.is_dirty().await {
                    candidates.push((item.last_access().await, name, item));
                }
            }
            candidates.sort_by_key(|(at, _, _)| *at);

            for (_, name, item) in candidates {
                if used <= quota {
                    break;
                }
                let report = item.reset(self).await;
                debug!(
                    name = %name,
                    outcome = ?report.outcome,
                    freed = report.bytes_freed,
                    "reset attempted"
                );
                used = used.saturating_sub(report.bytes_freed);
                {
                    let mut reg = self.registry.lock().expect("registry poisoned");
                    reg.used = reg.used.saturating_sub(report.bytes_freed);
                    if let Some(err) = report.error {
                        warn!(name = %name, error = %err, "reset failed; parking for retry");
                        reg.err_items.insert(name, err);
                    }
                }
            }
        }
        // Wake blocked writers regardless, so items whose accesses held off
        // a reset get another chance and stuck writers can surface their
        // second ENOSPC instead of hanging.
        self.space_tx.send_replace(false);
    }

    /// Re-run resets that previously failed; drop them from the parking lot
    /// unless they are still out of space.
    async fn retry_failed_resets(self: &Arc<Self>) {
        let parked: Vec<String> = {
            let reg = self.registry.lock().expect("registry poisoned");
            reg.err_items.keys().cloned().collect()
        };
        if parked.is_empty() {
            return;
        }
        debug!(count = parked.len(), "retrying failed resets");
        for name in parked {
            let item = {
                let reg = self.registry.lock().expect("registry poisoned");
                reg.items.get(&name).cloned()
            };
            let Some(item) = item else {
                // Closed or removed in the meantime; nothing left to reset.
                let mut reg = self.registry.lock().expect("registry poisoned");
                reg.err_items.remove(&name);
                continue;
            };
            let report = item.reset(self).await;
            let still_no_space = report.error.as_ref().is_some_and(Error::is_no_space);
            let mut reg = self.registry.lock().expect("registry poisoned");
            reg.used = reg.used.saturating_sub(report.bytes_freed);
            if !still_no_space {
                reg.err_items.remove(&name);
            }
        }
    }

    /// Recompute `used` from what is actually on disk.
    async fn update_used(self: &Arc<Self>) -> u64 {
        let mut total = 0;
        for (_, item) in self.registry_entries() {
            total += item.disk_size(self).await;
        }
        let mut reg = self.registry.lock().expect("registry poisoned");
        reg.used = total;
        total
    }

    async fn total_in_use(&self) -> usize {
        let mut n = 0;
        for (_, item) in self.registry_entries() {
            if item.in_use().await {
                n += 1;
            }
        }
        n
    }

    // ---- observability & shutdown ----------------------------------------

    /// A snapshot of cache health.
    pub async fn stats(&self) -> CacheStats {
        let (items, used) = {
            let reg = self.registry.lock().expect("registry poisoned");
            (reg.items.len(), reg.used)
        };
        let mut in_use = 0;
        let mut dirty = 0;
        for (_, item) in self.registry_entries() {
            if item.in_use().await {
                in_use += 1;
            }
            if item.is_dirty().await {
                dirty += 1;
            }
        }
        let wb = self.writeback.stats();
        CacheStats {
            items,
            in_use,
            dirty,
            uploading: wb.uploading,
            queued: wb.queued,
            upload_failed: wb.failed,
            used_bytes: used,
            quota_bytes: self.opt.quota(),
            out_of_space: *self.space_tx.borrow(),
        }
    }

    /// Enumerate the cache contents into a debug string.
    pub async fn dump(&self) -> String {
        use std::fmt::Write as _;
        let mut out = String::from("Cache{\n");
        let mut entries = self.registry_entries();
        entries.sort_by(|(a, _), (b, _)| a.cmp(b));
        for (name, item) in entries {
            let snap = item.snapshot().await;
            let _ = writeln!(
                out,
                "\t{name:?}: size={} opens={} state={:?} present={} dirty={}",
                snap.size, snap.opens, snap.state, snap.present_bytes, snap.dirty_bytes,
            );
        }
        out.push_str("}\n");
        out
    }

    /// Drain the scheduler (bounded by `drain_timeout`), stop the cleaner
    /// and persist every sidecar. Dirty items left behind resume on the
    /// next run.
    pub async fn shutdown(&self) {
        self.writeback.shutdown(self.opt.drain_timeout).await;
        self.token.cancel();
        for (name, item) in self.registry_entries() {
            if let Err(e) = item.persist(self).await {
                warn!(name = %name, error = %e, "failed to persist sidecar on shutdown");
            }
        }
    }
}
