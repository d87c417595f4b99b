//! Per-object cache item state machine.
//!
//! An [`Item`] owns one backing file and one sidecar. It serves reads by
//! fetching missing ranges from the remote into the backing file, absorbs
//! writes as present+dirty ranges, and hands itself to the write-back
//! scheduler whenever it is dirtied. The registry exclusively owns items;
//! everything else holds `Arc`s whose validity the registry rules guarantee.
//!
//! Locking: one `tokio::sync::Mutex` per item, taken *after* the registry
//! lock and never the other way around. Reads release the item lock while a
//! remote fetch is in flight; the `pending_accesses` counter (an atomic, so
//! it survives task cancellation via an RAII guard) keeps the cleaner from
//! resetting the item during those windows.

use std::io::SeekFrom;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use bitflags::bitflags;
use chrono::Utc;
use tokio::io::{AsyncReadExt as _, AsyncSeekExt as _, AsyncWriteExt as _};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::Cache;
use crate::error::{Error, Result};
use crate::io;
use crate::meta::{self, Fingerprint, ItemMeta, SidecarLoad, UploadState};
use crate::ranges::ByteRange;
use crate::remote::ObjectInfo;
use crate::writeback::{PutFn, WbId};

bitflags! {
    /// How a handle intends to use the item.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenMode: u8 {
        /// Reads allowed.
        const READ = 1 << 0;
        /// Writes allowed.
        const WRITE = 1 << 1;
        /// Writes go to end of file; the offset argument is ignored.
        const APPEND = 1 << 2;
        /// Create the object if the remote does not have it.
        const CREATE = 1 << 3;
        /// Truncate to zero on open.
        const TRUNCATE = 1 << 4;
        /// Reads and writes allowed.
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
    }
}

impl OpenMode {
    fn allows_write(self) -> bool {
        self.intersects(Self::WRITE | Self::APPEND | Self::CREATE | Self::TRUNCATE)
    }
}

/// Why a [`Item::reset`] did or did not happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResetOutcome {
    /// Refused: unsynced local writes.
    SkippedDirty,
    /// Refused: accesses in flight.
    SkippedInUse,
    /// Nothing on disk to free.
    AlreadyEmpty,
    /// Data dropped; metadata kept so future opens refetch.
    Reset,
}

/// The full result of a reset attempt. Space may have been freed even when
/// an error is reported (e.g. the data went but the sidecar update hit
/// ENOSPC), so the two travel together.
#[derive(Debug)]
pub(crate) struct ResetReport {
    pub outcome: ResetOutcome,
    pub bytes_freed: u64,
    pub error: Option<Error>,
}

/// A point-in-time view of one item, for stats and debug dumps.
#[derive(Debug, Clone)]
pub(crate) struct ItemSnapshot {
    pub name: String,
    pub size: u64,
    pub opens: usize,
    pub state: UploadState,
    pub present_bytes: u64,
    pub dirty_bytes: u64,
}

struct ItemInner {
    /// Canonical remote name. Updated by rename.
    name: String,
    meta: ItemMeta,
    /// Whether the sidecar load (or recovery) has run.
    meta_loaded: bool,
    /// The in-memory metadata differs from the sidecar on disk.
    meta_unsaved: bool,
    opens: usize,
    fd: Option<tokio::fs::File>,
    wb_id: Option<WbId>,
    last_access: Instant,
    last_validated: Option<Instant>,
    /// Remote fetches in flight with the item lock released. The sender
    /// side lives on the fetching task's stack; a dropped sender wakes all
    /// waiters.
    fetches: Vec<(ByteRange, watch::Receiver<bool>)>,
}

/// One cached remote object.
pub struct Item {
    inner: tokio::sync::Mutex<ItemInner>,
    /// Readers/writers currently inside an I/O call, including the windows
    /// where they have released the item lock for a remote fetch or an
    /// out-of-space wait. Blocks reset.
    pending_accesses: AtomicUsize,
}

/// Decrements `pending_accesses` when the access ends, even if the calling
/// task is cancelled mid-fetch.
struct AccessGuard {
    item: Arc<Item>,
}

impl AccessGuard {
    fn register(item: &Arc<Item>) -> Self {
        item.pending_accesses.fetch_add(1, Ordering::AcqRel);
        Self {
            item: Arc::clone(item),
        }
    }
}

impl Drop for AccessGuard {
    fn drop(&mut self) {
        self.item.pending_accesses.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Item {
    pub(crate) fn new(name: String) -> Arc<Self> {
        Arc::new(Self {
            inner: tokio::sync::Mutex::new(ItemInner {
                name,
                meta: ItemMeta::empty(),
                meta_loaded: false,
                meta_unsaved: false,
                opens: 0,
                fd: None,
                wb_id: None,
                last_access: Instant::now(),
                last_validated: None,
                fetches: Vec::new(),
            }),
            pending_accesses: AtomicUsize::new(0),
        })
    }

    /// The item's current canonical name.
    pub(crate) async fn name(&self) -> String {
        self.inner.lock().await.name.clone()
    }

    /// Whether any handle is open or an access is in flight.
    pub(crate) async fn in_use(&self) -> bool {
        if self.pending_accesses.load(Ordering::Acquire) > 0 {
            return true;
        }
        self.inner.lock().await.opens > 0
    }

    /// Whether the item carries unsynced local writes.
    pub(crate) async fn is_dirty(&self) -> bool {
        self.inner.lock().await.meta.is_dirty()
    }

    pub(crate) async fn snapshot(&self) -> ItemSnapshot {
        let st = self.inner.lock().await;
        ItemSnapshot {
            name: st.name.clone(),
            size: st.meta.size,
            opens: st.opens,
            state: st.meta.upload_state,
            present_bytes: st.meta.present.total_bytes(),
            dirty_bytes: st.meta.dirty.total_bytes(),
        }
    }

    /// Bytes the backing file occupies on disk right now.
    pub(crate) async fn disk_size(&self, cache: &Cache) -> u64 {
        let st = self.inner.lock().await;
        match tokio::fs::metadata(cache.backing_path(&st.name)).await {
            Ok(md) => io::disk_usage(&md),
            Err(_) => 0,
        }
    }

    /// When the item was last opened, read or written.
    pub(crate) async fn last_access(&self) -> Instant {
        self.inner.lock().await.last_access
    }

    // ---- open / close ----------------------------------------------------

    /// Open the item, loading and validating metadata on first contact.
    pub(crate) async fn open(
        self: &Arc<Self>,
        cache: &Arc<Cache>,
        mode: OpenMode,
    ) -> Result<ItemHandle> {
        let mut st = self.inner.lock().await;
        if !st.meta_loaded {
            self.load_meta(cache, &mut st).await?;
        }
        self.validate(cache, &mut st, mode).await?;

        let name = st.name.clone();
        if st.fd.is_none() {
            cache
                .mkdir_parents(&name)
                .await
                .map_err(|e| Error::io(&name, e))?;
            let fd = tokio::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(cache.backing_path(&name))
                .await
                .map_err(|e| Error::io(&name, e))?;
            st.fd = Some(fd);
        }
        if mode.contains(OpenMode::TRUNCATE) {
            self.truncate_locked(cache, &mut st, 0).await?;
        }
        st.opens += 1;
        st.last_access = Instant::now();
        debug!(name = %name, opens = st.opens, ?mode, "opened");
        Ok(ItemHandle {
            cache: Arc::clone(cache),
            item: Arc::clone(self),
            mode,
            closed: false,
        })
    }

    /// Re-stat the remote when the item is clean and the validation window
    /// has elapsed, adopting the remote object on drift.
    async fn validate(
        self: &Arc<Self>,
        cache: &Arc<Cache>,
        st: &mut ItemInner,
        mode: OpenMode,
    ) -> Result<()> {
        let window = cache.opt().validate_window;
        let due = !st.meta.is_dirty()
            && st.last_validated.is_none_or(|at| at.elapsed() >= window);
        if !due {
            return Ok(());
        }
        let name = st.name.clone();
        match cache.remote().stat(&name, cache.token()).await {
            Ok(info) => {
                st.last_validated = Some(Instant::now());
                let unchanged = st
                    .meta
                    .fingerprint
                    .as_ref()
                    .is_some_and(|fp| fp.matches(&info));
                if !unchanged {
                    if st.meta.fingerprint.is_some() {
                        info!(name = %name, "remote changed; dropping cached data");
                    }
                    st.meta.present.clear();
                    st.meta.dirty.clear();
                    st.meta.size = info.size;
                    st.meta.mod_time = info.mod_time.into();
                    st.meta.hash = info.hash.clone();
                    st.meta.fingerprint = Some(Fingerprint::of(&info));
                    st.meta.upload_state = UploadState::Clean;
                    st.meta_unsaved = true;
                    if let Some(fd) = &st.fd {
                        fd.set_len(0).await.map_err(|e| Error::io(&name, e))?;
                    }
                }
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                st.last_validated = Some(Instant::now());
                if st.meta.is_dirty() {
                    return Ok(());
                }
                if mode.contains(OpenMode::CREATE) {
                    // Brand-new object: even if never written, an empty
                    // object must eventually exist on the remote.
                    if st.meta.upload_state == UploadState::Clean {
                        st.meta.upload_state = UploadState::Dirty;
                        st.meta_unsaved = true;
                    }
                    return Ok(());
                }
                Err(Error::not_found(&name))
            }
            Err(e) if e.is_cancelled() => Err(e),
            Err(e) => {
                if st.meta.is_dirty() {
                    warn!(name = %name, error = %e, "validation failed; serving dirty item offline");
                    Ok(())
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Close one handle. When the last handle goes and the item is dirty,
    /// it is (re)queued for upload; the sidecar is persisted either way.
    pub(crate) async fn close(self: &Arc<Self>, cache: &Arc<Cache>) -> Result<()> {
        let mut st = self.inner.lock().await;
        st.opens = st.opens.saturating_sub(1);
        if st.opens == 0 {
            if st.meta.is_dirty() {
                self.enqueue_upload_locked(cache, &mut st);
            }
            if self.pending_accesses.load(Ordering::Acquire) == 0 {
                st.fd = None;
            }
        }
        let res = self.save_meta_locked(cache, &mut st).await;
        debug!(name = %st.name, opens = st.opens, "closed");
        res
    }

    // ---- metadata --------------------------------------------------------

    /// Populate metadata from the sidecar, or recover from what is on disk.
    ///
    /// A backing file with no usable sidecar is preserved as one whole-file
    /// dirty range rather than dropped; a sidecar claiming present bytes
    /// that the backing file does not have is corrected to absent.
    async fn load_meta(&self, cache: &Cache, st: &mut ItemInner) -> Result<()> {
        let name = st.name.clone();
        let backing = cache.backing_path(&name);
        let backing_md = tokio::fs::metadata(&backing).await.ok();
        let backing_len = backing_md.as_ref().map(std::fs::Metadata::len);

        match meta::load(&cache.meta_path(&name))
            .await
            .map_err(|e| Error::io(&name, e))?
        {
            SidecarLoad::Loaded(loaded) => {
                st.meta = loaded;
                if backing_len.is_none() && !st.meta.present.is_empty() {
                    debug!(name = %name, "backing file missing; dropping present ranges");
                    st.meta.present.clear();
                    st.meta_unsaved = true;
                }
            }
            SidecarLoad::Missing | SidecarLoad::Unusable(_) => {
                st.meta = ItemMeta::empty();
                if let Some(len) = backing_len
                    && len > 0
                {
                    // Data-preservation bias: unknown bytes are dirty bytes.
                    warn!(name = %name, len, "no usable sidecar; treating backing file as dirty");
                    st.meta.size = len;
                    st.meta.present.insert(ByteRange::new(0, len));
                    st.meta.dirty.insert(ByteRange::new(0, len));
                    st.meta.upload_state = UploadState::Dirty;
                    st.meta_unsaved = true;
                }
            }
        }

        // Age the item like the file system does, so a restart does not
        // make everything look freshly used. The monotonic clock may not
        // reach far enough back; then the item just counts as fresh.
        if let Some(md) = &backing_md
            && let Ok(atime) = md.accessed()
            && let Ok(age) = std::time::SystemTime::now().duration_since(atime)
            && let Some(then) = Instant::now().checked_sub(age)
        {
            st.last_access = then;
        }

        st.meta_loaded = true;
        Ok(())
    }

    /// Load path used by the registry's startup scan. Returns false when the
    /// file on disk turned out to be an orphan and was removed.
    pub(crate) async fn reload(self: &Arc<Self>, cache: &Arc<Cache>) -> Result<bool> {
        let mut st = self.inner.lock().await;
        if !st.meta_loaded {
            self.load_meta(cache, &mut st).await?;
        }
        let name = st.name.clone();

        if st.meta.is_dirty() {
            // Resume the interrupted upload.
            info!(name = %name, "reloaded dirty item; queueing upload");
            self.enqueue_upload_locked(cache, &mut st);
            self.save_meta_locked(cache, &mut st).await?;
            return Ok(true);
        }

        // A clean, empty item with no sidecar is an orphan of a previous
        // run; a valid sidecar makes it a legitimate empty file.
        let has_sidecar = tokio::fs::try_exists(cache.meta_path(&name))
            .await
            .map_err(|e| Error::io(&name, e))?;
        if !has_sidecar && st.meta.present.is_empty() && st.meta.size == 0 {
            debug!(name = %name, "removing orphan backing file");
            let _ = tokio::fs::remove_file(cache.backing_path(&name)).await;
            return Ok(false);
        }
        Ok(true)
    }

    /// Persist the sidecar if the in-memory metadata has changed.
    async fn save_meta_locked(&self, cache: &Cache, st: &mut ItemInner) -> Result<()> {
        if !st.meta_unsaved {
            return Ok(());
        }
        let name = st.name.clone();
        cache
            .mkdir_parents(&name)
            .await
            .map_err(|e| Error::io(&name, e))?;
        meta::save(&cache.meta_path(&name), &st.meta)
            .await
            .map_err(|e| Error::io(&name, e))?;
        st.meta_unsaved = false;
        Ok(())
    }

    /// Persist the sidecar unconditionally on shutdown.
    pub(crate) async fn persist(&self, cache: &Cache) -> Result<()> {
        let mut st = self.inner.lock().await;
        if !st.meta_loaded {
            return Ok(());
        }
        st.meta_unsaved = true;
        self.save_meta_locked(cache, &mut st).await
    }

    /// Touch the logical modification time without any data IO.
    pub(crate) async fn set_mod_time(&self, cache: &Cache, mod_time: std::time::SystemTime) {
        let mut st = self.inner.lock().await;
        st.meta.mod_time = mod_time.into();
        st.meta_unsaved = true;
        if let Err(e) = self.save_meta_locked(cache, &mut st).await {
            warn!(name = %st.name, error = %e, "failed to persist mod time");
        }
    }

    // ---- reads -----------------------------------------------------------

    /// Read into `buf` at `offset`, fetching missing ranges from the remote
    /// first. Returns the number of bytes read; 0 at or past EOF.
    pub(crate) async fn read(
        self: &Arc<Self>,
        cache: &Arc<Cache>,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize> {
        let _access = AccessGuard::register(self);
        let res = self.read_access(cache, offset, buf).await;
        self.inner.lock().await.last_access = Instant::now();
        res
    }

    async fn read_access(
        self: &Arc<Self>,
        cache: &Arc<Cache>,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let mut st = self.inner.lock().await;
            // Drop fetch registrations whose task died mid-flight.
            st.fetches.retain(|(_, rx)| rx.has_changed().is_ok());

            let name = st.name.clone();
            if offset >= st.meta.size {
                return Ok(0);
            }
            let want_end = (offset + buf.len() as u64).min(st.meta.size);
            let want = ByteRange::new(offset, want_end);
            let Some(gap) = st.meta.present.missing(&want).first().copied() else {
                let n = usize::try_from(want.len()).expect("read len fits usize");
                let fd = st
                    .fd
                    .as_mut()
                    .ok_or_else(|| Error::busy(&name, "item is not open"))?;
                fd.seek(SeekFrom::Start(offset))
                    .await
                    .map_err(|e| Error::io(&name, e))?;
                fd.read_exact(&mut buf[..n])
                    .await
                    .map_err(|e| Error::io(&name, e))?;
                return Ok(n);
            };

            // Single-flight: an overlapping fetch already in flight will
            // cover (part of) our gap; wait for it and re-check.
            if let Some(rx) = st
                .fetches
                .iter()
                .find(|(r, _)| r.overlaps(&gap))
                .map(|(_, rx)| rx.clone())
            {
                drop(st);
                let mut rx = rx;
                let _ = rx.changed().await;
                continue;
            }

            // Fetch the gap ourselves, with the item lock released.
            let (tx, rx) = watch::channel(false);
            st.fetches.push((gap, rx));
            drop(st);
            debug!(name = %name, range = %gap, "fetching from remote");
            let fetched = cache.remote().get_range(&name, gap, cache.token()).await;

            let mut st = self.inner.lock().await;
            st.fetches.retain(|(r, _)| *r != gap);
            let bytes = match fetched {
                Ok(bytes) => bytes,
                Err(e) => {
                    let _ = tx.send(true);
                    return Err(e);
                }
            };
            if bytes.is_empty() {
                let _ = tx.send(true);
                return Err(Error::Remote {
                    name,
                    message: format!("empty read for range {gap}"),
                });
            }
            let got = (bytes.len() as u64).min(gap.len());
            let store: Result<()> = async {
                let fd = st
                    .fd
                    .as_mut()
                    .ok_or_else(|| Error::busy(&name, "item is not open"))?;
                fd.seek(SeekFrom::Start(gap.start))
                    .await
                    .map_err(|e| Error::io(&name, e))?;
                fd.write_all(&bytes[..usize::try_from(got).expect("fetch fits usize")])
                    .await
                    .map_err(|e| Error::io(&name, e))?;
                fd.flush().await.map_err(|e| Error::io(&name, e))?;
                Ok(())
            }
            .await;
            if let Err(e) = store {
                let _ = tx.send(true);
                return Err(e);
            }
            st.meta
                .present
                .insert(ByteRange::new(gap.start, gap.start + got));
            st.meta_unsaved = true;
            let _ = tx.send(true);
            // Loop: either the want range is now present or a smaller gap
            // remains.
        }
    }

    // ---- writes ----------------------------------------------------------

    /// Write `data` at `offset` (or at EOF when `offset` is `None`),
    /// extending size, present and dirty ranges. On ENOSPC the cleaner is
    /// kicked and the write retried once after space was reclaimed.
    pub(crate) async fn write(
        self: &Arc<Self>,
        cache: &Arc<Cache>,
        offset: Option<u64>,
        data: &[u8],
    ) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let _access = AccessGuard::register(self);
        let mut retried = false;
        loop {
            let mut st = self.inner.lock().await;
            let name = st.name.clone();
            let at = offset.unwrap_or(st.meta.size);
            let io_res: std::io::Result<()> = async {
                let fd = st
                    .fd
                    .as_mut()
                    .ok_or_else(|| std::io::Error::other("item is not open"))?;
                fd.seek(SeekFrom::Start(at)).await?;
                fd.write_all(data).await?;
                fd.flush().await?;
                Ok(())
            }
            .await;
            match io_res {
                Ok(()) => {
                    // A write past EOF makes the whole extension dirty: the
                    // hole below it is sparse zeroes we own locally.
                    let written = ByteRange::new(at.min(st.meta.size), at + data.len() as u64);
                    st.meta.present.insert(written);
                    st.meta.dirty.insert(written);
                    st.meta.size = st.meta.size.max(written.end);
                    st.meta.mod_time = Utc::now();
                    st.meta.upload_state = UploadState::Dirty;
                    st.meta_unsaved = true;
                    st.last_access = Instant::now();
                    self.enqueue_upload_locked(cache, &mut st);
                    return Ok(data.len());
                }
                Err(e) if e.kind() == std::io::ErrorKind::StorageFull && !retried => {
                    retried = true;
                    drop(st);
                    warn!(name = %name, "cache out of space; kicking cleaner and waiting");
                    cache.kick_and_wait().await;
                }
                Err(e) => return Err(Error::io(&name, e)),
            }
        }
    }

    /// Truncate to `new_size`, adjusting ranges and marking the item dirty.
    pub(crate) async fn truncate(self: &Arc<Self>, cache: &Arc<Cache>, new_size: u64) -> Result<()> {
        let _access = AccessGuard::register(self);
        let mut st = self.inner.lock().await;
        self.truncate_locked(cache, &mut st, new_size).await
    }

    async fn truncate_locked(
        self: &Arc<Self>,
        cache: &Arc<Cache>,
        st: &mut ItemInner,
        new_size: u64,
    ) -> Result<()> {
        let name = st.name.clone();
        let fd = st
            .fd
            .as_mut()
            .ok_or_else(|| Error::busy(&name, "item is not open"))?;
        fd.set_len(new_size)
            .await
            .map_err(|e| Error::io(&name, e))?;
        let old_size = st.meta.size;
        if new_size < old_size {
            st.meta.present.clamp_end(new_size);
            st.meta.dirty.clamp_end(new_size);
        } else if new_size > old_size {
            // The extension is a hole of zeroes we own locally.
            let grown = ByteRange::new(old_size, new_size);
            st.meta.present.insert(grown);
            st.meta.dirty.insert(grown);
        }
        st.meta.size = new_size;
        st.meta.mod_time = Utc::now();
        st.meta.upload_state = UploadState::Dirty;
        st.meta_unsaved = true;
        st.last_access = Instant::now();
        self.enqueue_upload_locked(cache, st);
        debug!(name = %name, new_size, "truncated");
        Ok(())
    }

    // ---- upload ----------------------------------------------------------

    /// Register (or refresh) this item in the write-back scheduler.
    fn enqueue_upload_locked(self: &Arc<Self>, cache: &Arc<Cache>, st: &mut ItemInner) {
        let put = self.make_put(cache);
        let id = cache
            .writeback()
            .add(st.wb_id, &st.name, st.meta.size, put);
        st.wb_id = Some(id);
    }

    fn make_put(self: &Arc<Self>, cache: &Arc<Cache>) -> PutFn {
        let item = Arc::clone(self);
        let cache = Arc::clone(cache);
        Arc::new(move |token: CancellationToken| {
            let item = Arc::clone(&item);
            let cache = Arc::clone(&cache);
            Box::pin(async move { item.upload_once(&cache, token).await })
        })
    }

    /// One upload round: snapshot the dirty state, PUT the whole object
    /// without holding the item lock, then reconcile. Writes that land
    /// during the PUT are not reflected in it; they re-dirty the item and
    /// the scheduler re-queues it.
    async fn upload_once(
        self: Arc<Self>,
        cache: &Arc<Cache>,
        token: CancellationToken,
    ) -> Result<()> {
        let (name, object, snapshot) = {
            let mut st = self.inner.lock().await;
            if !st.meta.is_dirty() {
                return Ok(());
            }
            st.meta.upload_state = UploadState::Uploading;
            st.meta_unsaved = true;
            if let Err(e) = self.save_meta_locked(cache, &mut st).await {
                st.meta.upload_state = UploadState::UploadFailed;
                return Err(e);
            }
            (
                st.name.clone(),
                ObjectInfo {
                    size: st.meta.size,
                    mod_time: st.meta.mod_time_sys(),
                    hash: st.meta.hash.clone(),
                },
                st.meta.dirty.clone(),
            )
        };

        // A fresh read handle, so writes through the item's own fd keep
        // flowing while the PUT streams the file.
        let src = tokio::fs::File::open(cache.backing_path(&name))
            .await
            .map_err(|e| Error::io(&name, e))?;
        let res = cache.remote().put(&name, src, &object, &token).await;

        let mut st = self.inner.lock().await;
        match res {
            Ok(remote_info) => {
                st.meta.dirty.subtract(&snapshot);
                st.meta.fingerprint = Some(Fingerprint::of(&remote_info));
                if st.meta.upload_state == UploadState::Uploading {
                    // No writes raced the upload.
                    st.meta.dirty.clear();
                    st.meta.upload_state = UploadState::Clean;
                }
                st.meta_unsaved = true;
                self.save_meta_locked(cache, &mut st).await?;
                Ok(())
            }
            Err(e) => {
                if st.meta.upload_state == UploadState::Uploading {
                    st.meta.upload_state = if e.is_cancelled() {
                        UploadState::Dirty
                    } else {
                        UploadState::UploadFailed
                    };
                    st.meta_unsaved = true;
                }
                if let Err(save_err) = self.save_meta_locked(cache, &mut st).await {
                    warn!(name = %name, error = %save_err, "failed to persist state after upload failure");
                }
                Err(e)
            }
        }
    }

    // ---- eviction / lifecycle -------------------------------------------

    /// Drop the item's data but keep its identity and metadata, so future
    /// opens refetch from the remote. Repeated resets are no-ops.
    pub(crate) async fn reset(self: &Arc<Self>, cache: &Arc<Cache>) -> ResetReport {
        let mut st = self.inner.lock().await;
        let name = st.name.clone();
        if st.meta.is_dirty() {
            return ResetReport {
                outcome: ResetOutcome::SkippedDirty,
                bytes_freed: 0,
                error: Some(Error::Dirty { name }),
            };
        }
        if self.pending_accesses.load(Ordering::Acquire) > 0 {
            return ResetReport {
                outcome: ResetOutcome::SkippedInUse,
                bytes_freed: 0,
                error: Some(Error::busy(&name, "accesses in flight")),
            };
        }
        let backing = cache.backing_path(&name);
        let freed = match tokio::fs::metadata(&backing).await {
            Ok(md) => io::disk_usage(&md),
            Err(_) => 0,
        };
        if freed == 0 && st.meta.present.is_empty() {
            return ResetReport {
                outcome: ResetOutcome::AlreadyEmpty,
                bytes_freed: 0,
                error: None,
            };
        }
        // An open item keeps its fd; truncating in place frees the space
        // without invalidating the handle. Otherwise the file goes away
        // entirely.
        let dropped: std::io::Result<()> = async {
            match &st.fd {
                Some(fd) => fd.set_len(0).await,
                None => match tokio::fs::remove_file(&backing).await {
                    Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
                    _ => Ok(()),
                },
            }
        }
        .await;
        if let Err(e) = dropped {
            return ResetReport {
                outcome: ResetOutcome::Reset,
                bytes_freed: 0,
                error: Some(Error::io(&name, e)),
            };
        }
        st.meta.present.clear();
        st.meta_unsaved = true;
        let error = self.save_meta_locked(cache, &mut st).await.err();
        info!(name = %name, freed, "reset");
        ResetReport {
            outcome: ResetOutcome::Reset,
            bytes_freed: freed,
            error,
        }
    }

    /// Evict the whole item (backing file and sidecar) if it is clean, not
    /// in use, old enough, and (when `empty_only`) occupies no disk.
    /// Returns whether it was removed and how many bytes were freed.
    pub(crate) async fn remove_not_in_use(
        self: &Arc<Self>,
        cache: &Arc<Cache>,
        max_age: Duration,
        empty_only: bool,
    ) -> (bool, u64) {
        let mut st = self.inner.lock().await;
        if st.opens > 0 || self.pending_accesses.load(Ordering::Acquire) > 0 {
            return (false, 0);
        }
        if st.meta.is_dirty() {
            return (false, 0);
        }
        if !max_age.is_zero() && st.last_access.elapsed() < max_age {
            return (false, 0);
        }
        let name = st.name.clone();
        let backing = cache.backing_path(&name);
        let freed = match tokio::fs::metadata(&backing).await {
            Ok(md) => io::disk_usage(&md),
            Err(_) => 0,
        };
        if empty_only && freed > 0 {
            return (false, 0);
        }
        let _ = tokio::fs::remove_file(&backing).await;
        let _ = tokio::fs::remove_file(cache.meta_path(&name)).await;
        st.meta = ItemMeta::empty();
        st.fd = None;
        debug!(name = %name, freed, "evicted");
        (true, freed)
    }

    /// Delete the item's files. Returns the write-back id, if the item was
    /// ever queued, so the registry can cancel any upload.
    pub(crate) async fn remove(&self, cache: &Cache, reason: &str) -> Option<WbId> {
        let mut st = self.inner.lock().await;
        let name = st.name.clone();
        let _ = tokio::fs::remove_file(cache.backing_path(&name)).await;
        let _ = tokio::fs::remove_file(cache.meta_path(&name)).await;
        st.meta = ItemMeta::empty();
        st.meta_loaded = true;
        st.fd = None;
        info!(name = %name, reason, "removed from cache");
        st.wb_id.take()
    }

    /// Rename backing and sidecar files together; either both move or
    /// neither does. An in-flight upload for the old name is cancelled and
    /// re-queued by the scheduler.
    pub(crate) async fn rename(
        &self,
        cache: &Cache,
        new_name: &str,
        new_remote: Option<ObjectInfo>,
    ) -> Result<()> {
        let mut st = self.inner.lock().await;
        let old_name = st.name.clone();
        if old_name == new_name {
            return Ok(());
        }
        let old_backing = cache.backing_path(&old_name);
        let new_backing = cache.backing_path(new_name);
        let moved_backing = io::rename_file(&old_backing, &new_backing)
            .await
            .map_err(|e| Error::io(&old_name, e))?;
        if let Err(e) = io::rename_file(&cache.meta_path(&old_name), &cache.meta_path(new_name)).await
        {
            // Roll back so the pair stays consistent.
            if moved_backing {
                let _ = io::rename_file(&new_backing, &old_backing).await;
            }
            return Err(Error::io(&old_name, e));
        }
        st.name = new_name.to_owned();
        if let Some(info) = new_remote {
            st.meta.fingerprint = Some(Fingerprint::of(&info));
            st.meta_unsaved = true;
        }
        if let Some(id) = st.wb_id {
            cache.writeback().rename(id, new_name);
        }
        self.save_meta_locked(cache, &mut st).await?;
        info!(name = %old_name, to = %new_name, "renamed in cache");
        Ok(())
    }
}

/// An open handle on a cache item, as handed to frontends.
///
/// Call [`ItemHandle::close`] when done; a handle dropped without closing
/// releases its open count on a best-effort background task.
pub struct ItemHandle {
    cache: Arc<Cache>,
    item: Arc<Item>,
    mode: OpenMode,
    closed: bool,
}

impl std::fmt::Debug for ItemHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ItemHandle")
            .field("mode", &self.mode)
            .field("closed", &self.closed)
            .finish()
    }
}

impl ItemHandle {
    /// Read up to `buf.len()` bytes at `offset`.
    pub async fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if !self.mode.contains(OpenMode::READ) {
            let name = self.item.name().await;
            return Err(Error::busy(&name, "handle not open for reading"));
        }
        self.item.read(&self.cache, offset, buf).await
    }

    /// Write `data` at `offset` (at EOF for append handles).
    pub async fn write(&self, offset: u64, data: &[u8]) -> Result<usize> {
        if !self.mode.allows_write() {
            let name = self.item.name().await;
            return Err(Error::busy(&name, "handle not open for writing"));
        }
        let at = if self.mode.contains(OpenMode::APPEND) {
            None
        } else {
            Some(offset)
        };
        self.item.write(&self.cache, at, data).await
    }

    /// Truncate the object to `new_size`.
    pub async fn truncate(&self, new_size: u64) -> Result<()> {
        if !self.mode.allows_write() {
            let name = self.item.name().await;
            return Err(Error::busy(&name, "handle not open for writing"));
        }
        self.item.truncate(&self.cache, new_size).await
    }

    /// The object's current logical size.
    pub async fn size(&self) -> u64 {
        self.item.inner.lock().await.meta.size
    }

    /// The object's current logical modification time.
    pub async fn mod_time(&self) -> std::time::SystemTime {
        self.item.inner.lock().await.meta.mod_time_sys()
    }

    /// Close the handle, persisting metadata and queueing an upload if the
    /// item is dirty.
    pub async fn close(mut self) -> Result<()> {
        self.closed = true;
        self.item.close(&self.cache).await
    }
}

impl Drop for ItemHandle {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let item = Arc::clone(&self.item);
        let cache = Arc::clone(&self.cache);
        if let Ok(rt) = tokio::runtime::Handle::try_current() {
            debug!("handle dropped without close; releasing in background");
            drop(rt.spawn(async move {
                let _ = item.close(&cache).await;
            }));
        } else {
            warn!("handle dropped outside a runtime; open count leaks");
        }
    }
}
