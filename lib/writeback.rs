//! Priority-queue upload scheduler.
//!
//! Dirty items are queued with an expiry (last write plus the configured
//! write-back delay) and uploaded by a bounded pool of worker slots, earliest
//! expiry first, FIFO within a tick. Each item is **single-flight**: it is
//! queued or uploading at most once, and anything that re-dirties it while an
//! upload is in flight sets a pending flag that re-queues it on completion.
//!
//! The scheduler never touches item state directly. Every queue entry carries
//! an upload closure supplied by the item, so retry, backoff, cancellation
//! and the single-flight protocol all live here, generic over what an upload
//! actually does.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use rand::Rng as _;
use rustc_hash::FxHashMap;
use tokio::sync::{Notify, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::cache::AddVirtualFn;
use crate::config::CacheOpt;
use crate::error::Result;

/// The upload action for one queue entry.
///
/// Called with a child cancellation token; must reflect the item's dirty
/// bytes at the moment it runs and report failures for the scheduler to
/// retry.
pub type PutFn = Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Stable identity of an item within the scheduler. Assigned on first
/// enqueue and kept by the item for its whole life, like a ticket number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WbId(u64);

/// Queue counters for stats and the cleaner's summary line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WbStats {
    /// Uploads currently in flight.
    pub uploading: usize,
    /// Entries waiting for their expiry.
    pub queued: usize,
    /// Entries parked after exhausting their retries.
    pub failed: usize,
}

/// Heap ordering: earliest expiry first, ties broken by lowest id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct HeapKey {
    expiry: Instant,
    id: WbId,
    seq: u64,
}

struct Entry {
    name: String,
    /// Bumped on every (re)schedule; heap keys with an older seq are stale
    /// and skipped on pop.
    seq: u64,
    uploading: bool,
    /// Re-queue once the in-flight upload completes.
    pending: bool,
    /// Exhausted retries; waits for a new write to reset the counter.
    failed: bool,
    tries: u32,
    cancel: Option<CancellationToken>,
    put: PutFn,
}

struct State {
    entries: FxHashMap<WbId, Entry>,
    heap: BinaryHeap<Reverse<HeapKey>>,
    uploads: usize,
    next_id: u64,
    next_seq: u64,
}

impl State {
    fn schedule(&mut self, id: WbId, when: Instant) {
        self.next_seq += 1;
        let seq = self.next_seq;
        if let Some(e) = self.entries.get_mut(&id) {
            e.seq = seq;
            self.heap.push(Reverse(HeapKey {
                expiry: when,
                id,
                seq,
            }));
        }
    }
}

/// The write-back scheduler. One per cache.
pub struct WriteBack {
    state: Mutex<State>,
    /// Wakes the worker when the queue or the slot count changes.
    kick: Notify,
    /// Cancelled on shutdown; parent of every per-upload child token.
    token: CancellationToken,
    /// Mirrors the in-flight upload count for the drain wait.
    active_tx: watch::Sender<usize>,
    write_back_delay: Duration,
    max_retries: u32,
    base_backoff: Duration,
    max_backoff: Duration,
    max_slots: usize,
    avfn: Option<Arc<AddVirtualFn>>,
}

impl WriteBack {
    /// Create the scheduler and spawn its worker task.
    pub fn new(
        opt: &CacheOpt,
        token: CancellationToken,
        avfn: Option<Arc<AddVirtualFn>>,
    ) -> Arc<Self> {
        let (active_tx, _) = watch::channel(0);
        let wb = Arc::new(Self {
            state: Mutex::new(State {
                entries: FxHashMap::default(),
                heap: BinaryHeap::new(),
                uploads: 0,
                next_id: 0,
                next_seq: 0,
            }),
            kick: Notify::new(),
            token,
            active_tx,
            write_back_delay: opt.write_back_delay,
            max_retries: opt.max_retries,
            base_backoff: opt.base_backoff,
            max_backoff: opt.max_backoff,
            max_slots: opt.max_upload_concurrency.max(1),
            avfn,
        });
        tokio::spawn(Arc::clone(&wb).run());
        wb
    }

    /// Enqueue an item for upload, or refresh an existing entry.
    ///
    /// Items call this on every dirtying write and on close-while-dirty, so
    /// the expiry is always measured from the *last* write. A queued entry
    /// has its expiry pushed out; an uploading entry is flagged for re-queue
    /// on completion; a parked (failed) entry gets its attempt counter
    /// reset. Returns the id the item must pass on subsequent calls.
    pub fn add(&self, id: Option<WbId>, name: &str, size: u64, put: PutFn) -> WbId {
        let mut created = false;
        let id = {
            let mut st = self.state.lock().expect("writeback state poisoned");
            let id = id.unwrap_or_else(|| {
                st.next_id += 1;
                WbId(st.next_id)
            });
            if let Some(e) = st.entries.get_mut(&id) {
                e.put = put;
                e.tries = 0;
                e.failed = false;
                if e.uploading {
                    e.pending = true;
                } else {
                    let when = Instant::now() + self.write_back_delay;
                    st.schedule(id, when);
                }
            } else {
                created = true;
                let when = Instant::now() + self.write_back_delay;
                st.entries.insert(
                    id,
                    Entry {
                        name: name.to_owned(),
                        seq: 0,
                        uploading: false,
                        pending: false,
                        failed: false,
                        tries: 0,
                        cancel: None,
                        put,
                    },
                );
                st.schedule(id, when);
            }
            id
        };
        if created && let Some(avfn) = &self.avfn {
            // Best effort: the unsynced file should show up in listings even
            // though the remote has not observed it yet.
            if let Err(e) = avfn(name, size, false) {
                tracing::debug!(name = %name, error = %e, "add virtual entry failed");
            }
        }
        self.kick.notify_one();
        id
    }

    /// Drop an entry, cancelling its upload if one is in flight.
    ///
    /// Returns true if the scheduler still had the item, i.e. the caller
    /// deleted a file that may not have finished uploading.
    pub fn remove(&self, id: WbId) -> bool {
        let mut st = self.state.lock().expect("writeback state poisoned");
        match st.entries.remove(&id) {
            Some(e) => {
                if let Some(cancel) = e.cancel {
                    cancel.cancel();
                }
                true
            }
            None => false,
        }
    }

    /// Record a rename. An in-flight upload still targets the old name, so
    /// it is cancelled and the entry re-queued; the refreshed upload reads
    /// the item's new name when it runs.
    pub fn rename(&self, id: WbId, new_name: &str) {
        let mut st = self.state.lock().expect("writeback state poisoned");
        if let Some(e) = st.entries.get_mut(&id) {
            e.name = new_name.to_owned();
            if e.uploading {
                e.pending = true;
                if let Some(cancel) = &e.cancel {
                    cancel.cancel();
                }
            }
        }
    }

    /// Whether the scheduler currently tracks `id`.
    #[must_use]
    pub fn tracks(&self, id: WbId) -> bool {
        self.state
            .lock()
            .expect("writeback state poisoned")
            .entries
            .contains_key(&id)
    }

    /// Current queue counters.
    #[must_use]
    pub fn stats(&self) -> WbStats {
        let st = self.state.lock().expect("writeback state poisoned");
        let failed = st.entries.values().filter(|e| e.failed).count();
        WbStats {
            uploading: st.uploads,
            queued: st.entries.len() - st.uploads - failed,
            failed,
        }
    }

    /// Stop accepting work, cancel in-flight uploads and wait up to
    /// `drain_timeout` for them to finish. Anything still dirty stays on
    /// disk for the next run; the sidecars guarantee resumption.
    pub async fn shutdown(&self, drain_timeout: Duration) {
        self.token.cancel();
        let mut rx = self.active_tx.subscribe();
        let drained = tokio::time::timeout(drain_timeout, async {
            while *rx.borrow_and_update() > 0 {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await;
        if drained.is_err() {
            tracing::warn!("shutdown timed out waiting for uploads to drain");
        }
    }

    async fn run(self: Arc<Self>) {
        loop {
            let next_expiry = self.start_eligible();
            tokio::select! {
                () = self.token.cancelled() => break,
                () = self.kick.notified() => {}
                () = async {
                    match next_expiry {
                        Some(when) => tokio::time::sleep_until(when).await,
                        None => std::future::pending().await,
                    }
                } => {}
            }
        }
        tracing::debug!("write-back worker exiting");
    }

    /// Spawn uploads for every eligible entry while slots are free. Returns
    /// the next expiry to sleep until, if any entry is still waiting.
    fn start_eligible(self: &Arc<Self>) -> Option<Instant> {
        let mut st = self.state.lock().expect("writeback state poisoned");
        let now = Instant::now();
        loop {
            let Some(Reverse(key)) = st.heap.peek().copied() else {
                return None;
            };
            let live = st
                .entries
                .get(&key.id)
                .is_some_and(|e| e.seq == key.seq && !e.uploading && !e.failed);
            if !live {
                st.heap.pop();
                continue;
            }
            if key.expiry > now {
                return Some(key.expiry);
            }
            if st.uploads >= self.max_slots {
                // Woken again when a slot frees up.
                return Some(key.expiry);
            }
            st.heap.pop();
            st.uploads += 1;
            let child = self.token.child_token();
            let (put, name) = {
                let e = st
                    .entries
                    .get_mut(&key.id)
                    .expect("liveness checked above");
                e.uploading = true;
                e.cancel = Some(child.clone());
                (e.put.clone(), e.name.clone())
            };
            self.active_tx.send_replace(st.uploads);
            let wb = Arc::clone(self);
            tokio::spawn(async move {
                tracing::debug!(name = %name, "upload starting");
                let res = (put)(child).await;
                wb.upload_finished(key.id, res);
            });
        }
    }

    fn upload_finished(&self, id: WbId, res: Result<()>) {
        enum Next {
            Remove,
            Schedule(Instant),
            Stay,
        }

        let mut st = self.state.lock().expect("writeback state poisoned");
        st.uploads -= 1;
        self.active_tx.send_replace(st.uploads);
        let now = Instant::now();
        let next = match st.entries.get_mut(&id) {
            // Removed while uploading; nothing left to do.
            None => Next::Stay,
            Some(e) => {
                e.uploading = false;
                e.cancel = None;
                match res {
                    Ok(()) => {
                        if e.pending {
                            // Re-dirtied while uploading; go around again.
                            e.pending = false;
                            e.tries = 0;
                            tracing::debug!(name = %e.name, "upload done, item re-dirtied, re-queueing");
                            Next::Schedule(now + self.write_back_delay)
                        } else {
                            tracing::info!(name = %e.name, "upload done");
                            Next::Remove
                        }
                    }
                    Err(err) if err.is_retriable() => {
                        e.tries += 1;
                        if e.tries >= self.max_retries {
                            e.failed = true;
                            tracing::error!(
                                name = %e.name,
                                tries = e.tries,
                                error = %err,
                                "upload failed, retries exhausted, parking until next write"
                            );
                            Next::Stay
                        } else {
                            let backoff = self.backoff_for(e.tries);
                            tracing::warn!(
                                name = %e.name,
                                tries = e.tries,
                                error = %err,
                                "upload failed, retrying in {backoff:?}"
                            );
                            Next::Schedule(now + backoff)
                        }
                    }
                    Err(_) => {
                        // Cancelled: renamed mid-flight or shutting down.
                        // Not a failure, so no attempt is charged; re-queue
                        // immediately. On shutdown the worker is gone anyway
                        // and the sidecar keeps the dirty state for the next
                        // run.
                        e.pending = false;
                        tracing::debug!(name = %e.name, "upload cancelled, re-queueing");
                        Next::Schedule(now)
                    }
                }
            }
        };
        match next {
            Next::Remove => {
                st.entries.remove(&id);
            }
            Next::Schedule(when) => st.schedule(id, when),
            Next::Stay => {}
        }
        drop(st);
        // A slot freed up either way.
        self.kick.notify_one();
    }

    /// Exponential backoff with +/-10% jitter: `base * 2^(tries-1)` capped
    /// at `max_backoff`.
    fn backoff_for(&self, tries: u32) -> Duration {
        let exp = tries.saturating_sub(1).min(16);
        let mut delay = self.base_backoff.saturating_mul(1 << exp);
        if delay > self.max_backoff {
            delay = self.max_backoff;
        }
        delay.mul_f64(rand::thread_rng().gen_range(0.9..1.1))
    }
}
