//! Background hashing, flushing and merging of frozen copies.
//!
//! # Workers
//!
//! | Thread | Loop |
//! |--------|------|
//! | `vmap-hasher` | hash the oldest unhashed immutable copy, strictly in creation order |
//! | `vmap-releaser` | take the oldest copy once hashed; flush it if it should be flushed, else merge it into its successor once the user released or detached it |
//!
//! Users may drive the same steps directly (`compute_hash`, `flush`,
//! `merge`). Hash passes serialize on one lock and flush/merge steps on
//! another, so a step runs once no matter who asks for it.
//!
//! # Ordering
//!
//! Only the oldest copy in the pipeline can be flushed or merged. A copy is
//! always hashed before it is flushed, merged or detached.
//!
//! # Logging
//!
//! - **INFO** `vmap::pipeline`: `pipeline_started`, `copy_flushed`, `pipeline_stopped`
//! - **DEBUG** `vmap::pipeline`: `copy_created`, `copy_hashed`, `copy_merged`, `copy_detached`, compaction results
//! - **WARN** `vmap::pipeline`: flush retries, failed compaction or close
//! - **ERROR** `vmap::pipeline`: `pipeline_failed` when a worker step fails for good

use crate::accessor::RecordAccessor;
use crate::config::VirtualMapConfig;
use crate::root::{Abandoned, CopyState, RootCore};
use parking_lot::{Condvar, Mutex};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use vmap_error::{Result, VmapError};
use vmap_hash::{HashListener, HashSource, VirtualHasher};
use vmap_store::{DiskStore, FlushBatch};
use vmap_types::{Hash, Path};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopMode {
    Drain,
    Immediate,
}

#[derive(Debug)]
struct Queue {
    /// Copies not yet flushed or merged, oldest first. The last one is
    /// the mutable copy.
    copies: VecDeque<Arc<RootCore>>,
    stop: Option<StopMode>,
    failure: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Retired {
    Flushed,
    Merged,
}

/// State shared by every copy of one map and by the workers.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) config: VirtualMapConfig,
    pub(crate) store: Arc<DiskStore>,
    pub(crate) label: Arc<str>,
    pub(crate) size_warned: AtomicBool,
    queue: Mutex<Queue>,
    work: Condvar,
    /// Root hash of the most recently hashed copy.
    last_root: Mutex<Hash>,
    /// Serializes flush, merge and detach.
    phase: Mutex<()>,
    cancel: Arc<AtomicBool>,
    hasher: VirtualHasher,
}

// ── Hash pass plumbing ───────────────────────────────────────────────────────

/// Unchanged hashes come from the copy's chain, then the store.
struct ChainSource<'a> {
    core: &'a RootCore,
}

impl HashSource for ChainSource<'_> {
    fn hash_at(&self, path: Path) -> Result<Option<Hash>> {
        self.core.find_hash(path)
    }
}

/// Collects every hash of a pass so it can be stored in one step.
#[derive(Default)]
struct HashCollector {
    hashes: RefCell<Vec<(Path, Hash)>>,
}

impl HashListener for HashCollector {
    fn on_leaf_hashed(&self, path: Path, hash: Hash) {
        self.hashes.borrow_mut().push((path, hash));
    }

    fn on_node_hashed(&self, path: Path, hash: Hash) {
        self.hashes.borrow_mut().push((path, hash));
    }
}

impl Shared {
    /// Wake the workers after a state change they may be waiting for.
    pub(crate) fn poke(&self) {
        let _queue = self.queue.lock();
        self.work.notify_all();
    }

    pub(crate) fn wants_flush(&self, core: &RootCore, state: &CopyState) -> bool {
        if state.flush_requested {
            return true;
        }
        let threshold = self.config.flush_threshold_bytes;
        if threshold > 0 && core.data.read().delta.estimated_bytes() as u64 >= threshold {
            return true;
        }
        let interval = self.config.flush_interval;
        interval > 0 && core.version.0 % interval == 0
    }

    // ── Copy creation ────────────────────────────────────────────────────

    pub(crate) fn copy(self: &Arc<Self>, current: &Arc<RootCore>) -> Result<Arc<RootCore>> {
        let mut queue = self.queue.lock();
        if let Some(reason) = &queue.failure {
            return Err(VmapError::Closed(format!("pipeline failed: {reason}")));
        }
        if queue.stop.is_some() {
            return Err(VmapError::Closed(format!(
                "pipeline of map {} is shut down",
                self.label
            )));
        }
        current.require_mutable()?;
        let range = current.range();
        let next = RootCore::new(
            current.version.next(),
            Arc::clone(self),
            range,
            Some(Arc::clone(current)),
        );
        current.update(|state| state.immutable = true);
        queue.copies.push_back(Arc::clone(&next));
        self.work.notify_all();
        debug!(
            target: "vmap::pipeline",
            label = %self.label,
            frozen = current.version.0,
            version = next.version.0,
            pending = queue.copies.len(),
            "copy_created"
        );
        Ok(next)
    }

    // ── Hashing ──────────────────────────────────────────────────────────

    /// Hash `target` and every older copy that is not hashed yet.
    pub(crate) fn hash_through(&self, target: &Arc<RootCore>) -> Result<Hash> {
        let state = target.state();
        if let Some(root) = state.root_hash {
            return Ok(root);
        }
        if !state.immutable {
            return Err(VmapError::sequencing(format!(
                "copy {} is mutable and cannot be hashed",
                target.version
            )));
        }
        let mut last_root = self.last_root.lock();
        let pending: Vec<Arc<RootCore>> = self
            .queue
            .lock()
            .copies
            .iter()
            .filter(|core| core.version <= target.version && core.state().root_hash.is_none())
            .cloned()
            .collect();
        for core in &pending {
            *last_root = self.hash_one(core, *last_root)?;
        }
        target.state().root_hash.ok_or_else(|| {
            VmapError::sequencing(format!(
                "copy {} left the pipeline without a hash",
                target.version
            ))
        })
    }

    fn hash_one(&self, core: &RootCore, previous_root: Hash) -> Result<Hash> {
        let (range, dirty) = {
            let data = core.data.read();
            (data.range, data.delta.dirty_leaves(data.range))
        };
        let collector = HashCollector::default();
        let source = ChainSource { core };
        let root = self
            .hasher
            .hash(range, &dirty, &source, &collector)?
            .unwrap_or(previous_root);
        let hashes = collector.hashes.into_inner();
        let computed = hashes.len();
        core.data.write().delta.record_hashes(hashes);
        core.update(|state| state.root_hash = Some(root));
        self.poke();
        debug!(
            target: "vmap::pipeline",
            label = %self.label,
            version = core.version.0,
            dirty_leaves = dirty.len(),
            hashes = computed,
            root = %root,
            "copy_hashed"
        );
        Ok(root)
    }

    // ── Flush and merge ──────────────────────────────────────────────────

    fn ensure_oldest(&self, core: &Arc<RootCore>) -> Result<()> {
        let queue = self.queue.lock();
        match queue.copies.front() {
            Some(front) if Arc::ptr_eq(front, core) => Ok(()),
            Some(front) => Err(VmapError::sequencing(format!(
                "copy {} cannot be released while copy {} is still pending",
                core.version, front.version
            ))),
            None => Err(VmapError::sequencing(format!(
                "copy {} is not in the pipeline",
                core.version
            ))),
        }
    }

    pub(crate) fn flush_copy(&self, core: &Arc<RootCore>) -> Result<()> {
        let _phase = self.phase.lock();
        self.flush_locked(core)
    }

    pub(crate) fn merge_copy(&self, core: &Arc<RootCore>) -> Result<()> {
        let _phase = self.phase.lock();
        self.merge_locked(core)
    }

    fn flush_locked(&self, core: &Arc<RootCore>) -> Result<()> {
        let state = core.state();
        if state.flushed {
            return Ok(());
        }
        if state.merged {
            return Err(VmapError::sequencing(format!(
                "copy {} was merged and cannot be flushed",
                core.version
            )));
        }
        if !state.immutable {
            return Err(VmapError::sequencing(format!(
                "copy {} is mutable and cannot be flushed",
                core.version
            )));
        }
        self.ensure_oldest(core)?;
        let root_hash = self.hash_through(core)?;
        let batch = {
            let data = core.data.read();
            FlushBatch {
                version: core.version,
                range: data.range,
                root_hash,
                leaves: data.delta.leaves_in(data.range),
                hashes: data.delta.hashes_in(data.range),
            }
        };
        self.save_with_retry(&batch)?;
        self.retire(core, Retired::Flushed);
        info!(
            target: "vmap::pipeline",
            label = %self.label,
            version = core.version.0,
            leaves = batch.leaves.len(),
            hashes = batch.hashes.len(),
            size = batch.range.size(),
            "copy_flushed"
        );
        Ok(())
    }

    fn save_with_retry(&self, batch: &FlushBatch) -> Result<()> {
        let mut attempt = 0_u32;
        loop {
            if self.cancel.load(Ordering::Acquire) {
                return Err(VmapError::Cancelled);
            }
            match self.store.save_batch(batch) {
                Ok(()) => return Ok(()),
                Err(err) if err.is_transient() && attempt < self.config.flush_retry_attempts => {
                    attempt += 1;
                    warn!(
                        target: "vmap::pipeline",
                        label = %self.label,
                        version = batch.version.0,
                        attempt,
                        error = %err,
                        "flush_retry"
                    );
                    std::thread::sleep(Duration::from_millis(self.config.flush_retry_backoff_ms));
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn merge_locked(&self, core: &Arc<RootCore>) -> Result<()> {
        let state = core.state();
        if state.merged {
            return Err(VmapError::sequencing(format!(
                "copy {} is already merged",
                core.version
            )));
        }
        if state.flushed {
            // Flushing already unlinked it from its successor.
            return Ok(());
        }
        if !state.immutable {
            return Err(VmapError::sequencing(format!(
                "copy {} is mutable and cannot be merged",
                core.version
            )));
        }
        self.ensure_oldest(core)?;
        self.hash_through(core)?;
        let successor = self.queue.lock().copies.get(1).cloned().ok_or_else(|| {
            VmapError::sequencing(format!("copy {} has no newer copy to merge into", core.version))
        })?;
        let moved = {
            let mut next = successor.data.write();
            let data = core.data.read();
            let moved = next.delta.absorb(&data.delta);
            next.prev = data.prev.clone();
            moved
        };
        self.retire(core, Retired::Merged);
        debug!(
            target: "vmap::pipeline",
            label = %self.label,
            version = core.version.0,
            into = successor.version.0,
            entries = moved,
            "copy_merged"
        );
        Ok(())
    }

    /// Drop `core` from the pipeline after a flush or merge.
    fn retire(&self, core: &Arc<RootCore>, how: Retired) {
        let successor = {
            let mut queue = self.queue.lock();
            if queue.copies.front().is_some_and(|front| Arc::ptr_eq(front, core)) {
                queue.copies.pop_front();
            }
            queue.copies.front().cloned()
        };
        if how == Retired::Flushed {
            // The store now holds everything the successor read through us.
            if let Some(next) = successor {
                next.data.write().prev = None;
            }
        }
        core.update(|state| match how {
            Retired::Flushed => state.flushed = true,
            Retired::Merged => state.merged = true,
        });
        self.poke();
    }

    /// One releaser step on the oldest copy. `Some(true)` after a flush.
    fn release_step(&self, core: &Arc<RootCore>) -> Result<Option<bool>> {
        let _phase = self.phase.lock();
        let state = core.state();
        if state.is_released() {
            return Ok(None);
        }
        if self.wants_flush(core, &state) {
            self.flush_locked(core)?;
            Ok(Some(true))
        } else {
            self.merge_locked(core)?;
            Ok(Some(false))
        }
    }

    // ── Detach ───────────────────────────────────────────────────────────

    /// Pin the current state of `core` for reading.
    ///
    /// `mark_detached` lets the releaser merge the copy even while the
    /// user still holds it.
    pub(crate) fn capture(&self, core: &Arc<RootCore>, mark_detached: bool) -> Result<RecordAccessor> {
        let _phase = self.phase.lock();
        let state = core.state();
        if !state.immutable {
            return Err(VmapError::sequencing(format!(
                "copy {} is mutable and cannot be detached",
                core.version
            )));
        }
        if state.merged || (state.flushed && self.store.view().version() != core.version) {
            return Err(VmapError::sequencing(format!(
                "copy {} already left the pipeline",
                core.version
            )));
        }
        let root_hash = self.hash_through(core)?;
        let (range, chain) = {
            let data = core.data.read();
            let mut chain = vec![Arc::clone(core)];
            let mut next = data.prev.clone();
            while let Some(older) = next {
                next = older.data.read().prev.clone();
                chain.push(older);
            }
            (data.range, chain)
        };
        let view = self.store.view();
        if mark_detached {
            core.update(|state| state.detached = true);
            self.poke();
        }
        debug!(
            target: "vmap::pipeline",
            label = %self.label,
            version = core.version.0,
            chain = chain.len(),
            store_version = view.version().0,
            "copy_detached"
        );
        Ok(RecordAccessor::new(
            Arc::clone(&self.label),
            core.version,
            range,
            root_hash,
            chain,
            view,
            Arc::clone(&self.store),
        ))
    }

    // ── Worker loops ─────────────────────────────────────────────────────

    fn next_hash_target(&self) -> Option<Arc<RootCore>> {
        let mut queue = self.queue.lock();
        loop {
            if queue.stop == Some(StopMode::Immediate) || queue.failure.is_some() {
                return None;
            }
            let target = queue.copies.iter().find(|core| {
                let state = core.state();
                state.immutable && state.root_hash.is_none()
            });
            if let Some(core) = target {
                return Some(Arc::clone(core));
            }
            if queue.stop.is_some() {
                return None;
            }
            self.work.wait(&mut queue);
        }
    }

    fn next_release_target(&self) -> Option<Arc<RootCore>> {
        let mut queue = self.queue.lock();
        loop {
            if queue.stop == Some(StopMode::Immediate) || queue.failure.is_some() {
                return None;
            }
            let mut hash_pending = false;
            if let Some(front) = queue.copies.front() {
                let state = front.state();
                if state.immutable && state.root_hash.is_some() {
                    if state.user_released || state.detached || self.wants_flush(front, &state) {
                        return Some(Arc::clone(front));
                    }
                } else {
                    hash_pending = state.immutable;
                }
            }
            if queue.stop == Some(StopMode::Drain) && !hash_pending {
                return None;
            }
            self.work.wait(&mut queue);
        }
    }

    fn hasher_loop(&self) {
        while let Some(core) = self.next_hash_target() {
            match self.hash_through(&core) {
                Ok(_) => {}
                Err(VmapError::Cancelled) => return,
                Err(err) => {
                    self.fail(&err);
                    return;
                }
            }
        }
    }

    fn releaser_loop(&self) {
        while let Some(core) = self.next_release_target() {
            match self.release_step(&core) {
                Ok(Some(true)) if self.config.compact_after_flush => self.compact_quietly(),
                Ok(_) => {}
                Err(VmapError::Cancelled) => return,
                Err(err) => {
                    self.fail(&err);
                    return;
                }
            }
        }
    }

    fn compact_quietly(&self) {
        match self.store.compact() {
            Ok(report) if report.files_compacted.is_empty() => {}
            Ok(report) => debug!(
                target: "vmap::pipeline",
                label = %self.label,
                files = report.files_compacted.len(),
                records_moved = report.records_moved,
                "compaction_after_flush"
            ),
            Err(err) => warn!(
                target: "vmap::pipeline",
                label = %self.label,
                error = %err,
                "compaction_failed"
            ),
        }
    }

    fn fail(&self, err: &VmapError) {
        error!(target: "vmap::pipeline", label = %self.label, error = %err, "pipeline_failed");
        let reason = err.to_string();
        let copies: Vec<Arc<RootCore>> = {
            let mut queue = self.queue.lock();
            queue.failure = Some(reason.clone());
            self.work.notify_all();
            queue.copies.iter().cloned().collect()
        };
        for core in copies {
            core.update(|state| {
                if state.abandoned.is_none() {
                    state.abandoned = Some(Abandoned::Failed(reason.clone()));
                }
            });
        }
    }

    fn request_stop(&self, mode: StopMode) {
        let mut queue = self.queue.lock();
        if queue.stop != Some(StopMode::Immediate) {
            queue.stop = Some(mode);
        }
        if mode == StopMode::Immediate {
            self.cancel.store(true, Ordering::Release);
        }
        self.work.notify_all();
    }

    fn abandon_remaining(&self) {
        let copies: Vec<Arc<RootCore>> = self.queue.lock().copies.iter().cloned().collect();
        for core in copies {
            core.update(|state| {
                if state.abandoned.is_none() {
                    state.abandoned = Some(Abandoned::Shutdown);
                }
            });
        }
    }
}

// ── Pipeline handle ──────────────────────────────────────────────────────────

/// Owner of the worker threads. Dropping it drains the pipeline.
#[derive(Debug)]
pub(crate) struct Pipeline {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Pipeline {
    /// Start the workers and create the first mutable copy on top of the
    /// store's last flushed version.
    pub(crate) fn start(config: VirtualMapConfig, store: Arc<DiskStore>) -> Result<(Self, Arc<RootCore>)> {
        let metadata = store.metadata();
        let cancel = Arc::new(AtomicBool::new(false));
        let shared = Arc::new(Shared {
            config,
            label: Arc::from(metadata.label.as_str()),
            size_warned: AtomicBool::new(false),
            queue: Mutex::new(Queue {
                copies: VecDeque::new(),
                stop: None,
                failure: None,
            }),
            work: Condvar::new(),
            last_root: Mutex::new(metadata.root_hash),
            phase: Mutex::new(()),
            hasher: VirtualHasher::with_cancel_flag(Arc::clone(&cancel)),
            cancel,
            store,
        });
        let first = RootCore::new(
            metadata.version.next(),
            Arc::clone(&shared),
            metadata.range,
            None,
        );
        shared.queue.lock().copies.push_back(Arc::clone(&first));

        let hasher = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("vmap-hasher".to_owned())
                .spawn(move || shared.hasher_loop())?
        };
        let releaser = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("vmap-releaser".to_owned())
                .spawn(move || shared.releaser_loop())
        };
        let releaser = match releaser {
            Ok(handle) => handle,
            Err(err) => {
                shared.request_stop(StopMode::Immediate);
                let _ = hasher.join();
                return Err(err.into());
            }
        };
        info!(
            target: "vmap::pipeline",
            label = %shared.label,
            version = first.version.0,
            size = metadata.range.size(),
            "pipeline_started"
        );
        Ok((
            Self {
                shared,
                workers: Mutex::new(vec![hasher, releaser]),
            },
            first,
        ))
    }

    /// Stop accepting copies and join the workers.
    ///
    /// A draining stop finishes every step that can still make progress;
    /// an immediate stop abandons pending hashes and flushes. Copies left
    /// in the pipeline fail their flush waiters with `Cancelled`.
    pub(crate) fn shutdown(&self, immediate: bool) {
        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        if workers.is_empty() {
            return;
        }
        self.shared.request_stop(if immediate {
            StopMode::Immediate
        } else {
            StopMode::Drain
        });
        for worker in workers {
            if worker.join().is_err() {
                error!(target: "vmap::pipeline", label = %self.shared.label, "worker_panicked");
            }
        }
        self.shared.abandon_remaining();
        if let Err(err) = self.shared.store.close() {
            warn!(
                target: "vmap::pipeline",
                label = %self.shared.label,
                error = %err,
                "store_close_failed"
            );
        }
        info!(
            target: "vmap::pipeline",
            label = %self.shared.label,
            immediate,
            "pipeline_stopped"
        );
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shutdown(false);
    }
}
