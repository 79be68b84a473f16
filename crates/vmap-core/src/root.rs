//! Copies of the map and the capabilities they expose.
//!
//! Every generation of the map is one [`VirtualRoot`]. Exactly one copy is
//! mutable; [`copy`](crate::VirtualMap::copy) freezes it and hands out its
//! successor. A frozen copy moves through the pipeline:
//!
//! ```text
//! mutable ──copy()──▶ immutable ──hash──▶ hashed ──┬──▶ flushed ──┐
//!                                                  └──▶ merged  ──┴──▶ dropped
//! ```
//!
//! A copy may be detached at any point after it is hashed and before it
//! leaves the pipeline.
//!
//! # Lookups
//!
//! A copy answers from its own delta, then from each older copy still
//! linked behind it, then from the disk store. The disk view used must not
//! be newer than the copy itself; reading a copy after a newer one has been
//! flushed is a [`SequencingViolation`](vmap_error::VmapError::SequencingViolation).

use crate::accessor::RecordAccessor;
use crate::delta::Delta;
use crate::pipeline::Shared;
use parking_lot::{Condvar, Mutex, RwLock};
use std::fmt;
use std::path::Path as FsPath;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::{debug, warn};
use vmap_error::{Result, VmapError};
use vmap_store::StoreView;
use vmap_types::{Hash, LeafRange, LeafRecord, Path, Version};

// ── Capabilities ─────────────────────────────────────────────────────────────

pub trait Versioned {
    fn version(&self) -> Version;
    fn is_immutable(&self) -> bool;
}

pub trait Hashable {
    /// Block until this copy is hashed, hashing older copies first.
    fn compute_hash(&self) -> Result<Hash>;
    fn is_hashed(&self) -> bool;
    fn root_hash(&self) -> Option<Hash>;
}

pub trait Flushable {
    fn should_be_flushed(&self) -> bool;
    /// Ask the pipeline to flush this copy instead of merging it.
    fn enable_flush(&self);
    fn flush(&self) -> Result<()>;
    fn is_flushed(&self) -> bool;
    fn wait_until_flushed(&self) -> Result<()>;
    fn merge(&self) -> Result<()>;
    fn is_merged(&self) -> bool;
    /// Approximate bytes held by this copy's delta.
    fn estimated_size(&self) -> u64;
}

pub trait Detachable {
    fn detach(&self) -> Result<RecordAccessor>;
    /// Write a self-contained store for this version at `dir`.
    fn snapshot(&self, dir: &FsPath) -> Result<()>;
}

// ── Copy internals ───────────────────────────────────────────────────────────

#[derive(Debug)]
pub(crate) struct CopyData {
    pub(crate) delta: Delta,
    pub(crate) range: LeafRange,
    /// Next older copy that has not been flushed or merged away.
    pub(crate) prev: Option<Arc<RootCore>>,
    /// Leaf range the copy had when a reconnect started writing into it.
    pub(crate) reconnect_base: Option<LeafRange>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Abandoned {
    Shutdown,
    Failed(String),
}

#[derive(Debug, Clone, Default)]
pub(crate) struct CopyState {
    pub(crate) immutable: bool,
    /// Set once hashed.
    pub(crate) root_hash: Option<Hash>,
    pub(crate) flushed: bool,
    pub(crate) merged: bool,
    pub(crate) detached: bool,
    pub(crate) user_released: bool,
    pub(crate) flush_requested: bool,
    pub(crate) abandoned: Option<Abandoned>,
}

impl CopyState {
    pub(crate) fn is_released(&self) -> bool {
        self.flushed || self.merged
    }
}

pub(crate) struct RootCore {
    pub(crate) version: Version,
    pub(crate) shared: Arc<Shared>,
    pub(crate) data: RwLock<CopyData>,
    state: Mutex<CopyState>,
    latch: Condvar,
}

impl fmt::Debug for RootCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RootCore")
            .field("version", &self.version)
            .field("state", &self.state.try_lock().map(|state| state.clone()))
            .finish_non_exhaustive()
    }
}

impl RootCore {
    pub(crate) fn new(
        version: Version,
        shared: Arc<Shared>,
        range: LeafRange,
        prev: Option<Arc<Self>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            version,
            shared,
            data: RwLock::new(CopyData {
                delta: Delta::default(),
                range,
                prev,
                reconnect_base: None,
            }),
            state: Mutex::new(CopyState::default()),
            latch: Condvar::new(),
        })
    }

    pub(crate) fn state(&self) -> CopyState {
        self.state.lock().clone()
    }

    /// Change the lifecycle state and wake every latch waiter.
    pub(crate) fn update(&self, change: impl FnOnce(&mut CopyState)) {
        change(&mut self.state.lock());
        self.latch.notify_all();
    }

    /// Block until `ready` yields a result for the current state.
    pub(crate) fn wait_until<T>(&self, ready: impl Fn(&CopyState) -> Option<Result<T>>) -> Result<T> {
        let mut state = self.state.lock();
        loop {
            if let Some(result) = ready(&state) {
                return result;
            }
            self.latch.wait(&mut state);
        }
    }

    pub(crate) fn require_mutable(&self) -> Result<()> {
        if self.state.lock().immutable {
            return Err(VmapError::sequencing(format!(
                "copy {} is immutable",
                self.version
            )));
        }
        Ok(())
    }

    pub(crate) fn range(&self) -> LeafRange {
        self.data.read().range
    }

    // ── Lookups ──────────────────────────────────────────────────────────

    /// Current disk view, refused when it is already past this copy.
    fn disk_view(&self) -> Result<Arc<StoreView>> {
        let view = self.shared.store.view();
        if view.version() > self.version {
            return Err(VmapError::sequencing(format!(
                "copy {} was released and the store has moved on to version {}",
                self.version,
                view.version()
            )));
        }
        Ok(view)
    }

    /// Path of `key` in this copy.
    pub(crate) fn resolve_key(&self, data: &CopyData, key: &[u8]) -> Result<Option<Path>> {
        let range = data.range;
        if let Some(slot) = data.delta.key(key) {
            return Ok(slot.filter(|path| range.is_leaf(*path)));
        }
        let mut next = data.prev.clone();
        while let Some(core) = next {
            let older = core.data.read();
            if let Some(slot) = older.delta.key(key) {
                return Ok(slot.filter(|path| range.is_leaf(*path)));
            }
            next = older.prev.clone();
        }
        Ok(self
            .disk_view()?
            .find_key(key)?
            .filter(|path| range.is_leaf(*path)))
    }

    /// Leaf at `path`, provided `path` is a leaf of `range`.
    pub(crate) fn find_leaf(
        &self,
        data: &CopyData,
        range: LeafRange,
        path: Path,
    ) -> Result<Option<Arc<LeafRecord>>> {
        if !range.is_leaf(path) {
            return Ok(None);
        }
        if let Some(leaf) = data.delta.leaf(path) {
            return Ok(Some(Arc::clone(leaf)));
        }
        let mut next = data.prev.clone();
        while let Some(core) = next {
            let older = core.data.read();
            if let Some(leaf) = older.delta.leaf(path) {
                return Ok(Some(Arc::clone(leaf)));
            }
            next = older.prev.clone();
        }
        Ok(self.disk_view()?.load_leaf(path)?.map(Arc::new))
    }

    /// Leaf that must exist at `path` of the current range.
    fn leaf_at(&self, data: &CopyData, path: Path) -> Result<Arc<LeafRecord>> {
        self.find_leaf(data, data.range, path)?.ok_or_else(|| {
            VmapError::Format(format!(
                "copy {} has no record for leaf path {path}",
                self.version
            ))
        })
    }

    /// Hash of the node at `path` as last computed for this copy or an
    /// older one.
    pub(crate) fn find_hash(&self, path: Path) -> Result<Option<Hash>> {
        let mut next = {
            let data = self.data.read();
            if !data.range.contains(path) {
                return Ok(None);
            }
            if let Some(hash) = data.delta.hash(path) {
                return Ok(Some(hash));
            }
            data.prev.clone()
        };
        while let Some(core) = next {
            let older = core.data.read();
            if let Some(hash) = older.delta.hash(path) {
                return Ok(Some(hash));
            }
            next = older.prev.clone();
        }
        self.disk_view()?.load_hash(path)
    }

    // ── Reads and writes ─────────────────────────────────────────────────

    pub(crate) fn get(&self, key: &[u8]) -> Result<Option<Arc<LeafRecord>>> {
        let data = self.data.read();
        match self.resolve_key(&data, key)? {
            Some(path) => self.leaf_at(&data, path).map(Some),
            None => Ok(None),
        }
    }

    pub(crate) fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        self.require_mutable()?;
        let mut data = self.data.write();
        if let Some(path) = self.resolve_key(&data, &key)? {
            data.delta.put_leaf(LeafRecord::new(path, key, value));
            return Ok(());
        }

        let size = data.range.size();
        let max_size = self.shared.config.max_size;
        if size >= max_size {
            return Err(VmapError::CapacityExceeded(format!(
                "map {} already holds {size} of at most {max_size} leaves",
                self.shared.label
            )));
        }
        let grown = LeafRange::for_size(size + 1).ok_or_else(|| {
            VmapError::CapacityExceeded(format!("leaf range for {} leaves overflows", size + 1))
        })?;
        if size >= 2 {
            // The first leaf becomes an internal node; its leaf moves to the
            // left child and the new leaf takes the right child.
            let first = data.range.first().unwrap_or(Path::FIRST_LEFT);
            let moved = self.leaf_at(&data, first)?;
            let left = first.left_child().ok_or_else(|| {
                VmapError::CapacityExceeded(format!("path {first} has no children"))
            })?;
            data.delta.clear_leaf(first);
            data.delta.put_leaf(moved.with_path(left));
        }
        let Some(path) = grown.last() else {
            return Err(VmapError::Format("non-empty range without a last leaf".into()));
        };
        data.range = grown;
        data.delta.put_leaf(LeafRecord::new(path, key, value));
        drop(data);

        let threshold = self.shared.config.size_warning_threshold;
        if threshold > 0
            && size + 1 >= threshold
            && !self.shared.size_warned.swap(true, Ordering::AcqRel)
        {
            warn!(
                target: "vmap::pipeline",
                label = %self.shared.label,
                size = size + 1,
                threshold,
                max_size,
                "map_size_warning"
            );
        }
        Ok(())
    }

    pub(crate) fn remove(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.require_mutable()?;
        let mut data = self.data.write();
        let Some(path) = self.resolve_key(&data, key)? else {
            return Ok(None);
        };
        let removed = self.leaf_at(&data, path)?;
        let range = data.range;
        let Some(last) = range.last() else {
            return Err(VmapError::Format("key resolved in an empty tree".into()));
        };

        data.delta.delete_key(key);
        if path != last {
            let moving = self.leaf_at(&data, last)?;
            data.delta.put_leaf(moving.with_path(path));
        }
        data.delta.clear_leaf(last);

        match range.size() {
            1 => data.range = LeafRange::EMPTY,
            2 => {
                // The root keeps a single child; rehash it from its leaf.
                data.range = LeafRange::for_size(1).unwrap_or(LeafRange::EMPTY);
                let only = self.leaf_at(&data, Path::FIRST_LEFT)?;
                data.delta.put_leaf((*only).clone());
            }
            size => {
                let (Some(parent), Some(sibling)) = (last.parent(), last.sibling()) else {
                    return Err(VmapError::Format(format!("last leaf {last} has no parent")));
                };
                let lifted = self.leaf_at(&data, sibling)?;
                data.delta.clear_leaf(sibling);
                data.delta.put_leaf(lifted.with_path(parent));
                data.range = LeafRange::for_size(size - 1).unwrap_or(LeafRange::EMPTY);
            }
        }
        Ok(Some(removed.value.clone()))
    }

    // ── Reconnect writes ─────────────────────────────────────────────────

    /// Switch the copy to `range` ahead of receiving leaves from a peer.
    ///
    /// Keys whose leaves fall outside the new leaf range are forgotten
    /// unless a received leaf brings them back.
    pub(crate) fn begin_reconnect(&self, range: LeafRange) -> Result<()> {
        self.require_mutable()?;
        let mut data = self.data.write();
        if data.reconnect_base.is_some() || data.delta.leaf_count() > 0 || data.delta.key_count() > 0 {
            return Err(VmapError::sequencing(format!(
                "copy {} already holds changes; reconnect needs a fresh copy",
                self.version
            )));
        }
        let old = data.range;
        let mut dropped = 0_u64;
        if let (Some(first), Some(last)) = (old.first(), old.last()) {
            for p in first.0..=last.0 {
                let path = Path(p);
                if range.is_leaf(path) {
                    continue;
                }
                let leaf = self.leaf_at(&data, path)?;
                if self.resolve_key(&data, &leaf.key)? == Some(path) {
                    data.delta.delete_key(&leaf.key);
                }
                data.delta.clear_leaf(path);
                dropped += 1;
            }
        }
        data.range = range;
        data.reconnect_base = Some(old);
        debug!(
            target: "vmap::pipeline",
            version = self.version.0,
            old_size = old.size(),
            new_size = range.size(),
            dropped,
            "reconnect_range_set"
        );
        Ok(())
    }

    /// Throw away everything a failed reconnect wrote into this copy.
    pub(crate) fn abandon_reconnect(&self) -> Result<()> {
        self.require_mutable()?;
        let mut data = self.data.write();
        let Some(base) = data.reconnect_base.take() else {
            return Ok(());
        };
        data.delta = Delta::default();
        data.range = base;
        debug!(
            target: "vmap::pipeline",
            version = self.version.0,
            size = base.size(),
            "reconnect_abandoned"
        );
        Ok(())
    }

    /// Write a leaf received from a peer at its path.
    pub(crate) fn apply_reconnect_leaf(&self, leaf: LeafRecord) -> Result<()> {
        self.require_mutable()?;
        let mut data = self.data.write();
        let Some(base) = data.reconnect_base else {
            return Err(VmapError::sequencing("reconnect leaf before begin_reconnect"));
        };
        if !data.range.is_leaf(leaf.path) {
            return Err(VmapError::sequencing(format!(
                "reconnect leaf {} outside leaf range",
                leaf.path
            )));
        }
        if let Some(old) = self.find_leaf(&data, base, leaf.path)? {
            if old.key != leaf.key && self.resolve_key(&data, &old.key)? == Some(leaf.path) {
                data.delta.delete_key(&old.key);
            }
        }
        data.delta.put_leaf(leaf);
        Ok(())
    }
}

// ── Public handle ────────────────────────────────────────────────────────────

/// Read-only picture of one copy for tests and diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugState {
    pub version: Version,
    pub range: LeafRange,
    pub immutable: bool,
    pub hashed: bool,
    pub flushed: bool,
    pub merged: bool,
    pub detached: bool,
    pub released_by_user: bool,
    pub flush_requested: bool,
    /// Whether lookups still walk back into an older copy.
    pub linked_to_older: bool,
    pub delta_leaves: usize,
    pub delta_keys: usize,
    pub delta_hashes: usize,
    pub dirty_leaves: usize,
    pub estimated_bytes: usize,
}

/// One generation of the map.
///
/// Cloning the handle does not create a new generation; it is another
/// reference to the same copy.
#[derive(Clone)]
pub struct VirtualRoot {
    pub(crate) core: Arc<RootCore>,
}

impl fmt::Debug for VirtualRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualRoot")
            .field("version", &self.core.version)
            .finish_non_exhaustive()
    }
}

impl VirtualRoot {
    #[must_use]
    pub fn label(&self) -> &str {
        &self.core.shared.label
    }

    #[must_use]
    pub fn leaf_range(&self) -> LeafRange {
        self.core.range()
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.core.range().size()
    }

    #[must_use]
    pub fn debug_state(&self) -> DebugState {
        let state = self.core.state();
        let data = self.core.data.read();
        DebugState {
            version: self.core.version,
            range: data.range,
            immutable: state.immutable,
            hashed: state.root_hash.is_some(),
            flushed: state.flushed,
            merged: state.merged,
            detached: state.detached,
            released_by_user: state.user_released,
            flush_requested: state.flush_requested,
            linked_to_older: data.prev.is_some(),
            delta_leaves: data.delta.leaf_count(),
            delta_keys: data.delta.key_count(),
            delta_hashes: data.delta.hash_count(),
            dirty_leaves: data.delta.dirty_count(),
            estimated_bytes: data.delta.estimated_bytes(),
        }
    }
}

impl Versioned for VirtualRoot {
    fn version(&self) -> Version {
        self.core.version
    }

    fn is_immutable(&self) -> bool {
        self.core.state().immutable
    }
}

impl Hashable for VirtualRoot {
    fn compute_hash(&self) -> Result<Hash> {
        self.core.shared.hash_through(&self.core)
    }

    fn is_hashed(&self) -> bool {
        self.core.state().root_hash.is_some()
    }

    fn root_hash(&self) -> Option<Hash> {
        self.core.state().root_hash
    }
}

impl Flushable for VirtualRoot {
    fn should_be_flushed(&self) -> bool {
        self.core.shared.wants_flush(&self.core, &self.core.state())
    }

    fn enable_flush(&self) {
        self.core.update(|state| state.flush_requested = true);
        self.core.shared.poke();
    }

    fn flush(&self) -> Result<()> {
        self.core.shared.flush_copy(&self.core)
    }

    fn is_flushed(&self) -> bool {
        self.core.state().flushed
    }

    fn wait_until_flushed(&self) -> Result<()> {
        if !self.core.state().immutable {
            return Err(VmapError::sequencing(format!(
                "copy {} is mutable and will never be flushed as is",
                self.core.version
            )));
        }
        let version = self.core.version;
        self.core.wait_until(|state| {
            if state.flushed {
                return Some(Ok(()));
            }
            if state.merged {
                return Some(Err(VmapError::sequencing(format!(
                    "copy {version} was merged instead of flushed"
                ))));
            }
            match &state.abandoned {
                Some(Abandoned::Shutdown) => Some(Err(VmapError::Cancelled)),
                Some(Abandoned::Failed(reason)) => Some(Err(VmapError::Closed(format!(
                    "pipeline failed: {reason}"
                )))),
                None => None,
            }
        })
    }

    fn merge(&self) -> Result<()> {
        self.core.shared.merge_copy(&self.core)
    }

    fn is_merged(&self) -> bool {
        self.core.state().merged
    }

    fn estimated_size(&self) -> u64 {
        self.core.data.read().delta.estimated_bytes() as u64
    }
}

impl Detachable for VirtualRoot {
    fn detach(&self) -> Result<RecordAccessor> {
        self.core.shared.capture(&self.core, true)
    }

    fn snapshot(&self, dir: &FsPath) -> Result<()> {
        let accessor = self.core.shared.capture(&self.core, false)?;
        accessor.write_image(dir)
    }
}
