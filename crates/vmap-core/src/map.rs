//! User-facing handle over one copy of the map.

use crate::accessor::RecordAccessor;
use crate::codec::Codec;
use crate::config::VirtualMapConfig;
use crate::diagnostic::DiagnosticAccessor;
use crate::pipeline::Pipeline;
use crate::root::{Detachable, Flushable, Hashable, Versioned, VirtualRoot};
use std::path::Path as FsPath;
use std::sync::Arc;
use tracing::info;
use vmap_error::{Result, VmapError};
use vmap_store::{DiskStore, StoreStats};
use vmap_types::{Hash, LeafRange, LeafRecord, Version};

/// Key-value view of one generation.
///
/// The handle returned by [`open`](Self::open) is mutable. [`copy`](Self::copy)
/// freezes it and returns a handle on the new mutable generation; the old
/// handle keeps reading its own version until it is dropped. Dropping a
/// handle releases its copy, after which the pipeline may merge it away.
///
/// ```no_run
/// use vmap_core::{Hashable, VirtualMap, VirtualMapConfig};
///
/// let mut map = VirtualMap::open("/tmp/accounts", VirtualMapConfig::default())?;
/// map.put(b"alice".to_vec(), b"10".to_vec())?;
/// let next = map.copy()?;
/// let frozen = std::mem::replace(&mut map, next);
/// let root = frozen.compute_hash()?;
/// # let _ = root;
/// # Ok::<(), vmap_error::VmapError>(())
/// ```
#[derive(Debug)]
pub struct VirtualMap {
    root: VirtualRoot,
    pipeline: Arc<Pipeline>,
}

impl VirtualMap {
    /// Open (or create) the store configured in `config.store_dir`.
    ///
    /// Copies live in memory until the pipeline flushes them.
    pub fn new(config: VirtualMapConfig) -> Result<Self> {
        let Some(dir) = config.store_dir.clone() else {
            return Err(VmapError::InvalidConfig(
                "store_dir is required to create a map".to_owned(),
            ));
        };
        Self::open(dir, config)
    }

    /// Reopen the store or snapshot image at `dir`.
    ///
    /// The mutable copy starts one version after the last flushed one.
    pub fn open(dir: impl AsRef<FsPath>, config: VirtualMapConfig) -> Result<Self> {
        config.validate()?;
        let store = DiskStore::open(dir.as_ref(), config.store.clone())?;
        let (pipeline, core) = Pipeline::start(config, Arc::new(store))?;
        info!(
            target: "vmap::pipeline",
            dir = %dir.as_ref().display(),
            version = core.version.0,
            "map_opened"
        );
        Ok(Self {
            root: VirtualRoot { core },
            pipeline: Arc::new(pipeline),
        })
    }

    #[must_use]
    pub fn root(&self) -> &VirtualRoot {
        &self.root
    }

    #[must_use]
    pub fn label(&self) -> &str {
        self.root.label()
    }

    #[must_use]
    pub fn leaf_range(&self) -> LeafRange {
        self.root.leaf_range()
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.root.size()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    // ── Reads ────────────────────────────────────────────────────────────

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.root.core.get(key)?.map(|leaf| leaf.value.clone()))
    }

    pub fn contains_key(&self, key: &[u8]) -> Result<bool> {
        Ok(self.root.core.get(key)?.is_some())
    }

    /// Read the leaf for `key` once, leaving its data file pages in the OS
    /// page cache. The map itself keeps nothing.
    ///
    /// Returns whether the key exists.
    pub fn warm(&self, key: &[u8]) -> Result<bool> {
        self.contains_key(key)
    }

    pub fn get_as<K, V>(
        &self,
        key: &K,
        key_codec: &impl Codec<K>,
        value_codec: &impl Codec<V>,
    ) -> Result<Option<V>> {
        match self.get(&key_codec.encode(key))? {
            Some(bytes) => value_codec.decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    // ── Writes ───────────────────────────────────────────────────────────

    /// Insert or replace. Fails with `CapacityExceeded` at `max_size` leaves.
    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Result<()> {
        self.root.core.put(key.into(), value.into())
    }

    pub fn put_as<K, V>(
        &mut self,
        key: &K,
        value: &V,
        key_codec: &impl Codec<K>,
        value_codec: &impl Codec<V>,
    ) -> Result<()> {
        self.put(key_codec.encode(key), value_codec.encode(value))
    }

    /// Remove `key`, returning its value.
    pub fn remove(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.root.core.remove(key)
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    /// Freeze this copy and return a handle on its mutable successor.
    pub fn copy(&mut self) -> Result<Self> {
        let core = self.root.core.shared.copy(&self.root.core)?;
        Ok(Self {
            root: VirtualRoot { core },
            pipeline: Arc::clone(&self.pipeline),
        })
    }

    /// Read view of this frozen copy that keeps the copy held.
    ///
    /// Unlike [`detach`](Detachable::detach) the pipeline may still flush
    /// the copy but will not merge it away while this handle lives.
    pub fn read_view(&self) -> Result<RecordAccessor> {
        self.root.core.shared.capture(&self.root.core, false)
    }

    /// Give up this handle; same as dropping it.
    pub fn release(self) {
        drop(self);
    }

    /// Stop the pipeline shared by every copy of this map.
    pub fn shutdown(&self, immediate: bool) {
        self.pipeline.shutdown(immediate);
    }

    #[must_use]
    pub fn store_stats(&self) -> StoreStats {
        self.root.core.shared.store.stats()
    }

    #[must_use]
    pub fn diagnostics(&self) -> DiagnosticAccessor {
        DiagnosticAccessor::for_root(self.root.clone())
    }

    // ── Reconnect ────────────────────────────────────────────────────────

    /// Give this mutable copy the leaf range of a peer's tree.
    ///
    /// Only a copy with no writes of its own can take part; freeze the
    /// map first and keep the frozen handle until the reconnect finishes
    /// or is abandoned, so nothing is merged into this copy meanwhile.
    /// Leaves are then written with [`apply_reconnect_leaf`](Self::apply_reconnect_leaf);
    /// paths that receive nothing keep this copy's current leaves.
    pub fn begin_reconnect(&mut self, range: LeafRange) -> Result<()> {
        self.root.core.begin_reconnect(range)
    }

    pub fn apply_reconnect_leaf(&mut self, leaf: LeafRecord) -> Result<()> {
        self.root.core.apply_reconnect_leaf(leaf)
    }

    /// Undo [`begin_reconnect`](Self::begin_reconnect) and every leaf
    /// applied since. A no-op when no reconnect is in progress.
    pub fn abandon_reconnect(&mut self) -> Result<()> {
        self.root.core.abandon_reconnect()
    }
}

impl Drop for VirtualMap {
    fn drop(&mut self) {
        self.root.core.update(|state| state.user_released = true);
        self.root.core.shared.poke();
    }
}

impl Versioned for VirtualMap {
    fn version(&self) -> Version {
        self.root.version()
    }

    fn is_immutable(&self) -> bool {
        self.root.is_immutable()
    }
}

impl Hashable for VirtualMap {
    fn compute_hash(&self) -> Result<Hash> {
        self.root.compute_hash()
    }

    fn is_hashed(&self) -> bool {
        self.root.is_hashed()
    }

    fn root_hash(&self) -> Option<Hash> {
        self.root.root_hash()
    }
}

impl Flushable for VirtualMap {
    fn should_be_flushed(&self) -> bool {
        self.root.should_be_flushed()
    }

    fn enable_flush(&self) {
        self.root.enable_flush();
    }

    fn flush(&self) -> Result<()> {
        self.root.flush()
    }

    fn is_flushed(&self) -> bool {
        self.root.is_flushed()
    }

    fn wait_until_flushed(&self) -> Result<()> {
        self.root.wait_until_flushed()
    }

    fn merge(&self) -> Result<()> {
        self.root.merge()
    }

    fn is_merged(&self) -> bool {
        self.root.is_merged()
    }

    fn estimated_size(&self) -> u64 {
        self.root.estimated_size()
    }
}

impl Detachable for VirtualMap {
    fn detach(&self) -> Result<RecordAccessor> {
        self.root.detach()
    }

    fn snapshot(&self, dir: &FsPath) -> Result<()> {
        self.root.snapshot(dir)
    }
}
