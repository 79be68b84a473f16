//! Detached read view of one hashed copy.
//!
//! A [`RecordAccessor`] pins the delta chain the copy had when it was
//! detached together with the store view of that moment. Later flushes,
//! merges and compactions publish new state elsewhere; the accessor keeps
//! answering for its own version.

use crate::root::RootCore;
use std::fmt;
use std::path::Path as FsPath;
use std::sync::Arc;
use vmap_error::Result;
use vmap_hash::HashSource;
use vmap_store::{DiskStore, StoreMetadata, StoreView};
use vmap_types::{Hash, HashRecord, LeafRange, LeafRecord, Path, Version};

pub struct RecordAccessor {
    label: Arc<str>,
    version: Version,
    range: LeafRange,
    root_hash: Hash,
    /// The detached copy first, then older copies newest first.
    chain: Vec<Arc<RootCore>>,
    view: Arc<StoreView>,
    store: Arc<DiskStore>,
}

impl fmt::Debug for RecordAccessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordAccessor")
            .field("label", &self.label)
            .field("version", &self.version)
            .field("range", &self.range)
            .field("root_hash", &self.root_hash)
            .field("chain", &self.chain.len())
            .field("store_version", &self.view.version())
            .finish()
    }
}

impl RecordAccessor {
    pub(crate) fn new(
        label: Arc<str>,
        version: Version,
        range: LeafRange,
        root_hash: Hash,
        chain: Vec<Arc<RootCore>>,
        view: Arc<StoreView>,
        store: Arc<DiskStore>,
    ) -> Self {
        Self {
            label,
            version,
            range,
            root_hash,
            chain,
            view,
            store,
        }
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    #[must_use]
    pub fn version(&self) -> Version {
        self.version
    }

    #[must_use]
    pub fn leaf_range(&self) -> LeafRange {
        self.range
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.range.size()
    }

    #[must_use]
    pub fn root_hash(&self) -> Hash {
        self.root_hash
    }

    /// Store view pinned at detach time.
    #[must_use]
    pub fn store_view(&self) -> &Arc<StoreView> {
        &self.view
    }

    pub(crate) fn store(&self) -> &Arc<DiskStore> {
        &self.store
    }

    pub fn find_key(&self, key: &[u8]) -> Result<Option<Path>> {
        for core in &self.chain {
            if let Some(slot) = core.data.read().delta.key(key) {
                return Ok(slot.filter(|path| self.range.is_leaf(*path)));
            }
        }
        Ok(self
            .view
            .find_key(key)?
            .filter(|path| self.range.is_leaf(*path)))
    }

    pub fn leaf(&self, path: Path) -> Result<Option<LeafRecord>> {
        if !self.range.is_leaf(path) {
            return Ok(None);
        }
        for core in &self.chain {
            if let Some(leaf) = core.data.read().delta.leaf(path) {
                return Ok(Some((**leaf).clone()));
            }
        }
        self.view.load_leaf(path)
    }

    pub fn hash(&self, path: Path) -> Result<Option<Hash>> {
        if !self.range.contains(path) {
            return Ok(None);
        }
        for core in &self.chain {
            if let Some(hash) = core.data.read().delta.hash(path) {
                return Ok(Some(hash));
            }
        }
        self.view.load_hash(path)
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.find_key(key)? {
            Some(path) => Ok(self.leaf(path)?.map(|leaf| leaf.value)),
            None => Ok(None),
        }
    }

    pub fn contains_key(&self, key: &[u8]) -> Result<bool> {
        Ok(self.find_key(key)?.is_some())
    }

    /// Every leaf in path order.
    pub fn leaves(&self) -> impl Iterator<Item = Result<LeafRecord>> + '_ {
        let (first, last) = match (self.range.first(), self.range.last()) {
            (Some(first), Some(last)) => (first.0, last.0),
            _ => (1, 0),
        };
        (first..=last).filter_map(move |p| self.leaf(Path(p)).transpose())
    }

    /// Every node hash in path order.
    pub fn hashes(&self) -> impl Iterator<Item = Result<HashRecord>> + '_ {
        let end = self.range.last().map_or(0, |last| last.0.saturating_add(1));
        (0..end).filter_map(move |p| {
            let path = Path(p);
            self.hash(path)
                .map(|hash| hash.map(|hash| HashRecord { path, hash }))
                .transpose()
        })
    }

    pub(crate) fn write_image(&self, dir: &FsPath) -> Result<()> {
        let metadata = StoreMetadata {
            label: self.label.to_string(),
            version: self.version,
            range: self.range,
            root_hash: self.root_hash,
        };
        let mut options = self.store.options().clone();
        options.label = self.label.to_string();
        DiskStore::write_image(dir, &options, &metadata, self.leaves(), self.hashes())
    }
}

impl HashSource for RecordAccessor {
    fn hash_at(&self, path: Path) -> Result<Option<Hash>> {
        self.hash(path)
    }
}
