//! Published read-only state of the store.
//!
//! A [`StoreView`] is immutable once published. Readers obtain one from
//! [`DiskStore::view`](crate::DiskStore::view) and keep using it for as long
//! as they like; a later flush or compaction publishes a new view without
//! disturbing readers of the old one.

use crate::checkpoint::StoreMetadata;
use crate::file::FileSet;
use crate::index::{KeyBuckets, LongList, key_hash};
use crate::record::{RecordRegistry, StoredRecord};
use std::sync::Arc;
use vmap_error::{Result, VmapError};
use vmap_hash::HashSource;
use vmap_types::{Hash, LeafRange, LeafRecord, Path, RecordLocation, Version};

#[derive(Debug, Clone)]
pub struct StoreView {
    pub(crate) metadata: StoreMetadata,
    pub(crate) leaves: LongList,
    pub(crate) hashes: LongList,
    pub(crate) keys: KeyBuckets,
    pub(crate) files: FileSet,
    pub(crate) registry: Arc<RecordRegistry>,
}

impl StoreView {
    pub(crate) fn empty(label: &str, key_buckets: u32, registry: Arc<RecordRegistry>) -> Self {
        Self {
            metadata: StoreMetadata::empty(label),
            leaves: LongList::new(),
            hashes: LongList::new(),
            keys: KeyBuckets::new(key_buckets),
            files: FileSet::default(),
            registry,
        }
    }

    #[must_use]
    pub fn metadata(&self) -> &StoreMetadata {
        &self.metadata
    }

    #[must_use]
    pub fn version(&self) -> Version {
        self.metadata.version
    }

    #[must_use]
    pub fn range(&self) -> LeafRange {
        self.metadata.range
    }

    #[must_use]
    pub fn root_hash(&self) -> Hash {
        self.metadata.root_hash
    }

    #[must_use]
    pub fn leaf_location(&self, path: Path) -> RecordLocation {
        self.leaves.get(path)
    }

    #[must_use]
    pub fn hash_location(&self, path: Path) -> RecordLocation {
        self.hashes.get(path)
    }

    /// Number of entries in the key index.
    #[must_use]
    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    pub(crate) fn read(&self, location: RecordLocation) -> Result<StoredRecord> {
        self.files.read_record(location, &self.registry)
    }

    /// Leaf stored at `path`, or `None` when `path` is not a leaf of this
    /// version.
    pub fn load_leaf(&self, path: Path) -> Result<Option<LeafRecord>> {
        if !self.metadata.range.is_leaf(path) {
            return Ok(None);
        }
        let location = self.leaves.get(path);
        if location.is_none() {
            return Err(VmapError::Format(format!(
                "leaf path {path} of version {} has no stored record",
                self.metadata.version
            )));
        }
        match self.read(location)? {
            StoredRecord::Leaf { leaf, .. } if leaf.path == path => Ok(Some(leaf)),
            StoredRecord::Leaf { leaf, .. } => Err(VmapError::CorruptRecord {
                location: location.0,
                detail: format!("expected leaf at path {path}, found path {}", leaf.path),
            }),
            other => Err(VmapError::CorruptRecord {
                location: location.0,
                detail: format!("expected leaf record, found kind {}", other.kind()),
            }),
        }
    }

    /// Hash stored for the node at `path`, if any.
    pub fn load_hash(&self, path: Path) -> Result<Option<Hash>> {
        if !self.metadata.range.contains(path) {
            return Ok(None);
        }
        let location = self.hashes.get(path);
        if location.is_none() {
            return Ok(None);
        }
        match self.read(location)? {
            StoredRecord::Hash { record, .. } if record.path == path => Ok(Some(record.hash)),
            StoredRecord::Hash { record, .. } => Err(VmapError::CorruptRecord {
                location: location.0,
                detail: format!("expected hash at path {path}, found path {}", record.path),
            }),
            other => Err(VmapError::CorruptRecord {
                location: location.0,
                detail: format!("expected hash record, found kind {}", other.kind()),
            }),
        }
    }

    /// Leaf holding `key`, verified against the stored record.
    pub fn find_leaf_by_key(&self, key: &[u8]) -> Result<Option<LeafRecord>> {
        for path in self.keys.candidates(key_hash(key)) {
            if !self.metadata.range.is_leaf(path) {
                continue;
            }
            if let Some(leaf) = self.load_leaf(path)? {
                if leaf.key == key {
                    return Ok(Some(leaf));
                }
            }
        }
        Ok(None)
    }

    /// Path of the leaf holding `key`.
    pub fn find_key(&self, key: &[u8]) -> Result<Option<Path>> {
        Ok(self.find_leaf_by_key(key)?.map(|leaf| leaf.path))
    }

    /// Every leaf of this version in path order.
    pub fn leaves(&self) -> impl Iterator<Item = Result<LeafRecord>> + '_ {
        let (first, last) = match (self.metadata.range.first(), self.metadata.range.last()) {
            (Some(first), Some(last)) => (first.0, last.0),
            _ => (1, 0),
        };
        (first..=last).filter_map(move |p| self.load_leaf(Path(p)).transpose())
    }

    /// Every stored node hash of this version in path order.
    pub fn hashes(&self) -> impl Iterator<Item = Result<(Path, Hash)>> + '_ {
        let last = self.metadata.range.last().map_or(0, |last| last.0.saturating_add(1));
        (0..last).filter_map(move |p| {
            self.load_hash(Path(p))
                .map(|hash| hash.map(|hash| (Path(p), hash)))
                .transpose()
        })
    }
}

impl HashSource for StoreView {
    fn hash_at(&self, path: Path) -> Result<Option<Hash>> {
        self.load_hash(path)
    }
}
