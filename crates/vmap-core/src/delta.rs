//! In-memory changes held by one copy.
//!
//! A delta records what a copy changed relative to its predecessor: leaves
//! written by path, keys that moved or disappeared, and node hashes
//! computed when the copy was hashed. Lookups that miss a delta continue
//! with the previous copy and finally the disk store.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use vmap_types::{Hash, HashRecord, LeafRange, LeafRecord, Path};

/// Per-entry overheads used by the flush-threshold estimate.
const KEY_SLOT_OVERHEAD: usize = 32;
const HASH_SLOT_SIZE: usize = 48;

#[derive(Debug, Default)]
pub(crate) struct Delta {
    leaves: HashMap<Path, Arc<LeafRecord>>,
    /// `None` marks a key deleted in this copy.
    keys: HashMap<Vec<u8>, Option<Path>>,
    hashes: HashMap<Path, Hash>,
    /// Leaf paths written by this copy itself (merged entries excluded).
    dirty: BTreeSet<Path>,
    estimated_bytes: usize,
}

impl Delta {
    pub(crate) fn leaf(&self, path: Path) -> Option<&Arc<LeafRecord>> {
        self.leaves.get(&path)
    }

    /// `Some(None)` when this copy deleted the key.
    pub(crate) fn key(&self, key: &[u8]) -> Option<Option<Path>> {
        self.keys.get(key).copied()
    }

    pub(crate) fn hash(&self, path: Path) -> Option<Hash> {
        self.hashes.get(&path).copied()
    }

    /// Store `leaf` at its path, point its key there and mark it dirty.
    pub(crate) fn put_leaf(&mut self, leaf: LeafRecord) {
        let path = leaf.path;
        self.set_key(leaf.key.clone(), Some(path));
        self.estimated_bytes += leaf.footprint();
        if let Some(old) = self.leaves.insert(path, Arc::new(leaf)) {
            self.estimated_bytes = self.estimated_bytes.saturating_sub(old.footprint());
        }
        self.dirty.insert(path);
    }

    /// Drop the leaf at a path that left the leaf range.
    pub(crate) fn clear_leaf(&mut self, path: Path) {
        if let Some(old) = self.leaves.remove(&path) {
            self.estimated_bytes = self.estimated_bytes.saturating_sub(old.footprint());
        }
        self.dirty.remove(&path);
    }

    pub(crate) fn delete_key(&mut self, key: &[u8]) {
        self.set_key(key.to_vec(), None);
    }

    fn set_key(&mut self, key: Vec<u8>, path: Option<Path>) {
        let len = key.len();
        if self.keys.insert(key, path).is_none() {
            self.estimated_bytes += len + KEY_SLOT_OVERHEAD;
        }
    }

    pub(crate) fn record_hashes(&mut self, hashes: impl IntoIterator<Item = (Path, Hash)>) {
        for (path, hash) in hashes {
            if self.hashes.insert(path, hash).is_none() {
                self.estimated_bytes += HASH_SLOT_SIZE;
            }
        }
    }

    /// Dirty leaves that are still inside `range`, sorted by path.
    pub(crate) fn dirty_leaves(&self, range: LeafRange) -> Vec<LeafRecord> {
        self.dirty
            .iter()
            .filter(|path| range.is_leaf(**path))
            .filter_map(|path| self.leaves.get(path))
            .map(|leaf| (**leaf).clone())
            .collect()
    }

    /// Copy in every entry of an older delta that this one does not hold.
    ///
    /// Returns the number of entries taken over.
    pub(crate) fn absorb(&mut self, older: &Self) -> usize {
        let mut moved = 0;
        for (path, leaf) in &older.leaves {
            if !self.leaves.contains_key(path) {
                self.estimated_bytes += leaf.footprint();
                self.leaves.insert(*path, Arc::clone(leaf));
                moved += 1;
            }
        }
        for (key, path) in &older.keys {
            if !self.keys.contains_key(key) {
                self.set_key(key.clone(), *path);
                moved += 1;
            }
        }
        for (path, hash) in &older.hashes {
            if !self.hashes.contains_key(path) {
                self.hashes.insert(*path, *hash);
                self.estimated_bytes += HASH_SLOT_SIZE;
                moved += 1;
            }
        }
        moved
    }

    /// Leaves inside `range`, sorted by path.
    pub(crate) fn leaves_in(&self, range: LeafRange) -> Vec<LeafRecord> {
        let mut leaves: Vec<LeafRecord> = self
            .leaves
            .values()
            .filter(|leaf| range.is_leaf(leaf.path))
            .map(|leaf| (**leaf).clone())
            .collect();
        leaves.sort_by_key(|leaf| leaf.path);
        leaves
    }

    /// Node hashes inside `range`, sorted by path.
    pub(crate) fn hashes_in(&self, range: LeafRange) -> Vec<HashRecord> {
        let mut hashes: Vec<HashRecord> = self
            .hashes
            .iter()
            .filter(|(path, _)| range.contains(**path))
            .map(|(path, hash)| HashRecord {
                path: *path,
                hash: *hash,
            })
            .collect();
        hashes.sort_by_key(|record| record.path);
        hashes
    }

    pub(crate) fn estimated_bytes(&self) -> usize {
        self.estimated_bytes
    }

    pub(crate) fn leaf_count(&self) -> usize {
        self.leaves.len()
    }

    pub(crate) fn key_count(&self) -> usize {
        self.keys.len()
    }

    pub(crate) fn hash_count(&self) -> usize {
        self.hashes.len()
    }

    pub(crate) fn dirty_count(&self) -> usize {
        self.dirty.len()
    }
}
