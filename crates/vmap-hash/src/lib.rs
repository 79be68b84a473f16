#![forbid(unsafe_code)]
//! Merkle hashing of the virtual tree.
//!
//! # Hash Functions
//!
//! | Node | Input to BLAKE3 |
//! |------|-----------------|
//! | Leaf | `0x00 ‖ key_len u32 LE ‖ key ‖ value_len u32 LE ‖ value` |
//! | Internal | `0x02 ‖ left ‖ right` (right omitted when the node has one child) |
//! | Empty tree | `0x02` |
//!
//! # Rehash Pass
//!
//! [`VirtualHasher::hash`] receives the dirty leaves of one copy. A dirty
//! leaf makes its whole ancestor chain dirty. The pass hashes the leaves in
//! parallel, then walks ranks from the deepest one up; every dirty parent of
//! the current rank is hashed (again in parallel) from children resolved in
//! this pass or, for untouched siblings, from a [`HashSource`] that reads the
//! previous copy's hashes.
//!
//! # Logging
//!
//! - **DEBUG** `vmap::hash`: `rehash_start` / `rehash_done` with dirty leaf and node counts
//! - **TRACE** `vmap::hash`: `rank_hashed` per processed rank

use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, trace};
use vmap_error::{Result, VmapError};
use vmap_types::{HASH_SIZE, Hash, LeafRange, LeafRecord, Path};

pub const LEAF_TAG: u8 = 0x00;
pub const INTERNAL_TAG: u8 = 0x02;

/// Below this many items per step the pass stays on the calling thread.
const PARALLEL_THRESHOLD: usize = 64;

/// Hash of a leaf holding `key` and `value`.
#[must_use]
pub fn hash_leaf(key: &[u8], value: &[u8]) -> Hash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[LEAF_TAG]);
    hasher.update(&len_prefix(key.len()));
    hasher.update(key);
    hasher.update(&len_prefix(value.len()));
    hasher.update(value);
    Hash(*hasher.finalize().as_bytes())
}

/// Hash of an internal node from its children's hashes.
#[must_use]
pub fn hash_internal(left: Option<&Hash>, right: Option<&Hash>) -> Hash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[INTERNAL_TAG]);
    if let Some(left) = left {
        hasher.update(left.as_bytes());
    }
    if let Some(right) = right {
        hasher.update(right.as_bytes());
    }
    Hash(*hasher.finalize().as_bytes())
}

/// Root hash of a tree without leaves.
#[must_use]
pub fn empty_tree_hash() -> Hash {
    hash_internal(None, None)
}

fn len_prefix(len: usize) -> [u8; 4] {
    // Leaf payloads are bounded well below 4 GiB by the record format.
    u32::try_from(len).unwrap_or(u32::MAX).to_le_bytes()
}

/// Lifecycle callbacks for one rehash pass.
///
/// All methods default to no-ops. `on_leaf_hashed` and `on_node_hashed` are
/// invoked on the thread that called [`VirtualHasher::hash`], in rank order.
pub trait HashListener {
    fn on_hashing_started(&self) {}
    fn on_leaf_hashed(&self, _path: Path, _hash: Hash) {}
    fn on_node_hashed(&self, _path: Path, _hash: Hash) {}
    fn on_hashing_completed(&self) {}
}

/// Listener that ignores every callback.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl HashListener for NoopListener {}

/// Read access to hashes that did not change in this pass.
pub trait HashSource: Sync {
    fn hash_at(&self, path: Path) -> Result<Option<Hash>>;
}

/// Source for full rehashes where every node is recomputed.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHashes;

impl HashSource for NoHashes {
    fn hash_at(&self, _path: Path) -> Result<Option<Hash>> {
        Ok(None)
    }
}

/// Counters from the last pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RehashStats {
    pub leaves_hashed: usize,
    pub nodes_hashed: usize,
    pub ranks: u32,
}

/// Stateless rehash engine with a shared cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct VirtualHasher {
    cancelled: Arc<AtomicBool>,
}

impl VirtualHasher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Hasher that stops between ranks once `flag` is set.
    #[must_use]
    pub fn with_cancel_flag(flag: Arc<AtomicBool>) -> Self {
        Self { cancelled: flag }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancelled.load(Ordering::Acquire) {
            Err(VmapError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Recompute hashes for `dirty` leaves (sorted by path, unique, inside
    /// `range`).
    ///
    /// Returns `Ok(None)` when nothing is dirty in a non-empty tree, in which
    /// case the previous root hash still applies. An empty tree yields the
    /// empty-tree sentinel.
    pub fn hash(
        &self,
        range: LeafRange,
        dirty: &[LeafRecord],
        source: &dyn HashSource,
        listener: &dyn HashListener,
    ) -> Result<Option<Hash>> {
        self.hash_with_stats(range, dirty, source, listener)
            .map(|(root, _)| root)
    }

    pub fn hash_with_stats(
        &self,
        range: LeafRange,
        dirty: &[LeafRecord],
        source: &dyn HashSource,
        listener: &dyn HashListener,
    ) -> Result<(Option<Hash>, RehashStats)> {
        let mut stats = RehashStats::default();
        if range.is_empty() {
            listener.on_hashing_started();
            listener.on_hashing_completed();
            return Ok((Some(empty_tree_hash()), stats));
        }
        if dirty.is_empty() {
            return Ok((None, stats));
        }
        validate_dirty(range, dirty)?;
        self.check_cancelled()?;

        debug!(
            target: "vmap::hash",
            dirty_leaves = dirty.len(),
            leaf_count = range.size(),
            "rehash_start"
        );
        listener.on_hashing_started();

        let leaf_hashes: Vec<(Path, Hash)> = if dirty.len() >= PARALLEL_THRESHOLD {
            dirty
                .par_iter()
                .map(|leaf| (leaf.path, hash_leaf(&leaf.key, &leaf.value)))
                .collect()
        } else {
            dirty
                .iter()
                .map(|leaf| (leaf.path, hash_leaf(&leaf.key, &leaf.value)))
                .collect()
        };

        let mut pending: BTreeMap<u32, BTreeMap<Path, Hash>> = BTreeMap::new();
        for (path, hash) in &leaf_hashes {
            listener.on_leaf_hashed(*path, *hash);
            pending
                .entry(path.rank())
                .or_default()
                .insert(*path, *hash);
        }
        stats.leaves_hashed = leaf_hashes.len();

        let deepest = pending.keys().next_back().copied().unwrap_or(0);
        for rank in (1..=deepest).rev() {
            self.check_cancelled()?;
            let level = pending.remove(&rank).unwrap_or_default();
            if level.is_empty() {
                continue;
            }
            let parents: BTreeSet<Path> = level.keys().filter_map(|p| p.parent()).collect();
            let resolve = |child: Option<Path>| -> Result<Option<Hash>> {
                let Some(child) = child.filter(|c| range.contains(*c)) else {
                    return Ok(None);
                };
                if let Some(hash) = level.get(&child) {
                    return Ok(Some(*hash));
                }
                match source.hash_at(child)? {
                    Some(hash) => Ok(Some(hash)),
                    None => Err(VmapError::Format(format!(
                        "no hash available for unchanged path {child}"
                    ))),
                }
            };
            let hash_parent = |parent: &Path| -> Result<(Path, Hash)> {
                let left = resolve(parent.left_child())?;
                let right = resolve(parent.right_child())?;
                Ok((*parent, hash_internal(left.as_ref(), right.as_ref())))
            };
            let computed: Vec<(Path, Hash)> = if parents.len() >= PARALLEL_THRESHOLD {
                parents.par_iter().map(hash_parent).collect::<Result<_>>()?
            } else {
                parents.iter().map(hash_parent).collect::<Result<_>>()?
            };
            trace!(target: "vmap::hash", rank, nodes = computed.len(), "rank_hashed");

            let next = pending.entry(rank - 1).or_default();
            for (path, hash) in computed {
                listener.on_node_hashed(path, hash);
                next.insert(path, hash);
                stats.nodes_hashed += 1;
            }
            stats.ranks += 1;
        }

        let root = pending
            .get(&0)
            .and_then(|level| level.get(&Path::ROOT))
            .copied()
            .ok_or_else(|| VmapError::Format("rehash did not reach the root".into()))?;
        listener.on_hashing_completed();
        debug!(
            target: "vmap::hash",
            leaves = stats.leaves_hashed,
            nodes = stats.nodes_hashed,
            root = %root,
            "rehash_done"
        );
        Ok((Some(root), stats))
    }
}

fn validate_dirty(range: LeafRange, dirty: &[LeafRecord]) -> Result<()> {
    let mut previous: Option<Path> = None;
    for leaf in dirty {
        if !range.is_leaf(leaf.path) {
            return Err(VmapError::sequencing(format!(
                "dirty leaf at path {} is outside the leaf range",
                leaf.path
            )));
        }
        if previous.is_some_and(|p| p >= leaf.path) {
            return Err(VmapError::sequencing(
                "dirty leaves must be sorted by path without duplicates",
            ));
        }
        previous = Some(leaf.path);
    }
    Ok(())
}

/// Root hash of a complete tree built from `leaves` (sorted, covering the
/// whole range of a tree of that size).
pub fn hash_full_tree(leaves: &[LeafRecord]) -> Result<Hash> {
    let size = u64::try_from(leaves.len())
        .map_err(|_| VmapError::CapacityExceeded("leaf count exceeds u64".into()))?;
    let range = LeafRange::for_size(size)
        .ok_or_else(|| VmapError::CapacityExceeded("leaf range overflow".into()))?;
    let root = VirtualHasher::new().hash(range, leaves, &NoHashes, &NoopListener)?;
    Ok(root.unwrap_or_else(empty_tree_hash))
}

/// Zero hash, used as a placeholder in fixed-size encodings.
pub const ZERO_HASH: Hash = Hash([0; HASH_SIZE]);
