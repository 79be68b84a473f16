//! Copy-on-write in-memory indexes.
//!
//! Both structures are cloned for every published view. Cloning copies only
//! the outer vector of `Arc` chunks or buckets; a chunk is duplicated the
//! first time a newer version writes into it (`Arc::make_mut`). Older views
//! therefore keep reading exactly the locations they were published with.
//!
//! ```text
//! LongList (path → packed location), chunk = 1024 entries:
//!   [Arc<chunk 0>] [Arc<chunk 1>] ... [Arc<chunk k>]
//!
//! KeyBuckets (key hash → path), fixed bucket count, overflow chaining:
//!   bucket[h & mask] = [entry × BUCKET_CAPACITY] → overflow → overflow ...
//! ```

use std::sync::Arc;
use vmap_types::{Path, RecordLocation};

pub const CHUNK_SIZE: usize = 1024;

/// Entries per bucket before an overflow bucket is chained.
pub const BUCKET_CAPACITY: usize = 32;

/// Average chain length (in buckets) that triggers doubling the bucket count.
const GROW_LOAD: usize = 2;

/// 64-bit key hash used by the bucket index.
#[must_use]
pub fn key_hash(key: &[u8]) -> u64 {
    let digest = blake3::hash(key);
    let bytes = digest.as_bytes();
    u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ])
}

/// Chunked path → location list. Unset entries read as [`RecordLocation::NONE`].
#[derive(Debug, Clone, Default)]
pub struct LongList {
    chunks: Vec<Arc<Vec<u64>>>,
    populated: usize,
}

impl LongList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn split(path: Path) -> Option<(usize, usize)> {
        let index = usize::try_from(path.0).ok()?;
        Some((index / CHUNK_SIZE, index % CHUNK_SIZE))
    }

    #[must_use]
    pub fn get(&self, path: Path) -> RecordLocation {
        let Some((chunk, slot)) = Self::split(path) else {
            return RecordLocation::NONE;
        };
        self.chunks
            .get(chunk)
            .map_or(RecordLocation::NONE, |c| RecordLocation(c[slot]))
    }

    /// Store `location` at `path`, returning the previous value.
    pub fn set(&mut self, path: Path, location: RecordLocation) -> RecordLocation {
        let Some((chunk, slot)) = Self::split(path) else {
            return RecordLocation::NONE;
        };
        if chunk >= self.chunks.len() {
            if location.is_none() {
                return RecordLocation::NONE;
            }
            let zero = Arc::new(vec![0_u64; CHUNK_SIZE]);
            self.chunks.resize_with(chunk + 1, || Arc::clone(&zero));
        }
        let entries = Arc::make_mut(&mut self.chunks[chunk]);
        let previous = RecordLocation(entries[slot]);
        entries[slot] = location.0;
        match (previous.is_none(), location.is_none()) {
            (true, false) => self.populated += 1,
            (false, true) => self.populated -= 1,
            _ => {}
        }
        previous
    }

    /// Clear every entry at or beyond `len` and release whole chunks past it.
    pub fn truncate(&mut self, len: u64) {
        let Ok(len) = usize::try_from(len) else {
            return;
        };
        let keep_chunks = len.div_ceil(CHUNK_SIZE);
        while self.chunks.len() > keep_chunks {
            if let Some(chunk) = self.chunks.pop() {
                self.populated -= chunk.iter().filter(|v| **v != 0).count();
            }
        }
        if let Some(last) = self.chunks.last_mut() {
            let start = len % CHUNK_SIZE;
            if start != 0 && last[start..].iter().any(|v| *v != 0) {
                let entries = Arc::make_mut(last);
                for value in &mut entries[start..] {
                    if *value != 0 {
                        *value = 0;
                        self.populated -= 1;
                    }
                }
            }
        }
    }

    /// Number of non-empty entries.
    #[must_use]
    pub fn populated(&self) -> usize {
        self.populated
    }

    /// Non-empty entries in path order.
    pub fn iter(&self) -> impl Iterator<Item = (Path, RecordLocation)> + '_ {
        self.chunks.iter().enumerate().flat_map(|(c, chunk)| {
            chunk.iter().enumerate().filter_map(move |(s, v)| {
                (*v != 0).then(|| (Path((c * CHUNK_SIZE + s) as u64), RecordLocation(*v)))
            })
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketEntry {
    pub key_hash: u64,
    pub path: Path,
}

#[derive(Debug, Clone, Default)]
struct Bucket {
    entries: Vec<BucketEntry>,
    overflow: Option<Box<Bucket>>,
}

impl Bucket {
    fn insert(&mut self, entry: BucketEntry) -> bool {
        if self.entries.len() < BUCKET_CAPACITY {
            self.entries.push(entry);
            return false;
        }
        let chained = self.overflow.is_none();
        let overflow = self.overflow.get_or_insert_with(Box::default);
        overflow.insert(entry) || chained
    }

    fn remove(&mut self, key_hash: u64, path: Path) -> bool {
        if let Some(pos) = self
            .entries
            .iter()
            .position(|e| e.key_hash == key_hash && e.path == path)
        {
            self.entries.swap_remove(pos);
            self.pull_from_overflow();
            return true;
        }
        match self.overflow.as_mut() {
            Some(overflow) => {
                let removed = overflow.remove(key_hash, path);
                if overflow.entries.is_empty() && overflow.overflow.is_none() {
                    self.overflow = None;
                }
                removed
            }
            None => false,
        }
    }

    // Keep primary slots dense so chains only exist for full buckets.
    fn pull_from_overflow(&mut self) {
        let Some(overflow) = self.overflow.as_mut() else {
            return;
        };
        if let Some(entry) = overflow.entries.pop() {
            self.entries.push(entry);
            overflow.pull_from_overflow();
        }
        if overflow.entries.is_empty() && overflow.overflow.is_none() {
            self.overflow = None;
        }
    }

    fn for_each(&self, f: &mut impl FnMut(BucketEntry)) {
        let mut current = Some(self);
        while let Some(bucket) = current {
            for entry in &bucket.entries {
                f(*entry);
            }
            current = bucket.overflow.as_deref();
        }
    }

    fn chain_len(&self) -> usize {
        1 + self.overflow.as_ref().map_or(0, |o| o.chain_len())
    }
}

/// Persistent-style bucketed hash map from key hash to leaf path.
///
/// Only the 64-bit key hash is stored. Callers resolve collisions by reading
/// the leaf record at each candidate path and comparing keys.
#[derive(Debug, Clone)]
pub struct KeyBuckets {
    buckets: Vec<Arc<Bucket>>,
    len: usize,
    overflow_buckets: usize,
}

impl KeyBuckets {
    /// Create with `bucket_count` buckets, rounded up to a power of two.
    #[must_use]
    pub fn new(bucket_count: u32) -> Self {
        let count = bucket_count.max(1).next_power_of_two() as usize;
        let empty = Arc::new(Bucket::default());
        Self {
            buckets: vec![empty; count],
            len: 0,
            overflow_buckets: 0,
        }
    }

    fn slot(&self, key_hash: u64) -> usize {
        // bucket count is a power of two
        (key_hash as usize) & (self.buckets.len() - 1)
    }

    pub fn insert(&mut self, key_hash: u64, path: Path) {
        let slot = self.slot(key_hash);
        if Arc::make_mut(&mut self.buckets[slot]).insert(BucketEntry { key_hash, path }) {
            self.overflow_buckets += 1;
        }
        self.len += 1;
        if self.overflow_buckets > self.buckets.len() * (GROW_LOAD - 1) {
            self.grow();
        }
    }

    /// Remove one entry matching both `key_hash` and `path`.
    pub fn remove(&mut self, key_hash: u64, path: Path) -> bool {
        let slot = self.slot(key_hash);
        let before = self.buckets[slot].chain_len();
        let removed = Arc::make_mut(&mut self.buckets[slot]).remove(key_hash, path);
        if removed {
            self.len -= 1;
            let after = self.buckets[slot].chain_len();
            self.overflow_buckets -= before - after;
        }
        removed
    }

    /// Candidate paths for `key_hash`.
    #[must_use]
    pub fn candidates(&self, key_hash: u64) -> Vec<Path> {
        let mut out = Vec::new();
        self.buckets[self.slot(key_hash)].for_each(&mut |entry| {
            if entry.key_hash == key_hash {
                out.push(entry.path);
            }
        });
        out
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    #[must_use]
    pub fn overflow_buckets(&self) -> usize {
        self.overflow_buckets
    }

    /// Every entry, bucket by bucket.
    #[must_use]
    pub fn entries(&self) -> Vec<BucketEntry> {
        let mut out = Vec::with_capacity(self.len);
        for bucket in &self.buckets {
            bucket.for_each(&mut |entry| out.push(entry));
        }
        out
    }

    fn grow(&mut self) {
        let entries = self.entries();
        let count = u32::try_from(self.buckets.len() * 2).unwrap_or(u32::MAX);
        let mut grown = Self::new(count);
        for entry in entries {
            let slot = grown.slot(entry.key_hash);
            if Arc::make_mut(&mut grown.buckets[slot]).insert(entry) {
                grown.overflow_buckets += 1;
            }
            grown.len += 1;
        }
        tracing::debug!(
            target: "vmap::store",
            buckets = grown.buckets.len(),
            entries = grown.len,
            "key_index_grown"
        );
        *self = grown;
    }
}
