#![forbid(unsafe_code)]
//! Durable record store backing a virtual map.
//!
//! The store keeps the last flushed version of the tree: one leaf record
//! per leaf path, one hash record per node path and a key index mapping
//! keys to leaf paths.
//!
//! # Layout
//!
//! ```text
//! <dir>/
//!   metadata.vmm        last committed version, leaf range, root hash, label
//!   index.vmi           optional index checkpoint (speeds up open)
//!   data/00000001.vmd   append-only data files, see [`record`]
//!   data/00000002.vmd
//! ```
//!
//! # Writes
//!
//! [`DiskStore::save_batch`] appends leaf and hash records followed by a
//! commit marker, syncs, then publishes a new [`StoreView`]. Readers holding
//! an older view are unaffected. A batch is visible after a crash if and
//! only if its commit marker reached the disk.
//!
//! # Logging
//!
//! - `info` on `vmap::store`: open, recovery summary, compaction.
//! - `debug` on `vmap::store`: every committed batch, checkpoints, file rolls.
//! - `warn` on `vmap::store`: torn tails, orphan files, stale metadata,
//!   failed rollbacks.

pub mod checkpoint;
pub mod compact;
pub mod file;
mod image;
pub mod index;
pub mod record;
mod recovery;
pub mod validate;
pub mod view;

pub use checkpoint::StoreMetadata;
pub use compact::{CompactionReport, FileUsage};
pub use recovery::RecoveryReport;
pub use validate::ValidationReport;
pub use view::StoreView;

use crate::checkpoint::Checkpoint;
use crate::file::{DATA_DIR, DataFile, DataFileWriter, data_file_name};
use crate::index::{KeyBuckets, LongList, key_hash};
use crate::record::{CommitMarker, HEADER_SIZE, RecordRegistry, StoredRecord, encode_record};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};
use vmap_error::{Result, VmapError};
use vmap_types::{Hash, HashRecord, LeafRange, LeafRecord, Path, RecordLocation, Version};

// ── Options ──────────────────────────────────────────────────────────────────

/// Configuration options for the disk store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreOptions {
    /// Name recorded in the metadata file and used in log fields.
    pub label: String,
    /// Whether to fsync data files at the end of every batch (default: true).
    pub sync_on_flush: bool,
    /// Size after which the writer rolls to a new data file.
    pub max_file_size: u64,
    /// Write an index checkpoint every this many batches (0 = only on close
    /// and compaction).
    pub checkpoint_interval: u32,
    /// Files whose share of dead records reaches this ratio are compacted.
    pub compaction_garbage_ratio: f64,
    /// Initial number of key index buckets (rounded up to a power of two).
    pub key_buckets: u32,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            label: "vmap".to_owned(),
            sync_on_flush: true,
            max_file_size: 64 * 1024 * 1024,
            checkpoint_interval: 16,
            compaction_garbage_ratio: 0.5,
            key_buckets: 1024,
        }
    }
}

impl StoreOptions {
    pub fn validate(&self) -> Result<()> {
        if self.label.is_empty() {
            return Err(VmapError::InvalidConfig("store label must not be empty".to_owned()));
        }
        if self.max_file_size <= HEADER_SIZE as u64 {
            return Err(VmapError::InvalidConfig(format!(
                "max_file_size {} leaves no room after the file header",
                self.max_file_size
            )));
        }
        if !(self.compaction_garbage_ratio > 0.0 && self.compaction_garbage_ratio <= 1.0) {
            return Err(VmapError::InvalidConfig(format!(
                "compaction_garbage_ratio {} outside (0, 1]",
                self.compaction_garbage_ratio
            )));
        }
        if self.key_buckets == 0 {
            return Err(VmapError::InvalidConfig("key_buckets must be positive".to_owned()));
        }
        Ok(())
    }
}

// ── Batches and stats ────────────────────────────────────────────────────────

/// Everything one flushed copy writes to disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushBatch {
    pub version: Version,
    pub range: LeafRange,
    pub root_hash: Hash,
    /// Leaves changed since the previous flushed version, sorted by path.
    pub leaves: Vec<LeafRecord>,
    /// Hashes changed since the previous flushed version.
    pub hashes: Vec<HashRecord>,
}

impl FlushBatch {
    fn check(&self) -> Result<()> {
        if let Some(leaf) = self.leaves.iter().find(|l| !self.range.is_leaf(l.path)) {
            return Err(VmapError::sequencing(format!(
                "batch {} writes leaf {} outside its range",
                self.version, leaf.path
            )));
        }
        if let Some(hash) = self.hashes.iter().find(|h| !self.range.contains(h.path)) {
            return Err(VmapError::sequencing(format!(
                "batch {} writes hash {} outside its range",
                self.version, hash.path
            )));
        }
        Ok(())
    }
}

/// Store statistics for monitoring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Batches committed since open.
    pub batches_written: u64,
    /// Leaf records appended since open.
    pub leaf_records_written: u64,
    /// Hash records appended since open.
    pub hash_records_written: u64,
    /// Bytes appended to data files since open.
    pub bytes_written: u64,
    /// Checkpoints written since open.
    pub checkpoints_written: u64,
    /// Compaction runs that rewrote at least one file.
    pub compactions: u64,
    /// Batches rolled back after a write failure.
    pub batches_rolled_back: u64,
}

// ── Store ────────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct WriterState {
    active: Option<DataFileWriter>,
    next_file_index: u32,
    batches_since_checkpoint: u32,
}

/// Records appended for one batch, kept until the batch commits or rolls
/// back.
#[derive(Debug, Default)]
struct PendingWrite {
    /// Active file position when the batch started.
    start: Option<(u32, u64, u64)>,
    retired: Vec<DataFileWriter>,
    created: Vec<u32>,
    per_file: BTreeMap<u32, u64>,
    bytes: u64,
}

/// Durable store for the flushed state of a virtual map.
#[derive(Debug)]
pub struct DiskStore {
    dir: PathBuf,
    data_dir: PathBuf,
    options: StoreOptions,
    registry: Arc<RecordRegistry>,
    view: ArcSwap<StoreView>,
    writer: Mutex<WriterState>,
    stats: Mutex<StoreStats>,
    recovery: RecoveryReport,
    closed: AtomicBool,
}

impl DiskStore {
    /// Open (or create) a store in `dir`, recovering committed state.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be prepared, if the metadata
    /// file claims a newer or different state than the data files hold, or
    /// if a record before the last commit marker is corrupt. A torn or
    /// uncommitted tail is tolerated and cut off.
    pub fn open(dir: impl AsRef<FsPath>, options: StoreOptions) -> Result<Self> {
        Self::open_with_registry(dir, options, RecordRegistry::standard())
    }

    /// Open with an explicit record registry.
    pub fn open_with_registry(
        dir: impl AsRef<FsPath>,
        options: StoreOptions,
        registry: RecordRegistry,
    ) -> Result<Self> {
        options.validate()?;
        let dir = dir.as_ref().to_path_buf();
        let data_dir = dir.join(DATA_DIR);
        fs::create_dir_all(&data_dir)?;
        let registry = Arc::new(registry);

        let recovered = recovery::recover(&dir, &data_dir, &options, &registry)?;
        let report = recovered.report;
        info!(
            target: "vmap::store",
            label = %recovered.view.metadata.label,
            version = recovered.view.metadata.version.0,
            leaves = recovered.view.metadata.range.size(),
            used_checkpoint = report.used_checkpoint,
            commits_replayed = report.commits_replayed,
            records_discarded = report.records_discarded,
            "store_opened"
        );

        Ok(Self {
            dir,
            data_dir,
            options,
            registry,
            view: ArcSwap::from_pointee(recovered.view),
            writer: Mutex::new(WriterState {
                active: None,
                next_file_index: recovered.next_file_index,
                batches_since_checkpoint: 0,
            }),
            stats: Mutex::new(StoreStats::default()),
            recovery: report,
            closed: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn dir(&self) -> &FsPath {
        &self.dir
    }

    #[must_use]
    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<RecordRegistry> {
        &self.registry
    }

    /// Current published view.
    #[must_use]
    pub fn view(&self) -> Arc<StoreView> {
        self.view.load_full()
    }

    #[must_use]
    pub fn metadata(&self) -> StoreMetadata {
        self.view.load().metadata.clone()
    }

    #[must_use]
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    #[must_use]
    pub fn stats(&self) -> StoreStats {
        *self.stats.lock()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(VmapError::Closed(format!("store {}", self.options.label)));
        }
        Ok(())
    }

    /// Persist one flushed version.
    ///
    /// On success the batch is durable (when `sync_on_flush` is set) and a
    /// new view is published. On failure nothing of the batch is visible and
    /// the data files are cut back to where the batch started, so the same
    /// batch can be retried.
    pub fn save_batch(&self, batch: &FlushBatch) -> Result<()> {
        let mut state = self.writer.lock();
        self.ensure_open()?;
        let current = self.view.load_full();
        if batch.version <= current.metadata.version {
            return Err(VmapError::sequencing(format!(
                "batch version {} is not newer than stored version {}",
                batch.version, current.metadata.version
            )));
        }
        batch.check()?;

        let mut pending = PendingWrite {
            start: state
                .active
                .as_ref()
                .map(|w| (w.index(), w.size(), w.records())),
            ..PendingWrite::default()
        };
        let next = match self.write_batch(&mut state, &mut pending, &current, batch) {
            Ok(next) => next,
            Err(err) => {
                self.rollback(&mut state, pending);
                self.stats.lock().batches_rolled_back += 1;
                return Err(err);
            }
        };

        for (index, count) in &pending.per_file {
            if let Some(file) = next.files.get(*index) {
                file.add_records(*count);
            }
        }
        let metadata = next.metadata.clone();
        self.view.store(Arc::new(next));
        {
            let mut stats = self.stats.lock();
            stats.batches_written += 1;
            stats.leaf_records_written += batch.leaves.len() as u64;
            stats.hash_records_written += batch.hashes.len() as u64;
            stats.bytes_written += pending.bytes;
        }
        debug!(
            target: "vmap::store",
            version = batch.version.0,
            leaves = batch.leaves.len(),
            hashes = batch.hashes.len(),
            bytes = pending.bytes,
            "batch_committed"
        );

        // The batch is committed in the data files from here on; the files
        // below are rebuilt by recovery when missing or stale.
        if let Err(e) = checkpoint::write_metadata(&self.dir, &metadata) {
            warn!(target: "vmap::store", version = batch.version.0, error = %e, "metadata_write_failed");
        }
        state.batches_since_checkpoint += 1;
        if self.options.checkpoint_interval > 0
            && state.batches_since_checkpoint >= self.options.checkpoint_interval
        {
            if let Err(e) = self.checkpoint_locked(&mut state) {
                warn!(target: "vmap::store", version = batch.version.0, error = %e, "checkpoint_failed");
            }
        }
        Ok(())
    }

    fn write_batch(
        &self,
        state: &mut WriterState,
        pending: &mut PendingWrite,
        current: &StoreView,
        batch: &FlushBatch,
    ) -> Result<StoreView> {
        let mut next = current.clone();

        let mut written_leaves = Vec::with_capacity(batch.leaves.len());
        for leaf in &batch.leaves {
            let bytes = encode_record(&StoredRecord::Leaf {
                version: batch.version,
                leaf: leaf.clone(),
            })?;
            let location = self.append(state, pending, &mut next, &bytes)?;
            written_leaves.push((leaf.path, location, key_hash(&leaf.key)));
        }
        let mut written_hashes = Vec::with_capacity(batch.hashes.len());
        for record in &batch.hashes {
            let bytes = encode_record(&StoredRecord::Hash {
                version: batch.version,
                record: *record,
            })?;
            let location = self.append(state, pending, &mut next, &bytes)?;
            written_hashes.push((record.path, location));
        }

        apply_leaf_changes(
            &|location| current.read(location),
            &mut next.leaves,
            &mut next.keys,
            current.metadata.range,
            batch.range,
            &written_leaves,
        )?;
        apply_hash_changes(&mut next.hashes, batch.range, &written_hashes);
        next.metadata = StoreMetadata {
            label: current.metadata.label.clone(),
            version: batch.version,
            range: batch.range,
            root_hash: batch.root_hash,
        };

        let commit = encode_record(&StoredRecord::Commit(CommitMarker {
            version: batch.version,
            range: batch.range,
            root_hash: batch.root_hash,
        }))?;
        self.append(state, pending, &mut next, &commit)?;
        if self.options.sync_on_flush {
            if let Some(active) = &state.active {
                active.sync()?;
            }
        }
        Ok(next)
    }

    /// Append one encoded record, rolling to a new file when the active one
    /// is full.
    fn append(
        &self,
        state: &mut WriterState,
        pending: &mut PendingWrite,
        next: &mut StoreView,
        bytes: &[u8],
    ) -> Result<RecordLocation> {
        let needs_roll = state.active.as_ref().is_none_or(|active| {
            active.size() > HEADER_SIZE as u64
                && active.size() + bytes.len() as u64 > self.options.max_file_size
        });
        if needs_roll {
            self.roll(state, pending, next)?;
        }
        let Some(active) = state.active.as_mut() else {
            return Err(VmapError::Closed("no active data file".to_owned()));
        };
        let location = active.append(bytes)?;
        *pending.per_file.entry(active.index()).or_default() += 1;
        pending.bytes += bytes.len() as u64;
        Ok(location)
    }

    fn roll(
        &self,
        state: &mut WriterState,
        pending: &mut PendingWrite,
        next: &mut StoreView,
    ) -> Result<()> {
        if let Some(previous) = state.active.take() {
            let synced = previous.sync();
            pending.retired.push(previous);
            synced?;
        }
        let index = state.next_file_index;
        if index > RecordLocation::MAX_FILE_INDEX {
            return Err(VmapError::CapacityExceeded(format!(
                "data file index {index} exceeds the addressable range"
            )));
        }
        let writer = DataFileWriter::create(&self.data_dir, index)?;
        state.next_file_index += 1;
        pending.created.push(index);
        next.files.insert(Arc::new(DataFile::open(writer.path(), index)?));
        debug!(target: "vmap::store", index, "data_file_created");
        state.active = Some(writer);
        Ok(())
    }

    /// Undo a failed batch: drop files it created and cut the file it
    /// started in back to the starting position.
    fn rollback(&self, state: &mut WriterState, pending: PendingWrite) {
        let created: HashSet<u32> = pending.created.iter().copied().collect();
        if state
            .active
            .as_ref()
            .is_some_and(|active| created.contains(&active.index()))
        {
            state.active = None;
        }
        for index in &pending.created {
            let path = self.data_dir.join(data_file_name(*index));
            if let Err(e) = fs::remove_file(&path) {
                warn!(target: "vmap::store", index, error = %e, "rollback_remove_failed");
            }
        }
        let Some((index, pos, records)) = pending.start else {
            return;
        };
        let original = match state.active.take() {
            Some(active) if active.index() == index => Some(active),
            other => {
                state.active = other;
                pending.retired.into_iter().find(|w| w.index() == index)
            }
        };
        let Some(mut original) = original else {
            return;
        };
        match original.truncate_to(pos, records) {
            Ok(()) => state.active = Some(original),
            Err(e) => {
                // Uncommitted bytes would be picked up by the next commit
                // marker; refuse further writes instead.
                warn!(target: "vmap::store", index, error = %e, "rollback_truncate_failed");
                self.closed.store(true, Ordering::Release);
            }
        }
    }

    /// Write an index checkpoint so the next open replays only newer
    /// records.
    pub fn checkpoint(&self) -> Result<()> {
        let mut state = self.writer.lock();
        self.ensure_open()?;
        self.checkpoint_locked(&mut state)
    }

    fn checkpoint_locked(&self, state: &mut WriterState) -> Result<()> {
        let (replay_file, replay_offset) = match &state.active {
            Some(active) => {
                active.sync()?;
                (active.index(), active.size())
            }
            None => (state.next_file_index, HEADER_SIZE as u64),
        };
        let view = self.view.load_full();
        let checkpoint = Checkpoint {
            covered_version: view.metadata.version,
            replay_file,
            replay_offset,
            metadata: view.metadata.clone(),
            live_files: view
                .files
                .iter()
                .map(|file| (file.index(), file.record_count()))
                .collect(),
            leaves: view.leaves.clone(),
            hashes: view.hashes.clone(),
            keys: view.keys.clone(),
        };
        checkpoint::write_checkpoint(&self.dir, &checkpoint)?;
        state.batches_since_checkpoint = 0;
        self.stats.lock().checkpoints_written += 1;
        debug!(
            target: "vmap::store",
            version = view.metadata.version.0,
            replay_file,
            replay_offset,
            "checkpoint_written"
        );
        Ok(())
    }

    /// Sync, checkpoint and refuse further writes. Views stay readable.
    pub fn close(&self) -> Result<()> {
        let mut state = self.writer.lock();
        if self.is_closed() {
            return Ok(());
        }
        let result = self.checkpoint_locked(&mut state);
        state.active = None;
        self.closed.store(true, Ordering::Release);
        info!(target: "vmap::store", label = %self.options.label, "store_closed");
        result
    }
}

// ── Index maintenance ────────────────────────────────────────────────────────

/// Move the leaf and key indexes from `old_range` to `new_range`.
///
/// `written` holds the new leaf records `(path, location, key hash)`.
/// Previous occupants of rewritten paths, and of paths that stopped being
/// leaves, are evicted from the key index by reading their records through
/// `read_old`.
pub(crate) fn apply_leaf_changes(
    read_old: &dyn Fn(RecordLocation) -> Result<StoredRecord>,
    leaves: &mut LongList,
    keys: &mut KeyBuckets,
    old_range: LeafRange,
    new_range: LeafRange,
    written: &[(Path, RecordLocation, u64)],
) -> Result<()> {
    let mut evicted = HashSet::new();
    let mut evict = |path: Path, leaves: &LongList, keys: &mut KeyBuckets| -> Result<()> {
        if !old_range.is_leaf(path) || !evicted.insert(path) {
            return Ok(());
        }
        let location = leaves.get(path);
        if location.is_none() {
            return Ok(());
        }
        match read_old(location)? {
            StoredRecord::Leaf { leaf, .. } => {
                keys.remove(key_hash(&leaf.key), path);
                Ok(())
            }
            other => Err(VmapError::CorruptRecord {
                location: location.0,
                detail: format!("expected leaf record, found kind {}", other.kind()),
            }),
        }
    };

    for (path, _, _) in written {
        evict(*path, leaves, keys)?;
    }
    if let (Some(first), Some(last)) = (old_range.first(), old_range.last()) {
        let (lo, hi) = (first.0, last.0);
        let gone: Vec<(u64, u64)> = match (new_range.first(), new_range.last()) {
            (Some(new_first), Some(new_last)) => vec![
                (lo, hi.min(new_first.0.saturating_sub(1))),
                (lo.max(new_last.0.saturating_add(1)), hi),
            ],
            _ => vec![(lo, hi)],
        };
        for (from, to) in gone {
            for p in from..=to {
                if new_range.is_leaf(Path(p)) {
                    continue;
                }
                evict(Path(p), leaves, keys)?;
                leaves.set(Path(p), RecordLocation::NONE);
            }
        }
    }
    for (path, location, hash) in written {
        if new_range.is_leaf(*path) {
            leaves.set(*path, *location);
            keys.insert(*hash, *path);
        }
    }
    leaves.truncate(new_range.last().map_or(0, |last| last.0.saturating_add(1)));
    Ok(())
}

/// Record new hash locations and drop those beyond the new range.
pub(crate) fn apply_hash_changes(
    hashes: &mut LongList,
    new_range: LeafRange,
    written: &[(Path, RecordLocation)],
) {
    for (path, location) in written {
        if new_range.contains(*path) {
            hashes.set(*path, *location);
        }
    }
    hashes.truncate(new_range.last().map_or(0, |last| last.0.saturating_add(1)));
}
