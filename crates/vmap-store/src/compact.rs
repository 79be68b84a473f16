//! Garbage accounting and compaction of data files.
//!
//! A record is live while the current view's path index points at it.
//! Compaction copies the live records of mostly-dead files into one new
//! file, keeping their versions, and ends it with a copy of the current
//! commit marker so the file replays on its own. The old files are marked
//! obsolete and disappear once no view references them.

use crate::DiskStore;
use crate::file::{DataFile, DataFileWriter};
use crate::record::{CommitMarker, StoredRecord, encode_record};
use crate::view::StoreView;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::info;
use vmap_error::Result;

/// Live and total record counts for one data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileUsage {
    pub index: u32,
    pub total_records: u64,
    pub live_records: u64,
    pub bytes: u64,
}

impl FileUsage {
    /// Share of records in the file that no longer back the current view.
    #[must_use]
    pub fn garbage_ratio(&self) -> f64 {
        if self.total_records == 0 {
            return 0.0;
        }
        let live = self.live_records.min(self.total_records);
        1.0 - live as f64 / self.total_records as f64
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionReport {
    /// Files whose live records were moved.
    pub files_compacted: Vec<u32>,
    /// Leaf and hash records copied.
    pub records_moved: u64,
    /// File receiving the copies, if anything was compacted.
    pub output_file: Option<u32>,
}

/// Usage of every file referenced by `view`.
pub(crate) fn usage_for(view: &StoreView) -> Result<Vec<FileUsage>> {
    let mut live: BTreeMap<u32, u64> = BTreeMap::new();
    for (_, location) in view.leaves.iter().chain(view.hashes.iter()) {
        *live.entry(location.file_index()).or_default() += 1;
    }
    view.files
        .iter()
        .map(|file| {
            Ok(FileUsage {
                index: file.index(),
                total_records: file.record_count(),
                live_records: live.get(&file.index()).copied().unwrap_or(0),
                bytes: file.len()?,
            })
        })
        .collect()
}

impl DiskStore {
    /// Per-file record accounting for the current view.
    pub fn storage_report(&self) -> Result<Vec<FileUsage>> {
        usage_for(&self.view())
    }

    /// Rewrite files whose garbage ratio reaches the configured threshold.
    ///
    /// The active file is closed first so the compaction output is the
    /// newest file; the next batch starts a fresh one. A checkpoint is
    /// written before old files are released, so recovery never needs a
    /// file that compaction removed.
    pub fn compact(&self) -> Result<CompactionReport> {
        let mut state = self.writer.lock();
        self.ensure_open()?;
        let view = self.view();
        let active_index = state.active.as_ref().map(DataFileWriter::index);
        let candidates: HashSet<u32> = usage_for(&view)?
            .into_iter()
            .filter(|usage| {
                Some(usage.index) != active_index
                    && usage.total_records > 0
                    && usage.garbage_ratio() >= self.options.compaction_garbage_ratio
            })
            .map(|usage| usage.index)
            .collect();
        if candidates.is_empty() {
            return Ok(CompactionReport::default());
        }

        if let Some(active) = state.active.take() {
            active.sync()?;
        }
        let output = state.next_file_index;
        let mut writer = DataFileWriter::create(&self.data_dir, output)?;
        state.next_file_index += 1;

        let mut next = (*view).clone();
        let mut moved = 0_u64;
        for (path, location) in view.leaves.iter() {
            if candidates.contains(&location.file_index()) {
                let bytes = encode_record(&view.read(location)?)?;
                next.leaves.set(path, writer.append(&bytes)?);
                moved += 1;
            }
        }
        for (path, location) in view.hashes.iter() {
            if candidates.contains(&location.file_index()) {
                let bytes = encode_record(&view.read(location)?)?;
                next.hashes.set(path, writer.append(&bytes)?);
                moved += 1;
            }
        }
        writer.append(&encode_record(&StoredRecord::Commit(CommitMarker {
            version: view.metadata.version,
            range: view.metadata.range,
            root_hash: view.metadata.root_hash,
        }))?)?;
        writer.sync()?;

        let file = Arc::new(DataFile::open(writer.path(), output)?);
        file.add_records(writer.records());
        next.files.insert(file);
        let mut released = Vec::with_capacity(candidates.len());
        for index in &candidates {
            if let Some(old) = next.files.remove(*index) {
                released.push(old);
            }
        }
        self.view.store(Arc::new(next));
        self.checkpoint_locked(&mut state)?;
        for old in &released {
            old.mark_obsolete();
        }
        self.stats.lock().compactions += 1;

        let mut files_compacted: Vec<u32> = candidates.into_iter().collect();
        files_compacted.sort_unstable();
        info!(
            target: "vmap::store",
            files = files_compacted.len(),
            records_moved = moved,
            output,
            "compaction_complete"
        );
        Ok(CompactionReport {
            files_compacted,
            records_moved: moved,
            output_file: Some(output),
        })
    }
}
