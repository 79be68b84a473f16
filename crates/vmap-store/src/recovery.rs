//! Rebuilding the published view on open.
//!
//! Recovery starts from the index checkpoint when one is usable and replays
//! data files from the checkpoint's replay position. Without a checkpoint
//! every data file is replayed.
//!
//! Replay buffers records until it meets a commit marker; only records
//! confirmed by a marker are indexed. For every path the record with the
//! highest version wins, so records relocated by compaction can be replayed
//! in file order. Whatever follows the last commit marker (a torn record or
//! an interrupted batch) is cut off the file, and files after it are
//! deleted.

use crate::checkpoint::{self, StoreMetadata};
use crate::file::{DataFile, FileSet, list_data_files, truncate_file};
use crate::index::{KeyBuckets, LongList, key_hash};
use crate::record::{DecodeResult, HEADER_SIZE, RecordRegistry, StoredRecord, decode_record};
use crate::view::StoreView;
use crate::{StoreOptions, apply_hash_changes, apply_leaf_changes};
use std::collections::HashMap;
use std::fs;
use std::path::Path as FsPath;
use std::sync::Arc;
use tracing::{debug, warn};
use vmap_error::{Result, VmapError};
use vmap_types::{Path, RecordLocation, Version};

/// Report produced after recovery on open.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Whether an index checkpoint was loaded before replay.
    pub used_checkpoint: bool,
    /// Version covered by the checkpoint, if one was used.
    pub checkpoint_version: Option<Version>,
    /// Data files scanned during replay.
    pub files_scanned: u64,
    /// Commit markers replayed.
    pub commits_replayed: u64,
    /// Leaf and hash records confirmed by a replayed commit marker.
    pub records_replayed: u64,
    /// Records discarded (torn, corrupt or after the last commit marker).
    pub records_discarded: u64,
    /// Bytes cut off the end of the data files.
    pub truncated_bytes: u64,
    /// Data files deleted because nothing referenced them.
    pub orphans_removed: u64,
    /// Whether the metadata file was rewritten.
    pub metadata_rewritten: bool,
    /// Version restored.
    pub version: Version,
}

pub(crate) struct Recovered {
    pub view: StoreView,
    pub next_file_index: u32,
    pub report: RecoveryReport,
}

#[derive(Debug, Clone, Copy)]
enum Pending {
    Leaf {
        version: Version,
        path: Path,
        location: RecordLocation,
        key_hash: u64,
    },
    Hash {
        version: Version,
        path: Path,
        location: RecordLocation,
    },
}

/// End of the last commit marker seen, as (file index, offset).
type CommitEnd = (u32, u64);

pub(crate) fn recover(
    dir: &FsPath,
    data_dir: &FsPath,
    options: &StoreOptions,
    registry: &Arc<RecordRegistry>,
) -> Result<Recovered> {
    let mut report = RecoveryReport::default();
    let listed = list_data_files(data_dir)?;
    let next_file_index = listed.last().map_or(1, |(index, _)| index.saturating_add(1));

    let checkpoint = match checkpoint::read_checkpoint(dir) {
        Ok(checkpoint) => checkpoint,
        Err(e) => {
            warn!(target: "vmap::store", error = %e, "checkpoint_unusable_full_replay");
            None
        }
    };

    let mut view = StoreView::empty(&options.label, options.key_buckets, Arc::clone(registry));
    let mut replay_from: CommitEnd = (0, HEADER_SIZE as u64);
    let mut live: HashMap<u32, u64> = HashMap::new();
    if let Some(checkpoint) = checkpoint {
        report.used_checkpoint = true;
        report.checkpoint_version = Some(checkpoint.covered_version);
        replay_from = (checkpoint.replay_file, checkpoint.replay_offset);
        live = checkpoint.live_files.iter().copied().collect();
        view.metadata = checkpoint.metadata;
        view.leaves = checkpoint.leaves;
        view.hashes = checkpoint.hashes;
        view.keys = checkpoint.keys;
    }
    let covered = view.metadata.version;

    // Files before the replay position are either indexed by the checkpoint
    // or leftovers of a compaction whose checkpoint landed.
    let mut files = FileSet::default();
    let mut scan = Vec::new();
    for (index, path) in &listed {
        if *index < replay_from.0 {
            let Some(records) = live.get(index) else {
                warn!(target: "vmap::store", index, "orphan_data_file_removed");
                fs::remove_file(path)?;
                report.orphans_removed += 1;
                continue;
            };
            let file = Arc::new(DataFile::open(path, *index)?);
            file.add_records(*records);
            files.insert(file);
        } else {
            let file = Arc::new(DataFile::open(path, *index)?);
            if let Some(records) = live.get(index) {
                file.add_records(*records);
            }
            files.insert(Arc::clone(&file));
            scan.push(file);
        }
    }
    if let Some(missing) = live
        .keys()
        .find(|index| **index < replay_from.0 && files.get(**index).is_none())
    {
        return Err(VmapError::Format(format!(
            "checkpoint references missing data file {missing}"
        )));
    }

    // ── Replay ──
    let mut buffered: Vec<Pending> = Vec::new();
    let mut confirmed: Vec<Pending> = Vec::new();
    let mut last_commit: Option<(CommitEnd, crate::record::CommitMarker)> = None;
    let mut damage: Option<CommitEnd> = None;
    for file in &scan {
        report.files_scanned += 1;
        let start = if file.index() == replay_from.0 {
            replay_from.1
        } else {
            HEADER_SIZE as u64
        };
        let data = file.read_from(start)?;
        let mut pos = 0_usize;
        let mut records = 0_u64;
        loop {
            let offset = start + pos as u64;
            match decode_record(&data[pos..], registry) {
                DecodeResult::Record { record, size } => {
                    records += 1;
                    let location =
                        RecordLocation::new(file.index(), offset).ok_or_else(|| {
                            VmapError::Format(format!(
                                "offset {offset} in file {} is not addressable",
                                file.index()
                            ))
                        })?;
                    match record {
                        StoredRecord::Leaf { version, leaf } => buffered.push(Pending::Leaf {
                            version,
                            path: leaf.path,
                            location,
                            key_hash: key_hash(&leaf.key),
                        }),
                        StoredRecord::Hash { version, record } => buffered.push(Pending::Hash {
                            version,
                            path: record.path,
                            location,
                        }),
                        StoredRecord::Commit(marker) => {
                            report.commits_replayed += 1;
                            confirmed.append(&mut buffered);
                            last_commit = Some(((file.index(), offset + size as u64), marker));
                        }
                    }
                    pos += size;
                }
                DecodeResult::EndOfData => break,
                DecodeResult::NeedMore(_) | DecodeResult::Corrupted(_) => {
                    warn!(
                        target: "vmap::store",
                        index = file.index(),
                        offset,
                        "torn_or_corrupt_record"
                    );
                    if damage.is_none() {
                        damage = Some((file.index(), offset));
                    }
                    report.records_discarded += 1;
                    break;
                }
            }
        }
        file.add_records(records);
    }
    report.records_discarded += buffered.len() as u64;
    if let (Some(damage), Some((end, _))) = (damage, &last_commit) {
        if damage < *end {
            return Err(damaged(damage, "damaged record precedes a commit marker".to_owned()));
        }
    }

    // Check the state the data files will hold against the metadata file
    // before anything is cut.
    let mut target = view.metadata.clone();
    if let Some((_, marker)) = &last_commit {
        if marker.version > covered {
            target.version = marker.version;
            target.range = marker.range;
            target.root_hash = marker.root_hash;
        }
    }
    let stored = check_metadata(dir, &target, damage)?;

    // ── Cut uncommitted tail ──
    let keep_until: CommitEnd = last_commit.as_ref().map_or(replay_from, |(end, _)| *end);
    for file in &scan {
        let len = file.len()?;
        if file.index() > keep_until.0 {
            warn!(target: "vmap::store", index = file.index(), "uncommitted_data_file_removed");
            report.truncated_bytes += len.saturating_sub(HEADER_SIZE as u64);
            files.remove(file.index());
            fs::remove_file(file.path())?;
        } else if file.index() == keep_until.0 && len > keep_until.1 {
            warn!(
                target: "vmap::store",
                index = file.index(),
                from = keep_until.1,
                bytes = len - keep_until.1,
                "uncommitted_tail_truncated"
            );
            report.truncated_bytes += len - keep_until.1;
            truncate_file(file.path(), keep_until.1)?;
        }
    }
    drop(scan);

    // ── Apply confirmed records ──
    if let Some((_, marker)) = last_commit {
        if marker.version > covered {
            let mut leaves: HashMap<Path, (Version, RecordLocation, u64)> = HashMap::new();
            let mut hashes: HashMap<Path, (Version, RecordLocation)> = HashMap::new();
            for pending in &confirmed {
                match *pending {
                    Pending::Leaf { version, path, location, key_hash }
                        if version > covered && version <= marker.version =>
                    {
                        let slot = leaves.entry(path).or_insert((version, location, key_hash));
                        if version >= slot.0 {
                            *slot = (version, location, key_hash);
                        }
                    }
                    Pending::Hash { version, path, location }
                        if version > covered && version <= marker.version =>
                    {
                        let slot = hashes.entry(path).or_insert((version, location));
                        if version >= slot.0 {
                            *slot = (version, location);
                        }
                    }
                    _ => {}
                }
            }
            report.records_replayed = (leaves.len() + hashes.len()) as u64;

            let mut written_leaves: Vec<_> = leaves
                .into_iter()
                .map(|(path, (_, location, hash))| (path, location, hash))
                .collect();
            written_leaves.sort_by_key(|(path, _, _)| *path);
            let written_hashes: Vec<_> = hashes
                .into_iter()
                .map(|(path, (_, location))| (path, location))
                .collect();

            let mut leaf_list: LongList = view.leaves.clone();
            let mut keys: KeyBuckets = view.keys.clone();
            apply_leaf_changes(
                &|location| files.read_record(location, registry),
                &mut leaf_list,
                &mut keys,
                view.metadata.range,
                marker.range,
                &written_leaves,
            )?;
            apply_hash_changes(&mut view.hashes, marker.range, &written_hashes);
            view.leaves = leaf_list;
            view.keys = keys;
            view.metadata.version = marker.version;
            view.metadata.range = marker.range;
            view.metadata.root_hash = marker.root_hash;
        }
    }
    view.files = files;
    report.version = view.metadata.version;

    match stored {
        Some(stored) if stored.version == view.metadata.version => {
            view.metadata.label = stored.label;
        }
        stored => {
            if let Some(stored) = stored {
                warn!(
                    target: "vmap::store",
                    stored = stored.version.0,
                    recovered = view.metadata.version.0,
                    "stale_metadata_rewritten"
                );
                view.metadata.label = stored.label;
            }
            checkpoint::write_metadata(dir, &view.metadata)?;
            report.metadata_rewritten = true;
        }
    }
    debug!(
        target: "vmap::store",
        version = report.version.0,
        files_scanned = report.files_scanned,
        records_replayed = report.records_replayed,
        truncated_bytes = report.truncated_bytes,
        "recovery_complete"
    );
    Ok(Recovered {
        view,
        next_file_index,
        report,
    })
}

fn damaged(at: CommitEnd, detail: String) -> VmapError {
    VmapError::CorruptRecord {
        location: RecordLocation::new(at.0, at.1).map_or(0, |l| l.0),
        detail,
    }
}

/// Compare the metadata file with the state recovery is about to restore.
///
/// A metadata file newer than the data, or one that disagrees at the same
/// version, means committed batches are missing from the data files. An
/// older file is only stale and gets rewritten.
fn check_metadata(
    dir: &FsPath,
    target: &StoreMetadata,
    damage: Option<CommitEnd>,
) -> Result<Option<StoreMetadata>> {
    let Some(stored) = checkpoint::read_metadata(dir)? else {
        return Ok(None);
    };
    if stored.version > target.version {
        let detail = format!(
            "metadata names version {} but data files end at version {}",
            stored.version, target.version
        );
        return Err(match damage {
            Some(at) => damaged(at, detail),
            None => VmapError::Format(detail),
        });
    }
    if stored.version == target.version
        && (stored.range != target.range || stored.root_hash != target.root_hash)
    {
        return Err(VmapError::Format(format!(
            "metadata for version {} disagrees with data files",
            stored.version
        )));
    }
    Ok(Some(stored))
}
