//! Consistency check of a view against the records it points at.

use crate::index::key_hash;
use crate::record::StoredRecord;
use crate::view::StoreView;
use tracing::{debug, warn};
use vmap_error::Result;
use vmap_types::Path;

/// Upper bound on paths collected per category; counts keep going.
const COLLECTED_PATHS_LIMIT: usize = 1000;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub leaves_checked: u64,
    pub hashes_checked: u64,
    /// Leaf paths with no record location.
    pub missing_leaves: Vec<Path>,
    /// (indexed path, path stored in the record)
    pub path_mismatches: Vec<(Path, Path)>,
    /// Key index entries pointing at a path that is not a leaf or whose
    /// leaf holds a different key.
    pub stale_key_entries: Vec<Path>,
    /// Leaves whose key cannot be found through the key index.
    pub unindexed_keys: Vec<Path>,
    /// Node paths with no hash record.
    pub missing_hashes: Vec<Path>,
    /// Leaves whose stored hash differs from the hash of their contents.
    pub leaf_hash_mismatches: Vec<Path>,
    /// Stored root hash differs from the one in the metadata.
    pub root_mismatch: bool,
    pub total_problems: u64,
}

impl ValidationReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.total_problems == 0
    }

    fn note<T>(list: &mut Vec<T>, total: &mut u64, item: T) {
        *total += 1;
        if list.len() < COLLECTED_PATHS_LIMIT {
            list.push(item);
        }
    }
}

impl StoreView {
    /// Walk every leaf, hash and key entry of this view.
    ///
    /// Unreadable or corrupt records are returned as errors; everything else
    /// is collected in the report.
    pub fn validate(&self) -> Result<ValidationReport> {
        let mut report = ValidationReport::default();
        let range = self.metadata.range;

        if let (Some(first), Some(last)) = (range.first(), range.last()) {
            for p in first.0..=last.0 {
                let path = Path(p);
                report.leaves_checked += 1;
                let location = self.leaves.get(path);
                if location.is_none() {
                    ValidationReport::note(&mut report.missing_leaves, &mut report.total_problems, path);
                    continue;
                }
                let StoredRecord::Leaf { leaf, .. } = self.read(location)? else {
                    ValidationReport::note(
                        &mut report.path_mismatches,
                        &mut report.total_problems,
                        (path, Path(u64::MAX)),
                    );
                    continue;
                };
                if leaf.path != path {
                    ValidationReport::note(
                        &mut report.path_mismatches,
                        &mut report.total_problems,
                        (path, leaf.path),
                    );
                    continue;
                }
                if !self.keys.candidates(key_hash(&leaf.key)).contains(&path) {
                    ValidationReport::note(&mut report.unindexed_keys, &mut report.total_problems, path);
                }
                match self.load_hash(path)? {
                    None => {}
                    Some(hash) if hash == vmap_hash::hash_leaf(&leaf.key, &leaf.value) => {}
                    Some(_) => ValidationReport::note(
                        &mut report.leaf_hash_mismatches,
                        &mut report.total_problems,
                        path,
                    ),
                }
            }
            for p in 0..=last.0 {
                report.hashes_checked += 1;
                if self.hashes.get(Path(p)).is_none() {
                    ValidationReport::note(&mut report.missing_hashes, &mut report.total_problems, Path(p));
                }
            }
        }

        if let Some(root) = self.load_hash(Path::ROOT)? {
            if root != self.metadata.root_hash {
                report.root_mismatch = true;
                report.total_problems += 1;
            }
        }

        for entry in self.keys.entries() {
            let stale = if range.is_leaf(entry.path) {
                match self.load_leaf(entry.path) {
                    Ok(Some(leaf)) => key_hash(&leaf.key) != entry.key_hash,
                    Ok(None) | Err(_) => true,
                }
            } else {
                true
            };
            if stale {
                ValidationReport::note(
                    &mut report.stale_key_entries,
                    &mut report.total_problems,
                    entry.path,
                );
            }
        }

        if report.is_clean() {
            debug!(
                target: "vmap::store",
                version = self.metadata.version.0,
                leaves = report.leaves_checked,
                "validation_clean"
            );
        } else {
            warn!(
                target: "vmap::store",
                version = self.metadata.version.0,
                problems = report.total_problems,
                "validation_found_problems"
            );
        }
        Ok(report)
    }
}
