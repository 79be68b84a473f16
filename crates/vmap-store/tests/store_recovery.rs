#![forbid(unsafe_code)]
//! Durability and recovery tests for the disk store.
//!
//! Scenarios tested:
//! 1. Committed batches survive a reopen, with and without a checkpoint.
//! 2. A torn record at the tail is cut off and the store opens.
//! 3. Records without a commit marker are never indexed.
//! 4. Compaction keeps old views readable and drops dead files.
//! 5. Damaged committed records surface as `CorruptRecord`.
//! 6. Metadata that is ahead of the data files is a format error.
//! 7. Images reopen without replay and validate clean.

use std::cell::RefCell;
use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::FileExt;
use vmap_error::VmapError;
use vmap_hash::{HashListener, NoHashes, VirtualHasher, empty_tree_hash};
use vmap_store::checkpoint::{self, CHECKPOINT_FILE, StoreMetadata};
use vmap_store::file::{DATA_DIR, list_data_files};
use vmap_store::record::{StoredRecord, encode_record};
use vmap_store::{DiskStore, FlushBatch, StoreOptions};
use vmap_types::{Hash, HashRecord, LeafRange, LeafRecord, Path, Version};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

#[derive(Default)]
struct CollectHashes(RefCell<Vec<HashRecord>>);

impl HashListener for CollectHashes {
    fn on_leaf_hashed(&self, path: Path, hash: Hash) {
        self.0.borrow_mut().push(HashRecord { path, hash });
    }
    fn on_node_hashed(&self, path: Path, hash: Hash) {
        self.0.borrow_mut().push(HashRecord { path, hash });
    }
}

/// Full batch for a tree holding `entries` in leaf order.
fn batch(version: u64, entries: &[(&str, &str)]) -> FlushBatch {
    let range = LeafRange::for_size(entries.len() as u64).unwrap_or(LeafRange::EMPTY);
    let first = range.first().map_or(0, |p| p.0);
    let leaves: Vec<LeafRecord> = entries
        .iter()
        .enumerate()
        .map(|(i, (k, v))| {
            LeafRecord::new(
                Path(first + i as u64),
                k.as_bytes().to_vec(),
                v.as_bytes().to_vec(),
            )
        })
        .collect();
    let collect = CollectHashes::default();
    let root = VirtualHasher::new()
        .hash(range, &leaves, &NoHashes, &collect)
        .expect("hash")
        .unwrap_or_else(empty_tree_hash);
    FlushBatch {
        version: Version(version),
        range,
        root_hash: root,
        leaves,
        hashes: collect.0.into_inner(),
    }
}

fn options() -> StoreOptions {
    StoreOptions {
        checkpoint_interval: 0,
        ..StoreOptions::default()
    }
}

fn value_of(store: &DiskStore, key: &str) -> Option<String> {
    store
        .view()
        .find_leaf_by_key(key.as_bytes())
        .expect("lookup")
        .map(|leaf| String::from_utf8(leaf.value).expect("utf8"))
}

fn last_data_file(dir: &std::path::Path) -> std::path::PathBuf {
    list_data_files(&dir.join(DATA_DIR))
        .expect("list")
        .pop()
        .expect("at least one data file")
        .1
}

// ---------------------------------------------------------------------------
// Scenario 1: reopen
// ---------------------------------------------------------------------------

#[test]
fn empty_store_recovers_at_version_zero() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = DiskStore::open(dir.path(), options()).expect("open");
    let report = store.recovery_report();
    assert_eq!(report.version, Version::default());
    assert_eq!(report.version, Version::ZERO);
    assert_eq!(report.commits_replayed, 0);
    assert_eq!(report.checkpoint_version, None);
    assert_eq!(store.metadata().root_hash, empty_tree_hash());
}

#[test]
fn committed_batches_survive_reopen_without_checkpoint() {
    let dir = tempfile::tempdir().expect("tempdir");
    let expected_root;
    {
        let store = DiskStore::open(dir.path(), options()).expect("open");
        store
            .save_batch(&batch(1, &[("a", "1"), ("b", "2"), ("c", "3")]))
            .expect("save 1");
        let second = batch(2, &[("a", "1"), ("b", "20"), ("c", "3"), ("d", "4")]);
        expected_root = second.root_hash;
        store.save_batch(&second).expect("save 2");
    }

    let store = DiskStore::open(dir.path(), options()).expect("reopen");
    let report = store.recovery_report();
    assert!(!report.used_checkpoint);
    assert_eq!(report.commits_replayed, 2);
    assert_eq!(report.version, Version(2));
    assert_eq!(store.metadata().root_hash, expected_root);
    assert_eq!(value_of(&store, "b").as_deref(), Some("20"));
    assert_eq!(value_of(&store, "d").as_deref(), Some("4"));
    assert!(store.view().validate().expect("validate").is_clean());
}

#[test]
fn checkpoint_limits_replay_to_newer_batches() {
    let dir = tempfile::tempdir().expect("tempdir");
    {
        let store = DiskStore::open(dir.path(), options()).expect("open");
        store.save_batch(&batch(1, &[("a", "1"), ("b", "2")])).expect("save 1");
        store.checkpoint().expect("checkpoint");
        store
            .save_batch(&batch(2, &[("a", "1"), ("b", "2"), ("c", "3")]))
            .expect("save 2");
    }

    let store = DiskStore::open(dir.path(), options()).expect("reopen");
    let report = store.recovery_report();
    assert!(report.used_checkpoint);
    assert_eq!(report.checkpoint_version, Some(Version(1)));
    assert_eq!(report.commits_replayed, 1);
    assert_eq!(value_of(&store, "c").as_deref(), Some("3"));
    assert!(store.view().validate().expect("validate").is_clean());
}

#[test]
fn unusable_checkpoint_falls_back_to_full_replay() {
    let dir = tempfile::tempdir().expect("tempdir");
    {
        let store = DiskStore::open(dir.path(), options()).expect("open");
        store.save_batch(&batch(1, &[("a", "1"), ("b", "2")])).expect("save");
        store.close().expect("close");
    }
    std::fs::write(dir.path().join(CHECKPOINT_FILE), b"not a checkpoint").expect("clobber");

    let store = DiskStore::open(dir.path(), options()).expect("reopen");
    assert!(!store.recovery_report().used_checkpoint);
    assert_eq!(value_of(&store, "a").as_deref(), Some("1"));
}

// ---------------------------------------------------------------------------
// Scenario 2 and 3: torn tails and uncommitted batches
// ---------------------------------------------------------------------------

#[test]
fn torn_tail_is_truncated() {
    let dir = tempfile::tempdir().expect("tempdir");
    {
        let store = DiskStore::open(dir.path(), options()).expect("open");
        store.save_batch(&batch(1, &[("a", "1"), ("b", "2")])).expect("save");
    }
    let path = last_data_file(dir.path());
    let committed_len = std::fs::metadata(&path).expect("stat").len();
    {
        let mut file = OpenOptions::new().append(true).open(&path).expect("open data");
        // Length prefix promising more bytes than follow.
        file.write_all(&[200, 0, 0, 0, 1, 2, 3]).expect("append");
    }

    let store = DiskStore::open(dir.path(), options()).expect("reopen");
    let report = store.recovery_report();
    assert_eq!(report.truncated_bytes, 7);
    assert!(report.records_discarded >= 1);
    assert_eq!(std::fs::metadata(&path).expect("stat").len(), committed_len);
    assert_eq!(store.metadata().version, Version(1));
}

#[test]
fn records_without_commit_marker_are_ignored() {
    let dir = tempfile::tempdir().expect("tempdir");
    {
        let store = DiskStore::open(dir.path(), options()).expect("open");
        store.save_batch(&batch(1, &[("a", "1"), ("b", "2")])).expect("save");
    }
    let path = last_data_file(dir.path());
    {
        let orphan = StoredRecord::Leaf {
            version: Version(2),
            leaf: LeafRecord::new(Path(1), b"a".to_vec(), b"uncommitted".to_vec()),
        };
        let mut file = OpenOptions::new().append(true).open(&path).expect("open data");
        file.write_all(&encode_record(&orphan).expect("encode"))
            .expect("append");
    }

    let store = DiskStore::open(dir.path(), options()).expect("reopen");
    assert_eq!(store.recovery_report().records_discarded, 1);
    assert_eq!(store.metadata().version, Version(1));
    assert_eq!(value_of(&store, "a").as_deref(), Some("1"));

    // The next batch starts after the cut and replays cleanly.
    store
        .save_batch(&batch(2, &[("a", "10"), ("b", "2")]))
        .expect("save 2");
    drop(store);
    let store = DiskStore::open(dir.path(), options()).expect("reopen again");
    assert_eq!(value_of(&store, "a").as_deref(), Some("10"));
}

// ---------------------------------------------------------------------------
// Scenario 4: compaction
// ---------------------------------------------------------------------------

#[test]
fn compaction_keeps_old_views_readable() {
    let dir = tempfile::tempdir().expect("tempdir");
    let first_file;
    {
        let store = DiskStore::open(dir.path(), options()).expect("open");
        store
            .save_batch(&batch(1, &[("a", "1"), ("b", "2"), ("c", "3")]))
            .expect("save 1");
        first_file = last_data_file(dir.path());
    }

    let store = DiskStore::open(dir.path(), options()).expect("reopen");
    store
        .save_batch(&batch(2, &[("a", "10"), ("b", "20"), ("c", "30")]))
        .expect("save 2");
    // Taken before compaction; holds a handle to the first file.
    let old_view = store.view();

    let report = store.compact().expect("compact");
    assert!(report.files_compacted.contains(&1));
    assert_eq!(store.stats().compactions, 1);
    assert_eq!(value_of(&store, "b").as_deref(), Some("20"));
    assert_eq!(
        old_view
            .find_leaf_by_key(b"c")
            .expect("lookup")
            .map(|leaf| leaf.value),
        Some(b"30".to_vec())
    );
    assert!(first_file.exists(), "pinned by the old view");
    drop(old_view);
    assert!(!first_file.exists(), "released with the last view");

    drop(store);
    let store = DiskStore::open(dir.path(), options()).expect("reopen after compaction");
    assert_eq!(value_of(&store, "a").as_deref(), Some("10"));
    assert!(store.view().validate().expect("validate").is_clean());
}

#[test]
fn storage_report_counts_live_records() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = DiskStore::open(dir.path(), options()).expect("open");
    store.save_batch(&batch(1, &[("a", "1"), ("b", "2")])).expect("save");
    let usage = store.storage_report().expect("report");
    assert_eq!(usage.len(), 1);
    // Two leaves, three hashes and a commit marker.
    assert_eq!(usage[0].total_records, 6);
    assert_eq!(usage[0].live_records, 5);
}

// ---------------------------------------------------------------------------
// Scenario 5: corruption
// ---------------------------------------------------------------------------

#[test]
fn damaged_committed_record_is_reported() {
    let dir = tempfile::tempdir().expect("tempdir");
    let location;
    {
        let store = DiskStore::open(dir.path(), options()).expect("open");
        store.save_batch(&batch(1, &[("a", "1"), ("b", "2")])).expect("save");
        location = store.view().leaf_location(Path(1));
        store.close().expect("close");
    }
    let path = last_data_file(dir.path());
    {
        let file = OpenOptions::new().write(true).open(&path).expect("open data");
        file.write_all_at(&[0xEE], location.offset() + 12)
            .expect("flip byte");
    }

    // The checkpoint covers the damaged file, so open succeeds and the read
    // fails.
    let store = DiskStore::open(dir.path(), options()).expect("reopen");
    let err = store.view().load_leaf(Path(1)).expect_err("corrupt");
    assert!(matches!(err, VmapError::CorruptRecord { .. }));
    drop(store);

    // Without the checkpoint replay meets the damage before the commit.
    std::fs::remove_file(dir.path().join(CHECKPOINT_FILE)).expect("remove checkpoint");
    let err = DiskStore::open(dir.path(), options()).expect_err("replay");
    assert!(matches!(err, VmapError::CorruptRecord { .. }));
}

// ---------------------------------------------------------------------------
// Scenario 6: metadata cross-check
// ---------------------------------------------------------------------------

#[test]
fn metadata_ahead_of_data_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    {
        let store = DiskStore::open(dir.path(), options()).expect("open");
        store.save_batch(&batch(1, &[("a", "1")])).expect("save");
    }
    let mut metadata = checkpoint::read_metadata(dir.path())
        .expect("read")
        .expect("present");
    metadata.version = Version(9);
    checkpoint::write_metadata(dir.path(), &metadata).expect("write");

    let err = DiskStore::open(dir.path(), options()).expect_err("ahead");
    assert!(matches!(err, VmapError::Format(_)));
}

#[test]
fn stale_metadata_is_rewritten() {
    let dir = tempfile::tempdir().expect("tempdir");
    {
        let store = DiskStore::open(dir.path(), options()).expect("open");
        store.save_batch(&batch(1, &[("a", "1")])).expect("save 1");
        store.save_batch(&batch(2, &[("a", "2")])).expect("save 2");
    }
    let mut metadata = checkpoint::read_metadata(dir.path())
        .expect("read")
        .expect("present");
    metadata.version = Version(1);
    checkpoint::write_metadata(dir.path(), &metadata).expect("write");

    let store = DiskStore::open(dir.path(), options()).expect("reopen");
    assert!(store.recovery_report().metadata_rewritten);
    let rewritten = checkpoint::read_metadata(dir.path())
        .expect("read")
        .expect("present");
    assert_eq!(rewritten.version, Version(2));
}

// ---------------------------------------------------------------------------
// Scenario 7: images
// ---------------------------------------------------------------------------

#[test]
fn image_reopens_without_replay() {
    let source = tempfile::tempdir().expect("tempdir");
    let store = DiskStore::open(source.path(), options()).expect("open");
    store
        .save_batch(&batch(4, &[("x", "1"), ("y", "2"), ("z", "3")]))
        .expect("save");
    let view = store.view();

    let dest = tempfile::tempdir().expect("tempdir");
    DiskStore::write_image(
        dest.path(),
        &options(),
        view.metadata(),
        view.leaves(),
        view.hashes()
            .map(|item| item.map(|(path, hash)| HashRecord { path, hash })),
    )
    .expect("image");

    let image = DiskStore::open(dest.path(), options()).expect("open image");
    assert_eq!(image.recovery_report().files_scanned, 0);
    assert_eq!(image.metadata(), *view.metadata());
    assert_eq!(value_of(&image, "y").as_deref(), Some("2"));
    assert!(image.view().validate().expect("validate").is_clean());

    let again = DiskStore::write_image(
        dest.path(),
        &options(),
        view.metadata(),
        view.leaves(),
        std::iter::empty(),
    );
    assert!(matches!(again, Err(VmapError::InvalidConfig(_))));
}

#[test]
fn empty_store_has_sentinel_root() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = DiskStore::open(dir.path(), options()).expect("open");
    let metadata: StoreMetadata = store.metadata();
    assert_eq!(metadata.root_hash, empty_tree_hash());
    assert_eq!(metadata.range, LeafRange::EMPTY);
    assert!(store.view().validate().expect("validate").is_clean());
}
