#![forbid(unsafe_code)]
//! Copy chain and pipeline tests for the virtual map.
//!
//! Scenarios tested:
//! 1. Leaves occupy exactly the leaf range after random puts and removes.
//! 2. The root hash is a function of the leaf layout: copy and flush timing
//!    never change it, insertion order may.
//! 3. Mutating a newer copy never changes what a detached view returns.
//! 4. A fresh map is empty and hashes to the empty-tree sentinel.
//! 5. Merging or flushing out of order is a sequencing violation.
//! 6. Flushed pairs come back byte-identical after reopening.
//! 7. Snapshots reopen at the same version with the same root hash.
//! 8. Capacity limits, shutdown latches and typed access.
//! 9. Completeness and copy isolation as shrinking properties over
//!    arbitrary put/remove sequences.

use proptest::prelude::*;
use std::collections::BTreeMap;
use vmap_core::{
    Detachable, DiagnosticAccessor, Flushable, Hashable, RecordAccessor, U64Codec, Utf8Codec,
    Versioned, VirtualMap, VirtualMapConfig,
};
use vmap_error::VmapError;
use vmap_hash::{empty_tree_hash, hash_full_tree};
use vmap_types::{LeafRange, LeafRecord, Path, Version};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn config() -> VirtualMapConfig {
    let mut config = VirtualMapConfig {
        flush_interval: 0,
        compact_after_flush: false,
        ..VirtualMapConfig::default()
    };
    config.store.sync_on_flush = false;
    config
}

fn open(dir: &std::path::Path) -> VirtualMap {
    VirtualMap::open(dir, config()).expect("open map")
}

/// Freeze `map` and return the frozen handle; `map` moves on to the
/// successor.
fn freeze(map: &mut VirtualMap) -> VirtualMap {
    let next = map.copy().expect("copy");
    std::mem::replace(map, next)
}

struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        self.0 >> 33
    }
}

fn check_complete(accessor: &RecordAccessor, model: &BTreeMap<Vec<u8>, Vec<u8>>) {
    let size = model.len() as u64;
    assert_eq!(accessor.size(), size);
    assert_eq!(
        accessor.leaf_range(),
        LeafRange::for_size(size).expect("range")
    );
    let leaves: Vec<LeafRecord> = accessor
        .leaves()
        .collect::<Result<_, _>>()
        .expect("read leaves");
    assert_eq!(leaves.len() as u64, size, "every leaf path is occupied");
    for leaf in &leaves {
        assert_eq!(model.get(&leaf.key), Some(&leaf.value), "leaf {}", leaf.path);
    }
    for (key, value) in model {
        assert_eq!(accessor.get(key).expect("get").as_ref(), Some(value));
    }
}

// ---------------------------------------------------------------------------
// Scenario 1: completeness invariant
// ---------------------------------------------------------------------------

#[test]
fn leaves_fill_the_range_after_random_mutations() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut map = open(dir.path());
    let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
    let mut rng = Lcg(7);

    for round in 0..6 {
        for _ in 0..120 {
            let key = format!("key-{:03}", rng.next() % 60).into_bytes();
            if rng.next() % 3 == 0 {
                let removed = map.remove(&key).expect("remove");
                assert_eq!(removed, model.remove(&key));
            } else {
                let value = format!("value-{}", rng.next()).into_bytes();
                map.put(key.clone(), value.clone()).expect("put");
                model.insert(key, value);
            }
            assert_eq!(map.size(), model.len() as u64);
            assert_eq!(
                map.leaf_range(),
                LeafRange::for_size(model.len() as u64).expect("range")
            );
        }

        let frozen = freeze(&mut map);
        let accessor = frozen.detach().expect("detach");
        check_complete(&accessor, &model);
        let leaves: Vec<LeafRecord> = accessor
            .leaves()
            .collect::<Result<_, _>>()
            .expect("read leaves");
        assert_eq!(
            accessor.root_hash(),
            hash_full_tree(&leaves).expect("full rehash"),
            "incremental hash of round {round} matches a full rehash"
        );
        if round % 2 == 0 {
            frozen.enable_flush();
        }
    }

    for (key, value) in &model {
        assert_eq!(map.get(key).expect("get").as_ref(), Some(value));
    }
}

#[test]
fn removing_down_to_empty_keeps_the_shape() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut map = open(dir.path());
    map.put(*b"a", *b"1").expect("put a");
    map.put(*b"b", *b"2").expect("put b");
    assert_eq!(map.leaf_range(), LeafRange::for_size(2).expect("range"));

    // Removing the first leaf moves the last one into path 1.
    assert_eq!(map.remove(b"a").expect("remove a"), Some(b"1".to_vec()));
    assert_eq!(map.leaf_range(), LeafRange::for_size(1).expect("range"));
    let frozen = freeze(&mut map);
    let accessor = frozen.detach().expect("detach");
    let leaf = accessor.leaf(Path(1)).expect("leaf").expect("present");
    assert_eq!(leaf.key, b"b");
    assert_eq!(accessor.leaf(Path(2)).expect("leaf"), None);
    drop(frozen);

    assert_eq!(map.remove(b"b").expect("remove b"), Some(b"2".to_vec()));
    assert_eq!(map.remove(b"b").expect("remove again"), None);
    assert!(map.is_empty());
    let frozen = freeze(&mut map);
    assert_eq!(frozen.compute_hash().expect("hash"), empty_tree_hash());
}

// ---------------------------------------------------------------------------
// Scenario 2: root hash follows the leaf layout
// ---------------------------------------------------------------------------

fn apply_ops(map: &mut VirtualMap, seed: u64, copy_every: usize) -> Vec<VirtualMap> {
    let mut rng = Lcg(seed);
    let mut frozen = Vec::new();
    for step in 0..300 {
        let key = format!("acct-{}", rng.next() % 80).into_bytes();
        if rng.next() % 4 == 0 {
            map.remove(&key).expect("remove");
        } else {
            map.put(key, rng.next().to_be_bytes()).expect("put");
        }
        if copy_every > 0 && step % copy_every == copy_every - 1 {
            let copy = freeze(map);
            copy.enable_flush();
            frozen.push(copy);
        }
    }
    frozen
}

#[test]
fn root_hash_ignores_copy_and_flush_boundaries() {
    let dir_a = tempfile::tempdir().expect("tempdir");
    let dir_b = tempfile::tempdir().expect("tempdir");
    let mut map_a = open(dir_a.path());
    let mut map_b = open(dir_b.path());

    let frozen_a = apply_ops(&mut map_a, 42, 7);
    drop(frozen_a);
    let frozen_b = apply_ops(&mut map_b, 42, 0);
    assert!(frozen_b.is_empty());

    let last_a = freeze(&mut map_a);
    let last_b = freeze(&mut map_b);
    assert_eq!(
        last_a.compute_hash().expect("hash a"),
        last_b.compute_hash().expect("hash b")
    );
    assert_ne!(last_a.version(), last_b.version());
}

#[test]
fn insertion_order_decides_the_layout_and_the_root() {
    let dir_xy = tempfile::tempdir().expect("tempdir");
    let dir_yx = tempfile::tempdir().expect("tempdir");
    let mut xy = open(dir_xy.path());
    let mut yx = open(dir_yx.path());
    xy.put(*b"x", *b"1").expect("put");
    xy.put(*b"y", *b"2").expect("put");
    yx.put(*b"y", *b"2").expect("put");
    yx.put(*b"x", *b"1").expect("put");

    let view_xy = freeze(&mut xy).detach().expect("detach");
    let view_yx = freeze(&mut yx).detach().expect("detach");
    let leaves_xy: Vec<LeafRecord> = view_xy.leaves().collect::<Result<_, _>>().expect("leaves");
    let leaves_yx: Vec<LeafRecord> = view_yx.leaves().collect::<Result<_, _>>().expect("leaves");

    // Same pairs, swapped paths.
    assert_eq!(leaves_xy[0].key, leaves_yx[1].key);
    assert_eq!(leaves_xy[1].key, leaves_yx[0].key);
    assert_eq!(view_xy.root_hash(), hash_full_tree(&leaves_xy).expect("rehash"));
    assert_eq!(view_yx.root_hash(), hash_full_tree(&leaves_yx).expect("rehash"));
    assert_ne!(view_xy.root_hash(), view_yx.root_hash());

    // Rebuilding the xy layout in a third map gives the xy root.
    let dir_again = tempfile::tempdir().expect("tempdir");
    let mut again = open(dir_again.path());
    for leaf in &leaves_xy {
        again.put(leaf.key.clone(), leaf.value.clone()).expect("put");
    }
    let view_again = freeze(&mut again).detach().expect("detach");
    assert_eq!(view_again.root_hash(), view_xy.root_hash());
}

// ---------------------------------------------------------------------------
// Scenario 3: copy isolation
// ---------------------------------------------------------------------------

#[test]
fn detached_view_is_isolated_from_newer_copies() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut map = open(dir.path());
    map.put(*b"a", *b"1").expect("put");
    map.put(*b"c", *b"3").expect("put");

    let first = freeze(&mut map);
    // Requested before detaching, so the releaser flushes this copy
    // instead of merging it forward.
    first.enable_flush();
    let view = first.detach().expect("detach");

    map.put(*b"a", *b"changed").expect("put");
    map.put(*b"b", *b"2").expect("put");
    map.remove(b"c").expect("remove");
    assert_eq!(first.get(b"a").expect("get"), Some(b"1".to_vec()));

    let second = freeze(&mut map);
    second.enable_flush();
    second.wait_until_flushed().expect("second flushed");
    assert!(first.is_flushed());

    assert_eq!(view.get(b"a").expect("get"), Some(b"1".to_vec()));
    assert_eq!(view.get(b"b").expect("get"), None);
    assert_eq!(view.get(b"c").expect("get"), Some(b"3".to_vec()));
    assert_eq!(view.size(), 2);

    // The first copy still answers from its own delta, but a miss would
    // have to read a store that is already past it.
    assert_eq!(first.get(b"a").expect("get"), Some(b"1".to_vec()));
    assert!(matches!(
        first.get(b"missing"),
        Err(VmapError::SequencingViolation(_))
    ));
    assert_eq!(map.get(b"a").expect("get"), Some(b"changed".to_vec()));
    assert_eq!(map.get(b"c").expect("get"), None);
}

// ---------------------------------------------------------------------------
// Scenario 4: empty tree
// ---------------------------------------------------------------------------

#[test]
fn fresh_map_hashes_to_the_sentinel() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut map = open(dir.path());
    assert_eq!(map.size(), 0);
    assert!(map.is_empty());
    assert_eq!(map.version(), Version(1));
    assert!(matches!(
        map.compute_hash(),
        Err(VmapError::SequencingViolation(_))
    ));

    let frozen = freeze(&mut map);
    assert_eq!(frozen.compute_hash().expect("hash"), empty_tree_hash());
    assert_eq!(frozen.root_hash(), Some(empty_tree_hash()));
}

// ---------------------------------------------------------------------------
// Scenario 5: ordering
// ---------------------------------------------------------------------------

#[test]
fn merging_the_second_copy_first_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut map = open(dir.path());
    map.put(*b"k1", *b"v1").expect("put");
    let c1 = freeze(&mut map);
    map.put(*b"k2", *b"v2").expect("put");
    let c2 = freeze(&mut map);
    let c3 = &mut map;

    assert!(matches!(c2.merge(), Err(VmapError::SequencingViolation(_))));
    assert!(matches!(c2.flush(), Err(VmapError::SequencingViolation(_))));
    assert!(matches!(c3.merge(), Err(VmapError::SequencingViolation(_))));

    c1.flush().expect("flush c1");
    c1.flush().expect("flush is idempotent");
    assert!(matches!(c1.merge(), Ok(())), "merging a flushed copy only unlinks it");
    c2.merge().expect("merge c2");
    assert!(c2.is_merged());
    assert!(matches!(c2.merge(), Err(VmapError::SequencingViolation(_))));
    assert!(matches!(c2.flush(), Err(VmapError::SequencingViolation(_))));
    assert!(matches!(
        c2.wait_until_flushed(),
        Err(VmapError::SequencingViolation(_))
    ));

    let state = c3.root().debug_state();
    assert!(!state.linked_to_older);
    assert_eq!(c3.get(b"k1").expect("get"), Some(b"v1".to_vec()));
    assert_eq!(c3.get(b"k2").expect("get"), Some(b"v2".to_vec()));
}

// ---------------------------------------------------------------------------
// Scenario 6: durability
// ---------------------------------------------------------------------------

#[test]
fn flushed_pairs_survive_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let expected: Vec<(Vec<u8>, Vec<u8>)> = (0..50_u32)
        .map(|i| (format!("key-{i}").into_bytes(), vec![i as u8; (i % 7) as usize]))
        .collect();

    let root = {
        let mut map = open(dir.path());
        for (key, value) in &expected {
            map.put(key.clone(), value.clone()).expect("put");
        }
        let frozen = freeze(&mut map);
        frozen.enable_flush();
        frozen.wait_until_flushed().expect("flushed");
        frozen.root_hash().expect("hashed")
    };

    let mut map = open(dir.path());
    assert_eq!(map.version(), Version(2));
    assert_eq!(map.size(), expected.len() as u64);
    for (key, value) in &expected {
        assert_eq!(map.get(key).expect("get").as_ref(), Some(value));
    }
    let frozen = freeze(&mut map);
    assert_eq!(frozen.compute_hash().expect("hash"), root);
}

#[test]
fn released_copies_merge_forward_before_a_flush() {
    let dir = tempfile::tempdir().expect("tempdir");
    {
        let mut map = open(dir.path());
        for round in 0..8_u64 {
            map.put(format!("round-{round}"), round.to_be_bytes()).expect("put");
            if round > 0 {
                map.remove(format!("round-{}", round - 1).as_bytes()).expect("remove");
                map.put(format!("kept-{round}"), *b"x").expect("put");
            }
            drop(freeze(&mut map));
        }
        let last = freeze(&mut map);
        last.enable_flush();
        last.wait_until_flushed().expect("flushed");
        let stats = map.store_stats();
        assert_eq!(stats.batches_written, 1, "only the last copy reaches disk");
    }

    let map = open(dir.path());
    assert_eq!(map.get(b"round-7").expect("get"), Some(7_u64.to_be_bytes().to_vec()));
    assert_eq!(map.get(b"round-6").expect("get"), None);
    for round in 1..8 {
        assert!(map.contains_key(format!("kept-{round}").as_bytes()).expect("get"));
    }
    assert_eq!(map.size(), 8);
}

// ---------------------------------------------------------------------------
// Scenario 7: snapshots
// ---------------------------------------------------------------------------

#[test]
fn snapshot_reopens_with_the_same_root() {
    let dir = tempfile::tempdir().expect("tempdir");
    let image = tempfile::tempdir().expect("tempdir");
    let (version, root) = {
        let mut map = open(dir.path());
        for i in 0..20_u64 {
            map.put(i.to_be_bytes(), format!("v{i}")).expect("put");
        }
        let frozen = freeze(&mut map);
        frozen.snapshot(image.path()).expect("snapshot");
        assert!(!frozen.root().debug_state().detached);
        (frozen.version(), frozen.root_hash().expect("hashed"))
    };

    let mut restored = open(image.path());
    assert_eq!(restored.version(), Version(version.0 + 1));
    assert_eq!(restored.size(), 20);
    assert_eq!(restored.get(&3_u64.to_be_bytes()).expect("get"), Some(b"v3".to_vec()));
    let report = restored.diagnostics().validate_store().expect("validate");
    assert!(report.is_clean(), "{report:?}");
    let frozen = freeze(&mut restored);
    assert_eq!(frozen.compute_hash().expect("hash"), root);
}

// ---------------------------------------------------------------------------
// Scenario 8: limits, shutdown, typed access
// ---------------------------------------------------------------------------

#[test]
fn capacity_is_enforced_on_insert_only() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = VirtualMapConfig {
        max_size: 3,
        size_warning_threshold: 2,
        ..config()
    };
    let mut map = VirtualMap::open(dir.path(), config).expect("open");
    for key in [b"a", b"b", b"c"] {
        map.put(*key, *b"1").expect("put");
    }
    assert!(matches!(
        map.put(*b"d", *b"1"),
        Err(VmapError::CapacityExceeded(_))
    ));
    map.put(*b"a", *b"2").expect("replace at capacity");
    assert_eq!(map.size(), 3);
}

#[test]
fn immediate_shutdown_cancels_flush_waiters() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut map = open(dir.path());
    map.put(*b"a", *b"1").expect("put");
    let frozen = freeze(&mut map);
    map.shutdown(true);
    assert!(matches!(
        frozen.wait_until_flushed(),
        Err(VmapError::Cancelled)
    ));
    assert!(matches!(map.copy(), Err(VmapError::Closed(_))));
    assert!(matches!(
        map.wait_until_flushed(),
        Err(VmapError::SequencingViolation(_))
    ));
}

#[test]
fn typed_access_and_diagnostics() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut map = open(dir.path());
    map.put_as(&7_u64, &"seven".to_owned(), &U64Codec, &Utf8Codec)
        .expect("put");
    assert_eq!(
        map.get_as(&7_u64, &U64Codec, &Utf8Codec).expect("get"),
        Some("seven".to_owned())
    );
    assert_eq!(map.get_as(&8_u64, &U64Codec, &Utf8Codec).expect("get"), None);
    assert!(map.warm(&7_u64.to_be_bytes()).expect("warm"));

    let frozen = freeze(&mut map);
    frozen.enable_flush();
    frozen.wait_until_flushed().expect("flushed");

    // Warming only reads.
    let stats = map.store_stats();
    assert!(map.warm(&7_u64.to_be_bytes()).expect("warm flushed"));
    assert!(!map.warm(&9_u64.to_be_bytes()).expect("warm missing"));
    assert_eq!(map.size(), 1);
    assert_eq!(map.store_stats(), stats);

    let diagnostics = DiagnosticAccessor::for_accessor(map_detach_after_copy(&mut map));
    let metadata = diagnostics.metadata();
    assert_eq!(metadata.label, "vmap");
    assert_eq!(metadata.size, 1);
    assert_eq!(metadata.stored_version, frozen.version());
    assert_eq!(
        diagnostics
            .get_as(&7_u64.to_be_bytes(), &Utf8Codec)
            .expect("get"),
        Some("seven".to_owned())
    );
    assert!(diagnostics.validate_store().expect("validate").is_clean());
    assert_eq!(diagnostics.store_stats().batches_written, 1);
}

fn map_detach_after_copy(map: &mut VirtualMap) -> RecordAccessor {
    let frozen = freeze(map);
    frozen.detach().expect("detach")
}

// ---------------------------------------------------------------------------
// Scenario 9: properties over arbitrary operation sequences
// ---------------------------------------------------------------------------

/// `(key, Some(value))` puts, `(key, None)` removes.
type Op = (u8, Option<u8>);

fn op_sequence(max: usize) -> impl Strategy<Value = Vec<Op>> {
    proptest::collection::vec((0_u8..32, proptest::option::weighted(0.7, any::<u8>())), 0..max)
}

fn apply(map: &mut VirtualMap, model: &mut BTreeMap<Vec<u8>, Vec<u8>>, ops: &[Op]) {
    for &(key, value) in ops {
        let key = vec![b'k', key];
        match value {
            Some(value) => {
                map.put(key.clone(), vec![value]).expect("put");
                model.insert(key, vec![value]);
            }
            None => {
                map.remove(&key).expect("remove");
                model.remove(&key);
            }
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn any_sequence_keeps_the_tree_complete(ops in op_sequence(120), copy_at in 0_usize..120) {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut map = open(dir.path());
        let mut model = BTreeMap::new();
        let split = copy_at.min(ops.len());
        apply(&mut map, &mut model, &ops[..split]);
        let middle = freeze(&mut map);
        middle.enable_flush();
        apply(&mut map, &mut model, &ops[split..]);

        let accessor = freeze(&mut map).detach().expect("detach");
        let size = model.len() as u64;
        prop_assert_eq!(accessor.size(), size);
        prop_assert_eq!(accessor.leaf_range(), LeafRange::for_size(size).expect("range"));
        let leaves: Vec<LeafRecord> = accessor.leaves().collect::<Result<_, _>>().expect("leaves");
        prop_assert_eq!(leaves.len() as u64, size);
        for (leaf, expected) in leaves.iter().zip(accessor.leaf_range().first().map_or(0, |p| p.0)..) {
            prop_assert_eq!(leaf.path, Path(expected));
            prop_assert_eq!(model.get(&leaf.key), Some(&leaf.value));
        }
        prop_assert_eq!(accessor.root_hash(), hash_full_tree(&leaves).expect("full rehash"));
    }

    #[test]
    fn detached_views_never_see_later_copies(before in op_sequence(60), after in op_sequence(60)) {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut map = open(dir.path());
        let mut model = BTreeMap::new();
        apply(&mut map, &mut model, &before);
        let first = freeze(&mut map);
        first.enable_flush();
        let view = first.detach().expect("detach");
        let root = view.root_hash();
        let seen = model.clone();

        apply(&mut map, &mut model, &after);
        let second = freeze(&mut map);
        second.enable_flush();
        second.wait_until_flushed().expect("flushed");

        prop_assert_eq!(view.size(), seen.len() as u64);
        prop_assert_eq!(view.root_hash(), root);
        for key in 0_u8..32 {
            let key = vec![b'k', key];
            let got = view.get(&key).expect("get");
            prop_assert_eq!(got.as_ref(), seen.get(&key));
        }
    }
}
