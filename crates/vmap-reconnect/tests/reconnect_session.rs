#![forbid(unsafe_code)]
//! End-to-end reconnect sessions between two maps over loopback TCP.
//!
//! Scenarios tested:
//! 1. Only the one differing leaf of a three-leaf tree is transferred.
//! 2. Learners of any shape end with the teacher's root hash and contents.
//! 3. Value-only changes cost exactly one record per changed leaf.
//! 4. Identical and empty trees.
//! 5. Truncated or out-of-order streams fail and leave the learner intact.
//! 6. Divergence abort and read timeouts; answers that are slow but on
//!    time never time out.
//! 7. The round-trip law as a shrinking property over arbitrary trees.

use proptest::prelude::*;
use std::collections::BTreeMap;
use std::io::{self, Cursor, Read};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use vmap_core::{Detachable, RecordAccessor, VirtualMap, VirtualMapConfig};
use vmap_error::VmapError;
use vmap_hash::hash_full_tree;
use vmap_reconnect::{Frame, ReconnectConfig, ReconnectStats, learn, learn_stream, teach, teach_stream};
use vmap_types::{Hash, LeafRecord, Path};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn map_config() -> VirtualMapConfig {
    let mut config = VirtualMapConfig {
        flush_interval: 0,
        compact_after_flush: false,
        ..VirtualMapConfig::default()
    };
    config.store.sync_on_flush = false;
    config
}

fn session_config() -> ReconnectConfig {
    ReconnectConfig {
        read_timeout_ms: 10_000,
        ..ReconnectConfig::default()
    }
}

fn build(dir: &std::path::Path, pairs: &[(&[u8], &[u8])]) -> VirtualMap {
    let mut map = VirtualMap::open(dir, map_config()).expect("open map");
    for (key, value) in pairs {
        map.put(key.to_vec(), value.to_vec()).expect("put");
    }
    map
}

/// Freeze `map` and detach the frozen copy for serving.
fn serve(map: &mut VirtualMap) -> RecordAccessor {
    let next = map.copy().expect("copy");
    let frozen = std::mem::replace(map, next);
    frozen.detach().expect("detach")
}

/// Root hash of the current contents of `map`.
fn root_of(map: &mut VirtualMap) -> Hash {
    serve(map).root_hash()
}

/// Run one session over loopback TCP.
fn run(
    tree: RecordAccessor,
    learner: &mut VirtualMap,
    config: &ReconnectConfig,
) -> (Result<ReconnectStats, VmapError>, Result<ReconnectStats, VmapError>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    let teacher_config = config.clone();
    let teacher = thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept");
        let result = teach_stream(&tree, &stream, &teacher_config);
        // Close only after the learner hung up, so unread answers never
        // turn into a reset that races the last frame.
        let _ = stream.shutdown(Shutdown::Write);
        let _ = io::copy(&mut stream, &mut io::sink());
        result
    });
    let stream = TcpStream::connect(addr).expect("connect");
    let learned = learn_stream(learner, &stream, config);
    drop(stream);
    let taught = teacher.join().expect("teacher thread");
    (taught, learned)
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

fn random_map(dir: &std::path::Path, seed: u64, ops: usize) -> (VirtualMap, BTreeMap<Vec<u8>, Vec<u8>>) {
    let mut map = VirtualMap::open(dir, map_config()).expect("open map");
    let mut model = BTreeMap::new();
    let mut rng = Lcg(seed);
    for _ in 0..ops {
        let key = format!("key-{}", rng.next() % 90).into_bytes();
        if rng.next() % 5 == 0 {
            map.remove(&key).expect("remove");
            model.remove(&key);
        } else {
            let value = format!("v{}", rng.next() % 1000).into_bytes();
            map.put(key.clone(), value.clone()).expect("put");
            model.insert(key, value);
        }
    }
    (map, model)
}

// ---------------------------------------------------------------------------
// Scenario 1: minimality
// ---------------------------------------------------------------------------

#[test]
fn only_the_differing_leaf_is_sent() {
    let teacher_dir = tempfile::tempdir().expect("tempdir");
    let learner_dir = tempfile::tempdir().expect("tempdir");
    let mut teacher = build(teacher_dir.path(), &[(b"k1", b"a"), (b"k2", b"b"), (b"k3", b"c")]);
    let mut learner = build(learner_dir.path(), &[(b"k1", b"a"), (b"k2", b"x"), (b"k3", b"c")]);

    let tree = serve(&mut teacher);
    let teacher_root = tree.root_hash();
    let (taught, learned) = run(tree, &mut learner, &session_config());
    let taught = taught.expect("teacher");
    let learned = learned.expect("learner");

    // Root and both children travel as hashes; the internal node holding
    // k1 and k3 matches, the leaf holding k2 does not.
    for stats in [taught, learned] {
        assert_eq!(stats.hashes_sent, 3);
        assert_eq!(stats.matches, 1);
        assert_eq!(stats.mismatches, 2);
        assert_eq!(stats.leaves_sent, 1);
        assert_eq!(stats.leaf_bytes, 3, "k2 plus b");
    }
    assert_eq!(learner.get(b"k2").expect("get"), Some(b"b".to_vec()));
    assert_eq!(learner.get(b"k1").expect("get"), Some(b"a".to_vec()));
    assert_eq!(root_of(&mut learner), teacher_root);
}

// ---------------------------------------------------------------------------
// Scenario 2: round trip across shapes
// ---------------------------------------------------------------------------

#[test]
fn learners_of_any_shape_converge() {
    for (teacher_seed, learner_seed, teacher_ops, learner_ops) in
        [(1, 2, 200, 40), (3, 4, 30, 220), (5, 6, 120, 120), (7, 8, 1, 90)]
    {
        let teacher_dir = tempfile::tempdir().expect("tempdir");
        let learner_dir = tempfile::tempdir().expect("tempdir");
        let (mut teacher, model) = random_map(teacher_dir.path(), teacher_seed, teacher_ops);
        let (mut learner, stale) = random_map(learner_dir.path(), learner_seed, learner_ops);

        let tree = serve(&mut teacher);
        let teacher_root = tree.root_hash();
        let (taught, learned) = run(tree, &mut learner, &session_config());
        let taught = taught.expect("teacher");
        learned.expect("learner");
        assert!(taught.leaves_sent <= model.len() as u64);

        assert_eq!(learner.size(), model.len() as u64, "seed {teacher_seed}");
        for (key, value) in &model {
            assert_eq!(learner.get(key).expect("get").as_ref(), Some(value));
        }
        for key in stale.keys().filter(|key| !model.contains_key(*key)) {
            assert_eq!(learner.get(key).expect("get"), None);
        }
        assert_eq!(root_of(&mut learner), teacher_root);

        // The learner keeps working normally afterwards.
        learner.put(*b"after", *b"reconnect").expect("put");
        learner.remove(b"key-1").expect("remove");
        let view = serve(&mut learner);
        let leaves: Vec<LeafRecord> = view.leaves().collect::<Result<_, _>>().expect("leaves");
        assert_eq!(leaves.len() as u64, view.size());
        assert_eq!(view.root_hash(), hash_full_tree(&leaves).expect("full rehash"));
    }
}

// ---------------------------------------------------------------------------
// Scenario 3: value-only changes
// ---------------------------------------------------------------------------

#[test]
fn each_changed_value_costs_one_record() {
    let teacher_dir = tempfile::tempdir().expect("tempdir");
    let learner_dir = tempfile::tempdir().expect("tempdir");
    let mut teacher = VirtualMap::open(teacher_dir.path(), map_config()).expect("open");
    let mut learner = VirtualMap::open(learner_dir.path(), map_config()).expect("open");
    for i in 0..64_u32 {
        let key = format!("acct-{i:02}");
        teacher.put(key.clone(), i.to_be_bytes()).expect("put");
        let value = if i % 13 == 0 { (i + 1000).to_be_bytes() } else { i.to_be_bytes() };
        learner.put(key, value).expect("put");
    }

    let (taught, learned) = run(serve(&mut teacher), &mut learner, &session_config());
    let taught = taught.expect("teacher");
    learned.expect("learner");
    assert_eq!(taught.leaves_sent, 5, "acct-00, 13, 26, 39 and 52");
    assert_eq!(taught.leaf_bytes, 5 * (7 + 4));
    assert_eq!(learner.get(b"acct-26").expect("get"), Some(26_u32.to_be_bytes().to_vec()));
}

// ---------------------------------------------------------------------------
// Scenario 4: identical and empty trees
// ---------------------------------------------------------------------------

#[test]
fn identical_trees_exchange_one_hash() {
    let teacher_dir = tempfile::tempdir().expect("tempdir");
    let learner_dir = tempfile::tempdir().expect("tempdir");
    let pairs: &[(&[u8], &[u8])] = &[(b"a", b"1"), (b"b", b"2"), (b"c", b"3"), (b"d", b"4")];
    let mut teacher = build(teacher_dir.path(), pairs);
    let mut learner = build(learner_dir.path(), pairs);

    let (taught, learned) = run(serve(&mut teacher), &mut learner, &session_config());
    let taught = taught.expect("teacher");
    learned.expect("learner");
    assert_eq!(taught.hashes_sent, 1);
    assert_eq!(taught.matches, 1);
    assert_eq!(taught.leaves_sent, 0);
    assert_eq!(taught.leaf_bytes, 0);
}

#[test]
fn empty_teacher_empties_the_learner() {
    let teacher_dir = tempfile::tempdir().expect("tempdir");
    let learner_dir = tempfile::tempdir().expect("tempdir");
    let mut teacher = build(teacher_dir.path(), &[]);
    let mut learner = build(learner_dir.path(), &[(b"a", b"1"), (b"b", b"2")]);

    let tree = serve(&mut teacher);
    let teacher_root = tree.root_hash();
    let (taught, learned) = run(tree, &mut learner, &session_config());
    assert_eq!(taught.expect("teacher").hashes_sent, 0);
    learned.expect("learner");
    assert!(learner.is_empty());
    assert_eq!(learner.get(b"a").expect("get"), None);
    assert_eq!(root_of(&mut learner), teacher_root);
}

#[test]
fn empty_learner_receives_everything() {
    let teacher_dir = tempfile::tempdir().expect("tempdir");
    let learner_dir = tempfile::tempdir().expect("tempdir");
    let (mut teacher, model) = random_map(teacher_dir.path(), 11, 150);
    let mut learner = build(learner_dir.path(), &[]);

    let tree = serve(&mut teacher);
    let teacher_root = tree.root_hash();
    let (taught, learned) = run(tree, &mut learner, &session_config());
    assert_eq!(taught.expect("teacher").leaves_sent, model.len() as u64);
    assert_eq!(learned.expect("learner").matches, 0);
    assert_eq!(root_of(&mut learner), teacher_root);
}

// ---------------------------------------------------------------------------
// Scenario 5: broken streams
// ---------------------------------------------------------------------------

fn shape_of(tree: &RecordAccessor) -> Frame {
    Frame::TreeShape {
        range: tree.leaf_range(),
        root_hash: tree.root_hash(),
        label: tree.label().to_owned(),
    }
}

#[test]
fn truncated_stream_leaves_the_learner_intact() {
    let teacher_dir = tempfile::tempdir().expect("tempdir");
    let learner_dir = tempfile::tempdir().expect("tempdir");
    let mut teacher = build(teacher_dir.path(), &[(b"a", b"9"), (b"b", b"8"), (b"z", b"7")]);
    let mut learner = build(learner_dir.path(), &[(b"a", b"1"), (b"b", b"2")]);
    let before = root_of(&mut learner);

    let tree = serve(&mut teacher);
    let mut bytes = shape_of(&tree).encode().expect("encode");
    let hash = Frame::SubtreeHash {
        path: Path::ROOT,
        hash: tree.root_hash(),
    }
    .encode()
    .expect("encode");
    bytes.extend_from_slice(&hash[..hash.len() - 5]);

    let err = learn(&mut learner, Cursor::new(bytes), io::sink(), &session_config()).unwrap_err();
    assert!(matches!(err, VmapError::ProtocolViolation(_)), "{err:?}");
    assert_eq!(learner.size(), 2);
    assert_eq!(learner.get(b"a").expect("get"), Some(b"1".to_vec()));
    assert_eq!(learner.get(b"z").expect("get"), None);
    assert_eq!(root_of(&mut learner), before);
}

#[test]
fn unrequested_frames_are_violations() {
    let teacher_dir = tempfile::tempdir().expect("tempdir");
    let learner_dir = tempfile::tempdir().expect("tempdir");
    let mut teacher = build(teacher_dir.path(), &[(b"a", b"1"), (b"b", b"2")]);
    let mut learner = build(learner_dir.path(), &[(b"a", b"1")]);
    let tree = serve(&mut teacher);

    let mut bytes = shape_of(&tree).encode().expect("encode");
    bytes.extend(
        Frame::Leaf(LeafRecord::new(Path(1), b"a".to_vec(), b"1".to_vec()))
            .encode()
            .expect("encode"),
    );
    let err = learn(&mut learner, Cursor::new(bytes), io::sink(), &session_config()).unwrap_err();
    assert!(matches!(err, VmapError::ProtocolViolation(_)), "{err:?}");

    // A teacher refuses answers for nodes it did not ask about.
    let answers = Frame::Match(Path(5)).encode().expect("encode");
    let err = teach(&tree, Cursor::new(answers), io::sink(), &session_config()).unwrap_err();
    assert!(matches!(err, VmapError::ProtocolViolation(_)), "{err:?}");
    assert_eq!(learner.size(), 1);
}

#[test]
fn maps_with_different_labels_do_not_reconnect() {
    let teacher_dir = tempfile::tempdir().expect("tempdir");
    let learner_dir = tempfile::tempdir().expect("tempdir");
    let mut config = map_config();
    config.store.label = "balances".to_owned();
    let mut teacher = VirtualMap::open(teacher_dir.path(), config).expect("open");
    teacher.put(*b"a", *b"1").expect("put");
    let mut learner = build(learner_dir.path(), &[(b"a", b"1")]);

    let (_, learned) = run(serve(&mut teacher), &mut learner, &session_config());
    assert!(matches!(learned, Err(VmapError::ProtocolViolation(_))));
}

// ---------------------------------------------------------------------------
// Scenario 6: abort and timeout
// ---------------------------------------------------------------------------

#[test]
fn divergent_trees_abort_on_both_sides() {
    let teacher_dir = tempfile::tempdir().expect("tempdir");
    let learner_dir = tempfile::tempdir().expect("tempdir");
    let (mut teacher, _) = random_map(teacher_dir.path(), 21, 80);
    let (mut learner, _) = random_map(learner_dir.path(), 22, 80);
    let before = root_of(&mut learner);

    let config = ReconnectConfig {
        abort_rank: Some(1),
        max_divergent_subtrees: Some(0),
        ..session_config()
    };
    let (taught, learned) = run(serve(&mut teacher), &mut learner, &config);
    assert!(matches!(taught, Err(VmapError::ReconnectAborted(_))), "{taught:?}");
    assert!(matches!(learned, Err(VmapError::ReconnectAborted(_))), "{learned:?}");
    assert_eq!(root_of(&mut learner), before);
}

#[test]
fn silent_teacher_times_out() {
    let learner_dir = tempfile::tempdir().expect("tempdir");
    let mut learner = build(learner_dir.path(), &[(b"a", b"1")]);
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (release, hold) = mpsc::channel::<()>();
    let silent = thread::spawn(move || {
        let (_stream, _) = listener.accept().expect("accept");
        let _ = hold.recv_timeout(Duration::from_secs(10));
    });

    let stream = TcpStream::connect(addr).expect("connect");
    let config = ReconnectConfig {
        read_timeout_ms: 200,
        ..ReconnectConfig::default()
    };
    let err = learn_stream(&mut learner, &stream, &config).unwrap_err();
    assert!(matches!(err, VmapError::Timeout { millis: 200 }), "{err:?}");
    assert_eq!(learner.get(b"a").expect("get"), Some(b"1".to_vec()));

    release.send(()).expect("release");
    silent.join().expect("silent teacher");
}

/// Hands out one frame per pause, like a learner that takes its time.
struct Paced {
    frames: Vec<Vec<u8>>,
    current: Cursor<Vec<u8>>,
    pause: Duration,
}

impl Read for Paced {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.current.position() == self.current.get_ref().len() as u64 {
            if self.frames.is_empty() {
                return Ok(0);
            }
            thread::sleep(self.pause);
            self.current = Cursor::new(self.frames.remove(0));
        }
        self.current.read(buf)
    }
}

#[test]
fn slow_answers_within_the_timeout_keep_the_session_alive() {
    let teacher_dir = tempfile::tempdir().expect("tempdir");
    let mut teacher = build(teacher_dir.path(), &[(b"a", b"1"), (b"b", b"2"), (b"c", b"3")]);
    let tree = serve(&mut teacher);

    // Each answer takes 200 ms; together the matches outlast the timeout.
    let answers = [Frame::Mismatch(Path::ROOT), Frame::Match(Path(1)), Frame::Match(Path(2))];
    let reader = Paced {
        frames: answers.iter().map(|f| f.encode().expect("encode")).collect(),
        current: Cursor::new(Vec::new()),
        pause: Duration::from_millis(200),
    };
    let config = ReconnectConfig {
        read_timeout_ms: 300,
        ..ReconnectConfig::default()
    };
    let stats = teach(&tree, reader, io::sink(), &config).expect("timely answers");
    assert_eq!(stats.hashes_sent, 3);
    assert_eq!(stats.mismatches, 1);
    assert_eq!(stats.matches, 2);
    assert_eq!(stats.leaves_sent, 0);
}

#[test]
fn slow_teacher_frames_within_the_timeout_keep_the_learner_alive() {
    let teacher_dir = tempfile::tempdir().expect("tempdir");
    let learner_dir = tempfile::tempdir().expect("tempdir");
    let pairs: &[(&[u8], &[u8])] = &[(b"a", b"1"), (b"b", b"2"), (b"c", b"3")];
    let mut teacher = build(teacher_dir.path(), pairs);
    let mut learner = build(learner_dir.path(), pairs);
    let tree = serve(&mut teacher);

    // Shape, root hash and DONE arrive 200 ms apart; only the gap from the
    // start to the first answer would exceed the timeout.
    let frames = [
        shape_of(&tree),
        Frame::SubtreeHash {
            path: Path::ROOT,
            hash: tree.root_hash(),
        },
        Frame::Done,
    ];
    let reader = Paced {
        frames: frames.iter().map(|f| f.encode().expect("encode")).collect(),
        current: Cursor::new(Vec::new()),
        pause: Duration::from_millis(200),
    };
    let config = ReconnectConfig {
        read_timeout_ms: 300,
        ..ReconnectConfig::default()
    };
    let stats = learn(&mut learner, reader, io::sink(), &config).expect("timely frames");
    assert_eq!(stats.matches, 1);
    assert_eq!(stats.leaves_sent, 0);
    assert_eq!(root_of(&mut learner), tree.root_hash());
}

// ---------------------------------------------------------------------------
// Scenario 7: round-trip law over arbitrary trees
// ---------------------------------------------------------------------------

fn pairs() -> impl Strategy<Value = Vec<(u8, u8)>> {
    proptest::collection::vec((0_u8..48, any::<u8>()), 0..64)
}

fn map_from(dir: &std::path::Path, pairs: &[(u8, u8)]) -> (VirtualMap, BTreeMap<Vec<u8>, Vec<u8>>) {
    let mut map = VirtualMap::open(dir, map_config()).expect("open map");
    let mut model = BTreeMap::new();
    for &(key, value) in pairs {
        let key = vec![b'k', key];
        // Every third write of an existing key removes it instead.
        if value % 3 == 0 && model.contains_key(&key) {
            map.remove(&key).expect("remove");
            model.remove(&key);
        } else {
            map.put(key.clone(), vec![value]).expect("put");
            model.insert(key, vec![value]);
        }
    }
    (map, model)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn any_learner_converges_to_any_teacher(teacher_pairs in pairs(), learner_pairs in pairs()) {
        let teacher_dir = tempfile::tempdir().expect("tempdir");
        let learner_dir = tempfile::tempdir().expect("tempdir");
        let (mut teacher, model) = map_from(teacher_dir.path(), &teacher_pairs);
        let (mut learner, _) = map_from(learner_dir.path(), &learner_pairs);

        let tree = serve(&mut teacher);
        let teacher_root = tree.root_hash();
        let (taught, learned) = run(tree, &mut learner, &session_config());
        let taught = taught.expect("teacher");
        let learned = learned.expect("learner");

        prop_assert_eq!(root_of(&mut learner), teacher_root);
        prop_assert_eq!(learner.size(), model.len() as u64);
        for key in 0_u8..48 {
            let key = vec![b'k', key];
            let got = learner.get(&key).expect("get");
            prop_assert_eq!(got.as_ref(), model.get(&key));
        }
        prop_assert!(taught.leaves_sent <= model.len() as u64);
        prop_assert_eq!(taught.leaves_sent, learned.leaves_sent);
        prop_assert_eq!(taught.hashes_sent, taught.matches + taught.mismatches);
    }
}
