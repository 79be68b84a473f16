//! Catching-up side of a reconnect session.
//!
//! The learner freezes its map, keeps the frozen copy as the original to
//! compare against and writes what the teacher sends into the new mutable
//! copy. A node is answered MATCH only when the original has a node of the
//! same kind (leaf or internal) at that path with an equal hash; paths the
//! original lacks or holds as the other kind are always MISMATCH.
//!
//! After DONE the learner freezes the received copy, hashes it and checks
//! the result against the root the teacher announced. A session that
//! fails before DONE leaves the map's contents as they were before
//! [`learn`] started.

use crate::config::{ReconnectConfig, apply_socket_timeouts};
use crate::session::{ReconnectStats, join, next_item, settle};
use crate::wire::{Frame, FrameReader, FrameWriter};
use std::collections::HashSet;
use std::io::{BufWriter, Read, Write};
use std::net::TcpStream;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::thread;
use std::time::Instant;
use tracing::{debug, info, warn};
use vmap_core::{Hashable, RecordAccessor, Versioned, VirtualMap};
use vmap_error::{Result, VmapError};
use vmap_types::{Hash, LeafRange, Path};

/// Items passed from the reader thread to the writer thread.
#[derive(Debug)]
enum Reply {
    Answer(Frame),
    /// A frame arrived that needs no answer; resets the writer's wait.
    Progress,
}

/// What the reader thread learned from a completed session.
#[derive(Debug)]
struct Received {
    root_hash: Hash,
    stats: ReconnectStats,
}

/// Bring `map` up to the tree served over `stream`.
pub fn learn_stream(
    map: &mut VirtualMap,
    stream: &TcpStream,
    config: &ReconnectConfig,
) -> Result<ReconnectStats> {
    apply_socket_timeouts(stream, config)?;
    learn(map, stream.try_clone()?, stream, config)
}

/// Bring `map` up to the teacher's tree: read frames from `reader`, write
/// answers to `writer`.
///
/// On success `map` is the mutable successor of a copy whose root hash
/// equals the teacher's. A session that fails before DONE has its writes
/// undone; a received tree that does not hash to the announced root is
/// kept frozen behind `map`. Either way the session must be restarted from
/// the root.
pub fn learn<R, W>(
    map: &mut VirtualMap,
    reader: R,
    writer: W,
    config: &ReconnectConfig,
) -> Result<ReconnectStats>
where
    R: Read + Send,
    W: Write + Send,
{
    config.validate()?;
    let started = Instant::now();

    // The frozen handle keeps the original from being merged into the copy
    // the session writes to.
    let next = map.copy()?;
    let original_copy = std::mem::replace(map, next);
    let original = original_copy.read_view()?;
    info!(
        target: "vmap::reconnect",
        role = "learner",
        label = original.label(),
        version = map.version().0,
        size = original.size(),
        root = %original.root_hash(),
        "reconnect_started"
    );

    let (tx, rx) = mpsc::channel();
    let outcome = {
        let target = &mut *map;
        let original = &original;
        thread::scope(|scope| {
            let sender = thread::Builder::new()
                .name("vmap-learn-send".to_owned())
                .spawn_scoped(scope, move || send_answers(writer, &rx, config))?;
            let receiver = thread::Builder::new()
                .name("vmap-learn-recv".to_owned())
                .spawn_scoped(scope, move || receive_tree(target, original, reader, &tx, config))?;
            settle(join(receiver, "reconnect reader"), join(sender, "reconnect writer"))
        })
    };

    let result = match outcome {
        Ok((received, written)) => {
            verify(map, received.root_hash).map(|()| received.stats.combine(written))
        }
        Err(err) => {
            // Undo while the original is still held, so nothing was merged
            // into the copy being reset.
            if let Err(undo) = map.abandon_reconnect() {
                warn!(
                    target: "vmap::reconnect",
                    role = "learner",
                    error = %undo,
                    "reconnect_undo_failed"
                );
            }
            Err(err)
        }
    };
    drop(original_copy);

    match result {
        Ok(stats) => {
            info!(
                target: "vmap::reconnect",
                role = "learner",
                label = original.label(),
                version = map.version().0,
                hashes = stats.hashes_sent,
                leaves = stats.leaves_sent,
                leaf_bytes = stats.leaf_bytes,
                matches = stats.matches,
                mismatches = stats.mismatches,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "reconnect_finished"
            );
            Ok(stats)
        }
        Err(err) => {
            warn!(
                target: "vmap::reconnect",
                role = "learner",
                label = original.label(),
                error = %err,
                "reconnect_failed"
            );
            Err(err)
        }
    }
}

/// Freeze the received copy and compare its root with the teacher's.
fn verify(map: &mut VirtualMap, expected: Hash) -> Result<()> {
    let next = map.copy()?;
    let received = std::mem::replace(map, next);
    let root = received.compute_hash()?;
    if root != expected {
        return Err(VmapError::protocol(format!(
            "received tree hashes to {root}, teacher announced {expected}"
        )));
    }
    debug!(
        target: "vmap::reconnect",
        role = "learner",
        version = received.version().0,
        root = %root,
        "reconnect_verified"
    );
    Ok(())
}

// ── Reader thread ────────────────────────────────────────────────────────────

/// Hash the original holds for `path`, if it is comparable with a node of
/// the same kind in `theirs`.
fn local_hash(original: &RecordAccessor, theirs: LeafRange, path: Path) -> Result<Option<Hash>> {
    let ours = original.leaf_range();
    if !ours.contains(path) || ours.is_leaf(path) != theirs.is_leaf(path) {
        return Ok(None);
    }
    if path == Path::ROOT {
        return Ok(Some(original.root_hash()));
    }
    original.hash(path)
}

fn receive_tree<R: Read>(
    map: &mut VirtualMap,
    original: &RecordAccessor,
    reader: R,
    tx: &Sender<Reply>,
    config: &ReconnectConfig,
) -> Result<Received> {
    let mut frames = FrameReader::new(reader, config);
    let mut stats = ReconnectStats::default();
    let send = |reply: Reply| tx.send(reply).map_err(|_| VmapError::Cancelled);

    let (range, root_hash) = match frames.read_frame()? {
        Frame::TreeShape {
            range,
            root_hash,
            label,
        } => {
            if label != original.label() {
                return Err(VmapError::protocol(format!(
                    "teacher serves map {label:?}, learner holds {:?}",
                    original.label()
                )));
            }
            (range, root_hash)
        }
        other => {
            return Err(VmapError::protocol(format!(
                "session must open with TREE_SHAPE, got {other}"
            )));
        }
    };
    map.begin_reconnect(range)?;
    // Dropping the old range can take a while on large trees.
    send(Reply::Progress)?;

    // Nodes the teacher may still send: hashes under mismatched internal
    // nodes and records for mismatched leaves.
    let mut hash_expected: HashSet<Path> = HashSet::new();
    let mut leaf_expected: HashSet<Path> = HashSet::new();
    if !range.is_empty() {
        hash_expected.insert(Path::ROOT);
    }

    loop {
        let frame = frames.read_frame()?;
        match frame {
            Frame::SubtreeHash { path, hash } => {
                if !hash_expected.remove(&path) {
                    return Err(VmapError::protocol(format!("unrequested hash for node {path}")));
                }
                stats.hashes_sent += 1;
                if local_hash(original, range, path)? == Some(hash) {
                    stats.matches += 1;
                    send(Reply::Answer(Frame::Match(path)))?;
                    continue;
                }
                stats.mismatches += 1;
                if range.is_leaf(path) {
                    leaf_expected.insert(path);
                } else {
                    for child in [path.left_child(), path.right_child()].into_iter().flatten() {
                        if range.contains(child) {
                            hash_expected.insert(child);
                        }
                    }
                }
                send(Reply::Answer(Frame::Mismatch(path)))?;
            }
            Frame::Leaf(leaf) => {
                if !leaf_expected.remove(&leaf.path) {
                    return Err(VmapError::protocol(format!(
                        "unrequested record for leaf {}",
                        leaf.path
                    )));
                }
                stats.leaves_sent += 1;
                stats.leaf_bytes += (leaf.key.len() + leaf.value.len()) as u64;
                map.apply_reconnect_leaf(leaf)?;
                send(Reply::Progress)?;
            }
            Frame::Done => {
                if !hash_expected.is_empty() || !leaf_expected.is_empty() {
                    return Err(VmapError::protocol(format!(
                        "DONE with {} hashes and {} leaves still owed",
                        hash_expected.len(),
                        leaf_expected.len()
                    )));
                }
                stats.bytes_read = frames.bytes_read();
                return Ok(Received { root_hash, stats });
            }
            Frame::Abort { reason } => return Err(VmapError::ReconnectAborted(reason)),
            other => {
                return Err(VmapError::protocol(format!("learner cannot accept {other}")));
            }
        }
    }
}

// ── Writer thread ────────────────────────────────────────────────────────────

fn send_answers<W: Write>(
    writer: W,
    rx: &Receiver<Reply>,
    config: &ReconnectConfig,
) -> Result<ReconnectStats> {
    let mut out = FrameWriter::new(BufWriter::new(writer), config);
    let timeout = config.read_timeout();

    while let Some(reply) = next_item(rx, timeout, config.read_timeout_ms)? {
        let mut pending = Some(reply);
        while let Some(reply) = pending.take() {
            if let Reply::Answer(frame) = reply {
                out.write_frame(&frame)?;
            }
            pending = match rx.try_recv() {
                Ok(reply) => Some(reply),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
            };
        }
        out.flush()?;
    }
    Ok(ReconnectStats {
        bytes_written: out.bytes_written(),
        ..ReconnectStats::default()
    })
}
