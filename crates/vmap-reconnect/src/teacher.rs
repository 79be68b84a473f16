//! Authoritative side of a reconnect session.
//!
//! The teacher walks its tree top-down. The writer thread turns queued
//! work into frames by reading the teacher's [`RecordAccessor`]; the reader
//! thread consumes the learner's answers in the order the hashes went out
//! and decides what to queue next:
//!
//! | Answer | Node | Next |
//! |--------|------|------|
//! | MATCH | any | nothing, the subtree is pruned |
//! | MISMATCH | internal | SUBTREE_HASH for each child inside the tree |
//! | MISMATCH | leaf | LEAF_RECORD |
//!
//! Once no answer is outstanding the reader queues DONE and stops reading.

use crate::config::{ReconnectConfig, apply_socket_timeouts};
use crate::session::{ReconnectStats, join, next_item, settle};
use crate::wire::{Frame, FrameReader, FrameWriter};
use std::collections::VecDeque;
use std::io::{BufWriter, Read, Write};
use std::net::TcpStream;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::thread;
use std::time::Instant;
use tracing::{debug, info, warn};
use vmap_core::RecordAccessor;
use vmap_error::{Result, VmapError};
use vmap_types::{LeafRange, Path};

/// Work handed from the reader thread to the writer thread.
#[derive(Debug)]
enum Outgoing {
    Shape,
    Hash(Path),
    Leaf(Path),
    Done,
    Abort(String),
    /// An answer arrived that queues no frame; resets the writer's wait.
    Progress,
}

/// Serve `tree` to a learner over `stream`.
pub fn teach_stream(
    tree: &RecordAccessor,
    stream: &TcpStream,
    config: &ReconnectConfig,
) -> Result<ReconnectStats> {
    apply_socket_timeouts(stream, config)?;
    teach(tree, stream.try_clone()?, stream, config)
}

/// Serve `tree` to a learner: read answers from `reader`, write frames to
/// `writer`.
///
/// Fails with `ReconnectAborted` when the divergence limit is exceeded
/// (after telling the learner), `ProtocolViolation` on unexpected answers
/// and `Timeout` when the learner goes quiet.
pub fn teach<R, W>(
    tree: &RecordAccessor,
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
    let range = tree.leaf_range();
    info!(
        target: "vmap::reconnect",
        role = "teacher",
        label = tree.label(),
        version = tree.version().0,
        size = range.size(),
        root = %tree.root_hash(),
        "reconnect_started"
    );

    let (tx, rx) = mpsc::channel();
    // Queued before either thread runs; the channel is unbounded.
    let _ = tx.send(Outgoing::Shape);
    let first = if range.is_empty() {
        let _ = tx.send(Outgoing::Done);
        None
    } else {
        let _ = tx.send(Outgoing::Hash(Path::ROOT));
        Some(Path::ROOT)
    };

    let outcome = thread::scope(|scope| {
        let sender = thread::Builder::new()
            .name("vmap-teach-send".to_owned())
            .spawn_scoped(scope, move || send_frames(tree, writer, &rx, config))?;
        let receiver = thread::Builder::new()
            .name("vmap-teach-recv".to_owned())
            .spawn_scoped(scope, move || receive_answers(range, first, reader, &tx, config))?;
        settle(join(receiver, "reconnect reader"), join(sender, "reconnect writer"))
    });

    match outcome {
        Ok((received, sent)) => {
            let stats = received.combine(sent);
            info!(
                target: "vmap::reconnect",
                role = "teacher",
                label = tree.label(),
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
                role = "teacher",
                label = tree.label(),
                error = %err,
                "reconnect_failed"
            );
            Err(err)
        }
    }
}

// ── Reader thread ────────────────────────────────────────────────────────────

fn receive_answers<R: Read>(
    range: LeafRange,
    first: Option<Path>,
    reader: R,
    tx: &Sender<Outgoing>,
    config: &ReconnectConfig,
) -> Result<ReconnectStats> {
    let mut frames = FrameReader::new(reader, config);
    let mut stats = ReconnectStats::default();
    let mut expected: VecDeque<Path> = first.into_iter().collect();
    let mut divergent = 0_u64;
    let queue = |item: Outgoing| tx.send(item).map_err(|_| VmapError::Cancelled);

    while let Some(want) = expected.pop_front() {
        let (path, matched) = match frames.read_frame()? {
            Frame::Match(path) => (path, true),
            Frame::Mismatch(path) => (path, false),
            other => {
                return Err(VmapError::protocol(format!(
                    "teacher expected an answer for node {want}, got {other}"
                )));
            }
        };
        if path != want {
            return Err(VmapError::protocol(format!(
                "answer for node {path} arrived while node {want} was next"
            )));
        }
        if matched {
            stats.matches += 1;
            queue(Outgoing::Progress)?;
            continue;
        }
        stats.mismatches += 1;

        if config.abort_rank == Some(path.rank()) {
            divergent += 1;
            if let Some(limit) = config.max_divergent_subtrees {
                if divergent > limit {
                    let reason = format!(
                        "more than {limit} subtrees differ at rank {}",
                        path.rank()
                    );
                    // The writer may already be gone; the abort stands either way.
                    let _ = tx.send(Outgoing::Abort(reason.clone()));
                    return Err(VmapError::ReconnectAborted(reason));
                }
            }
        }

        if range.is_leaf(path) {
            queue(Outgoing::Leaf(path))?;
            continue;
        }
        for child in [path.left_child(), path.right_child()].into_iter().flatten() {
            if range.contains(child) {
                queue(Outgoing::Hash(child))?;
                expected.push_back(child);
            }
        }
    }

    if first.is_some() {
        queue(Outgoing::Done)?;
    }
    stats.bytes_read = frames.bytes_read();
    debug!(
        target: "vmap::reconnect",
        role = "teacher",
        matches = stats.matches,
        mismatches = stats.mismatches,
        "answers_complete"
    );
    Ok(stats)
}

// ── Writer thread ────────────────────────────────────────────────────────────

fn send_frames<W: Write>(
    tree: &RecordAccessor,
    writer: W,
    rx: &Receiver<Outgoing>,
    config: &ReconnectConfig,
) -> Result<ReconnectStats> {
    let mut out = FrameWriter::new(BufWriter::new(writer), config);
    let mut stats = ReconnectStats::default();
    let timeout = config.read_timeout();

    while let Some(item) = next_item(rx, timeout, config.read_timeout_ms)? {
        if matches!(item, Outgoing::Progress) {
            continue;
        }
        let mut last = write_item(tree, &mut out, &mut stats, item)?;
        // Write whatever else is queued, then flush once.
        while !last {
            match rx.try_recv() {
                Ok(item) => last = write_item(tree, &mut out, &mut stats, item)?,
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }
        out.flush()?;
        if last {
            break;
        }
    }
    stats.bytes_written = out.bytes_written();
    Ok(stats)
}

/// Write the frame for `item`, if it has one. Returns whether it ended the
/// session.
fn write_item<W: Write>(
    tree: &RecordAccessor,
    out: &mut FrameWriter<W>,
    stats: &mut ReconnectStats,
    item: Outgoing,
) -> Result<bool> {
    let frame = match item {
        Outgoing::Shape => Frame::TreeShape {
            range: tree.leaf_range(),
            root_hash: tree.root_hash(),
            label: tree.label().to_owned(),
        },
        Outgoing::Hash(path) => {
            let hash = if path == Path::ROOT {
                tree.root_hash()
            } else {
                tree.hash(path)?.ok_or_else(|| {
                    VmapError::Format(format!("teacher tree has no hash for node {path}"))
                })?
            };
            stats.hashes_sent += 1;
            Frame::SubtreeHash { path, hash }
        }
        Outgoing::Leaf(path) => {
            let leaf = tree.leaf(path)?.ok_or_else(|| {
                VmapError::Format(format!("teacher tree has no record for leaf {path}"))
            })?;
            stats.leaves_sent += 1;
            stats.leaf_bytes += (leaf.key.len() + leaf.value.len()) as u64;
            Frame::Leaf(leaf)
        }
        Outgoing::Done => Frame::Done,
        Outgoing::Abort(reason) => Frame::Abort { reason },
        Outgoing::Progress => return Ok(false),
    };
    let last = matches!(frame, Frame::Done | Frame::Abort { .. });
    out.write_frame(&frame)?;
    Ok(last)
}
