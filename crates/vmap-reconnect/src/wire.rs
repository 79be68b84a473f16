//! Reconnect frames and their byte encoding.
//!
//! # Format
//!
//! ```text
//! Every frame:
//! +------------------+--------+
//! | path             | 8 bytes| signed, big-endian; -1 for session frames
//! | kind             | 1 byte |
//! | body             | N bytes| kind specific
//! +------------------+--------+
//!
//! Teacher → learner
//!   1 TREE_SHAPE     (-1)   first i64 | last i64 | root_hash [32] | label_len i32 | label
//!   2 SUBTREE_HASH   (path) hash [32]
//!   3 LEAF_RECORD    (path) key_len i32 | key | value_len i32 | value
//!   4 DONE           (-1)
//!   5 ABORT          (-1)   reason_len i32 | reason
//!
//! Learner → teacher
//!   6 MATCH          (path)
//!   7 MISMATCH       (path)
//! ```
//!
//! `first`/`last` are -1 for an empty tree. Lengths are signed: -1 is
//! reserved and any negative length is a protocol violation, 0 is an
//! explicit empty value. Lengths above the configured frame limit are
//! refused before any allocation.
//!
//! # Reads
//!
//! [`FrameReader`] keeps reading until every byte of a field has arrived,
//! retrying short reads and `Interrupted`. A stream that ends mid-frame,
//! or before a frame the session still expects, is a protocol violation.
//! A read that times out (`WouldBlock`/`TimedOut` from a socket with a read
//! timeout) becomes `VmapError::Timeout`.

use crate::config::ReconnectConfig;
use std::fmt;
use std::io::{ErrorKind, Read, Write};
use vmap_error::{Result, VmapError};
use vmap_types::{HASH_SIZE, Hash, LeafRange, LeafRecord, Path};

/// Path written by frames that are not about one node.
pub const NO_PATH: i64 = -1;

pub const KIND_TREE_SHAPE: u8 = 1;
pub const KIND_SUBTREE_HASH: u8 = 2;
pub const KIND_LEAF_RECORD: u8 = 3;
pub const KIND_DONE: u8 = 4;
pub const KIND_ABORT: u8 = 5;
pub const KIND_MATCH: u8 = 6;
pub const KIND_MISMATCH: u8 = 7;

/// Path plus kind.
pub const FRAME_HEADER_LEN: usize = 9;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    TreeShape {
        range: LeafRange,
        root_hash: Hash,
        label: String,
    },
    SubtreeHash {
        path: Path,
        hash: Hash,
    },
    Leaf(LeafRecord),
    Done,
    Abort {
        reason: String,
    },
    Match(Path),
    Mismatch(Path),
}

impl Frame {
    #[must_use]
    pub fn kind(&self) -> u8 {
        match self {
            Self::TreeShape { .. } => KIND_TREE_SHAPE,
            Self::SubtreeHash { .. } => KIND_SUBTREE_HASH,
            Self::Leaf(_) => KIND_LEAF_RECORD,
            Self::Done => KIND_DONE,
            Self::Abort { .. } => KIND_ABORT,
            Self::Match(_) => KIND_MATCH,
            Self::Mismatch(_) => KIND_MISMATCH,
        }
    }

    /// Node the frame is about, `None` for session frames.
    #[must_use]
    pub fn path(&self) -> Option<Path> {
        match self {
            Self::SubtreeHash { path, .. } | Self::Match(path) | Self::Mismatch(path) => Some(*path),
            Self::Leaf(leaf) => Some(leaf.path),
            Self::TreeShape { .. } | Self::Done | Self::Abort { .. } => None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + HASH_SIZE);
        let path = match self.path() {
            Some(path) => wire_path(path)?,
            None => NO_PATH,
        };
        buf.extend_from_slice(&path.to_be_bytes());
        buf.push(self.kind());
        match self {
            Self::TreeShape {
                range,
                root_hash,
                label,
            } => {
                buf.extend_from_slice(&optional_wire_path(range.first())?.to_be_bytes());
                buf.extend_from_slice(&optional_wire_path(range.last())?.to_be_bytes());
                buf.extend_from_slice(root_hash.as_bytes());
                push_len_prefixed(&mut buf, label.as_bytes(), "label")?;
            }
            Self::SubtreeHash { hash, .. } => buf.extend_from_slice(hash.as_bytes()),
            Self::Leaf(leaf) => {
                push_len_prefixed(&mut buf, &leaf.key, "key")?;
                push_len_prefixed(&mut buf, &leaf.value, "value")?;
            }
            Self::Abort { reason } => push_len_prefixed(&mut buf, reason.as_bytes(), "reason")?,
            Self::Done | Self::Match(_) | Self::Mismatch(_) => {}
        }
        Ok(buf)
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::TreeShape { .. } => "TREE_SHAPE",
            Self::SubtreeHash { .. } => "SUBTREE_HASH",
            Self::Leaf(_) => "LEAF_RECORD",
            Self::Done => "DONE",
            Self::Abort { .. } => "ABORT",
            Self::Match(_) => "MATCH",
            Self::Mismatch(_) => "MISMATCH",
        };
        match self.path() {
            Some(path) => write!(f, "{name}({path})"),
            None => f.write_str(name),
        }
    }
}

fn wire_path(path: Path) -> Result<i64> {
    i64::try_from(path.0)
        .map_err(|_| VmapError::protocol(format!("path {path} does not fit a signed 64-bit field")))
}

fn optional_wire_path(path: Option<Path>) -> Result<i64> {
    path.map_or(Ok(NO_PATH), wire_path)
}

fn push_len_prefixed(buf: &mut Vec<u8>, bytes: &[u8], field: &str) -> Result<()> {
    let len = i32::try_from(bytes.len())
        .map_err(|_| VmapError::protocol(format!("{field} of {} bytes is too long", bytes.len())))?;
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(bytes);
    Ok(())
}

// ── Reading ──────────────────────────────────────────────────────────────────

/// Frame decoder over a byte stream.
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
    max_frame_bytes: usize,
    timeout_millis: u64,
    bytes_read: u64,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R, config: &ReconnectConfig) -> Self {
        Self {
            inner,
            max_frame_bytes: config.max_frame_bytes as usize,
            timeout_millis: config.read_timeout_ms,
            bytes_read: 0,
        }
    }

    #[must_use]
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn read_frame(&mut self) -> Result<Frame> {
        let mut header = [0_u8; FRAME_HEADER_LEN];
        self.read_full(&mut header, "frame header")?;
        let mut raw_path = [0_u8; 8];
        raw_path.copy_from_slice(&header[..8]);
        let raw_path = i64::from_be_bytes(raw_path);
        let kind = header[8];

        match kind {
            KIND_TREE_SHAPE => {
                self.expect_no_path(raw_path, kind)?;
                let first = self.read_optional_path("first leaf")?;
                let last = self.read_optional_path("last leaf")?;
                let range = LeafRange::from_bounds(first, last)
                    .map_err(|err| VmapError::protocol(format!("tree shape: {err}")))?;
                let root_hash = self.read_hash()?;
                let label = self.read_string("label")?;
                Ok(Frame::TreeShape {
                    range,
                    root_hash,
                    label,
                })
            }
            KIND_SUBTREE_HASH => {
                let path = node_path(raw_path, kind)?;
                let hash = self.read_hash()?;
                Ok(Frame::SubtreeHash { path, hash })
            }
            KIND_LEAF_RECORD => {
                let path = node_path(raw_path, kind)?;
                let key = self.read_bytes("key")?;
                let value = self.read_bytes("value")?;
                Ok(Frame::Leaf(LeafRecord::new(path, key, value)))
            }
            KIND_DONE => {
                self.expect_no_path(raw_path, kind)?;
                Ok(Frame::Done)
            }
            KIND_ABORT => {
                self.expect_no_path(raw_path, kind)?;
                let reason = self.read_string("reason")?;
                Ok(Frame::Abort { reason })
            }
            KIND_MATCH => Ok(Frame::Match(node_path(raw_path, kind)?)),
            KIND_MISMATCH => Ok(Frame::Mismatch(node_path(raw_path, kind)?)),
            other => Err(VmapError::protocol(format!("unknown frame kind {other}"))),
        }
    }

    /// Fill `buf` completely.
    fn read_full(&mut self, buf: &mut [u8], what: &str) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.inner.read(&mut buf[filled..]) {
                Ok(0) => {
                    return Err(VmapError::protocol(format!(
                        "stream ended after {filled} of {} bytes of {what}",
                        buf.len()
                    )));
                }
                Ok(n) => {
                    filled += n;
                    self.bytes_read += n as u64;
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Err(VmapError::Timeout {
                        millis: self.timeout_millis,
                    });
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    fn expect_no_path(&self, raw_path: i64, kind: u8) -> Result<()> {
        if raw_path != NO_PATH {
            return Err(VmapError::protocol(format!(
                "frame kind {kind} carries path {raw_path} instead of {NO_PATH}"
            )));
        }
        Ok(())
    }

    fn read_i64(&mut self, what: &str) -> Result<i64> {
        let mut raw = [0_u8; 8];
        self.read_full(&mut raw, what)?;
        Ok(i64::from_be_bytes(raw))
    }

    fn read_optional_path(&mut self, what: &str) -> Result<Option<Path>> {
        match self.read_i64(what)? {
            NO_PATH => Ok(None),
            raw if raw < 0 => Err(VmapError::protocol(format!("{what} path {raw} is negative"))),
            raw => Ok(Some(Path(raw.unsigned_abs()))),
        }
    }

    fn read_hash(&mut self) -> Result<Hash> {
        let mut raw = [0_u8; HASH_SIZE];
        self.read_full(&mut raw, "hash")?;
        Ok(Hash(raw))
    }

    fn read_len(&mut self, what: &str) -> Result<usize> {
        let mut raw = [0_u8; 4];
        self.read_full(&mut raw, what)?;
        let len = i32::from_be_bytes(raw);
        if len == -1 {
            return Err(VmapError::protocol(format!("{what} length -1 is reserved")));
        }
        let len = usize::try_from(len)
            .map_err(|_| VmapError::protocol(format!("{what} length {len} is negative")))?;
        if len > self.max_frame_bytes {
            return Err(VmapError::protocol(format!(
                "{what} length {len} exceeds the frame limit of {} bytes",
                self.max_frame_bytes
            )));
        }
        Ok(len)
    }

    fn read_bytes(&mut self, what: &str) -> Result<Vec<u8>> {
        let len = self.read_len(what)?;
        let mut bytes = vec![0_u8; len];
        self.read_full(&mut bytes, what)?;
        Ok(bytes)
    }

    fn read_string(&mut self, what: &str) -> Result<String> {
        String::from_utf8(self.read_bytes(what)?)
            .map_err(|_| VmapError::protocol(format!("{what} is not UTF-8")))
    }
}

fn node_path(raw_path: i64, kind: u8) -> Result<Path> {
    u64::try_from(raw_path)
        .map(Path)
        .map_err(|_| VmapError::protocol(format!("frame kind {kind} carries path {raw_path}")))
}

// ── Writing ──────────────────────────────────────────────────────────────────

/// Frame encoder over a byte stream.
#[derive(Debug)]
pub struct FrameWriter<W> {
    inner: W,
    timeout_millis: u64,
    bytes_written: u64,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(inner: W, config: &ReconnectConfig) -> Self {
        Self {
            inner,
            timeout_millis: config.read_timeout_ms,
            bytes_written: 0,
        }
    }

    #[must_use]
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        let bytes = frame.encode()?;
        self.inner.write_all(&bytes).map_err(|err| self.io_error(err))?;
        self.bytes_written += bytes.len() as u64;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.inner.flush().map_err(|err| self.io_error(err))
    }

    fn io_error(&self, err: std::io::Error) -> VmapError {
        match err.kind() {
            ErrorKind::WouldBlock | ErrorKind::TimedOut => VmapError::Timeout {
                millis: self.timeout_millis,
            },
            _ => err.into(),
        }
    }
}
