#![forbid(unsafe_code)]
//! Core value types shared by every virtual map crate.
//!
//! # Path Addressing
//!
//! The map is a conceptual complete binary tree. Nodes are addressed by
//! their breadth-first index:
//!
//! ```text
//!               0                rank 0
//!         1           2          rank 1
//!      3     4     5     6       rank 2
//!     7 8   9 10 11 12 13 14     rank 3
//! ```
//!
//! Children of `p` are `2p+1` and `2p+2`. A tree with `N` leaves keeps them
//! at exactly `[N-1, 2N-2]`; the single-leaf tree is special and keeps its
//! leaf at path 1 with path 2 absent.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Size of every Merkle hash in bytes.
pub const HASH_SIZE: usize = 32;

/// Node address in the virtual tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Path(pub u64);

impl Path {
    pub const ROOT: Self = Self(0);
    /// Path of the only leaf in a single-leaf tree.
    pub const FIRST_LEFT: Self = Self(1);

    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }

    #[must_use]
    pub fn is_root(self) -> bool {
        self.0 == 0
    }

    /// Left child, or `None` if the address space is exhausted.
    #[must_use]
    pub fn left_child(self) -> Option<Self> {
        self.0.checked_mul(2)?.checked_add(1).map(Self)
    }

    /// Right child, or `None` if the address space is exhausted.
    #[must_use]
    pub fn right_child(self) -> Option<Self> {
        self.0.checked_mul(2)?.checked_add(2).map(Self)
    }

    #[must_use]
    pub fn parent(self) -> Option<Self> {
        if self.0 == 0 {
            None
        } else {
            Some(Self((self.0 - 1) / 2))
        }
    }

    #[must_use]
    pub fn is_left(self) -> bool {
        self.0 % 2 == 1
    }

    #[must_use]
    pub fn sibling(self) -> Option<Self> {
        if self.0 == 0 {
            None
        } else if self.is_left() {
            Some(Self(self.0 + 1))
        } else {
            Some(Self(self.0 - 1))
        }
    }

    /// Depth of the node; the root has rank 0.
    #[must_use]
    pub fn rank(self) -> u32 {
        match self.0.checked_add(1) {
            Some(n) => 63 - n.leading_zeros(),
            None => 64,
        }
    }

    /// Whether this is the right-most node of its rank.
    #[must_use]
    pub fn is_far_right(self) -> bool {
        self.0.checked_add(2).is_some_and(u64::is_power_of_two)
    }

    /// First (left-most) path of `rank`.
    #[must_use]
    pub fn first_in_rank(rank: u32) -> Option<Self> {
        1_u64.checked_shl(rank).map(|v| Self(v - 1))
    }

    /// Whether `self` lies in the subtree rooted at `ancestor`.
    #[must_use]
    pub fn is_descendant_of(self, ancestor: Self) -> bool {
        let mut current = self;
        while current.0 > ancestor.0 {
            match current.parent() {
                Some(p) => current = p,
                None => return false,
            }
        }
        current == ancestor
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Merkle node hash.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Hash(pub [u8; HASH_SIZE]);

impl Hash {
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(HASH_SIZE * 2);
        for byte in self.0 {
            out.push_str(&format!("{byte:02x}"));
        }
        out
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Eight bytes are plenty to tell hashes apart in logs.
        let hex = self.to_hex();
        write!(f, "Hash({}..)", &hex[..16])
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Copy generation number. Strictly increasing along the pipeline.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Version(pub u64);

impl Version {
    pub const ZERO: Self = Self(0);

    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Physical record address: `(file_index << 40) | byte_offset`.
///
/// Offset 0 is always inside a data file header, so the packed value 0 is
/// free to mean "no record".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordLocation(pub u64);

impl RecordLocation {
    pub const NONE: Self = Self(0);
    const OFFSET_BITS: u32 = 40;
    const OFFSET_MASK: u64 = (1 << Self::OFFSET_BITS) - 1;
    pub const MAX_FILE_INDEX: u32 = (1 << 24) - 1;

    /// Pack a file index and offset, or `None` if either is out of range.
    #[must_use]
    pub fn new(file_index: u32, offset: u64) -> Option<Self> {
        if file_index > Self::MAX_FILE_INDEX || offset > Self::OFFSET_MASK {
            return None;
        }
        Some(Self((u64::from(file_index) << Self::OFFSET_BITS) | offset))
    }

    #[must_use]
    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub fn file_index(self) -> u32 {
        // Upper 24 bits only.
        (self.0 >> Self::OFFSET_BITS) as u32
    }

    #[must_use]
    pub fn offset(self) -> u64 {
        self.0 & Self::OFFSET_MASK
    }
}

/// A leaf: opaque key and value bytes stored at a leaf path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeafRecord {
    pub path: Path,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl LeafRecord {
    #[must_use]
    pub fn new(path: Path, key: Vec<u8>, value: Vec<u8>) -> Self {
        Self { path, key, value }
    }

    /// Same key and value relocated to `path`.
    #[must_use]
    pub fn with_path(&self, path: Path) -> Self {
        Self {
            path,
            key: self.key.clone(),
            value: self.value.clone(),
        }
    }

    /// Approximate heap footprint, used for flush thresholds.
    #[must_use]
    pub fn footprint(&self) -> usize {
        self.key.len() + self.value.len() + 48
    }
}

/// Hash of the node at `path`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HashRecord {
    pub path: Path,
    pub hash: Hash,
}

/// Occupied leaf range of a tree, `None` when the tree is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct LeafRange {
    range: Option<(Path, Path)>,
}

impl LeafRange {
    pub const EMPTY: Self = Self { range: None };

    /// Range of a complete tree with `size` leaves.
    #[must_use]
    pub fn for_size(size: u64) -> Option<Self> {
        match size {
            0 => Some(Self::EMPTY),
            1 => Some(Self {
                range: Some((Path::FIRST_LEFT, Path::FIRST_LEFT)),
            }),
            n => {
                let first = n - 1;
                let last = n.checked_mul(2)?.checked_sub(2)?;
                Some(Self {
                    range: Some((Path(first), Path(last))),
                })
            }
        }
    }

    /// Build from explicit bounds, validating that they describe a complete tree.
    pub fn from_bounds(first: Option<Path>, last: Option<Path>) -> Result<Self, ParseError> {
        match (first, last) {
            (None, None) => Ok(Self::EMPTY),
            (Some(first), Some(last)) => {
                let valid = if first.0 == 1 && last.0 == 1 {
                    true
                } else {
                    first.0 >= 1 && last.0.checked_sub(first.0) == Some(first.0)
                };
                if valid {
                    Ok(Self {
                        range: Some((first, last)),
                    })
                } else {
                    Err(ParseError::InvalidField {
                        field: "leaf_range",
                        reason: "bounds do not describe a complete tree",
                    })
                }
            }
            _ => Err(ParseError::InvalidField {
                field: "leaf_range",
                reason: "only one bound present",
            }),
        }
    }

    #[must_use]
    pub fn first(self) -> Option<Path> {
        self.range.map(|(first, _)| first)
    }

    #[must_use]
    pub fn last(self) -> Option<Path> {
        self.range.map(|(_, last)| last)
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        self.range.is_none()
    }

    #[must_use]
    pub fn size(self) -> u64 {
        self.range.map_or(0, |(first, last)| last.0 - first.0 + 1)
    }

    /// Whether `path` holds a leaf.
    #[must_use]
    pub fn is_leaf(self, path: Path) -> bool {
        self.range
            .is_some_and(|(first, last)| path >= first && path <= last)
    }

    /// Whether `path` holds an internal node (the root always does when
    /// the tree is non-empty).
    #[must_use]
    pub fn is_internal(self, path: Path) -> bool {
        self.range.is_some_and(|(first, _)| path < first)
    }

    /// Whether `path` is a node of the tree at all.
    #[must_use]
    pub fn contains(self, path: Path) -> bool {
        self.range.is_some_and(|(_, last)| path <= last)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed for {field}")]
    IntegerConversion { field: &'static str },
}

pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    Ok(u32::from_le_bytes(read_fixed::<4>(data, offset)?))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    Ok(u64::from_le_bytes(read_fixed::<8>(data, offset)?))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

/// Convert a length field to `usize`, failing on platforms where it does not fit.
#[inline]
pub fn to_usize(value: u64, field: &'static str) -> Result<usize, ParseError> {
    usize::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

/// Sentinel encoding of an absent path in on-disk records.
pub const NO_PATH: u64 = u64::MAX;

#[must_use]
pub fn encode_optional_path(path: Option<Path>) -> u64 {
    path.map_or(NO_PATH, Path::get)
}

#[must_use]
pub fn decode_optional_path(raw: u64) -> Option<Path> {
    if raw == NO_PATH { None } else { Some(Path(raw)) }
}
