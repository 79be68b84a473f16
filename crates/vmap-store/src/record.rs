//! Data file and record formats.
//!
//! Every data file is an append-only sequence of checksummed records.
//!
//! # Format Overview
//!
//! ```text
//! Data File (data/NNNNNNNN.vmd):
//! +----------------+
//! | File Header    |  (16 bytes)
//! +----------------+
//! | Record         |  (variable)
//! +----------------+
//! | ...            |
//! +----------------+
//!
//! File Header:
//! +------------------+--------+
//! | magic            | 4 bytes| = 0x564D_4446 ("VMDF")
//! | version          | 2 bytes| = 1
//! | checksum_type    | 2 bytes| = 0 (CRC32c)
//! | file_index       | 4 bytes|
//! | reserved         | 4 bytes| = 0
//! +------------------+--------+
//!
//! Record:
//! +------------------+--------+
//! | record_len       | 4 bytes| length of record (excluding this field)
//! | record_kind      | 1 byte | 1 = leaf, 2 = hash, 3 = commit
//! | body             | N bytes| kind specific, see below
//! | record_crc       | 4 bytes| CRC32c of kind + body
//! +------------------+--------+
//!
//! Leaf body:    version u64 | path u64 | key_len u32 | key | value_len u32 | value
//! Hash body:    version u64 | path u64 | hash [32]
//! Commit body:  version u64 | first_leaf u64 | last_leaf u64 | root_hash [32]
//! ```
//!
//! A commit record closes one flush batch. Leaf and hash records carry the
//! version of the batch that wrote them so that replay can order records
//! relocated by compaction.
//!
//! # Invariants
//!
//! - Every record is checksummed; a mismatch on a live read is fatal.
//! - Records after the last commit marker are never indexed.
//! - Decoding is driven by an explicit [`RecordRegistry`] passed at
//!   construction, never by a process-wide table.

use std::collections::HashMap;
use vmap_error::{Result, VmapError};
use vmap_types::{
    HASH_SIZE, Hash, HashRecord, LeafRange, LeafRecord, ParseError, Path, Version,
    decode_optional_path, encode_optional_path, read_fixed, read_le_u32, read_le_u64, to_usize,
};

/// Data file magic number ("VMDF").
pub const DATA_MAGIC: u32 = 0x564D_4446;

/// Current data file format version.
pub const DATA_FORMAT_VERSION: u16 = 1;

/// Checksum type: CRC32c.
pub const CHECKSUM_TYPE_CRC32C: u16 = 0;

/// File header size in bytes.
pub const HEADER_SIZE: usize = 16;

/// Framing overhead: length prefix, kind byte and trailing CRC.
pub const FRAME_OVERHEAD: usize = 4 + 1 + 4;

/// Upper bound on a single record; larger length prefixes are corruption.
pub const MAX_RECORD_LEN: usize = 64 * 1024 * 1024;

pub const RECORD_KIND_LEAF: u8 = 1;
pub const RECORD_KIND_HASH: u8 = 2;
pub const RECORD_KIND_COMMIT: u8 = 3;

/// End of one committed flush batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitMarker {
    pub version: Version,
    pub range: LeafRange,
    pub root_hash: Hash,
}

/// A decoded record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredRecord {
    Leaf { version: Version, leaf: LeafRecord },
    Hash { version: Version, record: HashRecord },
    Commit(CommitMarker),
}

impl StoredRecord {
    #[must_use]
    pub fn kind(&self) -> u8 {
        match self {
            Self::Leaf { .. } => RECORD_KIND_LEAF,
            Self::Hash { .. } => RECORD_KIND_HASH,
            Self::Commit(_) => RECORD_KIND_COMMIT,
        }
    }

    #[must_use]
    pub fn version(&self) -> Version {
        match self {
            Self::Leaf { version, .. } | Self::Hash { version, .. } => *version,
            Self::Commit(marker) => marker.version,
        }
    }
}

/// Data file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataFileHeader {
    pub magic: u32,
    pub version: u16,
    pub checksum_type: u16,
    pub file_index: u32,
}

impl DataFileHeader {
    #[must_use]
    pub fn new(file_index: u32) -> Self {
        Self {
            magic: DATA_MAGIC,
            version: DATA_FORMAT_VERSION,
            checksum_type: CHECKSUM_TYPE_CRC32C,
            file_index,
        }
    }
}

#[must_use]
pub fn encode_header(header: &DataFileHeader) -> [u8; HEADER_SIZE] {
    let mut buf = [0_u8; HEADER_SIZE];
    buf[0..4].copy_from_slice(&header.magic.to_le_bytes());
    buf[4..6].copy_from_slice(&header.version.to_le_bytes());
    buf[6..8].copy_from_slice(&header.checksum_type.to_le_bytes());
    buf[8..12].copy_from_slice(&header.file_index.to_le_bytes());
    // bytes 12..16 are reserved (zeros)
    buf
}

pub fn decode_header(bytes: &[u8]) -> Result<DataFileHeader> {
    if bytes.len() < HEADER_SIZE {
        return Err(VmapError::Format(format!(
            "data file header too short: {} bytes, need {HEADER_SIZE}",
            bytes.len()
        )));
    }
    let magic = u32::from_le_bytes(fixed(bytes, 0)?);
    if magic != DATA_MAGIC {
        return Err(VmapError::Format(format!(
            "data file magic mismatch: expected {DATA_MAGIC:#010x}, got {magic:#010x}"
        )));
    }
    let version = u16::from_le_bytes(fixed(bytes, 4)?);
    if version != DATA_FORMAT_VERSION {
        return Err(VmapError::Format(format!(
            "unsupported data file version: {version} (expected {DATA_FORMAT_VERSION})"
        )));
    }
    let checksum_type = u16::from_le_bytes(fixed(bytes, 6)?);
    if checksum_type != CHECKSUM_TYPE_CRC32C {
        return Err(VmapError::Format(format!(
            "unsupported checksum type: {checksum_type}"
        )));
    }
    let file_index = u32::from_le_bytes(fixed(bytes, 8)?);
    Ok(DataFileHeader {
        magic,
        version,
        checksum_type,
        file_index,
    })
}

fn fixed<const N: usize>(bytes: &[u8], offset: usize) -> Result<[u8; N]> {
    read_fixed::<N>(bytes, offset).map_err(|e| VmapError::Format(e.to_string()))
}

// ── Encoding ────────────────────────────────────────────────────────────────

/// Encode a record with its length prefix and trailing CRC.
pub fn encode_record(record: &StoredRecord) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    body.push(record.kind());
    match record {
        StoredRecord::Leaf { version, leaf } => {
            body.extend_from_slice(&version.0.to_le_bytes());
            body.extend_from_slice(&leaf.path.0.to_le_bytes());
            push_len_prefixed(&mut body, &leaf.key, "key")?;
            push_len_prefixed(&mut body, &leaf.value, "value")?;
        }
        StoredRecord::Hash { version, record } => {
            body.extend_from_slice(&version.0.to_le_bytes());
            body.extend_from_slice(&record.path.0.to_le_bytes());
            body.extend_from_slice(record.hash.as_bytes());
        }
        StoredRecord::Commit(marker) => {
            body.extend_from_slice(&marker.version.0.to_le_bytes());
            body.extend_from_slice(&encode_optional_path(marker.range.first()).to_le_bytes());
            body.extend_from_slice(&encode_optional_path(marker.range.last()).to_le_bytes());
            body.extend_from_slice(marker.root_hash.as_bytes());
        }
    }

    let record_len = body
        .len()
        .checked_add(4)
        .filter(|len| *len <= MAX_RECORD_LEN)
        .ok_or_else(|| VmapError::CapacityExceeded("record exceeds maximum size".to_owned()))?;
    let crc = crc32c::crc32c(&body);

    let mut buf = Vec::with_capacity(4 + record_len);
    let record_len = u32::try_from(record_len)
        .map_err(|_| VmapError::CapacityExceeded("record length exceeds u32".to_owned()))?;
    buf.extend_from_slice(&record_len.to_le_bytes());
    buf.extend_from_slice(&body);
    buf.extend_from_slice(&crc.to_le_bytes());
    Ok(buf)
}

fn push_len_prefixed(buf: &mut Vec<u8>, bytes: &[u8], field: &str) -> Result<()> {
    let len = u32::try_from(bytes.len())
        .map_err(|_| VmapError::CapacityExceeded(format!("{field} length exceeds u32")))?;
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(bytes);
    Ok(())
}

// ── Decoding ────────────────────────────────────────────────────────────────

/// Decoder for one record kind. Receives the body after the kind byte.
pub type RecordDecoder = fn(&[u8]) -> std::result::Result<StoredRecord, ParseError>;

/// Record kind tag → decoder table.
#[derive(Debug, Clone, Default)]
pub struct RecordRegistry {
    decoders: HashMap<u8, RecordDecoder>,
}

impl RecordRegistry {
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry for the leaf, hash and commit records written by this crate.
    #[must_use]
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        registry.decoders.insert(RECORD_KIND_LEAF, decode_leaf_body);
        registry.decoders.insert(RECORD_KIND_HASH, decode_hash_body);
        registry.decoders.insert(RECORD_KIND_COMMIT, decode_commit_body);
        registry
    }

    /// Register a decoder for `kind`. Each kind may be registered once.
    pub fn register(&mut self, kind: u8, decoder: RecordDecoder) -> Result<()> {
        if self.decoders.contains_key(&kind) {
            return Err(VmapError::InvalidConfig(format!(
                "record kind {kind} registered twice"
            )));
        }
        self.decoders.insert(kind, decoder);
        Ok(())
    }

    #[must_use]
    pub fn decoder(&self, kind: u8) -> Option<RecordDecoder> {
        self.decoders.get(&kind).copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }
}

fn decode_leaf_body(body: &[u8]) -> std::result::Result<StoredRecord, ParseError> {
    let version = Version(read_le_u64(body, 0)?);
    let path = Path(read_le_u64(body, 8)?);
    let key_len = to_usize(u64::from(read_le_u32(body, 16)?), "key_len")?;
    let key_start = 20_usize;
    let key = vmap_types::ensure_slice(body, key_start, key_len)?.to_vec();
    let value_len_at = key_start + key_len;
    let value_len = to_usize(u64::from(read_le_u32(body, value_len_at)?), "value_len")?;
    let value = vmap_types::ensure_slice(body, value_len_at + 4, value_len)?.to_vec();
    if value_len_at + 4 + value_len != body.len() {
        return Err(ParseError::InvalidField {
            field: "leaf_record",
            reason: "trailing bytes after value",
        });
    }
    Ok(StoredRecord::Leaf {
        version,
        leaf: LeafRecord::new(path, key, value),
    })
}

fn decode_hash_body(body: &[u8]) -> std::result::Result<StoredRecord, ParseError> {
    if body.len() != 16 + HASH_SIZE {
        return Err(ParseError::InvalidField {
            field: "hash_record",
            reason: "unexpected body length",
        });
    }
    let version = Version(read_le_u64(body, 0)?);
    let path = Path(read_le_u64(body, 8)?);
    let hash = Hash(read_fixed::<HASH_SIZE>(body, 16)?);
    Ok(StoredRecord::Hash {
        version,
        record: HashRecord { path, hash },
    })
}

fn decode_commit_body(body: &[u8]) -> std::result::Result<StoredRecord, ParseError> {
    if body.len() != 24 + HASH_SIZE {
        return Err(ParseError::InvalidField {
            field: "commit_record",
            reason: "unexpected body length",
        });
    }
    let version = Version(read_le_u64(body, 0)?);
    let first = decode_optional_path(read_le_u64(body, 8)?);
    let last = decode_optional_path(read_le_u64(body, 16)?);
    let range = LeafRange::from_bounds(first, last)?;
    let root_hash = Hash(read_fixed::<HASH_SIZE>(body, 24)?);
    Ok(StoredRecord::Commit(CommitMarker {
        version,
        range,
        root_hash,
    }))
}

/// Result of attempting to decode a record from a byte stream.
#[derive(Debug)]
pub enum DecodeResult {
    /// Successfully decoded a record spanning `size` bytes.
    Record { record: StoredRecord, size: usize },
    /// Need at least this many bytes to complete the record.
    NeedMore(usize),
    /// Record is corrupted (CRC mismatch or invalid format).
    Corrupted(String),
    /// Reached end of valid data (zero padding).
    EndOfData,
}

/// Decode the record at the start of `bytes`.
#[must_use]
pub fn decode_record(bytes: &[u8], registry: &RecordRegistry) -> DecodeResult {
    if bytes.is_empty() {
        return DecodeResult::EndOfData;
    }
    if bytes.len() < 4 {
        return if bytes.iter().all(|b| *b == 0) {
            DecodeResult::EndOfData
        } else {
            DecodeResult::NeedMore(4)
        };
    }
    let record_len = match read_le_u32(bytes, 0) {
        Ok(len) => len as usize,
        Err(e) => return DecodeResult::Corrupted(format!("failed to read record length: {e}")),
    };
    if record_len == 0 {
        return DecodeResult::EndOfData;
    }
    if record_len < FRAME_OVERHEAD - 4 || record_len > MAX_RECORD_LEN {
        return DecodeResult::Corrupted(format!("implausible record length: {record_len}"));
    }
    let total = 4 + record_len;
    if bytes.len() < total {
        return DecodeResult::NeedMore(total);
    }
    match decode_frame_body(&bytes[4..total], registry) {
        Ok(record) => DecodeResult::Record {
            record,
            size: total,
        },
        Err(detail) => DecodeResult::Corrupted(detail),
    }
}

/// Decode a frame body (kind + body + crc, i.e. the bytes after the length
/// prefix).
pub fn decode_frame_body(
    frame: &[u8],
    registry: &RecordRegistry,
) -> std::result::Result<StoredRecord, String> {
    if frame.len() < FRAME_OVERHEAD - 4 {
        return Err("record too short for kind and CRC".to_owned());
    }
    let crc_offset = frame.len() - 4;
    let stored_crc = u32::from_le_bytes([
        frame[crc_offset],
        frame[crc_offset + 1],
        frame[crc_offset + 2],
        frame[crc_offset + 3],
    ]);
    let computed_crc = crc32c::crc32c(&frame[..crc_offset]);
    if stored_crc != computed_crc {
        return Err(format!(
            "CRC mismatch: stored {stored_crc:#010x}, computed {computed_crc:#010x}"
        ));
    }
    let kind = frame[0];
    let Some(decoder) = registry.decoder(kind) else {
        return Err(format!("unknown record kind: {kind}"));
    };
    decoder(&frame[1..crc_offset]).map_err(|e| format!("undecodable record body: {e}"))
}
