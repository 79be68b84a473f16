//! Index checkpoint and metadata files.
//!
//! Both files are rewritten atomically (temp file + fsync + rename) and end
//! with a CRC32c over everything before it.
//!
//! ```text
//! metadata.vmm:
//! +------------------+--------+
//! | magic            | 4 bytes| = 0x564D_4D44 ("VMMD")
//! | format_version   | 2 bytes| = 1
//! | reserved         | 2 bytes|
//! | version          | 8 bytes| last committed copy
//! | first_leaf       | 8 bytes| u64::MAX when empty
//! | last_leaf        | 8 bytes| u64::MAX when empty
//! | leaf_count       | 8 bytes|
//! | root_hash        |32 bytes|
//! | label_len        | 4 bytes|
//! | label            | N bytes| UTF-8
//! | crc32c           | 4 bytes|
//! +------------------+--------+
//!
//! index.vmi:
//! +------------------+--------+
//! | magic            | 4 bytes| = 0x564D_434B ("VMCK")
//! | format_version   | 2 bytes| = 1
//! | reserved         | 2 bytes|
//! | covered_version  | 8 bytes| every record up to this version is indexed
//! | replay_file      | 4 bytes| data file where replay resumes
//! | replay_offset    | 8 bytes| offset in that file
//! | metadata         |  ...   | same fields as metadata.vmm (no magic/crc)
//! | live_file_count  | 4 bytes| then (file index u32, record count u64) each
//! | leaf_count       | 8 bytes| then (path u64, location u64) each
//! | hash_count       | 8 bytes| then (path u64, location u64) each
//! | bucket_count     | 4 bytes|
//! | key_count        | 8 bytes| then (key_hash u64, path u64) each
//! | crc32c           | 4 bytes|
//! +------------------+--------+
//! ```

use crate::index::{KeyBuckets, LongList};
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::Path as FsPath;
use vmap_error::{Result, VmapError};
use vmap_types::{
    HASH_SIZE, Hash, LeafRange, ParseError, Path, RecordLocation, Version, decode_optional_path,
    encode_optional_path, read_fixed, read_le_u32, read_le_u64, to_usize,
};

pub const METADATA_FILE: &str = "metadata.vmm";
pub const CHECKPOINT_FILE: &str = "index.vmi";

const METADATA_MAGIC: u32 = 0x564D_4D44;
const CHECKPOINT_MAGIC: u32 = 0x564D_434B;
const FORMAT_VERSION: u16 = 1;

/// Last consistent state of the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreMetadata {
    pub label: String,
    pub version: Version,
    pub range: LeafRange,
    pub root_hash: Hash,
}

impl StoreMetadata {
    #[must_use]
    pub fn empty(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            version: Version::ZERO,
            range: LeafRange::EMPTY,
            root_hash: vmap_hash::empty_tree_hash(),
        }
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.range.size()
    }
}

/// Indexed state captured by a checkpoint.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub covered_version: Version,
    pub replay_file: u32,
    pub replay_offset: u64,
    pub metadata: StoreMetadata,
    /// Live data files with the number of records each holds.
    pub live_files: Vec<(u32, u64)>,
    pub leaves: LongList,
    pub hashes: LongList,
    pub keys: KeyBuckets,
}

/// Simple CRC32c hasher for checkpoint verification.
struct Crc32cHasher {
    crc: u32,
}

impl Crc32cHasher {
    fn new() -> Self {
        Self { crc: 0 }
    }

    fn update(&mut self, data: &[u8]) {
        self.crc = crc32c::crc32c_append(self.crc, data);
    }

    fn finalize(self) -> u32 {
        self.crc
    }
}

/// Writer that checksums everything passing through it.
struct ChecksummedWriter<W: Write> {
    inner: W,
    hasher: Crc32cHasher,
}

impl<W: Write> ChecksummedWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Crc32cHasher::new(),
        }
    }

    fn put(&mut self, bytes: &[u8]) -> Result<()> {
        self.inner.write_all(bytes)?;
        self.hasher.update(bytes);
        Ok(())
    }

    fn put_u16(&mut self, value: u16) -> Result<()> {
        self.put(&value.to_le_bytes())
    }

    fn put_u32(&mut self, value: u32) -> Result<()> {
        self.put(&value.to_le_bytes())
    }

    fn put_u64(&mut self, value: u64) -> Result<()> {
        self.put(&value.to_le_bytes())
    }

    fn finish(mut self) -> Result<W> {
        let crc = self.hasher.finalize();
        self.inner.write_all(&crc.to_le_bytes())?;
        Ok(self.inner)
    }
}

fn put_metadata<W: Write>(out: &mut ChecksummedWriter<W>, metadata: &StoreMetadata) -> Result<()> {
    out.put_u64(metadata.version.0)?;
    out.put_u64(encode_optional_path(metadata.range.first()))?;
    out.put_u64(encode_optional_path(metadata.range.last()))?;
    out.put_u64(metadata.range.size())?;
    out.put(metadata.root_hash.as_bytes())?;
    let label = metadata.label.as_bytes();
    let label_len = u32::try_from(label.len())
        .map_err(|_| VmapError::InvalidConfig("label longer than u32::MAX bytes".to_owned()))?;
    out.put_u32(label_len)?;
    out.put(label)
}

/// Write `contents` to `path` atomically.
fn write_atomically(
    path: &FsPath,
    contents: impl FnOnce(&mut ChecksummedWriter<BufWriter<File>>) -> Result<()>,
) -> Result<()> {
    let temp_path = path.with_extension("tmp");
    {
        let file = File::create(&temp_path)?;
        let mut writer = ChecksummedWriter::new(BufWriter::new(file));
        contents(&mut writer)?;
        let mut inner = writer.finish()?;
        inner.flush()?;
        inner
            .into_inner()
            .map_err(|e| VmapError::Io(e.into_error()))?
            .sync_all()?;
    }
    fs::rename(&temp_path, path)?;
    Ok(())
}

pub fn write_metadata(dir: &FsPath, metadata: &StoreMetadata) -> Result<()> {
    write_atomically(&dir.join(METADATA_FILE), |out| {
        out.put_u32(METADATA_MAGIC)?;
        out.put_u16(FORMAT_VERSION)?;
        out.put_u16(0)?;
        put_metadata(out, metadata)
    })
}

pub fn write_checkpoint(dir: &FsPath, checkpoint: &Checkpoint) -> Result<()> {
    write_atomically(&dir.join(CHECKPOINT_FILE), |out| {
        out.put_u32(CHECKPOINT_MAGIC)?;
        out.put_u16(FORMAT_VERSION)?;
        out.put_u16(0)?;
        out.put_u64(checkpoint.covered_version.0)?;
        out.put_u32(checkpoint.replay_file)?;
        out.put_u64(checkpoint.replay_offset)?;
        put_metadata(out, &checkpoint.metadata)?;

        let live = u32::try_from(checkpoint.live_files.len())
            .map_err(|_| VmapError::Format("too many data files for checkpoint".to_owned()))?;
        out.put_u32(live)?;
        for (index, records) in &checkpoint.live_files {
            out.put_u32(*index)?;
            out.put_u64(*records)?;
        }
        for list in [&checkpoint.leaves, &checkpoint.hashes] {
            out.put_u64(list.populated() as u64)?;
            for (path, location) in list.iter() {
                out.put_u64(path.0)?;
                out.put_u64(location.0)?;
            }
        }
        let buckets = u32::try_from(checkpoint.keys.bucket_count())
            .map_err(|_| VmapError::Format("too many key buckets for checkpoint".to_owned()))?;
        out.put_u32(buckets)?;
        let entries = checkpoint.keys.entries();
        out.put_u64(entries.len() as u64)?;
        for entry in entries {
            out.put_u64(entry.key_hash)?;
            out.put_u64(entry.path.0)?;
        }
        Ok(())
    })
}

/// Read a whole file and verify its trailing CRC. Returns the payload.
fn read_verified(path: &FsPath, what: &str) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    File::open(path)?.read_to_end(&mut bytes)?;
    if bytes.len() < 8 {
        return Err(VmapError::Format(format!("{what} file too short")));
    }
    let crc_offset = bytes.len() - 4;
    let stored = u32::from_le_bytes([
        bytes[crc_offset],
        bytes[crc_offset + 1],
        bytes[crc_offset + 2],
        bytes[crc_offset + 3],
    ]);
    let computed = crc32c::crc32c(&bytes[..crc_offset]);
    if stored != computed {
        return Err(VmapError::Format(format!(
            "{what} CRC mismatch: stored {stored:#010x}, computed {computed:#010x}"
        )));
    }
    bytes.truncate(crc_offset);
    Ok(bytes)
}

/// Cursor over a verified payload.
struct Cursor<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn u16(&mut self) -> std::result::Result<u16, ParseError> {
        let value = u16::from_le_bytes(read_fixed::<2>(self.data, self.offset)?);
        self.offset += 2;
        Ok(value)
    }

    fn u32(&mut self) -> std::result::Result<u32, ParseError> {
        let value = read_le_u32(self.data, self.offset)?;
        self.offset += 4;
        Ok(value)
    }

    fn u64(&mut self) -> std::result::Result<u64, ParseError> {
        let value = read_le_u64(self.data, self.offset)?;
        self.offset += 8;
        Ok(value)
    }

    fn bytes(&mut self, len: usize) -> std::result::Result<&'a [u8], ParseError> {
        let slice = vmap_types::ensure_slice(self.data, self.offset, len)?;
        self.offset += len;
        Ok(slice)
    }

    fn header(&mut self, expected_magic: u32) -> std::result::Result<(), ParseError> {
        let magic = self.u32()?;
        if magic != expected_magic {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(expected_magic),
                actual: u64::from(magic),
            });
        }
        if self.u16()? != FORMAT_VERSION {
            return Err(ParseError::InvalidField {
                field: "format_version",
                reason: "unsupported",
            });
        }
        self.u16()?;
        Ok(())
    }

    fn metadata(&mut self) -> std::result::Result<StoreMetadata, ParseError> {
        let version = Version(self.u64()?);
        let first = decode_optional_path(self.u64()?);
        let last = decode_optional_path(self.u64()?);
        let range = LeafRange::from_bounds(first, last)?;
        let size = self.u64()?;
        if size != range.size() {
            return Err(ParseError::InvalidField {
                field: "leaf_count",
                reason: "disagrees with leaf range",
            });
        }
        let root_hash = Hash(read_fixed::<HASH_SIZE>(self.bytes(HASH_SIZE)?, 0)?);
        let label_len = to_usize(u64::from(self.u32()?), "label_len")?;
        let label = String::from_utf8(self.bytes(label_len)?.to_vec()).map_err(|_| {
            ParseError::InvalidField {
                field: "label",
                reason: "not UTF-8",
            }
        })?;
        Ok(StoreMetadata {
            label,
            version,
            range,
            root_hash,
        })
    }

    fn location_list(&mut self) -> std::result::Result<LongList, ParseError> {
        let count = self.u64()?;
        let mut list = LongList::new();
        for _ in 0..count {
            let path = Path(self.u64()?);
            let location = RecordLocation(self.u64()?);
            list.set(path, location);
        }
        Ok(list)
    }
}

fn format_error(what: &str, err: ParseError) -> VmapError {
    VmapError::Format(format!("{what}: {err}"))
}

pub fn read_metadata(dir: &FsPath) -> Result<Option<StoreMetadata>> {
    let path = dir.join(METADATA_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let payload = read_verified(&path, "metadata")?;
    let mut cursor = Cursor {
        data: &payload,
        offset: 0,
    };
    cursor
        .header(METADATA_MAGIC)
        .and_then(|()| cursor.metadata())
        .map(Some)
        .map_err(|e| format_error("metadata", e))
}

pub fn read_checkpoint(dir: &FsPath) -> Result<Option<Checkpoint>> {
    let path = dir.join(CHECKPOINT_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let payload = read_verified(&path, "checkpoint")?;
    let mut cursor = Cursor {
        data: &payload,
        offset: 0,
    };
    let parse = |cursor: &mut Cursor<'_>| -> std::result::Result<Checkpoint, ParseError> {
        cursor.header(CHECKPOINT_MAGIC)?;
        let covered_version = Version(cursor.u64()?);
        let replay_file = cursor.u32()?;
        let replay_offset = cursor.u64()?;
        let metadata = cursor.metadata()?;
        let live_count = cursor.u32()?;
        let mut live_files = Vec::with_capacity(live_count as usize);
        for _ in 0..live_count {
            let index = cursor.u32()?;
            live_files.push((index, cursor.u64()?));
        }
        let leaves = cursor.location_list()?;
        let hashes = cursor.location_list()?;
        let bucket_count = cursor.u32()?;
        let key_count = cursor.u64()?;
        let mut keys = KeyBuckets::new(bucket_count);
        for _ in 0..key_count {
            let key_hash = cursor.u64()?;
            let path = Path(cursor.u64()?);
            keys.insert(key_hash, path);
        }
        Ok(Checkpoint {
            covered_version,
            replay_file,
            replay_offset,
            metadata,
            live_files,
            leaves,
            hashes,
            keys,
        })
    };
    parse(&mut cursor)
        .map(Some)
        .map_err(|e| format_error("checkpoint", e))
}
