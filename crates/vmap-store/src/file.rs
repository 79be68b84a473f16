//! Numbered data files: positional reads for any number of readers and a
//! single append handle for the writer.

use crate::record::{
    self, DataFileHeader, FRAME_OVERHEAD, HEADER_SIZE, MAX_RECORD_LEN, RecordRegistry,
    StoredRecord,
};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, warn};
use vmap_error::{Result, VmapError};
use vmap_types::RecordLocation;

pub const DATA_DIR: &str = "data";
pub const DATA_FILE_EXTENSION: &str = "vmd";

#[must_use]
pub fn data_file_name(index: u32) -> String {
    format!("{index:08}.{DATA_FILE_EXTENSION}")
}

/// Data files under `data_dir`, sorted by index.
pub fn list_data_files(data_dir: &FsPath) -> Result<Vec<(u32, PathBuf)>> {
    let mut files = Vec::new();
    if !data_dir.exists() {
        return Ok(files);
    }
    for entry in fs::read_dir(data_dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(DATA_FILE_EXTENSION) {
            continue;
        }
        let Some(index) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<u32>().ok())
        else {
            warn!(target: "vmap::store", path = %path.display(), "ignoring_unrecognised_data_file");
            continue;
        };
        files.push((index, path));
    }
    files.sort_by_key(|(index, _)| *index);
    Ok(files)
}

/// Read-only handle to one data file.
///
/// Once marked obsolete (after compaction), the file is removed from disk
/// when the last handle drops. Views that still hold the handle keep reading
/// it until then.
#[derive(Debug)]
pub struct DataFile {
    index: u32,
    path: PathBuf,
    file: File,
    records: AtomicU64,
    obsolete: AtomicBool,
}

impl DataFile {
    /// Open an existing data file and validate its header.
    pub fn open(path: impl AsRef<FsPath>, index: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let mut header = [0_u8; HEADER_SIZE];
        file.read_exact_at(&mut header, 0)?;
        let header = record::decode_header(&header)?;
        if header.file_index != index {
            return Err(VmapError::Format(format!(
                "data file {} claims index {}, expected {index}",
                path.display(),
                header.file_index
            )));
        }
        Ok(Self {
            index,
            path,
            file,
            records: AtomicU64::new(0),
            obsolete: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn index(&self) -> u32 {
        self.index
    }

    #[must_use]
    pub fn path(&self) -> &FsPath {
        &self.path
    }

    pub fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Number of records appended to this file (live or not).
    #[must_use]
    pub fn record_count(&self) -> u64 {
        self.records.load(Ordering::Relaxed)
    }

    pub(crate) fn add_records(&self, count: u64) {
        self.records.fetch_add(count, Ordering::Relaxed);
    }

    pub fn mark_obsolete(&self) {
        self.obsolete.store(true, Ordering::Release);
    }

    /// Read and decode the record at `location`.
    ///
    /// Any framing, checksum or decode failure is a `CorruptRecord` carrying
    /// the location.
    pub fn read_record(
        &self,
        location: RecordLocation,
        registry: &RecordRegistry,
    ) -> Result<StoredRecord> {
        let corrupt = |detail: String| VmapError::CorruptRecord {
            location: location.0,
            detail,
        };
        let offset = location.offset();
        let mut len_bytes = [0_u8; 4];
        self.file
            .read_exact_at(&mut len_bytes, offset)
            .map_err(|e| corrupt(format!("record length unreadable: {e}")))?;
        let record_len = u32::from_le_bytes(len_bytes) as usize;
        if record_len < FRAME_OVERHEAD - 4 || record_len > MAX_RECORD_LEN {
            return Err(corrupt(format!("implausible record length {record_len}")));
        }
        let mut frame = vec![0_u8; record_len];
        self.file
            .read_exact_at(&mut frame, offset + 4)
            .map_err(|e| corrupt(format!("record body unreadable: {e}")))?;
        record::decode_frame_body(&frame, registry).map_err(corrupt)
    }

    /// Read the whole file after the header (used by recovery scans).
    pub fn read_from(&self, offset: u64) -> Result<Vec<u8>> {
        let len = self.len()?;
        let start = offset.max(HEADER_SIZE as u64);
        if start >= len {
            return Ok(Vec::new());
        }
        let size = usize::try_from(len - start)
            .map_err(|_| VmapError::Format("data file larger than address space".to_owned()))?;
        let mut buf = vec![0_u8; size];
        self.file.read_exact_at(&mut buf, start)?;
        Ok(buf)
    }
}

impl Drop for DataFile {
    fn drop(&mut self) {
        if self.obsolete.load(Ordering::Acquire) {
            match fs::remove_file(&self.path) {
                Ok(()) => debug!(target: "vmap::store", index = self.index, "obsolete_data_file_removed"),
                Err(e) => warn!(
                    target: "vmap::store",
                    index = self.index,
                    error = %e,
                    "obsolete_data_file_remove_failed"
                ),
            }
        }
    }
}

/// The set of data files a view may reference.
#[derive(Debug, Clone, Default)]
pub struct FileSet {
    files: BTreeMap<u32, Arc<DataFile>>,
}

impl FileSet {
    #[must_use]
    pub fn get(&self, index: u32) -> Option<&Arc<DataFile>> {
        self.files.get(&index)
    }

    pub fn insert(&mut self, file: Arc<DataFile>) {
        self.files.insert(file.index(), file);
    }

    pub fn remove(&mut self, index: u32) -> Option<Arc<DataFile>> {
        self.files.remove(&index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<DataFile>> {
        self.files.values()
    }

    #[must_use]
    pub fn indices(&self) -> Vec<u32> {
        self.files.keys().copied().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn read_record(
        &self,
        location: RecordLocation,
        registry: &RecordRegistry,
    ) -> Result<StoredRecord> {
        let file = self
            .files
            .get(&location.file_index())
            .ok_or_else(|| VmapError::CorruptRecord {
                location: location.0,
                detail: format!("data file {} is not part of this view", location.file_index()),
            })?;
        file.read_record(location, registry)
    }
}

/// Append handle for the file currently being written.
#[derive(Debug)]
pub struct DataFileWriter {
    index: u32,
    path: PathBuf,
    file: File,
    write_pos: u64,
    records: u64,
}

impl DataFileWriter {
    /// Create a new data file with a fresh header.
    pub fn create(data_dir: &FsPath, index: u32) -> Result<Self> {
        let path = data_dir.join(data_file_name(index));
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        file.write_all(&record::encode_header(&DataFileHeader::new(index)))?;
        Ok(Self {
            index,
            path,
            file,
            write_pos: HEADER_SIZE as u64,
            records: 0,
        })
    }

    #[must_use]
    pub fn index(&self) -> u32 {
        self.index
    }

    #[must_use]
    pub fn path(&self) -> &FsPath {
        &self.path
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.write_pos
    }

    #[must_use]
    pub fn records(&self) -> u64 {
        self.records
    }

    /// Append an encoded record and return its location.
    pub fn append(&mut self, data: &[u8]) -> Result<RecordLocation> {
        let location = RecordLocation::new(self.index, self.write_pos).ok_or_else(|| {
            VmapError::CapacityExceeded(format!("data file {} exceeds addressable size", self.index))
        })?;
        self.file.write_all_at(data, self.write_pos)?;
        self.write_pos += u64::try_from(data.len())
            .map_err(|_| VmapError::Format("record size overflow".to_owned()))?;
        self.records += 1;
        Ok(location)
    }

    /// Discard everything written at or after `pos`.
    pub fn truncate_to(&mut self, pos: u64, records: u64) -> Result<()> {
        self.file.set_len(pos)?;
        self.write_pos = pos;
        self.records = records;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

/// Cut a data file at `len`, discarding a torn or uncommitted tail.
pub fn truncate_file(path: &FsPath, len: u64) -> Result<()> {
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_len(len)?;
    file.sync_all()?;
    Ok(())
}
