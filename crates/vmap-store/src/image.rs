//! Writing a complete, self-contained store for one version.

use crate::checkpoint::{self, Checkpoint, StoreMetadata};
use crate::file::{DATA_DIR, DataFileWriter, list_data_files};
use crate::index::{KeyBuckets, LongList, key_hash};
use crate::record::{CommitMarker, HEADER_SIZE, StoredRecord, encode_record};
use crate::{DiskStore, StoreOptions};
use std::fs;
use std::path::Path as FsPath;
use tracing::info;
use vmap_error::{Result, VmapError};
use vmap_types::{HashRecord, LeafRecord, RecordLocation};

/// Appends to a sequence of image files, rolling at the size limit.
struct ImageWriter<'a> {
    data_dir: &'a FsPath,
    max_file_size: u64,
    current: Option<DataFileWriter>,
    finished: Vec<(u32, u64)>,
    next_index: u32,
}

impl ImageWriter<'_> {
    fn append(&mut self, bytes: &[u8]) -> Result<RecordLocation> {
        let full = self.current.as_ref().is_none_or(|w| {
            w.size() > HEADER_SIZE as u64 && w.size() + bytes.len() as u64 > self.max_file_size
        });
        if full {
            self.finish_current()?;
            self.current = Some(DataFileWriter::create(self.data_dir, self.next_index)?);
            self.next_index += 1;
        }
        let Some(writer) = self.current.as_mut() else {
            return Err(VmapError::Closed("image writer has no open file".to_owned()));
        };
        writer.append(bytes)
    }

    fn finish_current(&mut self) -> Result<()> {
        if let Some(writer) = self.current.take() {
            writer.sync()?;
            self.finished.push((writer.index(), writer.records()));
        }
        Ok(())
    }
}

impl DiskStore {
    /// Write a store at `dest` holding exactly the given version of a tree.
    ///
    /// `leaves` must yield every leaf of `metadata.range` and `hashes` every
    /// node hash. The image carries a checkpoint, so opening it replays
    /// nothing. `dest` must not already hold a store.
    pub fn write_image(
        dest: &FsPath,
        options: &StoreOptions,
        metadata: &StoreMetadata,
        leaves: impl IntoIterator<Item = Result<LeafRecord>>,
        hashes: impl IntoIterator<Item = Result<HashRecord>>,
    ) -> Result<()> {
        options.validate()?;
        let data_dir = dest.join(DATA_DIR);
        if dest.join(checkpoint::METADATA_FILE).exists() || !list_data_files(&data_dir)?.is_empty()
        {
            return Err(VmapError::InvalidConfig(format!(
                "snapshot destination {} already holds a store",
                dest.display()
            )));
        }
        fs::create_dir_all(&data_dir)?;

        let version = metadata.version;
        let range = metadata.range;
        let mut out = ImageWriter {
            data_dir: &data_dir,
            max_file_size: options.max_file_size,
            current: None,
            finished: Vec::new(),
            next_index: 1,
        };
        let mut leaf_list = LongList::new();
        let mut hash_list = LongList::new();
        let mut keys = KeyBuckets::new(options.key_buckets);

        let mut leaf_count = 0_u64;
        for leaf in leaves {
            let leaf = leaf?;
            if !range.is_leaf(leaf.path) {
                return Err(VmapError::sequencing(format!(
                    "image leaf {} outside range of version {version}",
                    leaf.path
                )));
            }
            let hash = key_hash(&leaf.key);
            let path = leaf.path;
            let location = out.append(&encode_record(&StoredRecord::Leaf { version, leaf })?)?;
            if !leaf_list.set(path, location).is_none() {
                return Err(VmapError::sequencing(format!("image leaf {path} written twice")));
            }
            keys.insert(hash, path);
            leaf_count += 1;
        }
        if leaf_count != range.size() {
            return Err(VmapError::Format(format!(
                "image of version {version} has {leaf_count} leaves, expected {}",
                range.size()
            )));
        }
        for record in hashes {
            let record = record?;
            if !range.contains(record.path) {
                return Err(VmapError::sequencing(format!(
                    "image hash {} outside range of version {version}",
                    record.path
                )));
            }
            let location = out.append(&encode_record(&StoredRecord::Hash { version, record })?)?;
            hash_list.set(record.path, location);
        }
        out.append(&encode_record(&StoredRecord::Commit(CommitMarker {
            version,
            range,
            root_hash: metadata.root_hash,
        }))?)?;
        out.finish_current()?;

        let index_checkpoint = Checkpoint {
            covered_version: version,
            replay_file: out.next_index,
            replay_offset: HEADER_SIZE as u64,
            metadata: metadata.clone(),
            live_files: out.finished.clone(),
            leaves: leaf_list,
            hashes: hash_list,
            keys,
        };
        checkpoint::write_checkpoint(dest, &index_checkpoint)?;
        checkpoint::write_metadata(dest, metadata)?;
        info!(
            target: "vmap::store",
            dest = %dest.display(),
            version = version.0,
            leaves = leaf_count,
            files = out.finished.len(),
            "image_written"
        );
        Ok(())
    }
}
