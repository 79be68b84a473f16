//! Read-only inspection of a copy or a detached view.
//!
//! Offers what tests and operators need to look at (key lookups with
//! decoding, metadata, store counters, index validation) without handing
//! out pipeline internals.

use crate::accessor::RecordAccessor;
use crate::codec::Codec;
use crate::root::{Hashable, Versioned, VirtualRoot};
use vmap_error::Result;
use vmap_store::{FileUsage, StoreStats, ValidationReport};
use vmap_types::{Hash, LeafRange, Version};

/// Identity and shape of the inspected version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapMetadata {
    pub label: String,
    pub version: Version,
    pub range: LeafRange,
    pub size: u64,
    /// `None` while a live copy is not hashed yet.
    pub root_hash: Option<Hash>,
    /// Version the disk store currently holds.
    pub stored_version: Version,
}

#[derive(Debug)]
enum Source {
    Live(VirtualRoot),
    Detached(RecordAccessor),
}

#[derive(Debug)]
pub struct DiagnosticAccessor {
    source: Source,
}

impl DiagnosticAccessor {
    /// Inspect a copy as it is now. Holding this does not count as a user
    /// handle on the copy.
    #[must_use]
    pub fn for_root(root: VirtualRoot) -> Self {
        Self {
            source: Source::Live(root),
        }
    }

    #[must_use]
    pub fn for_accessor(accessor: RecordAccessor) -> Self {
        Self {
            source: Source::Detached(accessor),
        }
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match &self.source {
            Source::Live(root) => Ok(root.core.get(key)?.map(|leaf| leaf.value.clone())),
            Source::Detached(accessor) => accessor.get(key),
        }
    }

    /// Look up `key` and decode its value.
    pub fn get_as<V>(&self, key: &[u8], codec: &impl Codec<V>) -> Result<Option<V>> {
        match self.get(key)? {
            Some(bytes) => codec.decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    #[must_use]
    pub fn metadata(&self) -> MapMetadata {
        match &self.source {
            Source::Live(root) => {
                let range = root.leaf_range();
                MapMetadata {
                    label: root.label().to_owned(),
                    version: root.version(),
                    range,
                    size: range.size(),
                    root_hash: root.root_hash(),
                    stored_version: root.core.shared.store.view().version(),
                }
            }
            Source::Detached(accessor) => MapMetadata {
                label: accessor.label().to_owned(),
                version: accessor.version(),
                range: accessor.leaf_range(),
                size: accessor.size(),
                root_hash: Some(accessor.root_hash()),
                stored_version: accessor.store_view().version(),
            },
        }
    }

    #[must_use]
    pub fn root_hash(&self) -> Option<Hash> {
        self.metadata().root_hash
    }

    #[must_use]
    pub fn store_stats(&self) -> StoreStats {
        match &self.source {
            Source::Live(root) => root.core.shared.store.stats(),
            Source::Detached(accessor) => accessor.store().stats(),
        }
    }

    pub fn storage_report(&self) -> Result<Vec<FileUsage>> {
        match &self.source {
            Source::Live(root) => root.core.shared.store.storage_report(),
            Source::Detached(accessor) => accessor.store().storage_report(),
        }
    }

    /// Check the disk indexes: the store's current view for a live copy,
    /// the pinned view for a detached one.
    pub fn validate_store(&self) -> Result<ValidationReport> {
        match &self.source {
            Source::Live(root) => root.core.shared.store.view().validate(),
            Source::Detached(accessor) => accessor.store_view().validate(),
        }
    }
}
