#![forbid(unsafe_code)]
//! Virtual map public API facade.
//!
//! Re-exports the map, its capability traits, reconnect sessions and the
//! value types they exchange through one stable interface. Downstream
//! consumers depend on this crate rather than on the `vmap-*` internals.

pub use vmap_core::*;
pub use vmap_error::{ErrorClass, Result, VmapError};
pub use vmap_hash::{empty_tree_hash, hash_full_tree};
pub use vmap_reconnect::{
    Frame, ReconnectConfig, ReconnectStats, apply_socket_timeouts, learn, learn_stream, teach,
    teach_stream,
};
pub use vmap_store::{StoreOptions, StoreStats, ValidationReport};
pub use vmap_types::{Hash, LeafRange, LeafRecord, Path, Version};
