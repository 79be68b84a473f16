#![forbid(unsafe_code)]
//! Versioned copies of a virtual map and the pipeline that retires them.
//!
//! A [`VirtualMap`] handle wraps one copy ([`VirtualRoot`]). Writes go to
//! the single mutable copy as in-memory deltas. Frozen copies are hashed in
//! creation order, then either flushed to the [`DiskStore`](vmap_store::DiskStore)
//! or merged into their successor, by two background workers.
//!
//! # Modules
//!
//! | Module | Contents |
//! |--------|----------|
//! | `config` | [`VirtualMapConfig`] |
//! | `codec` | [`Codec`] and the stock byte codecs |
//! | `root` | [`VirtualRoot`], capability traits, [`DebugState`] |
//! | `accessor` | [`RecordAccessor`], the detached read view |
//! | `map` | [`VirtualMap`] facade |
//! | `diagnostic` | [`DiagnosticAccessor`] |
//!
//! # Logging
//!
//! Everything here logs on target `vmap::pipeline`; see the `pipeline`
//! module for the event list. `map_opened` is INFO, `map_size_warning` is
//! WARN (logged once per map when `size_warning_threshold` is reached).

pub mod accessor;
pub mod codec;
pub mod config;
mod delta;
pub mod diagnostic;
pub mod map;
mod pipeline;
pub mod root;

pub use accessor::RecordAccessor;
pub use codec::{BytesCodec, Codec, U64Codec, Utf8Codec};
pub use config::VirtualMapConfig;
pub use diagnostic::{DiagnosticAccessor, MapMetadata};
pub use map::VirtualMap;
pub use root::{DebugState, Detachable, Flushable, Hashable, Versioned, VirtualRoot};
