#![forbid(unsafe_code)]
//! Reconnect: bring a stale virtual map up to a peer's root hash.
//!
//! A teacher serves a detached, hashed view of its map; a learner compares
//! that tree against its own top-down and receives only the leaves under
//! subtrees whose hashes differ.
//!
//! ```text
//! teacher                                   learner
//!   TREE_SHAPE(range, root, label) ───────▶  begin_reconnect(range)
//!   SUBTREE_HASH(0, h0)            ───────▶
//!                                  ◀───────  MISMATCH(0)
//!   SUBTREE_HASH(1, h1)            ───────▶
//!   SUBTREE_HASH(2, h2)            ───────▶
//!                                  ◀───────  MATCH(1)
//!                                  ◀───────  MISMATCH(2)
//!   LEAF_RECORD(2, key, value)     ───────▶  apply_reconnect_leaf
//!   DONE                           ───────▶  copy, hash, compare roots
//! ```
//!
//! Each side runs one reader thread and one writer thread joined by an
//! `mpsc` channel. Sessions never resume: any failure ends the session and
//! the caller starts a new one from the root.
//!
//! # Modules
//!
//! | Module | Contents |
//! |--------|----------|
//! | `config` | [`ReconnectConfig`], [`apply_socket_timeouts`] |
//! | `wire` | [`Frame`] encoding and complete-read decoding |
//! | `teacher` | [`teach`], [`teach_stream`] |
//! | `learner` | [`learn`], [`learn_stream`] |
//!
//! # Logging
//!
//! Target `vmap::reconnect`, with a `role` field on every event.
//! - `info`: `reconnect_started`, `reconnect_finished` (with counters).
//! - `debug`: `answers_complete` (teacher), `reconnect_verified` (learner).
//! - `warn`: `reconnect_failed`, `reconnect_undo_failed`.

pub mod config;
pub mod learner;
mod session;
pub mod teacher;
pub mod wire;

pub use config::{ReconnectConfig, apply_socket_timeouts};
pub use learner::{learn, learn_stream};
pub use session::ReconnectStats;
pub use teacher::{teach, teach_stream};
pub use wire::{Frame, FrameReader, FrameWriter};
