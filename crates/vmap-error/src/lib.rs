#![forbid(unsafe_code)]
//! Error types for the virtual map storage engine.
//!
//! # Error Taxonomy
//!
//! The engine uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `vmap-types` | Byte-level format violations detected while decoding records |
//! | Runtime | `VmapError` | `vmap-error` (this crate) | Errors surfaced by the map, pipeline, store and reconnect APIs |
//!
//! A missing key or path is not an error: lookups return `Option::None`.
//!
//! ## Mapping Policy: ParseError → VmapError
//!
//! `vmap-error` is independent of `vmap-types` to avoid cyclic
//! dependencies. The store converts at its boundary:
//!
//! | Situation | VmapError Variant |
//! |-----------|-------------------|
//! | Record read from a live data file fails to decode | `CorruptRecord { location, detail }` |
//! | Header, checkpoint or metadata file fails to decode on open | `Format(detail)` |
//! | Reconnect frame fails to decode | `ProtocolViolation(detail)` |
//!
//! ## Error Classes
//!
//! Every variant maps to exactly one [`ErrorClass`] via [`VmapError::class`].
//! The mapping is exhaustive (no wildcard arms) so adding a variant is a
//! compile error until its class is assigned.
//!
//! | Variant | Class | Retried locally |
//! |---------|-------|-----------------|
//! | `Io` | `Io` | only transient kinds, only during flush |
//! | `CorruptRecord` | `Integrity` | never |
//! | `Format` | `Integrity` | never |
//! | `ProtocolViolation` | `Protocol` | never (session is restarted by the caller) |
//! | `Timeout` | `Protocol` | never |
//! | `ReconnectAborted` | `Protocol` | never |
//! | `SequencingViolation` | `Contract` | never |
//! | `CapacityExceeded` | `Capacity` | never |
//! | `InvalidConfig` | `Contract` | never |
//! | `Cancelled` | `Shutdown` | never |
//! | `Closed` | `Shutdown` | never |
//!
//! ## Design Constraints
//!
//! - `vmap-error` MUST NOT depend on other workspace crates.
//! - All string payloads are owned (`String`) so errors cross worker
//!   threads without lifetime entanglement.

use thiserror::Error;

/// Unified error type for all virtual map operations.
#[derive(Debug, Error)]
pub enum VmapError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A record read from a data file failed its checksum, length or decode
    /// checks. Damage is presumed permanent.
    #[error("corrupt record at location {location:#x}: {detail}")]
    CorruptRecord { location: u64, detail: String },

    /// Invalid store layout (bad magic, unknown version, inconsistent
    /// metadata) detected while opening a store directory.
    #[error("invalid store format: {0}")]
    Format(String),

    /// The reconnect peer sent bytes that do not follow the protocol, or
    /// the stream ended mid-frame.
    #[error("reconnect protocol violation: {0}")]
    ProtocolViolation(String),

    /// A reconnect read did not complete within the configured timeout.
    #[error("reconnect timed out after {millis} ms")]
    Timeout { millis: u64 },

    /// The teacher decided the trees diverge too much for reconnect to pay off.
    #[error("reconnect aborted: {0}")]
    ReconnectAborted(String),

    /// A pipeline phase was invoked out of its legal order.
    #[error("sequencing violation: {0}")]
    SequencingViolation(String),

    /// The map or its index cannot hold another entry.
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Work was abandoned because the pipeline or session shut down.
    #[error("operation cancelled")]
    Cancelled,

    /// The store or pipeline was already closed.
    #[error("closed: {0}")]
    Closed(String),
}

/// Coarse classification used by retry and reporting policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    Io,
    Integrity,
    Protocol,
    Contract,
    Capacity,
    Shutdown,
}

impl VmapError {
    /// Classify this error.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Io(_) => ErrorClass::Io,
            Self::CorruptRecord { .. } | Self::Format(_) => ErrorClass::Integrity,
            Self::ProtocolViolation(_) | Self::Timeout { .. } | Self::ReconnectAborted(_) => {
                ErrorClass::Protocol
            }
            Self::SequencingViolation(_) | Self::InvalidConfig(_) => ErrorClass::Contract,
            Self::CapacityExceeded(_) => ErrorClass::Capacity,
            Self::Cancelled | Self::Closed(_) => ErrorClass::Shutdown,
        }
    }

    /// Whether a flush may retry after this error.
    ///
    /// Only I/O errors whose kind indicates a passing condition qualify.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ResourceBusy
            ),
            _ => false,
        }
    }

    /// Shorthand for a sequencing violation with a formatted message.
    pub fn sequencing(detail: impl Into<String>) -> Self {
        Self::SequencingViolation(detail.into())
    }

    /// Shorthand for a protocol violation with a formatted message.
    pub fn protocol(detail: impl Into<String>) -> Self {
        Self::ProtocolViolation(detail.into())
    }
}

/// Result alias using `VmapError`.
pub type Result<T> = std::result::Result<T, VmapError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_mapping_covers_all_variants() {
        let cases: Vec<(VmapError, ErrorClass)> = vec![
            (VmapError::Io(std::io::Error::other("test")), ErrorClass::Io),
            (
                VmapError::CorruptRecord {
                    location: 7,
                    detail: "crc".into(),
                },
                ErrorClass::Integrity,
            ),
            (VmapError::Format("bad magic".into()), ErrorClass::Integrity),
            (
                VmapError::ProtocolViolation("eof".into()),
                ErrorClass::Protocol,
            ),
            (VmapError::Timeout { millis: 5 }, ErrorClass::Protocol),
            (
                VmapError::ReconnectAborted("diverged".into()),
                ErrorClass::Protocol,
            ),
            (
                VmapError::SequencingViolation("merge".into()),
                ErrorClass::Contract,
            ),
            (
                VmapError::CapacityExceeded("full".into()),
                ErrorClass::Capacity,
            ),
            (VmapError::InvalidConfig("x".into()), ErrorClass::Contract),
            (VmapError::Cancelled, ErrorClass::Shutdown),
            (VmapError::Closed("store".into()), ErrorClass::Shutdown),
        ];

        for (error, expected) in &cases {
            assert_eq!(error.class(), *expected, "wrong class for {error:?}");
        }
    }

    #[test]
    fn only_transient_io_is_retryable() {
        let interrupted = VmapError::Io(std::io::Error::from(std::io::ErrorKind::Interrupted));
        assert!(interrupted.is_transient());

        let denied = VmapError::Io(std::io::Error::from(std::io::ErrorKind::PermissionDenied));
        assert!(!denied.is_transient());

        let corrupt = VmapError::CorruptRecord {
            location: 0,
            detail: "crc".into(),
        };
        assert!(!corrupt.is_transient());
        assert!(!VmapError::Timeout { millis: 1 }.is_transient());
    }

    #[test]
    fn display_formatting() {
        let err = VmapError::CorruptRecord {
            location: 0x10,
            detail: "bad checksum".into(),
        };
        assert_eq!(
            err.to_string(),
            "corrupt record at location 0x10: bad checksum"
        );

        let seq = VmapError::sequencing("copy 2 merged before copy 1");
        assert_eq!(
            seq.to_string(),
            "sequencing violation: copy 2 merged before copy 1"
        );

        let timeout = VmapError::Timeout { millis: 250 };
        assert_eq!(timeout.to_string(), "reconnect timed out after 250 ms");
    }
}
