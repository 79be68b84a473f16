//! Plumbing shared by both roles: statistics, thread hand-off and joins.

use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::thread::ScopedJoinHandle;
use std::time::Duration;
use vmap_error::{Result, VmapError};

/// Counters for one session, seen from the side that returns them.
///
/// On the teacher "sent" means written; on the learner it means received.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconnectStats {
    pub hashes_sent: u64,
    pub leaves_sent: u64,
    /// Key plus value bytes of every transferred leaf.
    pub leaf_bytes: u64,
    pub matches: u64,
    pub mismatches: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

impl ReconnectStats {
    /// Sum of two partial counts kept by different threads.
    #[must_use]
    pub fn combine(self, other: Self) -> Self {
        Self {
            hashes_sent: self.hashes_sent + other.hashes_sent,
            leaves_sent: self.leaves_sent + other.leaves_sent,
            leaf_bytes: self.leaf_bytes + other.leaf_bytes,
            matches: self.matches + other.matches,
            mismatches: self.mismatches + other.mismatches,
            bytes_read: self.bytes_read + other.bytes_read,
            bytes_written: self.bytes_written + other.bytes_written,
        }
    }
}

/// Next item from the sibling thread, `None` once it hung up.
pub(crate) fn next_item<T>(rx: &Receiver<T>, timeout: Option<Duration>, millis: u64) -> Result<Option<T>> {
    match timeout {
        Some(timeout) => match rx.recv_timeout(timeout) {
            Ok(item) => Ok(Some(item)),
            Err(RecvTimeoutError::Timeout) => Err(VmapError::Timeout { millis }),
            Err(RecvTimeoutError::Disconnected) => Ok(None),
        },
        None => Ok(rx.recv().ok()),
    }
}

pub(crate) fn join<T>(handle: ScopedJoinHandle<'_, Result<T>>, name: &str) -> Result<T> {
    handle
        .join()
        .unwrap_or_else(|_| Err(VmapError::Closed(format!("{name} thread panicked"))))
}

/// Pick the session result from the reader and writer outcomes.
///
/// A side that only stopped because its sibling went away reports
/// `Cancelled`; the sibling's own error is the interesting one then.
pub(crate) fn settle<A, B>(reader: Result<A>, writer: Result<B>) -> Result<(A, B)> {
    match (reader, writer) {
        (Ok(a), Ok(b)) => Ok((a, b)),
        (Err(VmapError::Cancelled), Err(err)) | (Err(err), _) | (Ok(_), Err(err)) => Err(err),
    }
}
