//! Session configuration and socket setup.

use serde::{Deserialize, Serialize};
use std::net::TcpStream;
use std::time::Duration;
use vmap_error::{Result, VmapError};

/// Knobs for one reconnect session. Both roles read the same struct; the
/// divergence limits only matter on the teacher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// How long a read from the peer, or a wait on the sibling thread, may
    /// block before the session fails with `Timeout` (0 = no limit).
    pub read_timeout_ms: u64,
    /// Tree rank whose mismatching subtrees are counted for the
    /// divergence check.
    pub abort_rank: Option<u32>,
    /// Abort once more than this many subtrees at `abort_rank` differ.
    pub max_divergent_subtrees: Option<u64>,
    /// Largest key, value, label or reason accepted in one frame.
    pub max_frame_bytes: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: 30_000,
            abort_rank: None,
            max_divergent_subtrees: None,
            max_frame_bytes: 16 * 1024 * 1024,
        }
    }
}

impl ReconnectConfig {
    #[must_use]
    pub fn read_timeout(&self) -> Option<Duration> {
        (self.read_timeout_ms > 0).then(|| Duration::from_millis(self.read_timeout_ms))
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_frame_bytes == 0 || self.max_frame_bytes > i32::MAX as u32 {
            return Err(VmapError::InvalidConfig(format!(
                "max_frame_bytes {} outside 1..={}",
                self.max_frame_bytes,
                i32::MAX
            )));
        }
        if self.abort_rank.is_some() != self.max_divergent_subtrees.is_some() {
            return Err(VmapError::InvalidConfig(
                "abort_rank and max_divergent_subtrees must be set together".to_owned(),
            ));
        }
        if let Some(rank) = self.abort_rank {
            if rank > 63 {
                return Err(VmapError::InvalidConfig(format!(
                    "abort_rank {rank} is deeper than any tree"
                )));
            }
        }
        Ok(())
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)
            .map_err(|err| VmapError::InvalidConfig(format!("reconnect config: {err}")))?;
        config.validate()?;
        Ok(config)
    }
}

/// Apply the session timeout to both directions of `stream`.
pub fn apply_socket_timeouts(stream: &TcpStream, config: &ReconnectConfig) -> Result<()> {
    let timeout = config.read_timeout();
    stream.set_read_timeout(timeout)?;
    stream.set_write_timeout(timeout)?;
    Ok(())
}
