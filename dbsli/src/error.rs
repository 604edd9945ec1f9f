use std::path::PathBuf;

use thiserror::Error;

/// Failures the probe lifecycle branches on.
///
/// Discovery and lookup errors are soft (the cycle or the pid is skipped);
/// attach and channel errors end the probe.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("process discovery failed: {0}")]
    Discovery(String),

    #[error("library lookup failed for pid {pid}: {reason}")]
    Lookup { pid: u32, reason: String },

    #[error("failed to attach {program} to {symbol} in {} (pid {pid}): {reason}", path.display())]
    Attach {
        pid: u32,
        program: &'static str,
        symbol: &'static str,
        path: PathBuf,
        reason: String,
    },

    #[error("event channel {name} failed: {reason}")]
    Channel { name: &'static str, reason: String },
}

impl ProbeError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProbeError::Attach { .. } | ProbeError::Channel { .. })
    }
}
