//! Pinned kernel objects of the SLI probe.
//!
//! The loader pins maps declared with `pinned` under `dir/<MAP_NAME>`. Files
//! left by an earlier run would be reused by the loader, so they are removed
//! before loading and again on every shutdown path.

use std::{
    io,
    path::{Path, PathBuf},
};

use log::{debug, warn};

pub const PGSLI_ARGS: &str = "PGSLI_ARGS";
pub const PGSLI_CONN: &str = "PGSLI_CONN";
pub const PGSLI_CONN_SAMP: &str = "PGSLI_CONN_SAMP";
pub const PGSLI_OUTPUT: &str = "PGSLI_OUTPUT";

const PINNED_MAPS: [&str; 4] = [PGSLI_ARGS, PGSLI_CONN, PGSLI_CONN_SAMP, PGSLI_OUTPUT];

#[derive(Debug, Clone)]
pub struct PinnedMaps {
    dir: PathBuf,
}

impl PinnedMaps {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn paths(&self) -> impl Iterator<Item = PathBuf> + '_ {
        PINNED_MAPS.iter().map(|name| self.dir.join(name))
    }

    /// Removes leftovers from a previous run and makes sure the directory exists.
    pub fn clear_stale(&self) -> io::Result<()> {
        for path in self.paths() {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!("Removed stale pin {}", path.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        std::fs::create_dir_all(&self.dir)
    }

    /// Best effort; failures are logged.
    pub fn remove(&self) {
        for path in self.paths() {
            if let Err(e) = std::fs::remove_file(&path)
                && e.kind() != io::ErrorKind::NotFound
            {
                warn!("Failed to remove pin {}: {}", path.display(), e);
            }
        }
    }
}
