use std::path::{Path, PathBuf};

use log::debug;
use regex::Regex;

use crate::error::ProbeError;

/// Point-in-time scan for processes whose command name contains a substring.
pub trait ProcessDiscovery {
    /// Matching pids, ascending and without duplicates.
    fn discover(&self, comm: &str) -> Result<Vec<u32>, ProbeError>;
}

/// Outcome of looking for a shared library inside a process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Found(PathBuf),
    NotLoaded,
}

/// Reads `/proc` through the procfs crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcfsDiscovery;

impl ProcessDiscovery for ProcfsDiscovery {
    fn discover(&self, comm: &str) -> Result<Vec<u32>, ProbeError> {
        let procs =
            procfs::process::all_processes().map_err(|e| ProbeError::Discovery(e.to_string()))?;

        // processes can exit mid-scan; those entries are skipped
        let pids = procs.filter_map(|p| p.ok()).filter_map(|process| {
            let stat = process.stat().ok()?;
            stat.comm.contains(comm).then_some(process.pid as u32)
        });

        Ok(sorted_unique(pids))
    }
}

pub(crate) fn sorted_unique(pids: impl IntoIterator<Item = u32>) -> Vec<u32> {
    let mut pids: Vec<u32> = pids.into_iter().collect();
    pids.sort_unstable();
    pids.dedup();
    pids
}

/// Resolves a path from a process's namespace to the host filesystem.
/// Handles containerized processes by looking through /proc/<PID>/root.
pub fn resolve_host_path(pid: i32, container_path: &Path) -> PathBuf {
    if container_path.starts_with("/proc") {
        return container_path.to_path_buf();
    }

    // /proc/<PID>/root/<CONTAINER_PATH>
    let mut root_path = PathBuf::from(format!("/proc/{}/root", pid));
    let relative_path = container_path.strip_prefix("/").unwrap_or(container_path);
    root_path.push(relative_path);

    root_path
}

/// Matches `lib<name>.so` and versioned variants such as `lib<name>.so.1.1`.
pub fn library_pattern(name: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!(r"^lib{}\.so(\.\d+)*$", regex::escape(name)))
}

/// Looks up the first mapping of `pattern` in `/proc/<pid>/maps`.
pub fn resolve_library(pid: u32, pattern: &Regex) -> Result<Resolution, ProbeError> {
    let lookup_err = |reason: String| ProbeError::Lookup { pid, reason };

    let process =
        procfs::process::Process::new(pid as i32).map_err(|e| lookup_err(e.to_string()))?;
    let maps = process.maps().map_err(|e| lookup_err(e.to_string()))?;

    for map in maps {
        if let procfs::process::MMapPath::Path(path_buf) = map.pathname
            && let Some(file_name) = path_buf.file_name().and_then(|n| n.to_str())
            && pattern.is_match(file_name)
        {
            let host_path = resolve_host_path(process.pid, &path_buf);
            debug!("Found library: {} (from PID: {})", host_path.display(), pid);
            return Ok(Resolution::Found(host_path));
        }
    }

    Ok(Resolution::NotLoaded)
}
