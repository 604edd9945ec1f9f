use std::{
    os::fd::{AsFd, AsRawFd},
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result};
use aya::{
    Ebpf,
    maps::{
        Map, MapData,
        perf::{PerfEventArray, PerfEventArrayBuffer},
    },
    programs::{KProbe, TracePoint},
    util::online_cpus,
};
use bytes::BytesMut;
use log::{info, warn};

use crate::error::ProbeError;

pub mod builtin;
pub mod discovery;
pub mod pin;

/// Flags shared between the reconciliation thread, the event consumers and the
/// signal handler. Each has a single logical writer; reads are best effort.
#[derive(Debug, Default)]
pub struct ProbeState {
    shutdown: AtomicBool,
    dependency_absent: AtomicBool,
}

impl ProbeState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Sticky: once the target library is known to be missing it stays missing.
    pub fn latch_dependency_absent(&self) {
        self.dependency_absent.store(true, Ordering::Relaxed);
    }

    pub fn dependency_absent(&self) -> bool {
        self.dependency_absent.load(Ordering::Relaxed)
    }
}

pub trait Probe {
    fn attach(&self, bpf: &mut Ebpf, state: &Arc<ProbeState>) -> Result<()>;
}

pub struct TracepointConfig<'a> {
    pub program_name: &'a str,
    pub category: &'a str,
    pub name: &'a str,
}

fn tracepoint_exists(category: &str, name: &str) -> bool {
    const TRACEFS_MOUNT_POINTS: [&str; 2] = ["/sys/kernel/tracing", "/sys/kernel/debug/tracing"];

    TRACEFS_MOUNT_POINTS.iter().any(|base| {
        Path::new(base)
            .join("events")
            .join(category)
            .join(name)
            .exists()
    })
}

pub fn attach_tracepoint(bpf: &mut Ebpf, config: TracepointConfig) -> Result<bool> {
    if !tracepoint_exists(config.category, config.name) {
        warn!(
            "Tracepoint {}:{} not available; skipping {}",
            config.category, config.name, config.program_name
        );
        return Ok(false);
    }

    info!("Loading program {}", config.program_name);
    let program: &mut TracePoint = bpf
        .program_mut(config.program_name)
        .with_context(|| format!("Failed to find {} program", config.program_name))?
        .try_into()?;
    program.load()?;
    program
        .attach(config.category, config.name)
        .with_context(|| format!("Failed to attach {}", config.name))?;
    Ok(true)
}

/// Loads a kprobe/kretprobe program and attaches it to `function`.
pub fn attach_kprobe(bpf: &mut Ebpf, program_name: &str, function: &str) -> Result<()> {
    info!("Loading program {}", program_name);
    let program: &mut KProbe = bpf
        .program_mut(program_name)
        .with_context(|| format!("Failed to find {} program", program_name))?
        .try_into()?;
    program.load()?;
    program
        .attach(function, 0)
        .with_context(|| format!("Failed to attach {} to {}", program_name, function))?;
    Ok(())
}

/// Events per `read_events` call.
const PERF_READ_BATCH: usize = 16;

/// Counts returned by [`PerfChannel::drain`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainStats {
    pub read: u64,
    pub lost: u64,
}

/// Userspace side of one perf event array: a buffer per online CPU.
pub struct PerfChannel {
    name: &'static str,
    buffers: Vec<PerfEventArrayBuffer<MapData>>,
    scratch: Vec<BytesMut>,
}

impl PerfChannel {
    pub fn open(bpf: &mut Ebpf, name: &'static str) -> Result<Self, ProbeError> {
        let map = bpf.take_map(name).ok_or(ProbeError::Channel {
            name,
            reason: "map not found".into(),
        })?;
        Self::from_map(map, name)
    }

    pub fn from_map(map: Map, name: &'static str) -> Result<Self, ProbeError> {
        let channel_err = |reason: String| ProbeError::Channel { name, reason };

        let mut array = PerfEventArray::try_from(map).map_err(|e| channel_err(e.to_string()))?;
        let cpus = online_cpus().map_err(|(_, e)| channel_err(e.to_string()))?;

        let mut buffers = Vec::with_capacity(cpus.len());
        for cpu in cpus {
            let buf = array
                .open(cpu, None)
                .map_err(|e| channel_err(format!("cpu {}: {}", cpu, e)))?;
            buffers.push(buf);
        }

        Ok(Self {
            name,
            buffers,
            scratch: (0..PERF_READ_BATCH)
                .map(|_| BytesMut::with_capacity(256))
                .collect(),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Reads everything currently buffered, decoding each record as `T`.
    /// Records shorter than `T` are skipped.
    pub fn drain<T: Copy>(&mut self, mut handler: impl FnMut(T)) -> Result<DrainStats, ProbeError> {
        let mut stats = DrainStats::default();
        for buf in self.buffers.iter_mut() {
            while buf.readable() {
                let events = buf
                    .read_events(&mut self.scratch)
                    .map_err(|e| ProbeError::Channel {
                        name: self.name,
                        reason: e.to_string(),
                    })?;
                stats.lost += events.lost as u64;
                for raw in self.scratch.iter().take(events.read) {
                    if let Some(event) = decode::<T>(raw) {
                        stats.read += 1;
                        handler(event);
                    }
                }
                if events.read == 0 {
                    break;
                }
            }
        }
        Ok(stats)
    }
}

/// Blocks until any buffer of any channel is readable or `timeout` elapses.
/// Returns the number of ready buffers; 0 on timeout or interruption.
pub fn poll_channels(channels: &[&PerfChannel], timeout: Duration) -> Result<usize, ProbeError> {
    let mut fds: Vec<libc::pollfd> = channels
        .iter()
        .flat_map(|c| c.buffers.iter())
        .map(|b| libc::pollfd {
            fd: b.as_fd().as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        })
        .collect();

    let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;
    let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
    if ret < 0 {
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::Interrupted {
            return Ok(0);
        }
        return Err(ProbeError::Channel {
            name: channels.first().map(|c| c.name).unwrap_or("perf"),
            reason: err.to_string(),
        });
    }
    Ok(ret as usize)
}

pub(crate) fn decode<T: Copy>(raw: &[u8]) -> Option<T> {
    if raw.len() < std::mem::size_of::<T>() {
        return None;
    }
    Some(unsafe { (raw.as_ptr() as *const T).read_unaligned() })
}

/// NUL-terminated kernel `comm` as a string.
pub(crate) fn comm_str(comm: &[u8]) -> String {
    let end = comm.iter().position(|&b| b == 0).unwrap_or(comm.len());
    String::from_utf8_lossy(&comm[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_flags_start_clear() {
        let state = ProbeState::new();
        assert!(!state.is_shutdown());
        assert!(!state.dependency_absent());

        state.latch_dependency_absent();
        state.request_shutdown();
        assert!(state.is_shutdown());
        assert!(state.dependency_absent());
    }

    #[test]
    fn test_decode_rejects_short_records() {
        let raw = 0x0102_0304u32.to_ne_bytes();
        assert_eq!(decode::<u32>(&raw), Some(0x0102_0304));
        assert_eq!(decode::<u64>(&raw), None);
    }

    #[test]
    fn test_comm_str_stops_at_nul() {
        let mut comm = [0u8; 16];
        comm[..7].copy_from_slice(b"gaussdb");
        assert_eq!(comm_str(&comm), "gaussdb");
        assert_eq!(comm_str(b"postgres"), "postgres");
    }
}
