//! Records shared between the kernel-resident programs and the userspace agent.
//!
//! Every type here is `#[repr(C)]` and laid out without implicit padding so the
//! same bytes can be written by `bpf_perf_event_output` and read back with
//! `read_unaligned` on the other side.

#![cfg_attr(not(test), no_std)]

pub const TASK_COMM_LEN: usize = 16;
pub const IP_ADDR_LEN: usize = 16;

pub const AF_INET: u16 = 2;
pub const AF_INET6: u16 = 10;

/// Default lower bound for a reported off-CPU interval.
pub const MIN_BLOCK_US: u64 = 1000;
/// Upper bound sentinel: no maximum.
pub const MAX_BLOCK_US: u64 = u64::MAX;

// ============================================================
// SLI probe
// ============================================================

/// Kernel-side configuration pushed once before the first attachment.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SliArgs {
    /// Window after which the tracked per-connection maximum is reset.
    pub period_ns: u64,
}

/// Identifies one traced socket inside one process.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ConnKey {
    pub tgid: u32,
    pub fd: i32,
}

/// One endpoint. IPv4 addresses occupy the first four bytes of `addr` in
/// network order; `port` is in host order.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IpInfo {
    pub addr: [u8; IP_ADDR_LEN],
    pub port: u16,
    pub family: u16,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConnInfo {
    pub server: IpInfo,
    pub client: IpInfo,
}

/// A single request/response measurement.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RttSample {
    /// First byte of the request, i.e. the PostgreSQL frontend message type.
    pub req_cmd: u8,
    pub _pad: [u8; 7],
    pub rtt_nsec: u64,
}

/// Per-connection in-flight request state.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct ConnSamp {
    pub start_ts: u64,
    pub period_start: u64,
    pub req_cmd: u8,
    pub in_flight: u8,
    pub _pad: [u8; 6],
    pub max: RttSample,
}

/// Emitted once per completed request on `PGSLI_OUTPUT`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct SliEvent {
    pub tgid: u32,
    pub fd: i32,
    pub conn: ConnInfo,
    pub latency: RttSample,
    pub max: RttSample,
}

// ============================================================
// Off-CPU sampler
// ============================================================

/// Which of the two parallel delivery channels an event goes to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Channel {
    A,
    B,
}

impl Channel {
    /// Routing is decided by the parity of the shared conversion counter.
    #[inline(always)]
    pub const fn for_counter(counter: u64) -> Self {
        if counter % 2 == 0 { Channel::A } else { Channel::B }
    }

    #[inline(always)]
    pub const fn index(self) -> u32 {
        match self {
            Channel::A => 0,
            Channel::B => 1,
        }
    }

    #[inline(always)]
    pub const fn from_index(index: u32) -> Self {
        if index == 0 { Channel::A } else { Channel::B }
    }

    #[inline(always)]
    pub const fn other(self) -> Self {
        match self {
            Channel::A => Channel::B,
            Channel::B => Channel::A,
        }
    }
}

/// Single-entry config written by userspace and read on every context switch.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConvertData {
    pub convert_counter: u64,
    pub min_block_us: u64,
    /// Offset of `task_struct.group_leader`; 0 leaves `StackId::start_time` unset.
    pub task_leader_off: u32,
    /// Offset of `task_struct.start_boottime` (`real_start_time` before 5.10).
    pub task_start_off: u32,
    pub whitelist_enable: u8,
    pub _pad: [u8; 7],
}

impl Default for ConvertData {
    fn default() -> Self {
        Self {
            convert_counter: 0,
            min_block_us: MIN_BLOCK_US,
            task_leader_off: 0,
            task_start_off: 0,
            whitelist_enable: 0,
            _pad: [0; 7],
        }
    }
}

impl ConvertData {
    #[inline(always)]
    pub const fn channel(&self) -> Channel {
        Channel::for_counter(self.convert_counter)
    }

    #[inline(always)]
    pub const fn tracks_start_time(&self) -> bool {
        self.task_leader_off != 0 && self.task_start_off != 0
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StackId {
    pub tgid: u32,
    /// `Channel::index` of the stack map the ids below were captured in.
    pub stack_map: u32,
    pub kern_stack_id: i64,
    pub user_stack_id: i64,
    /// Group leader start time, so a reused tgid is not merged with its
    /// predecessor. 0 when unknown.
    pub start_time: u64,
    pub comm: [u8; TASK_COMM_LEN],
}

/// Emitted on `OFFCPU_EVENTS_A` / `OFFCPU_EVENTS_B`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OffCpuSample {
    pub stack: StackId,
    pub delta_us: u64,
}

/// Recorded when a task is switched out, keyed by its pid.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct OffCpuStart {
    pub ts: u64,
    pub sample: OffCpuSample,
}

/// Returns the off-CPU interval in microseconds if it should be reported.
///
/// Intervals where the clock went backwards, that are shorter than `min_us`
/// or longer than `max_us` are dropped.
#[inline(always)]
pub const fn block_window_us(start_ns: u64, end_ns: u64, min_us: u64, max_us: u64) -> Option<u64> {
    if start_ns > end_ns {
        return None;
    }
    let delta_us = (end_ns - start_ns) / 1000;
    if delta_us < min_us || delta_us > max_us {
        return None;
    }
    Some(delta_us)
}

/// Full switch-in decision: the interval to report and the channel it goes to.
#[inline(always)]
pub const fn route_offcpu(start_ns: u64, end_ns: u64, cfg: &ConvertData) -> Option<(Channel, u64)> {
    match block_window_us(start_ns, end_ns, cfg.min_block_us, MAX_BLOCK_US) {
        Some(delta_us) => Some((cfg.channel(), delta_us)),
        None => None,
    }
}

#[cfg(feature = "user")]
mod pod {
    use super::*;

    unsafe impl aya::Pod for SliArgs {}
    unsafe impl aya::Pod for ConnKey {}
    unsafe impl aya::Pod for IpInfo {}
    unsafe impl aya::Pod for ConnInfo {}
    unsafe impl aya::Pod for RttSample {}
    unsafe impl aya::Pod for SliEvent {}
    unsafe impl aya::Pod for ConvertData {}
    unsafe impl aya::Pod for OffCpuSample {}
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: u64 = 1_000_000;

    #[test]
    fn test_channel_follows_counter_parity() {
        assert_eq!(Channel::for_counter(0), Channel::A);
        assert_eq!(Channel::for_counter(1), Channel::B);
        assert_eq!(Channel::for_counter(42), Channel::A);
        assert_eq!(Channel::A.other(), Channel::B);
        assert_eq!(Channel::from_index(Channel::B.index()), Channel::B);
    }

    #[test]
    fn test_start_time_needs_both_offsets() {
        let mut cfg = ConvertData::default();
        assert!(!cfg.tracks_start_time());
        cfg.task_leader_off = 0x5a8;
        assert!(!cfg.tracks_start_time());
        cfg.task_start_off = 0x6d0;
        assert!(cfg.tracks_start_time());
    }

    #[test]
    fn test_short_block_is_dropped() {
        let cfg = ConvertData::default();
        // 500us off-CPU
        assert_eq!(route_offcpu(10 * MS, 10 * MS + 500_000, &cfg), None);
    }

    #[test]
    fn test_long_block_routes_to_current_parity() {
        let mut cfg = ConvertData::default();
        assert_eq!(
            route_offcpu(10 * MS, 12 * MS, &cfg),
            Some((Channel::A, 2000))
        );

        cfg.convert_counter = 7;
        assert_eq!(
            route_offcpu(10 * MS, 12 * MS, &cfg),
            Some((Channel::B, 2000))
        );
    }

    #[test]
    fn test_clock_inversion_is_dropped() {
        assert_eq!(block_window_us(5 * MS, 1 * MS, 0, MAX_BLOCK_US), None);
    }

    #[test]
    fn test_min_threshold_is_inclusive() {
        assert_eq!(block_window_us(0, 1_000_000, 1000, MAX_BLOCK_US), Some(1000));
        assert_eq!(block_window_us(0, 999_999, 1000, MAX_BLOCK_US), None);
    }

    #[test]
    fn test_record_sizes() {
        assert_eq!(core::mem::size_of::<IpInfo>(), 20);
        assert_eq!(core::mem::size_of::<SliEvent>(), 80);
        assert_eq!(core::mem::size_of::<ConvertData>(), 32);
        assert_eq!(core::mem::size_of::<OffCpuSample>(), 56);
    }
}
