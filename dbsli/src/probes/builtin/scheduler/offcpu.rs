use anyhow::{Context, Result};
use aya::Ebpf;
use aya::maps::{Array, HashMap, MapData, StackTraceMap};
use dbsli_common::{Channel, ConvertData, OffCpuSample};
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::probes::{PerfChannel, Probe, ProbeState, TracepointConfig, attach_tracepoint, comm_str};
use crate::telemetry;

/// Stacks printed per period.
const TOP_STACKS: usize = 10;
/// Frames printed per stack.
const MAX_FRAMES: usize = 8;
/// Shutdown check granularity while waiting for the next flip.
const WAIT_SLICE: Duration = Duration::from_millis(100);

const CHANNELS: [&str; 2] = ["OFFCPU_EVENTS_A", "OFFCPU_EVENTS_B"];
const STACK_MAPS: [&str; 2] = ["OFFCPU_STACKS_A", "OFFCPU_STACKS_B"];

pub struct OffCpuProbe {
    pub config: ConvertData,
    /// Allow-list; empty samples every process.
    pub pids: Vec<u32>,
    pub period: Duration,
}

impl Probe for OffCpuProbe {
    fn attach(&self, bpf: &mut Ebpf, state: &Arc<ProbeState>) -> Result<()> {
        let mut convert: Array<MapData, ConvertData> = Array::try_from(
            bpf.take_map("OFFCPU_CONVERT")
                .context("Failed to find OFFCPU_CONVERT map")?,
        )?;
        convert.set(0, self.config, 0)?;

        if !self.pids.is_empty() {
            let mut procs: HashMap<_, u32, u8> = HashMap::try_from(
                bpf.map_mut("OFFCPU_PROCS")
                    .context("Failed to find OFFCPU_PROCS map")?,
            )?;
            for pid in &self.pids {
                procs.insert(pid, 1, 0)?;
            }
        }

        let channels = [
            PerfChannel::open(bpf, CHANNELS[0])?,
            PerfChannel::open(bpf, CHANNELS[1])?,
        ];
        let stacks = [take_stack_map(bpf, STACK_MAPS[0])?, take_stack_map(bpf, STACK_MAPS[1])?];

        if !attach_tracepoint(
            bpf,
            TracepointConfig {
                program_name: "offcpu_sched_switch",
                category: "sched",
                name: "sched_switch",
            },
        )? {
            return Ok(());
        }

        let collector = OffCpuCollector {
            convert,
            config: self.config,
            channels,
            stacks,
            kernel_symbols: load_kernel_symbols(),
            state: state.clone(),
            period: self.period,
        };
        thread::Builder::new()
            .name("dbsli-offcpu".into())
            .spawn(move || collector.run())
            .context("Failed to spawn off-CPU collector")?;

        telemetry::record_active_probe("offcpu", 1);
        info!(
            "OffCpuProbe attached (min_block={}us, allow-list={})",
            self.config.min_block_us,
            self.pids.len()
        );
        Ok(())
    }
}

fn take_stack_map(bpf: &mut Ebpf, name: &str) -> Result<StackTraceMap<MapData>> {
    let map = bpf
        .take_map(name)
        .with_context(|| format!("Failed to find {} map", name))?;
    Ok(StackTraceMap::try_from(map)?)
}

fn load_kernel_symbols() -> BTreeMap<u64, String> {
    aya::util::kernel_symbols().unwrap_or_else(|e| {
        warn!("Kernel symbols unavailable: {}", e);
        BTreeMap::new()
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct StackKey {
    pub tgid: u32,
    pub start_time: u64,
    pub comm: [u8; 16],
    pub stack_map: u32,
    pub kern_stack_id: i64,
    pub user_stack_id: i64,
}

impl From<&OffCpuSample> for StackKey {
    fn from(sample: &OffCpuSample) -> Self {
        let s = &sample.stack;
        Self {
            tgid: s.tgid,
            start_time: s.start_time,
            comm: s.comm,
            stack_map: s.stack_map,
            kern_stack_id: s.kern_stack_id,
            user_stack_id: s.user_stack_id,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BlockedTime {
    pub total_us: u64,
    pub count: u64,
}

/// Sums off-CPU time per (process, stack) over one period.
#[derive(Debug, Default)]
pub struct OffCpuAggregator {
    totals: BTreeMap<StackKey, BlockedTime>,
}

impl OffCpuAggregator {
    pub fn add(&mut self, sample: &OffCpuSample) {
        let entry = self.totals.entry(StackKey::from(sample)).or_default();
        entry.total_us += sample.delta_us;
        entry.count += 1;
    }

    pub fn len(&self) -> usize {
        self.totals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.totals.is_empty()
    }

    /// Largest totals first; ties keep key order.
    pub fn take_top(&mut self, n: usize) -> Vec<(StackKey, BlockedTime)> {
        let mut all: Vec<_> = std::mem::take(&mut self.totals).into_iter().collect();
        all.sort_by(|a, b| b.1.total_us.cmp(&a.1.total_us));
        all.truncate(n);
        all
    }
}

struct OffCpuCollector {
    convert: Array<MapData, ConvertData>,
    config: ConvertData,
    channels: [PerfChannel; 2],
    stacks: [StackTraceMap<MapData>; 2],
    kernel_symbols: BTreeMap<u64, String>,
    state: Arc<ProbeState>,
    period: Duration,
}

impl OffCpuCollector {
    fn run(mut self) {
        let mut next_flip = Instant::now() + self.period;
        while !self.state.is_shutdown() {
            let now = Instant::now();
            if now < next_flip {
                thread::sleep(WAIT_SLICE.min(next_flip - now));
                continue;
            }
            next_flip = now + self.period;

            if let Err(e) = self.collect_period() {
                warn!("Off-CPU collection failed: {:#}", e);
            }
        }
        debug!("Off-CPU collector stopped");
    }

    /// Flips the producer to the other side, then consumes the side it left.
    fn collect_period(&mut self) -> Result<()> {
        let idle = flip(&mut self.config);
        self.convert.set(0, self.config, 0)?;

        let mut aggregator = OffCpuAggregator::default();
        let channel = &mut self.channels[idle.index() as usize];
        let stats = channel.drain::<OffCpuSample>(|sample| {
            telemetry::record_offcpu_event(
                sample.delta_us.saturating_mul(1000),
                &comm_str(&sample.stack.comm),
            );
            aggregator.add(&sample);
        })?;
        telemetry::record_lost_events(channel.name(), stats.lost);

        if !aggregator.is_empty() {
            info!(
                "off-CPU: {} samples, {} distinct stacks, {} lost",
                stats.read,
                aggregator.len(),
                stats.lost
            );
            for (key, time) in aggregator.take_top(TOP_STACKS) {
                self.report(&key, &time);
            }
        }

        // Tasks still blocked at the flip carry ids into this map; their
        // stacks show as [unknown] next period and count as unresolved.
        self.clear_stacks(idle);
        Ok(())
    }

    fn report(&self, key: &StackKey, time: &BlockedTime) {
        info!(
            "OFFCPU pid={} comm={} total={}us count={}",
            key.tgid,
            comm_str(&key.comm),
            time.total_us,
            time.count
        );
        let stacks = &self.stacks[Channel::from_index(key.stack_map).index() as usize];
        for frame in self.frames(stacks, key.kern_stack_id, true) {
            info!("    {}", frame);
        }
        for frame in self.frames(stacks, key.user_stack_id, false) {
            info!("    {}", frame);
        }
    }

    fn frames(&self, stacks: &StackTraceMap<MapData>, id: i64, kernel: bool) -> Vec<String> {
        if id < 0 {
            return Vec::new();
        }
        let trace = match stacks.get(&(id as u32), 0) {
            Ok(trace) => trace,
            Err(e) => {
                debug!("stack {} unresolved: {}", id, e);
                telemetry::record_unresolved_stack(if kernel { "kernel" } else { "user" });
                return vec!["[unknown]".to_string()];
            }
        };
        trace
            .frames()
            .iter()
            .take_while(|f| f.ip != 0)
            .take(MAX_FRAMES)
            .map(|f| {
                if kernel {
                    symbolize(&self.kernel_symbols, f.ip)
                } else {
                    format!("{:#x}", f.ip)
                }
            })
            .collect()
    }

    fn clear_stacks(&mut self, channel: Channel) {
        let stacks = &mut self.stacks[channel.index() as usize];
        let ids: Vec<u32> = stacks.stack_ids().filter_map(|id| id.ok()).collect();
        for id in ids {
            if let Err(e) = stacks.remove(&id) {
                debug!("Failed to clear stack {}: {}", id, e);
            }
        }
    }
}

/// Advances the counter so the producer moves to the other side. Returns the
/// side it was writing until now, which is safe to drain.
fn flip(config: &mut ConvertData) -> Channel {
    let idle = config.channel();
    config.convert_counter = config.convert_counter.wrapping_add(1);
    idle
}

fn symbolize(symbols: &BTreeMap<u64, String>, ip: u64) -> String {
    match symbols.range(..=ip).next_back() {
        Some((_, name)) => name.clone(),
        None => format!("{:#x}", ip),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbsli_common::StackId;

    fn sample(tgid: u32, kern: i64, delta_us: u64) -> OffCpuSample {
        sample_started_at(tgid, 0, kern, delta_us)
    }

    fn sample_started_at(tgid: u32, start_time: u64, kern: i64, delta_us: u64) -> OffCpuSample {
        let mut comm = [0u8; 16];
        comm[..7].copy_from_slice(b"gaussdb");
        OffCpuSample {
            stack: StackId {
                tgid,
                stack_map: 0,
                kern_stack_id: kern,
                user_stack_id: -1,
                start_time,
                comm,
            },
            delta_us,
        }
    }

    #[test]
    fn test_aggregator_sums_per_stack() {
        let mut agg = OffCpuAggregator::default();
        agg.add(&sample(10, 1, 2000));
        agg.add(&sample(10, 1, 3000));
        agg.add(&sample(10, 2, 1500));
        agg.add(&sample(11, 1, 9000));

        assert_eq!(agg.len(), 3);
        let top = agg.take_top(2);
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].0.tgid, 11);
        assert_eq!(top[0].1, BlockedTime { total_us: 9000, count: 1 });
        assert_eq!(top[1].1, BlockedTime { total_us: 5000, count: 2 });
        assert!(agg.is_empty());
    }

    #[test]
    fn test_reused_tgid_is_kept_apart() {
        let mut agg = OffCpuAggregator::default();
        agg.add(&sample_started_at(10, 1_000, 1, 2000));
        agg.add(&sample_started_at(10, 9_000, 1, 3000));

        assert_eq!(agg.len(), 2);
        let top = agg.take_top(2);
        assert_eq!(top[0].0.start_time, 9_000);
        assert_eq!(top[1].0.start_time, 1_000);
    }

    #[test]
    fn test_flip_drains_the_side_left_behind() {
        let mut cfg = ConvertData::default();
        for k in 1..=4u64 {
            let idle = flip(&mut cfg);
            assert_eq!(cfg.convert_counter, k);
            assert_eq!(idle, Channel::for_counter(k - 1));
            // producer has moved to the other side
            assert_eq!(cfg.channel(), Channel::for_counter(k));
            assert_eq!(cfg.channel(), idle.other());
        }
    }

    #[test]
    fn test_flip_wraps_counter() {
        let mut cfg = ConvertData {
            convert_counter: u64::MAX,
            ..Default::default()
        };
        assert_eq!(flip(&mut cfg), Channel::B);
        assert_eq!(cfg.convert_counter, 0);
        assert_eq!(cfg.channel(), Channel::A);
    }

    #[test]
    fn test_symbolize_picks_enclosing_symbol() {
        let symbols: BTreeMap<u64, String> = [
            (0x1000, "schedule".to_string()),
            (0x2000, "io_schedule".to_string()),
        ]
        .into();
        assert_eq!(symbolize(&symbols, 0x1010), "schedule");
        assert_eq!(symbolize(&symbols, 0x2000), "io_schedule");
        assert_eq!(symbolize(&symbols, 0x10), "0x10");
    }
}
