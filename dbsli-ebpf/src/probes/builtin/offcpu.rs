//! Off-CPU sampler on `sched/sched_switch`.
//!
//! Producer side of the double-buffered delivery: two stack maps and two perf
//! channels, selected by the parity of `OFFCPU_CONVERT.convert_counter`.
//! Userspace bumps the counter between collection periods and then reads the
//! side the producer has stopped writing, so no lock is needed here.

use aya_ebpf::{
    helpers::{
        bpf_get_current_comm, bpf_get_current_pid_tgid, bpf_get_current_task, bpf_ktime_get_ns,
        bpf_probe_read_kernel,
    },
    macros::{map, tracepoint},
    maps::{Array, HashMap, PerfEventArray, StackTrace},
    programs::TracePointContext,
};
use dbsli_common::{Channel, ConvertData, OffCpuSample, OffCpuStart, StackId, route_offcpu};

use super::syscall_types::SchedSwitch;

const MAX_START_ENTRIES: u32 = 1024;
const MAX_PROCS: u32 = 1024;
const MAX_STACKS: u32 = 16384;

/// BPF_F_FAST_STACK_CMP
const KERN_STACKID_FLAGS: u64 = 0x200;
/// BPF_F_USER_STACK | BPF_F_FAST_STACK_CMP
const USER_STACKID_FLAGS: u64 = 0x100 | 0x200;

#[map]
pub static OFFCPU_CONVERT: Array<ConvertData> = Array::with_max_entries(1, 0);

/// Allow-listed tgids, consulted only when `whitelist_enable` is set.
#[map]
pub static OFFCPU_PROCS: HashMap<u32, u8> = HashMap::with_max_entries(MAX_PROCS, 0);

/// Key: pid of the task that was switched out
#[map]
static OFFCPU_START: HashMap<u32, OffCpuStart> = HashMap::with_max_entries(MAX_START_ENTRIES, 0);

#[map]
pub static OFFCPU_STACKS_A: StackTrace = StackTrace::with_max_entries(MAX_STACKS, 0);

#[map]
pub static OFFCPU_STACKS_B: StackTrace = StackTrace::with_max_entries(MAX_STACKS, 0);

#[map]
pub static OFFCPU_EVENTS_A: PerfEventArray<OffCpuSample> = PerfEventArray::new(0);

#[map]
pub static OFFCPU_EVENTS_B: PerfEventArray<OffCpuSample> = PerfEventArray::new(0);

#[tracepoint]
pub fn offcpu_sched_switch(ctx: TracePointContext) -> u32 {
    match try_sched_switch(&ctx) {
        Ok(()) => 0,
        Err(_) => 0,
    }
}

fn try_sched_switch(ctx: &TracePointContext) -> Result<(), i64> {
    let prev_pid: i32 = unsafe { ctx.read_at(core::mem::offset_of!(SchedSwitch, prev_pid))? };
    let next_pid: i32 = unsafe { ctx.read_at(core::mem::offset_of!(SchedSwitch, next_pid))? };
    if prev_pid <= 1 || next_pid <= 1 {
        return Ok(());
    }
    let (prev_pid, next_pid) = (prev_pid as u32, next_pid as u32);

    let cfg = match OFFCPU_CONVERT.get(0) {
        Some(cfg) => *cfg,
        None => return Err(1),
    };

    // `current` is still the outgoing task here
    let prev_tgid = (bpf_get_current_pid_tgid() >> 32) as u32;
    let now = unsafe { bpf_ktime_get_ns() };

    if is_tracked(&cfg, prev_tgid) {
        record_switch_out(ctx, &cfg, prev_pid, prev_tgid, now);
    }

    let start = match unsafe { OFFCPU_START.get(&next_pid) } {
        Some(start) => *start,
        None => return Ok(()),
    };

    if let Some((channel, delta_us)) = route_offcpu(start.ts, now, &cfg) {
        let mut sample = start.sample;
        sample.delta_us = delta_us;
        match channel {
            Channel::A => OFFCPU_EVENTS_A.output(ctx, &sample, 0),
            Channel::B => OFFCPU_EVENTS_B.output(ctx, &sample, 0),
        }
    }

    let _ = OFFCPU_START.remove(&next_pid);
    Ok(())
}

#[inline(always)]
fn is_tracked(cfg: &ConvertData, tgid: u32) -> bool {
    cfg.whitelist_enable == 0 || unsafe { OFFCPU_PROCS.get(&tgid).is_some() }
}

#[inline(always)]
fn record_switch_out(ctx: &TracePointContext, cfg: &ConvertData, pid: u32, tgid: u32, now: u64) {
    let channel = cfg.channel();
    let (kern_stack_id, user_stack_id) = unsafe {
        match channel {
            Channel::A => (
                OFFCPU_STACKS_A.get_stackid(ctx, KERN_STACKID_FLAGS),
                OFFCPU_STACKS_A.get_stackid(ctx, USER_STACKID_FLAGS),
            ),
            Channel::B => (
                OFFCPU_STACKS_B.get_stackid(ctx, KERN_STACKID_FLAGS),
                OFFCPU_STACKS_B.get_stackid(ctx, USER_STACKID_FLAGS),
            ),
        }
    };
    let kern_stack_id = kern_stack_id.unwrap_or(-1);
    let user_stack_id = user_stack_id.unwrap_or(-1);
    if kern_stack_id < 0 && user_stack_id < 0 {
        return;
    }

    let start = OffCpuStart {
        ts: now,
        sample: OffCpuSample {
            stack: StackId {
                tgid,
                stack_map: channel.index(),
                kern_stack_id,
                user_stack_id,
                start_time: leader_start_time(cfg),
                comm: bpf_get_current_comm().unwrap_or([0; 16]),
            },
            delta_us: 0,
        },
    };
    let _ = OFFCPU_START.insert(&pid, &start, 0);
}

/// `current->group_leader->start_boottime`, through the offsets userspace supplied.
#[inline(always)]
fn leader_start_time(cfg: &ConvertData) -> u64 {
    if !cfg.tracks_start_time() {
        return 0;
    }
    let task = unsafe { bpf_get_current_task() };
    if task == 0 {
        return 0;
    }
    let leader: u64 =
        match unsafe { bpf_probe_read_kernel((task + cfg.task_leader_off as u64) as *const u64) } {
            Ok(leader) if leader != 0 => leader,
            _ => return 0,
        };
    unsafe { bpf_probe_read_kernel((leader + cfg.task_start_off as u64) as *const u64) }.unwrap_or(0)
}
