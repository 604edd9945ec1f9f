/// Common tracepoint header for syscall events (sys_enter_*, sys_exit_*)
#[repr(C)]
#[allow(dead_code)]
pub struct SyscallTraceHeader {
    pub common_type: u16,
    pub common_flags: u8,
    pub common_preempt_count: u8,
    pub common_pid: i32,
    pub __syscall_nr: i32,
    pub _pad: i32,
}

// ============================================================
// sys_enter_close
// ============================================================

#[repr(C)]
#[allow(dead_code)]
pub struct SysEnterClose {
    pub header: SyscallTraceHeader,
    pub fd: i64,
}

// ============================================================
// sched/sched_switch
// Layout from /sys/kernel/tracing/events/sched/sched_switch/format
// ============================================================

#[repr(C)]
#[allow(dead_code)]
pub struct SchedSwitch {
    pub common_type: u16,
    pub common_flags: u8,
    pub common_preempt_count: u8,
    pub common_pid: i32,
    pub prev_comm: [u8; 16],
    pub prev_pid: i32,
    pub prev_prio: i32,
    pub prev_state: i64,
    pub next_comm: [u8; 16],
    pub next_pid: i32,
    pub next_prio: i32,
}
