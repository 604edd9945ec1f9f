//! PostgreSQL-over-TLS service level indicator probe.
//!
//! Measures server-side round trip per connection: the request starts when
//! `SSL_read` returns data and completes at the next `SSL_write` on the same
//! descriptor.
//!
//! # Program Mapping
//! - `pgsli_inet_csk_accept_exit` / `pgsli_sys_accept4_exit` → bind an accepted
//!   socket's endpoints to `(tgid, fd)`
//! - `pgsli_sys_enter_close` → drop connection state
//! - `pgsli_ssl_read_enter` / `pgsli_ssl_read_exit` → request start
//! - `pgsli_ssl_write_enter` → request completion, emits `SliEvent`
//!
//! The uprobes are attached per process by userspace; everything else is
//! attached once at startup.

use aya_ebpf::{
    helpers::{bpf_get_current_pid_tgid, bpf_ktime_get_ns, bpf_probe_read_kernel, bpf_probe_read_user},
    macros::{kretprobe, map, tracepoint, uprobe, uretprobe},
    maps::{Array, HashMap, PerfEventArray},
    programs::{ProbeContext, RetProbeContext, TracePointContext},
};
use aya_log_ebpf::debug;
use dbsli_common::{
    AF_INET, AF_INET6, ConnInfo, ConnKey, ConnSamp, IP_ADDR_LEN, IpInfo, RttSample, SliArgs,
    SliEvent,
};

use super::syscall_types::SysEnterClose;

const MAX_CONN: u32 = 10240;
const MAX_INFLIGHT: u32 = 10240;

/// Used until userspace pushes `SliArgs`.
const DEFAULT_PERIOD_NS: u64 = 5_000_000_000;

/// OpenSSL 1.1 `struct ssl_st`: `rbio` follows `version` and `method`.
const SSL_RBIO_OFFSET: u64 = 0x10;
/// OpenSSL 1.1 `struct bio_st`: `num` holds the socket descriptor.
const BIO_NUM_OFFSET: u64 = 0x30;

/// `struct sock_common` offsets (x86_64).
const SKC_DADDR_OFFSET: u64 = 0;
const SKC_RCV_SADDR_OFFSET: u64 = 4;
const SKC_DPORT_OFFSET: u64 = 12;
const SKC_NUM_OFFSET: u64 = 14;
const SKC_FAMILY_OFFSET: u64 = 16;
const SKC_V6_DADDR_OFFSET: u64 = 56;
const SKC_V6_RCV_SADDR_OFFSET: u64 = 72;

#[map]
pub static PGSLI_ARGS: Array<SliArgs> = Array::pinned(1, 0);

#[map]
pub static PGSLI_CONN: HashMap<ConnKey, ConnInfo> = HashMap::pinned(MAX_CONN, 0);

#[map]
pub static PGSLI_CONN_SAMP: HashMap<ConnKey, ConnSamp> = HashMap::pinned(MAX_CONN, 0);

#[map]
pub static PGSLI_OUTPUT: PerfEventArray<SliEvent> = PerfEventArray::pinned(0);

#[repr(C)]
#[derive(Clone, Copy)]
struct SslReadArgs {
    ssl: u64,
    buf: u64,
}

/// Key: pid_tgid
#[map]
static SSL_READ_ARGS: HashMap<u64, SslReadArgs> = HashMap::with_max_entries(MAX_INFLIGHT, 0);

/// Key: pid_tgid, Value: `struct sock *` returned by `inet_csk_accept`
#[map]
static ACCEPTED_SOCK: HashMap<u64, u64> = HashMap::with_max_entries(MAX_INFLIGHT, 0);

// ============================================================
// Connection tracking
// ============================================================

#[kretprobe]
pub fn pgsli_inet_csk_accept_exit(ctx: RetProbeContext) -> u32 {
    let sk: u64 = ctx.ret().unwrap_or(0);
    if sk != 0 {
        let _ = ACCEPTED_SOCK.insert(&bpf_get_current_pid_tgid(), &sk, 0);
    }
    0
}

#[kretprobe]
pub fn pgsli_sys_accept4_exit(ctx: RetProbeContext) -> u32 {
    if let Ok(Some(key)) = try_accept_exit(&ctx) {
        debug!(&ctx, "pgsli: tracking tgid={} fd={}", key.tgid, key.fd);
    }
    0
}

#[inline(always)]
fn try_accept_exit(ctx: &RetProbeContext) -> Result<Option<ConnKey>, i64> {
    let pid_tgid = bpf_get_current_pid_tgid();
    let sk = match unsafe { ACCEPTED_SOCK.get(&pid_tgid) } {
        Some(sk) => *sk,
        None => return Ok(None),
    };
    let _ = ACCEPTED_SOCK.remove(&pid_tgid);

    let fd: i64 = ctx.ret().ok_or(1i64)?;
    if fd < 0 {
        return Ok(None);
    }

    let key = ConnKey {
        tgid: (pid_tgid >> 32) as u32,
        fd: fd as i32,
    };
    let info = read_conn_info(sk)?;
    PGSLI_CONN.insert(&key, &info, 0)?;
    // descriptor reuse: forget any request state of the previous socket
    let _ = PGSLI_CONN_SAMP.remove(&key);
    Ok(Some(key))
}

#[tracepoint]
pub fn pgsli_sys_enter_close(ctx: TracePointContext) -> u32 {
    let fd: i64 = match unsafe { ctx.read_at(core::mem::offset_of!(SysEnterClose, fd)) } {
        Ok(fd) => fd,
        Err(_) => return 0,
    };
    let key = ConnKey {
        tgid: (bpf_get_current_pid_tgid() >> 32) as u32,
        fd: fd as i32,
    };
    let _ = PGSLI_CONN.remove(&key);
    let _ = PGSLI_CONN_SAMP.remove(&key);
    0
}

#[inline(always)]
fn read_conn_info(sk: u64) -> Result<ConnInfo, i64> {
    let family: u16 = read_kernel(sk + SKC_FAMILY_OFFSET)?;
    let local_port: u16 = read_kernel(sk + SKC_NUM_OFFSET)?;
    let peer_port: u16 = read_kernel(sk + SKC_DPORT_OFFSET)?;

    let (server_addr, client_addr) = match family {
        AF_INET => {
            let saddr: [u8; 4] = read_kernel(sk + SKC_RCV_SADDR_OFFSET)?;
            let daddr: [u8; 4] = read_kernel(sk + SKC_DADDR_OFFSET)?;
            (widen_v4(saddr), widen_v4(daddr))
        }
        AF_INET6 => {
            let saddr: [u8; IP_ADDR_LEN] = read_kernel(sk + SKC_V6_RCV_SADDR_OFFSET)?;
            let daddr: [u8; IP_ADDR_LEN] = read_kernel(sk + SKC_V6_DADDR_OFFSET)?;
            (saddr, daddr)
        }
        _ => return Err(1),
    };

    Ok(ConnInfo {
        server: IpInfo {
            addr: server_addr,
            port: local_port,
            family,
        },
        client: IpInfo {
            addr: client_addr,
            port: u16::from_be(peer_port),
            family,
        },
    })
}

#[inline(always)]
fn widen_v4(a: [u8; 4]) -> [u8; IP_ADDR_LEN] {
    [a[0], a[1], a[2], a[3], 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]
}

#[inline(always)]
fn read_kernel<T>(addr: u64) -> Result<T, i64> {
    unsafe { bpf_probe_read_kernel(addr as *const T) }
}

// ============================================================
// Request / response
// ============================================================

/// Entry for `SSL_read(ssl, buf, num)`.
#[uprobe]
pub fn pgsli_ssl_read_enter(ctx: ProbeContext) -> u32 {
    let ssl: u64 = ctx.arg(0).unwrap_or(0);
    let buf: u64 = ctx.arg(1).unwrap_or(0);
    if ssl != 0 && buf != 0 {
        let _ = SSL_READ_ARGS.insert(&bpf_get_current_pid_tgid(), &SslReadArgs { ssl, buf }, 0);
    }
    0
}

/// Return from `SSL_read`: a request has arrived.
#[uretprobe]
pub fn pgsli_ssl_read_exit(ctx: RetProbeContext) -> u32 {
    let pid_tgid = bpf_get_current_pid_tgid();
    let args = match unsafe { SSL_READ_ARGS.get(&pid_tgid) } {
        Some(args) => *args,
        None => return 0,
    };
    let _ = SSL_READ_ARGS.remove(&pid_tgid);
    let _ = try_request_start(&ctx, pid_tgid, args);
    0
}

#[inline(always)]
fn try_request_start(ctx: &RetProbeContext, pid_tgid: u64, args: SslReadArgs) -> Result<(), i64> {
    let ret: i32 = ctx.ret().ok_or(1i64)?;
    if ret <= 0 {
        return Ok(());
    }

    let key = ConnKey {
        tgid: (pid_tgid >> 32) as u32,
        fd: fd_from_ssl(args.ssl)?,
    };
    let req_cmd: u8 = unsafe { bpf_probe_read_user(args.buf as *const u8)? };
    let now = unsafe { bpf_ktime_get_ns() };

    match PGSLI_CONN_SAMP.get_ptr_mut(&key) {
        Some(samp) => {
            let samp = unsafe { &mut *samp };
            // a request split over several reads keeps its first timestamp
            if samp.in_flight == 0 {
                samp.start_ts = now;
                samp.req_cmd = req_cmd;
                samp.in_flight = 1;
            }
        }
        None => {
            let samp = ConnSamp {
                start_ts: now,
                period_start: now,
                req_cmd,
                in_flight: 1,
                ..ConnSamp::default()
            };
            PGSLI_CONN_SAMP.insert(&key, &samp, 0)?;
        }
    }
    Ok(())
}

/// Entry for `SSL_write(ssl, buf, num)`: the response is going out.
#[uprobe]
pub fn pgsli_ssl_write_enter(ctx: ProbeContext) -> u32 {
    let _ = try_request_done(&ctx);
    0
}

#[inline(always)]
fn try_request_done(ctx: &ProbeContext) -> Result<(), i64> {
    let ssl: u64 = ctx.arg(0).ok_or(1i64)?;
    let pid_tgid = bpf_get_current_pid_tgid();
    let key = ConnKey {
        tgid: (pid_tgid >> 32) as u32,
        fd: fd_from_ssl(ssl)?,
    };

    let samp = PGSLI_CONN_SAMP.get_ptr_mut(&key).ok_or(1i64)?;
    let samp = unsafe { &mut *samp };
    // continuation of a response already accounted for
    if samp.in_flight == 0 {
        return Ok(());
    }
    samp.in_flight = 0;

    let now = unsafe { bpf_ktime_get_ns() };
    if now < samp.start_ts {
        return Ok(());
    }
    let latency = RttSample {
        req_cmd: samp.req_cmd,
        _pad: [0; 7],
        rtt_nsec: now - samp.start_ts,
    };

    let period_ns = PGSLI_ARGS
        .get(0)
        .map(|args| args.period_ns)
        .filter(|p| *p > 0)
        .unwrap_or(DEFAULT_PERIOD_NS);
    if now.saturating_sub(samp.period_start) >= period_ns {
        samp.max = RttSample::default();
        samp.period_start = now;
    }
    if latency.rtt_nsec > samp.max.rtt_nsec {
        samp.max = latency;
    }

    let conn = match unsafe { PGSLI_CONN.get(&key) } {
        Some(conn) => *conn,
        None => ConnInfo::default(),
    };
    let event = SliEvent {
        tgid: key.tgid,
        fd: key.fd,
        conn,
        latency,
        max: samp.max,
    };
    PGSLI_OUTPUT.output(ctx, &event, 0);
    Ok(())
}

/// `ssl->rbio->num`
#[inline(always)]
fn fd_from_ssl(ssl: u64) -> Result<i32, i64> {
    let rbio: u64 = unsafe { bpf_probe_read_user((ssl + SSL_RBIO_OFFSET) as *const u64)? };
    if rbio == 0 {
        return Err(1);
    }
    unsafe { bpf_probe_read_user((rbio + BIO_NUM_OFFSET) as *const i32) }
}
