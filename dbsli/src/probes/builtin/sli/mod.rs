//! PostgreSQL-over-TLS round trip probe.
//!
//! Connection tracking (accept/close) is attached once for the whole host.
//! The SSL uprobes are attached per process by the [`Reconciler`], which
//! follows database processes as they start and exit.

mod attach;
mod consumer;
mod pipeline;
mod reconcile;
mod registry;

pub use attach::{Attacher, UprobeAttacher};
pub use consumer::SliConsumer;
pub use pipeline::{
    Alert, AlertSink, Endpoint, LatencySample, LogAlertSink, MetricsRecord, MetricsSink,
    SliEventHandler, StdoutSink,
};
pub use reconcile::{CycleReport, Reconciler, StartHook};
pub use registry::{LinkEntry, LinkHandles, LinkRegistry, LinkState};

use std::sync::Arc;

use anyhow::{Context, Result};
use aya::{
    Ebpf,
    maps::{Array, MapData},
};
use dbsli_common::SliArgs;
use log::info;

use crate::probes::{
    PerfChannel, ProbeState, TracepointConfig, attach_kprobe, attach_tracepoint, pin,
};
use crate::settings::ThresholdConfig;
use crate::telemetry;

/// Host-wide connection tracking programs.
pub struct SliConnTracker;

impl crate::probes::Probe for SliConnTracker {
    fn attach(&self, bpf: &mut Ebpf, _state: &Arc<ProbeState>) -> Result<()> {
        attach_kprobe(bpf, "pgsli_inet_csk_accept_exit", "inet_csk_accept")?;
        attach_kprobe(bpf, "pgsli_sys_accept4_exit", "__sys_accept4")?;
        attach_tracepoint(
            bpf,
            TracepointConfig {
                program_name: "pgsli_sys_enter_close",
                category: "syscalls",
                name: "sys_enter_close",
            },
        )?;
        telemetry::record_active_probe("sli_conn", 3);
        Ok(())
    }
}

/// Builds the one-shot start hook: pushes the period into the kernel and
/// starts the event consumer.
pub fn start_hook(
    bpf: &mut Ebpf,
    config: &ThresholdConfig,
    state: Arc<ProbeState>,
) -> Result<StartHook> {
    let mut args: Array<MapData, SliArgs> = Array::try_from(
        bpf.take_map(pin::PGSLI_ARGS)
            .with_context(|| format!("Failed to find {} map", pin::PGSLI_ARGS))?,
    )?;
    let output = bpf
        .take_map(pin::PGSLI_OUTPUT)
        .with_context(|| format!("Failed to find {} map", pin::PGSLI_OUTPUT))?;

    let period = config.period;
    let period_ns = config.period_ns();
    let threshold_ns = config.threshold_ns;

    Ok(Box::new(move || {
        args.set(0, SliArgs { period_ns }, 0)
            .context("Failed to write SLI args")?;

        let channel = PerfChannel::from_map(output, pin::PGSLI_OUTPUT)?;
        let handler = SliEventHandler::new(StdoutSink::stdout(), LogAlertSink, threshold_ns);
        SliConsumer::new(channel, handler, state, period).spawn()?;

        info!(
            "SLI consumer started (threshold {})",
            if threshold_ns > 0 {
                format!("{}ns", threshold_ns)
            } else {
                "disabled".to_string()
            }
        );
        Ok(())
    }))
}
