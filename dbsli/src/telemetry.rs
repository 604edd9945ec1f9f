//! OpenTelemetry metrics export module
//!
//! Exports probe metrics collected by dbsli to an OpenTelemetry Collector.
//! Export is enabled only when `OTEL_EXPORTER_OTLP_ENDPOINT` is set; every
//! `record_*` helper is a no-op otherwise.

use anyhow::{Context, Result};
use log::info;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::{KeyValue, global};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{OnceLock, RwLock};
use std::time::Duration;

/// Metric export interval in seconds
const METRIC_EXPORT_INTERVAL_SECS: u64 = 30;

static METRICS: OnceLock<DbSliMetrics> = OnceLock::new();

static METER_PROVIDER: OnceLock<SdkMeterProvider> = OnceLock::new();

/// Read by the `active_probes` gauge callback.
static ACTIVE_PROBES: OnceLock<RwLock<HashMap<String, u64>>> = OnceLock::new();

/// Read by the `sli_tracked_processes` gauge callback.
static TRACKED_PROCESSES: AtomicU64 = AtomicU64::new(0);

fn active_probes_map() -> &'static RwLock<HashMap<String, u64>> {
    ACTIVE_PROBES.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Note: Do NOT add _total suffix to Counter names (Prometheus adds it automatically)
pub struct DbSliMetrics {
    // SLI
    pub sli_rtt_ns: Histogram<u64>,
    pub sli_alerts: Counter<u64>,
    pub sli_link_ops: Counter<u64>,

    // Scheduler
    pub offcpu_duration_ns: Histogram<u64>,
    pub offcpu_unresolved_stacks: Counter<u64>,

    pub perf_lost_events: Counter<u64>,
}

impl DbSliMetrics {
    fn new(meter: &Meter) -> Self {
        Self {
            sli_rtt_ns: meter
                .u64_histogram("sli_rtt_ns")
                .with_description("Database request round trip measured at the server")
                .with_unit("ns")
                .build(),
            sli_alerts: meter
                .u64_counter("sli_alerts")
                .with_description("Requests whose round trip exceeded the configured threshold")
                .with_unit("events")
                .build(),
            sli_link_ops: meter
                .u64_counter("sli_link_ops")
                .with_description("Per-process uprobe attach and detach operations")
                .with_unit("operations")
                .build(),
            offcpu_duration_ns: meter
                .u64_histogram("offcpu_duration_ns")
                .with_description("Time spent off-CPU (blocked)")
                .with_unit("ns")
                .build(),
            offcpu_unresolved_stacks: meter
                .u64_counter("offcpu_unresolved_stacks")
                .with_description("Reported off-CPU stacks whose frames were no longer in the stack map")
                .with_unit("stacks")
                .build(),
            perf_lost_events: meter
                .u64_counter("perf_lost_events")
                .with_description("Events dropped because a perf buffer was full")
                .with_unit("events")
                .build(),
        }
    }
}

/// `OTEL_EXPORTER_OTLP_ENDPOINT`, with `http://` added when no scheme is given.
/// Metrics are disabled when unset or empty.
fn get_otlp_endpoint() -> Option<String> {
    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok()?;
    if endpoint.is_empty() {
        return None;
    }

    if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
        Some(format!("http://{}", endpoint))
    } else {
        Some(endpoint)
    }
}

/// Initialize OpenTelemetry metrics provider
///
/// Configures metrics export to OTLP Collector via gRPC.
/// Skips initialization if OTEL_EXPORTER_OTLP_ENDPOINT is not set.
pub fn init_metrics() -> Result<()> {
    let endpoint = match get_otlp_endpoint() {
        Some(ep) => ep,
        None => {
            info!("OTEL_EXPORTER_OTLP_ENDPOINT not set. Metrics export disabled.");
            return Ok(());
        }
    };

    info!("OTLP endpoint: {}", endpoint);

    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(&endpoint)
        .with_timeout(Duration::from_secs(10))
        .build()
        .context("Failed to create OTLP metric exporter")?;

    let reader = PeriodicReader::builder(exporter, opentelemetry_sdk::runtime::Tokio)
        .with_interval(Duration::from_secs(METRIC_EXPORT_INTERVAL_SECS))
        .build();

    let resource = Resource::default().merge(&Resource::new(vec![
        KeyValue::new("service.name", "dbsli"),
        KeyValue::new("telemetry.sdk.language", "rust"),
    ]));

    let provider = SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(resource)
        .build();

    global::set_meter_provider(provider.clone());
    let _ = METER_PROVIDER.set(provider);

    let meter = global::meter("dbsli");

    let _active_probes_gauge = meter
        .u64_observable_gauge("active_probes")
        .with_description("Number of currently active eBPF probes")
        .with_unit("probes")
        .with_callback(|observer| {
            if let Ok(probes) = active_probes_map().read() {
                for (probe_name, count) in probes.iter() {
                    observer.observe(*count, &[KeyValue::new("probe", probe_name.clone())]);
                }
            }
        })
        .build();

    let _tracked_gauge = meter
        .u64_observable_gauge("sli_tracked_processes")
        .with_description("Processes with SSL uprobes attached")
        .with_unit("processes")
        .with_callback(|observer| {
            observer.observe(TRACKED_PROCESSES.load(Ordering::Relaxed), &[]);
        })
        .build();

    let _ = METRICS.set(DbSliMetrics::new(&meter));

    info!("OpenTelemetry metrics initialized successfully");
    Ok(())
}

pub fn metrics() -> Option<&'static DbSliMetrics> {
    METRICS.get()
}

pub fn record_active_probe(probe_name: &str, count: u64) {
    if let Ok(mut probes) = active_probes_map().write() {
        probes.insert(probe_name.to_string(), count);
        info!("Active probe registered: {} = {}", probe_name, count);
    }
}

pub fn record_sli_sample(rtt_ns: u64, cmd: &str, alerted: bool) {
    if let Some(m) = metrics() {
        let attrs = [
            KeyValue::new("protocol", "POSTGRE"),
            KeyValue::new("cmd", cmd.to_string()),
        ];
        m.sli_rtt_ns.record(rtt_ns, &attrs);
        if alerted {
            m.sli_alerts.add(1, &attrs);
        }
    }
}

pub fn record_link_ops(attached: u64, detached: u64) {
    if let Some(m) = metrics() {
        if attached > 0 {
            m.sli_link_ops.add(attached, &[KeyValue::new("op", "attach")]);
        }
        if detached > 0 {
            m.sli_link_ops.add(detached, &[KeyValue::new("op", "detach")]);
        }
    }
}

pub fn record_tracked_processes(count: u64) {
    TRACKED_PROCESSES.store(count, Ordering::Relaxed);
}

pub fn record_offcpu_event(duration_ns: u64, comm: &str) {
    if let Some(m) = metrics() {
        let attrs = [KeyValue::new("process", comm.to_string())];
        m.offcpu_duration_ns.record(duration_ns, &attrs);
    }
}

pub fn record_unresolved_stack(kind: &'static str) {
    if let Some(m) = metrics() {
        m.offcpu_unresolved_stacks.add(1, &[KeyValue::new("stack", kind)]);
    }
}

pub fn record_lost_events(channel: &'static str, lost: u64) {
    if lost == 0 {
        return;
    }
    if let Some(m) = metrics() {
        m.perf_lost_events.add(lost, &[KeyValue::new("channel", channel)]);
    }
}

/// Flushes pending metrics and shuts down the MeterProvider
pub fn shutdown_metrics() {
    if let Some(provider) = METER_PROVIDER.get() {
        info!("Shutting down OpenTelemetry metrics...");
        if let Err(e) = provider.shutdown() {
            log::warn!("Failed to shutdown MeterProvider: {}", e);
        } else {
            info!("OpenTelemetry metrics shutdown complete");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_get_otlp_endpoint_not_set() {
        unsafe { std::env::remove_var("OTEL_EXPORTER_OTLP_ENDPOINT") };
        assert!(get_otlp_endpoint().is_none());
    }

    #[test]
    #[serial]
    fn test_get_otlp_endpoint_empty() {
        unsafe { std::env::set_var("OTEL_EXPORTER_OTLP_ENDPOINT", "") };
        assert!(get_otlp_endpoint().is_none());
        unsafe { std::env::remove_var("OTEL_EXPORTER_OTLP_ENDPOINT") };
    }

    #[test]
    #[serial]
    fn test_get_otlp_endpoint_adds_http_prefix() {
        unsafe { std::env::set_var("OTEL_EXPORTER_OTLP_ENDPOINT", "collector:4317") };
        assert_eq!(
            get_otlp_endpoint(),
            Some("http://collector:4317".to_string())
        );
        unsafe { std::env::set_var("OTEL_EXPORTER_OTLP_ENDPOINT", "https://collector:4317") };
        assert_eq!(
            get_otlp_endpoint(),
            Some("https://collector:4317".to_string())
        );
        unsafe { std::env::remove_var("OTEL_EXPORTER_OTLP_ENDPOINT") };
    }

    #[test]
    fn test_recorders_are_noops_without_provider() {
        record_sli_sample(5_000_000, "Q", true);
        record_link_ops(3, 3);
        record_lost_events("PGSLI_OUTPUT", 2);
        record_unresolved_stack("kernel");
        assert!(metrics().is_none());
    }
}
