//! Turns decoded `SliEvent`s into metrics records and threshold alerts.

use std::{
    fmt,
    io::{self, Write},
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
};

use chrono::{DateTime, Utc};
use dbsli_common::{AF_INET, AF_INET6, IpInfo, RttSample, SliEvent};
use log::warn;
use serde::Serialize;

use crate::telemetry;

pub const SLI_TABLE: &str = "pg_sli";
pub const MAX_SLI_TABLE: &str = "pg_max_sli";
pub const PROTOCOL: &str = "POSTGRE";
pub const ALERT_TARGET: &str = "dbsli::alert";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub addr: IpAddr,
    pub port: u16,
}

impl From<&IpInfo> for Endpoint {
    fn from(info: &IpInfo) -> Self {
        let addr = match info.family {
            AF_INET6 => IpAddr::V6(Ipv6Addr::from(info.addr)),
            AF_INET => IpAddr::V4(Ipv4Addr::new(
                info.addr[0],
                info.addr[1],
                info.addr[2],
                info.addr[3],
            )),
            // accept() was not observed for this connection
            _ => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        };
        Self {
            addr,
            port: info.port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

/// One measured request/response round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencySample {
    pub pid: u32,
    pub fd: i32,
    /// PostgreSQL frontend message type, e.g. `Q` for a simple query.
    pub cmd: u8,
    pub rtt_ns: u64,
    pub server: Endpoint,
    pub client: Endpoint,
}

impl LatencySample {
    fn with_rtt(event: &SliEvent, rtt: &RttSample) -> Self {
        Self {
            pid: event.tgid,
            fd: event.fd,
            cmd: rtt.req_cmd,
            rtt_ns: rtt.rtt_nsec,
            server: Endpoint::from(&event.conn.server),
            client: Endpoint::from(&event.conn.client),
        }
    }

    /// The measured sample and the connection's maximum in the current period.
    pub fn from_event(event: &SliEvent) -> (Self, Self) {
        (
            Self::with_rtt(event, &event.latency),
            Self::with_rtt(event, &event.max),
        )
    }

    pub fn entity_id(&self) -> String {
        format!("{}_{}", self.pid, self.fd)
    }

    pub fn cmd_tag(&self) -> char {
        if self.cmd.is_ascii_graphic() {
            self.cmd as char
        } else {
            '?'
        }
    }
}

/// `|table|pid|fd|POSTGRE|cmd|server_ip|server_port|client_ip|client_port|rtt_ns|`
pub struct MetricsRecord<'a> {
    pub table: &'a str,
    pub sample: &'a LatencySample,
}

impl fmt::Display for MetricsRecord<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.sample;
        write!(
            f,
            "|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|",
            self.table,
            s.pid,
            s.fd,
            PROTOCOL,
            s.cmd_tag(),
            s.server.addr,
            s.server.port,
            s.client.addr,
            s.client.port,
            s.rtt_ns
        )
    }
}

pub trait MetricsSink {
    /// Called exactly once per sample.
    fn record(&mut self, sample: &LatencySample, max: &LatencySample);
}

/// Writes `pg_sli` and `pg_max_sli` lines and flushes after each sample.
pub struct StdoutSink<W: Write = io::Stdout> {
    out: W,
}

impl StdoutSink {
    pub fn stdout() -> Self {
        Self { out: io::stdout() }
    }
}

impl<W: Write> StdoutSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    fn write_sample(&mut self, sample: &LatencySample, max: &LatencySample) -> io::Result<()> {
        writeln!(
            self.out,
            "{}",
            MetricsRecord {
                table: SLI_TABLE,
                sample
            }
        )?;
        writeln!(
            self.out,
            "{}",
            MetricsRecord {
                table: MAX_SLI_TABLE,
                sample: max
            }
        )?;
        self.out.flush()
    }
}

impl<W: Write> MetricsSink for StdoutSink<W> {
    fn record(&mut self, sample: &LatencySample, max: &LatencySample) {
        if let Err(e) = self.write_sample(sample, max) {
            warn!("Failed to write SLI record: {}", e);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warn,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Alert {
    pub timestamp: DateTime<Utc>,
    pub entity_name: &'static str,
    pub entity_id: String,
    pub metric: &'static str,
    pub severity: Severity,
    pub pid: u32,
    pub message: String,
}

impl Alert {
    pub fn threshold_exceeded(sample: &LatencySample) -> Self {
        Self {
            timestamp: Utc::now(),
            entity_name: "sli",
            entity_id: sample.entity_id(),
            metric: "rtt_nsec",
            severity: Severity::Warn,
            pid: sample.pid,
            message: format!(
                "Process(TID:{}, CIP({}), SIP({})) SLI({}:{}) exceed the threshold.",
                sample.pid,
                sample.client,
                sample.server,
                sample.cmd_tag(),
                sample.rtt_ns
            ),
        }
    }
}

pub trait AlertSink {
    fn alert(&mut self, alert: Alert);
}

/// One JSON line per alert on the `dbsli::alert` log target.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn alert(&mut self, alert: Alert) {
        match serde_json::to_string(&alert) {
            Ok(json) => warn!(target: ALERT_TARGET, "{}", json),
            Err(_) => warn!(target: ALERT_TARGET, "{}", alert.message),
        }
    }
}

pub struct SliEventHandler<M, A> {
    metrics: M,
    alerts: A,
    threshold_ns: u64,
}

impl<M: MetricsSink, A: AlertSink> SliEventHandler<M, A> {
    /// `threshold_ns == 0` disables alerting.
    pub fn new(metrics: M, alerts: A, threshold_ns: u64) -> Self {
        Self {
            metrics,
            alerts,
            threshold_ns,
        }
    }

    /// Returns whether an alert was raised.
    pub fn handle(&mut self, event: &SliEvent) -> bool {
        let (sample, max) = LatencySample::from_event(event);

        self.metrics.record(&sample, &max);

        let alerted = self.threshold_ns > 0 && sample.rtt_ns > self.threshold_ns;
        if alerted {
            self.alerts.alert(Alert::threshold_exceeded(&sample));
        }

        telemetry::record_sli_sample(sample.rtt_ns, &sample.cmd_tag().to_string(), alerted);
        alerted
    }

    #[cfg(test)]
    pub(crate) fn sinks(&self) -> (&M, &A) {
        (&self.metrics, &self.alerts)
    }
}
