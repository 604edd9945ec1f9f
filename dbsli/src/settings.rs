use std::{path::Path, path::PathBuf, time::Duration};

use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::Deserialize;

const DEFAULT_PROBE_INTERVAL_SECONDS: u32 = 5;
const DEFAULT_TARGET_COMM: &str = "gaussdb";
const DEFAULT_LIBRARY: &str = "ssl";
pub const DEFAULT_PIN_DIR: &str = "/sys/fs/bpf/dbsli";

/// Database SLI probe configuration
#[derive(Debug, Deserialize, Clone, Default)]
#[allow(unused)]
pub struct SliProbe {
    pub enabled: Option<bool>,
    /// Substring matched against the process command name.
    pub target_comm: Option<String>,
    /// Shared library carrying `SSL_read` / `SSL_write`, without the `lib` prefix.
    pub library: Option<String>,
    /// 0 disables alerting.
    pub latency_threshold_ms: Option<u64>,
    pub pin_dir: Option<PathBuf>,
}

/// Scheduler probe configuration
#[derive(Debug, Deserialize, Clone, Default)]
#[allow(unused)]
pub struct SchedulerProbes {
    pub offcpu: Option<bool>,
    pub offcpu_min_block_us: Option<u64>,
    /// When set, only these tgids are sampled.
    pub offcpu_pids: Option<Vec<u32>>,
    /// `task_struct` layout of the running kernel. Without both, stacks of a
    /// reused tgid within one period are merged.
    pub offcpu_task_leader_offset: Option<u32>,
    pub offcpu_task_start_offset: Option<u32>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[allow(unused)]
pub struct BuiltinProbes {
    #[serde(default)]
    pub sli: SliProbe,
    #[serde(default)]
    pub scheduler: SchedulerProbes,
    pub interval: Option<u32>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[allow(unused)]
pub struct Settings {
    pub otel_exporter_otlp_endpoint: Option<String>,
    pub otel_exporter_otlp_protocol: Option<String>,
    #[serde(default)]
    pub builtin_probes: BuiltinProbes,
}

/// Probe parameters fixed for the lifetime of the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThresholdConfig {
    pub period: Duration,
    pub threshold_ns: u64,
    pub target_comm: String,
    pub library: String,
}

impl ThresholdConfig {
    pub fn period_ns(&self) -> u64 {
        self.period.as_nanos() as u64
    }
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Environment variables override values from the optional YAML file.
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let mut builder = Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(File::from(path).format(FileFormat::Yaml).required(true));
        }

        let s = builder
            .add_source(
                Environment::default()
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("builtin_probes.scheduler.offcpu_pids")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Self = s.try_deserialize()?;
        log::debug!("Parsed settings: {:?}", settings);
        Ok(settings)
    }

    pub fn interval(&self) -> Duration {
        let secs = self
            .builtin_probes
            .interval
            .filter(|s| *s > 0)
            .unwrap_or(DEFAULT_PROBE_INTERVAL_SECONDS);
        Duration::from_secs(secs as u64)
    }

    pub fn sli_enabled(&self) -> bool {
        self.builtin_probes.sli.enabled.unwrap_or(true)
    }

    pub fn pin_dir(&self) -> PathBuf {
        self.builtin_probes
            .sli
            .pin_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_PIN_DIR))
    }

    pub fn threshold_config(&self) -> ThresholdConfig {
        let sli = &self.builtin_probes.sli;
        ThresholdConfig {
            period: self.interval(),
            threshold_ns: sli.latency_threshold_ms.unwrap_or(0).saturating_mul(1_000_000),
            target_comm: sli
                .target_comm
                .clone()
                .unwrap_or_else(|| DEFAULT_TARGET_COMM.to_string()),
            library: sli
                .library
                .clone()
                .unwrap_or_else(|| DEFAULT_LIBRARY.to_string()),
        }
    }

    pub fn to_convert_data(&self) -> dbsli_common::ConvertData {
        let sched = &self.builtin_probes.scheduler;
        dbsli_common::ConvertData {
            min_block_us: sched
                .offcpu_min_block_us
                .unwrap_or(dbsli_common::MIN_BLOCK_US),
            task_leader_off: sched.offcpu_task_leader_offset.unwrap_or(0),
            task_start_off: sched.offcpu_task_start_offset.unwrap_or(0),
            whitelist_enable: sched.offcpu_pids.as_ref().is_some_and(|p| !p.is_empty()) as u8,
            ..Default::default()
        }
    }
}
