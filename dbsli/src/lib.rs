pub mod error;
pub mod probes;
pub mod settings;
pub mod telemetry;

use std::sync::Arc;

use anyhow::{Context, Result};
use aya::{Ebpf, EbpfLoader};
use aya_log::EbpfLogger;
use log::{info, warn};
use tokio::signal;

use crate::probes::{
    Probe, ProbeState,
    builtin::{
        OffCpuProbe, SliConnTracker,
        sli::{self, Reconciler, UprobeAttacher},
    },
    discovery::ProcfsDiscovery,
    pin::PinnedMaps,
};
use crate::settings::Settings;

pub struct SliEngine {
    pub settings: Settings,
    bpf: Ebpf,
    pins: PinnedMaps,
    state: Arc<ProbeState>,
}

impl SliEngine {
    pub fn new(settings: Settings, bytecode: &[u8]) -> Result<Self> {
        bump_memlock_rlimit()?;

        let pins = PinnedMaps::new(settings.pin_dir());
        pins.clear_stale()
            .with_context(|| format!("Failed to prepare pin directory {}", pins.dir().display()))?;

        let mut bpf = EbpfLoader::new()
            .map_pin_path(pins.dir())
            .load(bytecode)
            .context("Failed to load eBPF object")?;
        if let Err(e) = EbpfLogger::init(&mut bpf) {
            warn!("Failed to initialize eBPF logger: {}", e);
        }

        Ok(Self {
            settings,
            bpf,
            pins,
            state: ProbeState::new(),
        })
    }

    pub fn state(&self) -> Arc<ProbeState> {
        self.state.clone()
    }

    /// Runs until Ctrl-C or a fatal probe error. Links, programs and pinned
    /// maps are released on every exit path.
    pub async fn run(self) -> Result<()> {
        let Self {
            settings,
            bpf,
            pins,
            state,
        } = self;

        let result = run_probes(&settings, bpf, &state).await;
        state.request_shutdown();
        pins.remove();
        result
    }
}

async fn run_probes(settings: &Settings, mut bpf: Ebpf, state: &Arc<ProbeState>) -> Result<()> {
    attach_builtin_probes(settings, &mut bpf, state)?;

    let signal_state = state.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Exiting...");
        }
        signal_state.request_shutdown();
    });

    if !settings.sli_enabled() {
        info!("SLI probe disabled. Press Ctrl-C to exit.");
        while !state.is_shutdown() {
            tokio::time::sleep(settings.interval()).await;
        }
        return Ok(());
    }

    let config = settings.threshold_config();
    SliConnTracker.attach(&mut bpf, state)?;
    let hook = sli::start_hook(&mut bpf, &config, state.clone())?;
    let attacher = UprobeAttacher::new(bpf, &config.library)?;

    info!(
        "Watching processes matching {:?} for lib{} every {:?}. Press Ctrl-C to exit.",
        config.target_comm, config.library, config.period
    );
    let reconciler =
        Reconciler::new(ProcfsDiscovery, attacher, state.clone(), config).with_start_hook(hook);

    let (attacher, result) = tokio::task::spawn_blocking(move || reconciler.run())
        .await
        .context("Reconciliation thread panicked")?;

    // unloads every program and map
    drop(attacher.into_inner());
    result
}

fn attach_builtin_probes(settings: &Settings, bpf: &mut Ebpf, state: &Arc<ProbeState>) -> Result<()> {
    let sched = &settings.builtin_probes.scheduler;
    if sched.offcpu.unwrap_or(false) {
        OffCpuProbe {
            config: settings.to_convert_data(),
            pids: sched.offcpu_pids.clone().unwrap_or_default(),
            period: settings.interval(),
        }
        .attach(bpf, state)?;
    }
    Ok(())
}

fn bump_memlock_rlimit() -> Result<()> {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        warn!("Failed to increase rlimit");
    }
    Ok(())
}
