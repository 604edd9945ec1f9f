//! Periodic discovery -> attach -> sweep over the target processes.
//!
//! The reconciler is the only owner of the [`LinkRegistry`]. It runs on one
//! blocking thread and talks to the rest of the agent through [`ProbeState`].

use std::sync::Arc;

use anyhow::Result;
use log::{debug, error, info, warn};

use super::attach::Attacher;
use super::registry::LinkRegistry;
use crate::error::ProbeError;
use crate::probes::ProbeState;
use crate::probes::discovery::{ProcessDiscovery, Resolution};
use crate::settings::ThresholdConfig;
use crate::telemetry;

/// Runs once, after the first cycle that completed without being skipped.
pub type StartHook = Box<dyn FnOnce() -> Result<()> + Send>;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub skipped: bool,
    pub discovered: usize,
    pub added: usize,
    pub attached: usize,
    pub swept: usize,
    pub released: usize,
}

impl CycleReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Default::default()
        }
    }

    fn is_quiet(&self) -> bool {
        self.added == 0 && self.attached == 0 && self.swept == 0
    }
}

pub struct Reconciler<D, A: Attacher> {
    discovery: D,
    attacher: A,
    registry: LinkRegistry<A::Link>,
    state: Arc<ProbeState>,
    config: ThresholdConfig,
    start_hook: Option<StartHook>,
}

impl<D: ProcessDiscovery, A: Attacher> Reconciler<D, A> {
    pub fn new(discovery: D, attacher: A, state: Arc<ProbeState>, config: ThresholdConfig) -> Self {
        Self {
            discovery,
            attacher,
            registry: LinkRegistry::new(),
            state,
            config,
            start_hook: None,
        }
    }

    pub fn with_start_hook(mut self, hook: StartHook) -> Self {
        self.start_hook = Some(hook);
        self
    }

    pub fn registry(&self) -> &LinkRegistry<A::Link> {
        &self.registry
    }

    /// One reconciliation pass.
    ///
    /// A latched missing dependency or a soft discovery failure skips the pass
    /// without touching the registry. A soft attach failure leaves the pid
    /// pending for the next pass. Fatal errors are returned as is; the caller
    /// is expected to [`shutdown`](Self::shutdown).
    pub fn run_cycle(&mut self) -> Result<CycleReport, ProbeError> {
        if self.state.dependency_absent() {
            return Ok(CycleReport::skipped());
        }

        let pids = match self.discovery.discover(&self.config.target_comm) {
            Ok(pids) => pids,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!("{}; skipping cycle", e);
                return Ok(CycleReport::skipped());
            }
        };

        let mut report = CycleReport {
            discovered: pids.len(),
            ..Default::default()
        };

        self.registry.mark_all_unseen();

        for &pid in &pids {
            if self.registry.confirm(pid) {
                continue;
            }
            // after the first NotLoaded, the rest of this pass only confirms
            if self.state.dependency_absent() {
                continue;
            }
            match self.attacher.resolve(pid) {
                Ok(Resolution::Found(path)) => {
                    debug!("pid {} uses {}", pid, path.display());
                    if self.registry.insert_pending(pid, path) {
                        report.added += 1;
                    }
                }
                Ok(Resolution::NotLoaded) => {
                    info!(
                        "pid {} does not load lib{}; no longer looking for new processes",
                        pid, self.config.library
                    );
                    self.state.latch_dependency_absent();
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => debug!("{}", e),
            }
        }

        for (pid, path) in self.registry.pending() {
            let links = match self.attacher.attach(pid, &path) {
                Ok(links) => links,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!("{}; retrying next cycle", e);
                    continue;
                }
            };
            if let Err(links) = self.registry.mark_attached(pid, links) {
                self.attacher.detach(pid, links);
                continue;
            }
            report.attached += 1;
        }

        let attacher = &mut self.attacher;
        let mut released = 0;
        let swept = self.registry.sweep(|pid, links| {
            attacher.detach(pid, links);
            released += 1;
        });
        for pid in &swept {
            info!("pid {} is gone; removed its SSL uprobes", pid);
        }
        report.swept = swept.len();
        report.released = released;

        Ok(report)
    }

    /// Releases every held link. Returns the number of entries removed.
    pub fn shutdown(&mut self) -> usize {
        let attacher = &mut self.attacher;
        let mut released = 0u64;
        let removed = self.registry.drain(|pid, links| {
            attacher.detach(pid, links);
            released += 1;
        });
        telemetry::record_link_ops(0, released * 3);
        telemetry::record_tracked_processes(0);
        removed
    }

    /// Sleeps one period, then reconciles, until shutdown is requested or a
    /// fatal error occurs. Every exit releases all links and sets the shared
    /// shutdown flag. The attacher is handed back for unloading.
    pub fn run(mut self) -> (A, Result<()>) {
        let result = self.run_loop();
        if let Err(e) = &result {
            error!("SLI reconciliation stopped: {:#}", e);
        }

        let removed = self.shutdown();
        info!("Released SSL uprobes of {} processes", removed);
        self.state.request_shutdown();

        (self.attacher, result)
    }

    fn run_loop(&mut self) -> Result<()> {
        let period = self.config.period;
        loop {
            std::thread::sleep(period);
            if self.state.is_shutdown() {
                return Ok(());
            }

            let report = self.run_cycle()?;
            if !report.skipped {
                self.log_report(&report);
                if let Some(hook) = self.start_hook.take() {
                    hook()?;
                    info!("SLI probe started (period {:?})", period);
                }
            }
        }
    }

    fn log_report(&self, report: &CycleReport) {
        if report.is_quiet() {
            debug!("Reconciled {:?}", report);
        } else {
            info!(
                "Reconciled: discovered={} added={} attached={} swept={} tracked={}",
                report.discovered,
                report.added,
                report.attached,
                report.swept,
                self.registry.len()
            );
        }
        telemetry::record_link_ops(report.attached as u64 * 3, report.released as u64 * 3);
        telemetry::record_tracked_processes(self.registry.attached_count() as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probes::builtin::sli::registry::{LinkHandles, LinkState};
    use std::collections::{HashMap, HashSet, VecDeque};
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    type FakeLink = (u32, u8);

    /// Returns scripted pid lists, repeating the last one.
    struct FakeDiscovery {
        script: Mutex<VecDeque<Result<Vec<u32>, ProbeError>>>,
        last: Mutex<Vec<u32>>,
    }

    impl FakeDiscovery {
        fn new(script: Vec<Result<Vec<u32>, ProbeError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                last: Mutex::new(Vec::new()),
            }
        }
    }

    impl ProcessDiscovery for FakeDiscovery {
        fn discover(&self, _comm: &str) -> Result<Vec<u32>, ProbeError> {
            match self.script.lock().unwrap().pop_front() {
                Some(Ok(pids)) => {
                    *self.last.lock().unwrap() = pids.clone();
                    Ok(pids)
                }
                Some(Err(e)) => Err(e),
                None => Ok(self.last.lock().unwrap().clone()),
            }
        }
    }

    #[derive(Default)]
    struct FakeAttacher {
        not_loaded: HashSet<u32>,
        lookup_fails: HashSet<u32>,
        attach_fails: HashSet<u32>,
        attach_lookup_fails: HashSet<u32>,
        resolved: Vec<u32>,
        attaches: usize,
        live: HashMap<FakeLink, ()>,
        released: Vec<FakeLink>,
    }

    impl Attacher for FakeAttacher {
        type Link = FakeLink;

        fn resolve(&mut self, pid: u32) -> Result<Resolution, ProbeError> {
            self.resolved.push(pid);
            if self.lookup_fails.contains(&pid) {
                return Err(ProbeError::Lookup {
                    pid,
                    reason: "maps unreadable".into(),
                });
            }
            if self.not_loaded.contains(&pid) {
                return Ok(Resolution::NotLoaded);
            }
            Ok(Resolution::Found(PathBuf::from("/usr/lib64/libssl.so.1.1")))
        }

        fn attach(&mut self, pid: u32, path: &Path) -> Result<LinkHandles<FakeLink>, ProbeError> {
            if self.attach_fails.contains(&pid) {
                return Err(ProbeError::Attach {
                    pid,
                    program: "pgsli_ssl_write_enter",
                    symbol: "SSL_write",
                    path: path.to_path_buf(),
                    reason: "EINVAL".into(),
                });
            }
            if self.attach_lookup_fails.contains(&pid) {
                return Err(ProbeError::Lookup {
                    pid,
                    reason: "library unmapped".into(),
                });
            }
            self.attaches += 1;
            let links = LinkHandles {
                read_enter: (pid, 0),
                read_exit: (pid, 1),
                write_enter: (pid, 2),
            };
            for link in [(pid, 0), (pid, 1), (pid, 2)] {
                self.live.insert(link, ());
            }
            Ok(links)
        }

        fn detach(&mut self, _pid: u32, links: LinkHandles<FakeLink>) {
            for link in links.into_array() {
                assert!(self.live.remove(&link).is_some(), "released twice: {:?}", link);
                self.released.push(link);
            }
        }
    }

    fn config() -> ThresholdConfig {
        ThresholdConfig {
            period: Duration::from_millis(1),
            threshold_ns: 0,
            target_comm: "gaussdb".into(),
            library: "ssl".into(),
        }
    }

    fn reconciler(
        script: Vec<Result<Vec<u32>, ProbeError>>,
        attacher: FakeAttacher,
    ) -> Reconciler<FakeDiscovery, FakeAttacher> {
        Reconciler::new(FakeDiscovery::new(script), attacher, ProbeState::new(), config())
    }

    #[test]
    fn test_resolved_pids_end_attached() {
        let mut r = reconciler(vec![Ok(vec![101, 202])], FakeAttacher::default());

        let report = r.run_cycle().unwrap();

        assert_eq!(report.attached, 2);
        for pid in [101, 202] {
            let entry = r.registry().get(pid).unwrap();
            assert_eq!(entry.state(), LinkState::Attached);
            let links = entry.links().unwrap();
            assert_eq!(links.read_enter, (pid, 0));
            assert_eq!(links.read_exit, (pid, 1));
            assert_eq!(links.write_enter, (pid, 2));
        }
    }

    #[test]
    fn test_vanished_pid_released_exactly_once() {
        let mut r = reconciler(
            vec![Ok(vec![101, 202]), Ok(vec![101]), Ok(vec![101])],
            FakeAttacher::default(),
        );
        r.run_cycle().unwrap();

        let report = r.run_cycle().unwrap();
        assert_eq!(report.swept, 1);
        assert_eq!(report.released, 1);
        assert_eq!(r.registry().state(202), None);
        assert_eq!(r.attacher.released, vec![(202, 0), (202, 1), (202, 2)]);

        r.run_cycle().unwrap();
        assert_eq!(r.attacher.released.len(), 3);
        assert_eq!(r.registry().state(101), Some(LinkState::Attached));
    }

    #[test]
    fn test_unchanged_discovery_is_idempotent() {
        let mut r = reconciler(vec![Ok(vec![101, 202])], FakeAttacher::default());
        r.run_cycle().unwrap();
        let (attaches, resolves) = (r.attacher.attaches, r.attacher.resolved.len());

        let report = r.run_cycle().unwrap();

        assert_eq!(report.attached, 0);
        assert_eq!(report.swept, 0);
        assert_eq!(r.attacher.attaches, attaches);
        assert_eq!(r.attacher.resolved.len(), resolves);
        assert!(r.attacher.released.is_empty());
    }

    #[test]
    fn test_not_loaded_short_circuits_the_pass() {
        let attacher = FakeAttacher {
            not_loaded: [202, 303].into(),
            ..Default::default()
        };
        let mut r = reconciler(vec![Ok(vec![101, 202, 303])], attacher);

        r.run_cycle().unwrap();

        assert_eq!(r.registry().state(101), Some(LinkState::Attached));
        assert_eq!(r.registry().state(202), None);
        assert_eq!(r.registry().state(303), None);
        assert!(r.state.dependency_absent());
        // 303 was never looked at
        assert_eq!(r.attacher.resolved, vec![101, 202]);

        // latched: later passes are no-ops
        let report = r.run_cycle().unwrap();
        assert!(report.skipped);
        assert_eq!(r.attacher.resolved, vec![101, 202]);
        assert_eq!(r.registry().state(101), Some(LinkState::Attached));
    }

    #[test]
    fn test_second_pid_not_loaded_leaves_first_attached() {
        let attacher = FakeAttacher {
            not_loaded: [202].into(),
            ..Default::default()
        };
        let mut r = reconciler(vec![Ok(vec![101, 202])], attacher);

        let report = r.run_cycle().unwrap();

        assert_eq!(report.attached, 1);
        assert_eq!(r.registry().state(101), Some(LinkState::Attached));
        assert_eq!(r.registry().state(202), None);
        assert_eq!(r.registry().len(), 1);
        assert!(r.state.dependency_absent());
        assert_eq!(r.attacher.resolved, vec![101, 202]);

        let report = r.run_cycle().unwrap();
        assert!(report.skipped);
        assert_eq!(r.attacher.resolved, vec![101, 202]);
        assert!(r.attacher.released.is_empty());
    }

    #[test]
    fn test_tracked_pids_survive_the_short_circuit() {
        let attacher = FakeAttacher {
            not_loaded: [150].into(),
            ..Default::default()
        };
        let mut r = reconciler(vec![Ok(vec![101, 202]), Ok(vec![101, 150, 202])], attacher);
        r.run_cycle().unwrap();

        let report = r.run_cycle().unwrap();

        assert!(r.state.dependency_absent());
        assert_eq!(report.swept, 0);
        assert_eq!(r.registry().state(202), Some(LinkState::Attached));
    }

    #[test]
    fn test_lookup_error_is_retried_next_cycle() {
        let attacher = FakeAttacher {
            lookup_fails: [202].into(),
            ..Default::default()
        };
        let mut r = reconciler(vec![Ok(vec![101, 202])], attacher);

        r.run_cycle().unwrap();
        assert_eq!(r.registry().state(202), None);
        assert!(!r.state.dependency_absent());

        r.attacher.lookup_fails.clear();
        r.run_cycle().unwrap();
        assert_eq!(r.registry().state(202), Some(LinkState::Attached));
    }

    #[test]
    fn test_discovery_failure_skips_without_sweeping() {
        let mut r = reconciler(
            vec![
                Ok(vec![101]),
                Err(ProbeError::Discovery("/proc unavailable".into())),
            ],
            FakeAttacher::default(),
        );
        r.run_cycle().unwrap();

        let report = r.run_cycle().unwrap();

        assert!(report.skipped);
        assert_eq!(r.registry().state(101), Some(LinkState::Attached));
        assert!(r.attacher.released.is_empty());
    }

    #[test]
    fn test_soft_attach_error_keeps_pid_pending() {
        let attacher = FakeAttacher {
            attach_lookup_fails: [202].into(),
            ..Default::default()
        };
        let mut r = reconciler(vec![Ok(vec![101, 202])], attacher);

        let report = r.run_cycle().unwrap();
        assert_eq!(report.attached, 1);
        assert_eq!(r.registry().state(202), Some(LinkState::PendingAttach));

        r.attacher.attach_lookup_fails.clear();
        let report = r.run_cycle().unwrap();
        assert_eq!(report.attached, 1);
        assert_eq!(r.registry().state(202), Some(LinkState::Attached));
        assert!(r.attacher.released.is_empty());
    }

    #[test]
    fn test_attach_failure_is_fatal_and_releases_everything() {
        let attacher = FakeAttacher {
            attach_fails: [202].into(),
            ..Default::default()
        };
        let r = reconciler(vec![Ok(vec![101, 202])], attacher);
        let state = r.state.clone();

        let (attacher, result) = r.run();

        assert!(matches!(
            result.unwrap_err().downcast_ref::<ProbeError>(),
            Some(ProbeError::Attach { pid: 202, .. })
        ));
        assert!(attacher.live.is_empty());
        assert_eq!(attacher.released.len(), 3);
        assert!(state.is_shutdown());
    }

    #[test]
    fn test_start_hook_runs_once_after_first_completed_cycle() {
        let calls = Arc::new(AtomicUsize::new(0));
        let hook_calls = calls.clone();
        let r = reconciler(
            vec![
                Err(ProbeError::Discovery("/proc unavailable".into())),
                Ok(vec![101]),
            ],
            FakeAttacher::default(),
        );
        let state = r.state.clone();
        let r = r.with_start_hook(Box::new(move || {
            hook_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        let handle = std::thread::spawn(move || r.run());
        while calls.load(Ordering::SeqCst) == 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
        std::thread::sleep(Duration::from_millis(20));
        state.request_shutdown();

        let (attacher, result) = handle.join().unwrap();
        result.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(attacher.released.len(), 3);
        assert!(attacher.live.is_empty());
    }

    #[test]
    fn test_start_hook_failure_shuts_down() {
        let r = reconciler(vec![Ok(vec![101])], FakeAttacher::default())
            .with_start_hook(Box::new(|| anyhow::bail!("perf buffer unavailable")));
        let state = r.state.clone();

        let (attacher, result) = r.run();

        assert!(result.is_err());
        assert!(state.is_shutdown());
        assert!(attacher.live.is_empty());
    }
}
