use std::path::Path;

use anyhow::{Context, Result};
use aya::{
    Ebpf,
    programs::{UProbe, uprobe::UProbeLinkId},
};
use log::{debug, info, warn};
use regex::Regex;

use super::registry::LinkHandles;
use crate::error::ProbeError;
use crate::probes::discovery::{self, Resolution};

/// Resolves the target library inside a process and installs the per-process
/// instrumentation in it.
pub trait Attacher {
    type Link;

    fn resolve(&mut self, pid: u32) -> Result<Resolution, ProbeError>;

    /// All three links or none: on error nothing stays attached.
    fn attach(&mut self, pid: u32, path: &Path) -> Result<LinkHandles<Self::Link>, ProbeError>;

    fn detach(&mut self, pid: u32, links: LinkHandles<Self::Link>);
}

struct UprobeSpec {
    program: &'static str,
    symbol: &'static str,
}

const SSL_READ_ENTER: UprobeSpec = UprobeSpec {
    program: "pgsli_ssl_read_enter",
    symbol: "SSL_read",
};
const SSL_READ_EXIT: UprobeSpec = UprobeSpec {
    program: "pgsli_ssl_read_exit",
    symbol: "SSL_read",
};
const SSL_WRITE_ENTER: UprobeSpec = UprobeSpec {
    program: "pgsli_ssl_write_enter",
    symbol: "SSL_write",
};

const SSL_UPROBES: [&UprobeSpec; 3] = [&SSL_READ_ENTER, &SSL_READ_EXIT, &SSL_WRITE_ENTER];

/// Attaches the SSL uprobes of the loaded object to individual processes.
pub struct UprobeAttacher {
    bpf: Ebpf,
    library: Regex,
}

impl UprobeAttacher {
    /// Loads the uprobe programs into the kernel; attachment happens per pid.
    pub fn new(mut bpf: Ebpf, library: &str) -> Result<Self> {
        for spec in SSL_UPROBES {
            info!("Loading program {}", spec.program);
            let program: &mut UProbe = bpf
                .program_mut(spec.program)
                .with_context(|| format!("Failed to find {} program", spec.program))?
                .try_into()?;
            program.load()?;
        }

        let library = discovery::library_pattern(library)
            .with_context(|| format!("Invalid library name {:?}", library))?;

        Ok(Self { bpf, library })
    }

    pub fn into_inner(self) -> Ebpf {
        self.bpf
    }

    fn attach_one(&mut self, spec: &UprobeSpec, pid: u32, path: &Path) -> Result<UProbeLinkId, ProbeError> {
        let attach_err = |reason: String| ProbeError::Attach {
            pid,
            program: spec.program,
            symbol: spec.symbol,
            path: path.to_path_buf(),
            reason,
        };

        let program: &mut UProbe = self
            .bpf
            .program_mut(spec.program)
            .ok_or_else(|| attach_err("program not found".into()))?
            .try_into()
            .map_err(|e: aya::programs::ProgramError| attach_err(e.to_string()))?;

        program
            .attach(Some(spec.symbol), 0, path, Some(pid as i32))
            .map_err(|e| attach_err(e.to_string()))
    }

    fn detach_one(&mut self, spec: &UprobeSpec, pid: u32, link: UProbeLinkId) {
        let program: Option<&mut UProbe> = self
            .bpf
            .program_mut(spec.program)
            .and_then(|p| p.try_into().ok());
        match program {
            Some(program) => {
                if let Err(e) = program.detach(link) {
                    warn!("Failed to detach {} from pid {}: {}", spec.program, pid, e);
                }
            }
            None => warn!("Program {} missing while detaching pid {}", spec.program, pid),
        }
    }
}

impl Attacher for UprobeAttacher {
    type Link = UProbeLinkId;

    fn resolve(&mut self, pid: u32) -> Result<Resolution, ProbeError> {
        discovery::resolve_library(pid, &self.library)
    }

    fn attach(&mut self, pid: u32, path: &Path) -> Result<LinkHandles<UProbeLinkId>, ProbeError> {
        let links = attach_all(
            self,
            SSL_UPROBES,
            |this, spec| this.attach_one(spec, pid, path),
            |this, spec, link| this.detach_one(spec, pid, link),
        )?;
        debug!("Attached SSL uprobes to pid {} ({})", pid, path.display());
        Ok(links)
    }

    fn detach(&mut self, pid: u32, links: LinkHandles<UProbeLinkId>) {
        self.detach_one(&SSL_READ_ENTER, pid, links.read_enter);
        self.detach_one(&SSL_READ_EXIT, pid, links.read_exit);
        self.detach_one(&SSL_WRITE_ENTER, pid, links.write_enter);
        debug!("Detached SSL uprobes from pid {}", pid);
    }
}

/// Attaches `read_enter`, `read_exit` and `write_enter` in that order. When a
/// step fails, the links acquired so far are detached, latest first, before
/// the error is returned.
fn attach_all<C, L>(
    ctx: &mut C,
    specs: [&UprobeSpec; 3],
    mut attach_one: impl FnMut(&mut C, &UprobeSpec) -> Result<L, ProbeError>,
    mut detach_one: impl FnMut(&mut C, &UprobeSpec, L),
) -> Result<LinkHandles<L>, ProbeError> {
    let [read_enter_spec, read_exit_spec, write_enter_spec] = specs;

    let read_enter = attach_one(ctx, read_enter_spec)?;

    let read_exit = match attach_one(ctx, read_exit_spec) {
        Ok(link) => link,
        Err(e) => {
            detach_one(ctx, read_enter_spec, read_enter);
            return Err(e);
        }
    };

    let write_enter = match attach_one(ctx, write_enter_spec) {
        Ok(link) => link,
        Err(e) => {
            detach_one(ctx, read_exit_spec, read_exit);
            detach_one(ctx, read_enter_spec, read_enter);
            return Err(e);
        }
    };

    Ok(LinkHandles {
        read_enter,
        read_exit,
        write_enter,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    /// Hands out program names as links and fails the `fail_at`-th attach.
    #[derive(Default)]
    struct Recorder {
        fail_at: Option<usize>,
        attached: Vec<&'static str>,
        detached: Vec<&'static str>,
    }

    fn attach_with(rec: &mut Recorder) -> Result<LinkHandles<&'static str>, ProbeError> {
        attach_all(
            rec,
            SSL_UPROBES,
            |rec, spec| {
                if rec.fail_at == Some(rec.attached.len() + 1) {
                    return Err(ProbeError::Attach {
                        pid: 101,
                        program: spec.program,
                        symbol: spec.symbol,
                        path: PathBuf::from("/usr/lib64/libssl.so.1.1"),
                        reason: "EINVAL".into(),
                    });
                }
                rec.attached.push(spec.program);
                Ok(spec.program)
            },
            |rec, spec, link| {
                assert_eq!(spec.program, link);
                rec.detached.push(link);
            },
        )
    }

    #[test]
    fn test_all_three_links_attached_in_order() {
        let mut rec = Recorder::default();

        let links = attach_with(&mut rec).unwrap();

        assert_eq!(links.read_enter, "pgsli_ssl_read_enter");
        assert_eq!(links.read_exit, "pgsli_ssl_read_exit");
        assert_eq!(links.write_enter, "pgsli_ssl_write_enter");
        assert!(rec.detached.is_empty());
    }

    #[test]
    fn test_first_step_failure_detaches_nothing() {
        let mut rec = Recorder {
            fail_at: Some(1),
            ..Default::default()
        };

        assert!(attach_with(&mut rec).is_err());
        assert!(rec.detached.is_empty());
    }

    #[test]
    fn test_read_exit_failure_detaches_read_enter() {
        let mut rec = Recorder {
            fail_at: Some(2),
            ..Default::default()
        };

        let err = attach_with(&mut rec).unwrap_err();

        assert!(matches!(
            err,
            ProbeError::Attach {
                program: "pgsli_ssl_read_exit",
                ..
            }
        ));
        assert_eq!(rec.detached, vec!["pgsli_ssl_read_enter"]);
    }

    #[test]
    fn test_write_enter_failure_detaches_both_read_links_once() {
        let mut rec = Recorder {
            fail_at: Some(3),
            ..Default::default()
        };

        let err = attach_with(&mut rec).unwrap_err();

        assert!(matches!(
            err,
            ProbeError::Attach {
                program: "pgsli_ssl_write_enter",
                ..
            }
        ));
        assert_eq!(rec.detached, vec!["pgsli_ssl_read_exit", "pgsli_ssl_read_enter"]);
    }
}
