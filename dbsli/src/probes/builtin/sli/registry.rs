//! Per-process attachment table.
//!
//! An entry exists from the moment the target library has been resolved in a
//! process until a sweep finds the process gone. Handles are owned by the
//! entry and only ever leave it by value, through the release callback of
//! [`LinkRegistry::sweep`] or [`LinkRegistry::drain`].

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

/// The three uprobe links held for one process.
#[derive(Debug)]
pub struct LinkHandles<L> {
    pub read_enter: L,
    pub read_exit: L,
    pub write_enter: L,
}

impl<L> LinkHandles<L> {
    pub fn into_array(self) -> [L; 3] {
        [self.read_enter, self.read_exit, self.write_enter]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    PendingAttach,
    Attached,
}

#[derive(Debug)]
pub struct LinkEntry<L> {
    path: PathBuf,
    links: Option<LinkHandles<L>>,
    seen: bool,
}

impl<L> LinkEntry<L> {
    pub fn state(&self) -> LinkState {
        if self.links.is_some() {
            LinkState::Attached
        } else {
            LinkState::PendingAttach
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn links(&self) -> Option<&LinkHandles<L>> {
        self.links.as_ref()
    }
}

#[derive(Debug)]
pub struct LinkRegistry<L> {
    entries: BTreeMap<u32, LinkEntry<L>>,
}

impl<L> Default for LinkRegistry<L> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<L> LinkRegistry<L> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, pid: u32) -> Option<&LinkEntry<L>> {
        self.entries.get(&pid)
    }

    pub fn state(&self, pid: u32) -> Option<LinkState> {
        self.entries.get(&pid).map(LinkEntry::state)
    }

    pub fn attached_count(&self) -> usize {
        self.entries
            .values()
            .filter(|e| e.state() == LinkState::Attached)
            .count()
    }

    /// Start of a generation: every entry must be re-confirmed to survive the sweep.
    pub fn mark_all_unseen(&mut self) {
        for entry in self.entries.values_mut() {
            entry.seen = false;
        }
    }

    /// Marks `pid` seen. Returns false when it is not tracked.
    pub fn confirm(&mut self, pid: u32) -> bool {
        match self.entries.get_mut(&pid) {
            Some(entry) => {
                entry.seen = true;
                true
            }
            None => false,
        }
    }

    /// Tracks a newly resolved process. Returns false if `pid` is already tracked.
    pub fn insert_pending(&mut self, pid: u32, path: PathBuf) -> bool {
        if self.entries.contains_key(&pid) {
            return false;
        }
        self.entries.insert(
            pid,
            LinkEntry {
                path,
                links: None,
                seen: true,
            },
        );
        true
    }

    /// Entries waiting for attachment, ascending by pid.
    pub fn pending(&self) -> Vec<(u32, PathBuf)> {
        self.entries
            .iter()
            .filter(|(_, e)| e.links.is_none())
            .map(|(pid, e)| (*pid, e.path.clone()))
            .collect()
    }

    /// PendingAttach -> Attached. The handles are handed back when the entry is
    /// missing or already attached so the caller can release them.
    pub fn mark_attached(&mut self, pid: u32, links: LinkHandles<L>) -> Result<(), LinkHandles<L>> {
        match self.entries.get_mut(&pid) {
            Some(entry) if entry.links.is_none() => {
                entry.links = Some(links);
                Ok(())
            }
            _ => Err(links),
        }
    }

    /// Removes every entry not confirmed since the last `mark_all_unseen`,
    /// handing held links to `release`. Returns the removed pids.
    pub fn sweep(&mut self, mut release: impl FnMut(u32, LinkHandles<L>)) -> Vec<u32> {
        let stale: Vec<u32> = self
            .entries
            .iter()
            .filter(|(_, e)| !e.seen)
            .map(|(pid, _)| *pid)
            .collect();

        for pid in &stale {
            if let Some(entry) = self.entries.remove(pid)
                && let Some(links) = entry.links
            {
                release(*pid, links);
            }
        }
        stale
    }

    /// Removes every entry. Used on shutdown.
    pub fn drain(&mut self, mut release: impl FnMut(u32, LinkHandles<L>)) -> usize {
        let entries = std::mem::take(&mut self.entries);
        let count = entries.len();
        for (pid, entry) in entries {
            if let Some(links) = entry.links {
                release(pid, links);
            }
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handles(pid: u32) -> LinkHandles<(u32, u8)> {
        LinkHandles {
            read_enter: (pid, 0),
            read_exit: (pid, 1),
            write_enter: (pid, 2),
        }
    }

    fn lib() -> PathBuf {
        PathBuf::from("/usr/lib64/libssl.so.1.1")
    }

    #[test]
    fn test_pending_then_attached() {
        let mut reg = LinkRegistry::new();
        assert!(reg.insert_pending(101, lib()));
        assert!(!reg.insert_pending(101, lib()));
        assert_eq!(reg.state(101), Some(LinkState::PendingAttach));
        assert_eq!(reg.pending(), vec![(101, lib())]);

        reg.mark_attached(101, handles(101)).unwrap();
        assert_eq!(reg.state(101), Some(LinkState::Attached));
        assert!(reg.pending().is_empty());
        assert_eq!(reg.attached_count(), 1);
        assert_eq!(reg.get(101).unwrap().path(), lib().as_path());
    }

    #[test]
    fn test_mark_attached_twice_returns_handles() {
        let mut reg = LinkRegistry::new();
        reg.insert_pending(101, lib());
        reg.mark_attached(101, handles(101)).unwrap();

        let back = reg.mark_attached(101, handles(101)).unwrap_err();
        assert_eq!(back.into_array(), [(101, 0), (101, 1), (101, 2)]);
        assert!(reg.mark_attached(999, handles(999)).is_err());
    }

    #[test]
    fn test_sweep_releases_unconfirmed_once() {
        let mut reg = LinkRegistry::new();
        for pid in [101, 202] {
            reg.insert_pending(pid, lib());
            reg.mark_attached(pid, handles(pid)).unwrap();
        }

        reg.mark_all_unseen();
        assert!(reg.confirm(101));
        assert!(!reg.confirm(303));

        let mut released = Vec::new();
        let removed = reg.sweep(|pid, links| released.push((pid, links.into_array())));

        assert_eq!(removed, vec![202]);
        assert_eq!(released, vec![(202, [(202, 0), (202, 1), (202, 2)])]);
        assert_eq!(reg.state(202), None);
        assert_eq!(reg.state(101), Some(LinkState::Attached));

        // nothing left to release for 202
        reg.mark_all_unseen();
        reg.confirm(101);
        assert!(reg.sweep(|_, _| panic!("double release")).is_empty());
    }

    #[test]
    fn test_sweep_drops_pending_without_release() {
        let mut reg: LinkRegistry<u8> = LinkRegistry::new();
        reg.insert_pending(7, lib());
        reg.mark_all_unseen();

        assert_eq!(reg.sweep(|_, _| panic!("pending entries hold no links")), vec![7]);
        assert!(reg.is_empty());
    }

    #[test]
    fn test_drain_releases_everything() {
        let mut reg = LinkRegistry::new();
        reg.insert_pending(1, lib());
        reg.insert_pending(2, lib());
        reg.mark_attached(2, handles(2)).unwrap();

        let mut released = Vec::new();
        assert_eq!(reg.drain(|pid, _| released.push(pid)), 2);
        assert_eq!(released, vec![2]);
        assert!(reg.is_empty());
    }
}
