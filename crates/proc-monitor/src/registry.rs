//! Registry of the spawners currently under trace.

use std::collections::HashMap;
use std::sync::RwLock;

use nix::unistd::Pid;
use trace_common::parsing::MountNsId;

/// Maps each traced spawner to the mount-namespace fingerprint read when it
/// was last seen.
///
/// Only the monitor thread mutates the registry; inspector workers read it
/// for the namespace-separation check. A worker observing a stale
/// fingerprint can only produce a spurious "not separated" verdict, which
/// is the safe direction.
#[derive(Debug, Default)]
pub(crate) struct SpawnerRegistry {
    spawners: RwLock<HashMap<Pid, MountNsId>>,
}

impl SpawnerRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Insert a spawner, or overwrite the fingerprint of a known one.
    pub(crate) fn upsert(&self, pid: Pid, ns: MountNsId) {
        self.spawners.write().unwrap().insert(pid, ns);
    }

    /// Returns whether the pid was present.
    pub(crate) fn forget(&self, pid: Pid) -> bool {
        self.spawners.write().unwrap().remove(&pid).is_some()
    }

    pub(crate) fn contains(&self, pid: Pid) -> bool {
        self.spawners.read().unwrap().contains_key(&pid)
    }

    pub(crate) fn count(&self) -> usize {
        self.spawners.read().unwrap().len()
    }

    #[cfg(test)]
    pub(crate) fn fingerprint(&self, pid: Pid) -> Option<MountNsId> {
        self.spawners.read().unwrap().get(&pid).copied()
    }

    /// Whether any registered spawner still shares this mount namespace.
    pub(crate) fn any_shares_ns(&self, ns: MountNsId) -> bool {
        self.spawners.read().unwrap().values().any(|fp| *fp == ns)
    }

    pub(crate) fn pids(&self) -> Vec<Pid> {
        let mut pids: Vec<Pid> = self.spawners.read().unwrap().keys().copied().collect();
        pids.sort_unstable();
        pids
    }

    pub(crate) fn clear(&self) {
        self.spawners.write().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trace_common::test_util::ns;

    const PID_1: Pid = Pid::from_raw(1000);
    const PID_2: Pid = Pid::from_raw(1001);

    #[test]
    fn upsert_overwrites_fingerprint() {
        let registry = SpawnerRegistry::new();
        registry.upsert(PID_1, ns(1, 10));
        registry.upsert(PID_1, ns(1, 20));
        assert_eq!(registry.count(), 1);
        assert_eq!(registry.fingerprint(PID_1), Some(ns(1, 20)));
    }

    #[test]
    fn shares_ns_checks_all_spawners() {
        let registry = SpawnerRegistry::new();
        registry.upsert(PID_1, ns(1, 10));
        registry.upsert(PID_2, ns(1, 20));
        assert!(registry.any_shares_ns(ns(1, 10)));
        assert!(registry.any_shares_ns(ns(1, 20)));
        assert!(!registry.any_shares_ns(ns(1, 30)));
        assert!(!registry.any_shares_ns(ns(2, 10)));
    }

    #[test]
    fn forget_reports_presence() {
        let registry = SpawnerRegistry::new();
        registry.upsert(PID_1, ns(1, 10));
        assert!(registry.forget(PID_1));
        assert!(!registry.forget(PID_1));
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn clear_empties_registry() {
        let registry = SpawnerRegistry::new();
        registry.upsert(PID_1, ns(1, 10));
        registry.upsert(PID_2, ns(1, 20));
        registry.clear();
        assert_eq!(registry.count(), 0);
        assert!(registry.pids().is_empty());
    }
}
