//! Child inspection, off the event loop.
//!
//! A fixed pool of workers consumes the fork queue. Each freshly forked
//! child is classified exactly once: it either gets resumed, or it gets
//! handed to the hiding daemon while stopped, and the daemon then owns
//! resumption. A target must not run any user code before its filesystem
//! view is sanitized, so the child is frozen before the target predicate
//! runs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use nix::sys::signal::Signal;
use nix::unistd::{Pid, Uid};
use trace_common::parsing::ProcessSource;
use trace_common::Tracer;

use crate::registry::SpawnerRegistry;
use crate::{
    HideOps, MonitorConfig, HIDE_CONFIDENCE, PREWARMED_HELPERS, PRE_INITIALIZED, SPAWNER_COMMAND,
};

/// Monotone polling backoff, bounded by an iteration cap and a wall-clock
/// deadline. The kernel exposes no "namespace separated" event, so the
/// inspector has to poll.
pub(crate) struct Backoff {
    interval: Duration,
    max_interval: Duration,
    deadline: Instant,
    remaining: u32,
}

impl Backoff {
    pub(crate) fn new(config: &MonitorConfig) -> Self {
        Self {
            interval: config.poll_interval,
            max_interval: config.poll_interval_max,
            deadline: Instant::now() + config.poll_deadline,
            remaining: config.poll_cap,
        }
    }

    /// Sleep one step. Returns false once the budget is exhausted.
    pub(crate) fn step(&mut self) -> bool {
        if self.remaining == 0 || Instant::now() >= self.deadline {
            return false;
        }
        self.remaining -= 1;
        thread::sleep(self.interval);
        // the interval never shrinks
        self.interval = (self.interval * 2).min(self.max_interval);
        true
    }
}

pub(crate) fn spawn_pool<T: Tracer, P: ProcessSource, H: HideOps>(
    config: &MonitorConfig,
    fork_rx: Receiver<Pid>,
    registry: Arc<SpawnerRegistry>,
    tracer: Arc<T>,
    proc: Arc<P>,
    ops: Arc<H>,
    shutdown: Arc<AtomicBool>,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::with_capacity(config.inspector_workers);
    for i in 0..config.inspector_workers {
        let config = config.clone();
        let fork_rx = fork_rx.clone();
        let registry = Arc::clone(&registry);
        let tracer = Arc::clone(&tracer);
        let proc = Arc::clone(&proc);
        let ops = Arc::clone(&ops);
        let shutdown = Arc::clone(&shutdown);
        let spawned = thread::Builder::new()
            .name(format!("proc-inspector-{i}"))
            .spawn(move || {
                while let Ok(pid) = fork_rx.recv() {
                    if shutdown.load(Ordering::Relaxed) {
                        continue;
                    }
                    inspect_child(&config, pid, &registry, &*tracer, &*proc, &*ops, &shutdown);
                }
            });
        match spawned {
            Ok(handle) => handles.push(handle),
            Err(err) => log::warn!("proc_monitor: spawning inspector worker failed: {err}"),
        }
    }
    handles
}

/// Classify one forked child. The child has already been detached from the
/// spawner's trace by the event router.
pub(crate) fn inspect_child<T: Tracer, P: ProcessSource, H: HideOps>(
    config: &MonitorConfig,
    pid: Pid,
    registry: &SpawnerRegistry,
    tracer: &T,
    proc: &P,
    ops: &H,
    shutdown: &AtomicBool,
) {
    // The child needs a moment to separate its mount namespace from the
    // spawner's; scrubbing before that would damage the spawner itself.
    let mut backoff = Backoff::new(config);
    loop {
        if shutdown.load(Ordering::Relaxed) {
            return;
        }
        match proc.mount_ns(pid) {
            Ok(ns) if !registry.any_shares_ns(ns) => break,
            Ok(_) => {}
            // Process died mid-inspection: nothing to do.
            Err(_) => return,
        }
        if !backoff.step() {
            let cmdline = proc.command_name(pid).unwrap_or_default();
            log::warn!("proc_monitor: skip [{cmdline}] PID=[{pid}]");
            let _ = tracer.signal(pid, Signal::SIGCONT);
            return;
        }
    }

    let uid = match proc.process_uid(pid) {
        Ok(uid) => uid,
        Err(_) => return,
    };
    let mut cmdline = match proc.command_name(pid) {
        Ok(cmdline) => cmdline,
        Err(_) => return,
    };
    // Specialization fills in the real command name shortly after fork.
    let mut backoff = Backoff::new(config);
    while cmdline == PRE_INITIALIZED {
        if shutdown.load(Ordering::Relaxed) {
            return;
        }
        if !backoff.step() {
            not_target(tracer, pid, uid, &cmdline);
            return;
        }
        cmdline = match proc.command_name(pid) {
            Ok(cmdline) => cmdline,
            Err(_) => return,
        };
    }

    if uid.is_root() || names_spawner(&cmdline) || is_prewarmed_helper(&cmdline) {
        log::debug!("proc_monitor: ignoring [{cmdline}] PID=[{pid}] UID=[{uid}]");
        return;
    }

    // Freeze the child before consulting the predicate; failure is
    // swallowed because the child may already be gone.
    let _ = tracer.signal(pid, Signal::SIGSTOP);

    if !ops.is_hide_target(uid, &cmdline, HIDE_CONFIDENCE) {
        not_target(tracer, pid, uid, &cmdline);
        return;
    }

    match proc.mount_ns(pid) {
        Ok(ns) if registry.any_shares_ns(ns) => {
            // The namespace snapped back to a spawner's: abort.
            log::warn!("proc_monitor: skip [{cmdline}] PID=[{pid}] UID=[{uid}]");
            let _ = tracer.signal(pid, Signal::SIGCONT);
            return;
        }
        Err(_) => return,
        Ok(_) => {}
    }

    log::info!("proc_monitor: [{cmdline}] PID=[{pid}] UID=[{uid}]");
    ops.hide_daemon(pid);
}

fn not_target<T: Tracer>(tracer: &T, pid: Pid, uid: Uid, cmdline: &str) {
    log::debug!("proc_monitor: not target [{cmdline}] PID=[{pid}] UID=[{uid}]");
    let _ = tracer.signal(pid, Signal::SIGCONT);
}

/// The spawner's own command names.
fn names_spawner(cmdline: &str) -> bool {
    match cmdline.strip_prefix(SPAWNER_COMMAND) {
        Some(rest) => rest.is_empty() || rest == "32" || rest == "64",
        None => false,
    }
}

fn is_prewarmed_helper(cmdline: &str) -> bool {
    PREWARMED_HELPERS.contains(&cmdline)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    use nix::sys::signal::Signal;
    use trace_common::test_util::{ns, FakeProcess, FakeProcessSource, FakeTracer};

    use super::*;
    use crate::test_support::{fast_config, FakeHideOps};

    const SPAWNER_NS: trace_common::parsing::MountNsId = trace_common::parsing::MountNsId {
        dev: 1,
        ino: 10,
    };

    const CHILD: Pid = Pid::from_raw(1100);

    struct Rig {
        config: MonitorConfig,
        registry: SpawnerRegistry,
        tracer: FakeTracer,
        proc: FakeProcessSource,
        shutdown: AtomicBool,
    }

    fn rig() -> Rig {
        let registry = SpawnerRegistry::new();
        registry.upsert(Pid::from_raw(1000), SPAWNER_NS);
        Rig {
            config: fast_config(),
            registry,
            tracer: FakeTracer::new(),
            proc: FakeProcessSource::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    fn run(rig: &Rig, ops: &FakeHideOps) {
        inspect_child(
            &rig.config,
            CHILD,
            &rig.registry,
            &rig.tracer,
            &rig.proc,
            ops,
            &rig.shutdown,
        );
    }

    #[test]
    fn target_is_stopped_and_handed_over() {
        let rig = rig();
        rig.proc.insert(
            CHILD.as_raw(),
            FakeProcess::new("com.example.target", 1000, 10050, ns(1, 99)),
        );
        let ops = FakeHideOps::new().target("com.example.target");

        run(&rig, &ops);

        assert_eq!(rig.tracer.signals(), vec![(CHILD, Signal::SIGSTOP)]);
        assert_eq!(ops.next_daemon_call(Duration::ZERO), Some(CHILD));
        assert_eq!(
            ops.predicate_calls(),
            vec![(Uid::from_raw(10050), "com.example.target".to_string(), 95)]
        );
    }

    #[test]
    fn non_target_is_stopped_then_resumed() {
        let rig = rig();
        rig.proc.insert(
            CHILD.as_raw(),
            FakeProcess::new("com.example.clean", 1000, 10051, ns(1, 99)),
        );
        let ops = FakeHideOps::new();

        run(&rig, &ops);

        assert_eq!(
            rig.tracer.signals(),
            vec![(CHILD, Signal::SIGSTOP), (CHILD, Signal::SIGCONT)]
        );
        assert_eq!(ops.daemon_calls(), 0);
    }

    #[test]
    fn unseparated_namespace_is_skipped() {
        let rig = rig();
        // fingerprint stays equal to the spawner's
        rig.proc.insert(
            CHILD.as_raw(),
            FakeProcess::new("com.example.target", 1000, 10050, SPAWNER_NS),
        );
        let ops = FakeHideOps::new().target("com.example.target");

        run(&rig, &ops);

        assert_eq!(rig.tracer.signals(), vec![(CHILD, Signal::SIGCONT)]);
        assert_eq!(ops.daemon_calls(), 0);
        assert!(ops.predicate_calls().is_empty());
    }

    #[test]
    fn namespace_snapping_back_is_skipped() {
        let rig = rig();
        // separated at first sight, back on the spawner's at the re-check
        rig.proc.insert(
            CHILD.as_raw(),
            FakeProcess::new("com.example.target", 1000, 10050, ns(1, 99))
                .ns_script(&[ns(1, 99), SPAWNER_NS]),
        );
        let ops = FakeHideOps::new().target("com.example.target");

        run(&rig, &ops);

        assert_eq!(
            rig.tracer.signals(),
            vec![(CHILD, Signal::SIGSTOP), (CHILD, Signal::SIGCONT)]
        );
        assert_eq!(ops.daemon_calls(), 0);
    }

    #[test]
    fn prewarmed_helper_is_ignored_early() {
        let rig = rig();
        rig.proc.insert(
            CHILD.as_raw(),
            FakeProcess::new("usap64", 1000, 10050, ns(1, 99)),
        );
        let ops = FakeHideOps::new();

        run(&rig, &ops);

        assert!(rig.tracer.signals().is_empty());
        assert!(ops.predicate_calls().is_empty());
        assert_eq!(ops.daemon_calls(), 0);
    }

    #[test]
    fn spawner_named_child_is_ignored() {
        for name in ["spawner", "spawner32", "spawner64"] {
            let rig = rig();
            rig.proc
                .insert(CHILD.as_raw(), FakeProcess::new(name, 1000, 10050, ns(1, 99)));
            let ops = FakeHideOps::new();
            run(&rig, &ops);
            assert!(rig.tracer.signals().is_empty());
            assert!(ops.predicate_calls().is_empty());
        }
    }

    #[test]
    fn root_child_is_ignored() {
        let rig = rig();
        rig.proc
            .insert(CHILD.as_raw(), FakeProcess::new("com.example.app", 1000, 0, ns(1, 99)));
        let ops = FakeHideOps::new();

        run(&rig, &ops);

        assert!(rig.tracer.signals().is_empty());
        assert!(ops.predicate_calls().is_empty());
    }

    #[test]
    fn dead_child_is_swallowed() {
        let rig = rig();
        // never inserted: every read fails
        let ops = FakeHideOps::new();

        run(&rig, &ops);

        assert!(rig.tracer.signals().is_empty());
        assert_eq!(ops.daemon_calls(), 0);
    }

    #[test]
    fn pre_initialized_child_is_waited_for() {
        let rig = rig();
        rig.proc.insert(
            CHILD.as_raw(),
            FakeProcess::new("", 1000, 10050, ns(1, 99)).cmdline_script(&[
                PRE_INITIALIZED,
                PRE_INITIALIZED,
                "com.example.target",
            ]),
        );
        let ops = FakeHideOps::new().target("com.example.target");

        run(&rig, &ops);

        assert_eq!(ops.next_daemon_call(Duration::ZERO), Some(CHILD));
    }

    #[test]
    fn stuck_pre_initialized_child_is_not_a_target() {
        let rig = rig();
        rig.proc.insert(
            CHILD.as_raw(),
            FakeProcess::new(PRE_INITIALIZED, 1000, 10050, ns(1, 99)),
        );
        let ops = FakeHideOps::new();

        run(&rig, &ops);

        assert_eq!(rig.tracer.signals(), vec![(CHILD, Signal::SIGCONT)]);
        assert!(ops.predicate_calls().is_empty());
        assert_eq!(ops.daemon_calls(), 0);
    }

    #[test]
    fn stale_registry_read_is_safe() {
        // A worker observing an outdated fingerprint must reject, not hide.
        let rig = rig();
        rig.proc.insert(
            CHILD.as_raw(),
            FakeProcess::new("com.example.target", 1000, 10050, SPAWNER_NS),
        );
        let ops = FakeHideOps::new().target("com.example.target");
        run(&rig, &ops);
        assert_eq!(ops.daemon_calls(), 0);
    }

    #[test]
    fn backoff_interval_is_monotone_and_bounded() {
        let config = fast_config();
        let mut backoff = Backoff::new(&config);
        let mut steps = 0;
        let mut last_interval = Duration::ZERO;
        while backoff.step() {
            steps += 1;
            assert!(backoff.interval >= last_interval);
            assert!(backoff.interval <= config.poll_interval_max);
            last_interval = backoff.interval;
        }
        assert!(steps > 0);
        assert!(steps <= config.poll_cap);
    }

    #[test]
    fn shutdown_aborts_polling() {
        let rig = rig();
        rig.proc.insert(
            CHILD.as_raw(),
            FakeProcess::new("com.example.target", 1000, 10050, SPAWNER_NS),
        );
        rig.shutdown.store(true, Ordering::SeqCst);
        let ops = FakeHideOps::new();

        run(&rig, &ops);

        assert!(rig.tracer.signals().is_empty());
    }
}
