//! Process monitor core of a root-hiding subsystem.
//!
//! The monitor watches the system's application spawners (the long-lived
//! processes that fork every application), observes each child they fork,
//! and pauses any child that turns out to be a hiding target long enough
//! for an external hiding daemon to scrub root traces from its view of the
//! filesystem before the child runs any user code.
//!
//! # Architecture
//!
//! All ptrace bookkeeping lives on a single monitor thread, because the
//! kernel only accepts trace requests from the attaching thread. The
//! monitor blocks in `waitpid` and consumes a control queue merging three
//! producers: a periodic rescan timer, an inotify reader watching the
//! package database and the spawner executables, and the terminate handle.
//! Producers interrupt a pending wait by delivering a no-op wake signal to
//! the monitor thread; every piece of state travels over the queue, so only
//! the monitor thread ever mutates the spawner registry and the attachment
//! bitmap.
//!
//! Forked children are handed over a bounded queue to a small pool of
//! inspector workers, which classify each child off the event loop and
//! either resume it or pass it, stopped, to the hiding daemon.
//!
//! The monitor is a library component: no binary, no RPC surface, no
//! persisted state. The host supplies the hiding collaborators through
//! [`HideOps`] and keeps the returned handle to stop the monitor:
//!
//! ```no_run
//! use nix::unistd::{Pid, Uid};
//! use proc_monitor::{start_monitor, HideOps, MonitorConfig};
//!
//! struct Hiding;
//!
//! impl HideOps for Hiding {
//!     fn update_uid_map(&self) { /* rebuild the package/uid cache */ }
//!     fn is_hide_target(&self, _uid: Uid, _cmdline: &str, _confidence: i32) -> bool {
//!         false
//!     }
//!     fn hide_daemon(&self, _pid: Pid) { /* scrub mounts, then resume */ }
//! }
//!
//! let handle = start_monitor(MonitorConfig::default(), Hiding).expect("monitor thread");
//! // ...
//! handle.shutdown();
//! ```

mod attach_set;
mod discovery;
mod inspector;
mod monitor;
mod registry;
mod timer;
mod watcher;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Sender};
use nix::unistd::{Pid, Uid};
use thiserror::Error;
use trace_common::parsing::{ProcessSource, Procfs};
use trace_common::{PtraceTracer, Tracer, WakeSignal};

use monitor::{ControlEvent, Monitor};

/// Command prefix identifying a spawner process.
pub(crate) const SPAWNER_COMMAND: &str = "spawner";
/// Command reported by a freshly forked child before it takes its own name.
pub(crate) const PRE_INITIALIZED: &str = "<pre-initialized>";
/// Pre-warmed helper processes, never hiding targets.
pub(crate) const PREWARMED_HELPERS: [&str; 2] = ["usap32", "usap64"];
/// Confidence threshold handed through to the target predicate.
pub(crate) const HIDE_CONFIDENCE: i32 = 95;
/// Spawners are reparented to init.
pub(crate) const INIT_PID: Pid = Pid::from_raw(1);

/// Everything the monitor leaves to external collaborators: the package/uid
/// map and the hiding daemon itself.
pub trait HideOps: Send + Sync + 'static {
    /// Invalidate or rebuild the package/uid cache. Called after the
    /// package database is rewritten.
    fn update_uid_map(&self);

    /// Whether a process with this uid and command line should be hidden
    /// from. Pure; called from inspector worker threads.
    fn is_hide_target(&self, uid: Uid, cmdline: &str, confidence: i32) -> bool;

    /// Take ownership of a stopped child: scrub its mount namespace, then
    /// resume or kill it. The monitor never resumes a child it handed over.
    fn hide_daemon(&self, pid: Pid);
}

impl<H: HideOps> HideOps for Arc<H> {
    fn update_uid_map(&self) {
        (**self).update_uid_map()
    }

    fn is_hide_target(&self, uid: Uid, cmdline: &str, confidence: i32) -> bool {
        (**self).is_hide_target(uid, cmdline, confidence)
    }

    fn hide_daemon(&self, pid: Pid) {
        (**self).hide_daemon(pid)
    }
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// How many spawners discovery expects before the periodic rescan is
    /// disarmed: two on 64-bit systems (one per ABI), one otherwise.
    pub expected_spawners: usize,
    /// Period of the discovery rescan timer.
    pub rescan_interval: Duration,
    /// Initial inspector polling interval.
    pub poll_interval: Duration,
    /// Ceiling for the growing inspector polling interval.
    pub poll_interval_max: Duration,
    /// Iteration budget for each inspector polling loop.
    pub poll_cap: u32,
    /// Wall-clock budget for each inspector polling loop.
    pub poll_deadline: Duration,
    /// Size of the inspector worker pool.
    pub inspector_workers: usize,
    /// Depth of the queue between the event router and the inspectors.
    pub fork_queue_depth: usize,
    /// Directory holding the package database.
    pub package_db_dir: PathBuf,
    /// Package database file name inside [`MonitorConfig::package_db_dir`].
    pub package_db_file: String,
    /// Spawner executable; the `32`/`64` suffixed variants are watched when
    /// they exist.
    pub spawner_exe: PathBuf,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            expected_spawners: if cfg!(target_pointer_width = "64") {
                2
            } else {
                1
            },
            rescan_interval: Duration::from_millis(250),
            poll_interval: Duration::from_micros(10),
            poll_interval_max: Duration::from_micros(100),
            poll_cap: 300_000,
            poll_deadline: Duration::from_secs(3),
            inspector_workers: 4,
            fork_queue_depth: 16,
            package_db_dir: PathBuf::from("/data/system"),
            package_db_file: "packages.xml".to_string(),
            spawner_exe: PathBuf::from("/system/bin/spawner"),
        }
    }
}

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("failed to spawn monitor thread")]
    Spawn(#[source] io::Error),
}

/// Start the monitor against the real kernel interfaces.
pub fn start_monitor<H: HideOps>(
    config: MonitorConfig,
    ops: H,
) -> Result<MonitorHandle<PtraceTracer>, MonitorError> {
    start_monitor_with(config, PtraceTracer::new(), Procfs, ops)
}

/// Start the monitor with explicit tracing and procfs implementations.
pub fn start_monitor_with<T, P, H>(
    config: MonitorConfig,
    tracer: T,
    proc: P,
    ops: H,
) -> Result<MonitorHandle<T>, MonitorError>
where
    T: Tracer,
    P: ProcessSource,
    H: HideOps,
{
    let tracer = Arc::new(tracer);
    let (ctl_tx, ctl_rx) = unbounded();
    let monitor = Monitor::new(
        config,
        Arc::clone(&tracer),
        Arc::new(proc),
        Arc::new(ops),
        ctl_tx.clone(),
        ctl_rx,
    );
    let thread = thread::Builder::new()
        .name("proc-monitor".into())
        .spawn(move || monitor.run())
        .map_err(MonitorError::Spawn)?;
    Ok(MonitorHandle {
        ctl_tx,
        tracer,
        thread: Some(thread),
    })
}

/// Handle to a running monitor, used to signal termination and wait for
/// the thread to exit.
pub struct MonitorHandle<T: Tracer> {
    ctl_tx: Sender<ControlEvent>,
    pub(crate) tracer: Arc<T>,
    thread: Option<thread::JoinHandle<()>>,
}

impl<T: Tracer> MonitorHandle<T> {
    /// Ask the monitor to tear down and exit. Idempotent; safe from any
    /// thread.
    pub fn terminate(&self) {
        let _ = self.ctl_tx.send(ControlEvent::Terminate);
        self.tracer.wake(WakeSignal::Terminate);
    }

    /// Wait for the monitor thread to exit.
    pub fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    /// Terminate and wait for the exit.
    pub fn shutdown(self) {
        self.terminate();
        self.join();
    }
}

impl<T: Tracer> Drop for MonitorHandle<T> {
    fn drop(&mut self) {
        self.terminate();
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use crossbeam_channel::{unbounded, Receiver, Sender};
    use nix::unistd::{Pid, Uid};

    use crate::{HideOps, MonitorConfig};

    /// Recording stand-in for the external hiding collaborators.
    pub(crate) struct FakeHideOps {
        targets: Mutex<HashSet<String>>,
        predicate_calls: Mutex<Vec<(Uid, String, i32)>>,
        uid_map_updates: AtomicUsize,
        uid_map_tx: Sender<()>,
        uid_map_rx: Receiver<()>,
        daemon_tx: Sender<Pid>,
        daemon_rx: Receiver<Pid>,
    }

    impl FakeHideOps {
        pub(crate) fn new() -> Self {
            let (uid_map_tx, uid_map_rx) = unbounded();
            let (daemon_tx, daemon_rx) = unbounded();
            Self {
                targets: Mutex::default(),
                predicate_calls: Mutex::default(),
                uid_map_updates: AtomicUsize::new(0),
                uid_map_tx,
                uid_map_rx,
                daemon_tx,
                daemon_rx,
            }
        }

        /// Mark a command line as a hiding target.
        pub(crate) fn target(self, cmdline: &str) -> Self {
            self.targets.lock().unwrap().insert(cmdline.to_string());
            self
        }

        pub(crate) fn predicate_calls(&self) -> Vec<(Uid, String, i32)> {
            self.predicate_calls.lock().unwrap().clone()
        }

        pub(crate) fn uid_map_updates(&self) -> usize {
            self.uid_map_updates.load(Ordering::SeqCst)
        }

        pub(crate) fn wait_uid_map_update(&self, timeout: Duration) -> bool {
            self.uid_map_rx.recv_timeout(timeout).is_ok()
        }

        pub(crate) fn next_daemon_call(&self, timeout: Duration) -> Option<Pid> {
            self.daemon_rx.recv_timeout(timeout).ok()
        }

        pub(crate) fn daemon_calls(&self) -> usize {
            self.daemon_rx.len()
        }
    }

    impl HideOps for FakeHideOps {
        fn update_uid_map(&self) {
            self.uid_map_updates.fetch_add(1, Ordering::SeqCst);
            let _ = self.uid_map_tx.send(());
        }

        fn is_hide_target(&self, uid: Uid, cmdline: &str, confidence: i32) -> bool {
            self.predicate_calls
                .lock()
                .unwrap()
                .push((uid, cmdline.to_string(), confidence));
            self.targets.lock().unwrap().contains(cmdline)
        }

        fn hide_daemon(&self, pid: Pid) {
            self.daemon_tx.send(pid).expect("daemon channel closed");
        }
    }

    /// A config with polling budgets small enough for tests.
    pub(crate) fn fast_config() -> MonitorConfig {
        MonitorConfig {
            expected_spawners: 2,
            rescan_interval: Duration::from_millis(10),
            poll_interval: Duration::from_micros(10),
            poll_interval_max: Duration::from_micros(50),
            poll_cap: 200,
            poll_deadline: Duration::from_millis(200),
            ..MonitorConfig::default()
        }
    }
}
