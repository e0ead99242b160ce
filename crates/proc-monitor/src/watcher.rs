//! Filesystem triggers for discovery: package database rewrites and reads
//! of the spawner executable.
//!
//! A dedicated thread drains the inotify descriptor (opened nonblocking,
//! with a bounded idle sleep so shutdown is observed) and pushes control
//! events to the monitor. If inotify cannot be set up the monitor keeps
//! running on the timer and trace events alone.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::Sender;
use nix::errno::Errno;
use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify, WatchDescriptor};
use trace_common::{Tracer, WakeSignal};

use crate::monitor::ControlEvent;
use crate::MonitorConfig;

/// Idle sleep between empty reads; bounds both event latency and how long
/// teardown waits for this thread.
const READ_IDLE_SLEEP: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WatchKind {
    PackageDb,
    SpawnerExe,
}

struct WatchSet {
    inotify: Inotify,
    kinds: HashMap<WatchDescriptor, WatchKind>,
}

pub(crate) fn start<T: Tracer>(
    config: &MonitorConfig,
    shutdown: Arc<AtomicBool>,
    ctl_tx: Sender<ControlEvent>,
    tracer: Arc<T>,
) -> Option<JoinHandle<()>> {
    let watches = setup(config)?;
    let db_file = config.package_db_file.clone();
    match thread::Builder::new()
        .name("proc-watcher".into())
        .spawn(move || run(watches, db_file, shutdown, ctl_tx, tracer))
    {
        Ok(handle) => Some(handle),
        Err(err) => {
            log::warn!("proc_monitor: spawning watcher thread failed: {err}");
            None
        }
    }
}

fn setup(config: &MonitorConfig) -> Option<WatchSet> {
    let inotify = match Inotify::init(InitFlags::IN_CLOEXEC | InitFlags::IN_NONBLOCK) {
        Ok(inotify) => inotify,
        Err(err) => {
            log::warn!(
                "proc_monitor: inotify unavailable ({err}), continuing without filesystem watches"
            );
            return None;
        }
    };

    let mut kinds = HashMap::new();
    match inotify.add_watch(
        config.package_db_dir.as_path(),
        AddWatchFlags::IN_CLOSE_WRITE,
    ) {
        Ok(wd) => {
            kinds.insert(wd, WatchKind::PackageDb);
        }
        Err(err) => log::debug!(
            "proc_monitor: cannot watch {}: {err}",
            config.package_db_dir.display()
        ),
    }
    for exe in spawner_exe_watch_paths(&config.spawner_exe) {
        match inotify.add_watch(exe.as_path(), AddWatchFlags::IN_ACCESS) {
            Ok(wd) => {
                kinds.insert(wd, WatchKind::SpawnerExe);
            }
            Err(err) => log::debug!("proc_monitor: cannot watch {}: {err}", exe.display()),
        }
    }

    if kinds.is_empty() {
        log::warn!("proc_monitor: no watchable paths, continuing without filesystem watches");
        return None;
    }
    Some(WatchSet { inotify, kinds })
}

/// The `32` variant when present (plus the `64` variant if it also
/// exists), otherwise the plain executable path.
fn spawner_exe_watch_paths(exe: &Path) -> Vec<PathBuf> {
    let with_suffix = |suffix: &str| -> PathBuf {
        let mut s = exe.as_os_str().to_os_string();
        s.push(suffix);
        PathBuf::from(s)
    };
    let exe32 = with_suffix("32");
    if exe32.exists() {
        let exe64 = with_suffix("64");
        if exe64.exists() {
            vec![exe32, exe64]
        } else {
            vec![exe32]
        }
    } else if exe.exists() {
        vec![exe.to_path_buf()]
    } else {
        Vec::new()
    }
}

fn run<T: Tracer>(
    watches: WatchSet,
    db_file: String,
    shutdown: Arc<AtomicBool>,
    ctl_tx: Sender<ControlEvent>,
    tracer: Arc<T>,
) {
    // Returning drops `watches`, which closes the inotify descriptor.
    loop {
        if shutdown.load(Ordering::Relaxed) {
            return;
        }
        let events = match watches.inotify.read_events() {
            Ok(events) => events,
            Err(Errno::EAGAIN) => {
                thread::sleep(READ_IDLE_SLEEP);
                continue;
            }
            Err(Errno::EINTR) => continue,
            Err(err) => {
                log::warn!("proc_monitor: reading inotify events failed: {err}");
                return;
            }
        };
        for event in events {
            let Some(kind) = watches.kinds.get(&event.wd) else {
                continue;
            };
            let ctl = classify(*kind, event.mask, event.name.as_deref(), &db_file);
            if ctl_tx.send(ctl).is_err() {
                return;
            }
            tracer.wake(WakeSignal::Filesystem);
        }
    }
}

fn classify(
    kind: WatchKind,
    mask: AddWatchFlags,
    name: Option<&OsStr>,
    db_file: &str,
) -> ControlEvent {
    match kind {
        WatchKind::PackageDb => {
            if mask.contains(AddWatchFlags::IN_CLOSE_WRITE) && name == Some(OsStr::new(db_file)) {
                ControlEvent::PackageDbWrite
            } else {
                // anything else in the database directory still warrants a look
                ControlEvent::Rescan
            }
        }
        WatchKind::SpawnerExe => ControlEvent::Rescan,
    }
}
