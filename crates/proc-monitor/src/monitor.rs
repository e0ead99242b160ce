//! The event router: one thread owning every piece of ptrace bookkeeping.
//!
//! The kernel only accepts trace requests from the thread that attached a
//! tracee, so attach, wait, option setup, resume and detach all happen
//! here. Between waits the thread drains a control queue fed by the rescan
//! timer, the filesystem watcher and the terminate handle; producers
//! interrupt a pending wait with a wake signal. Because events are only
//! ever consumed between waits, registry and bitmap updates never
//! interleave with event arrival.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender};
use nix::errno::Errno;
use nix::sys::ptrace::{Event, Options};
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;
use trace_common::parsing::ProcessSource;
use trace_common::{log_error, Tracer};

use crate::attach_set::PidSet;
use crate::registry::SpawnerRegistry;
use crate::{inspector, timer, watcher, HideOps, MonitorConfig};

/// Events merged into the monitor thread from its producers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ControlEvent {
    /// Rediscover spawners.
    Rescan,
    /// The package database was rewritten.
    PackageDbWrite,
    /// Tear down and exit.
    Terminate,
}

pub(crate) struct Monitor<T: Tracer, P: ProcessSource, H: HideOps> {
    pub(crate) config: MonitorConfig,
    pub(crate) tracer: Arc<T>,
    pub(crate) proc: Arc<P>,
    ops: Arc<H>,
    pub(crate) registry: Arc<SpawnerRegistry>,
    pub(crate) attaches: PidSet,
    ctl_tx: Sender<ControlEvent>,
    ctl_rx: Receiver<ControlEvent>,
    fork_tx: Option<Sender<Pid>>,
    fork_rx: Option<Receiver<Pid>>,
    pub(crate) rescan_armed: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    producers: Vec<JoinHandle<()>>,
    torn_down: bool,
}

impl<T: Tracer, P: ProcessSource, H: HideOps> Monitor<T, P, H> {
    pub(crate) fn new(
        config: MonitorConfig,
        tracer: Arc<T>,
        proc: Arc<P>,
        ops: Arc<H>,
        ctl_tx: Sender<ControlEvent>,
        ctl_rx: Receiver<ControlEvent>,
    ) -> Self {
        let (fork_tx, fork_rx) = bounded(config.fork_queue_depth);
        Self {
            config,
            tracer,
            proc,
            ops,
            registry: Arc::new(SpawnerRegistry::new()),
            attaches: PidSet::new(),
            ctl_tx,
            ctl_rx,
            fork_tx: Some(fork_tx),
            fork_rx: Some(fork_rx),
            rescan_armed: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(AtomicBool::new(false)),
            producers: Vec::new(),
            torn_down: false,
        }
    }

    pub(crate) fn run(mut self) {
        self.tracer.register_waiter();
        self.spawn_workers();
        self.spawn_producers();
        self.scan_once();

        loop {
            while let Ok(event) = self.ctl_rx.try_recv() {
                if !self.handle_control(event) {
                    self.teardown();
                    return;
                }
            }
            match self.tracer.wait_any() {
                Ok(status) => self.handle_wait_status(status),
                Err(Errno::EINTR) => {}
                Err(Errno::ECHILD) => {
                    // Nothing to wait on: block on the queue instead, since
                    // only a control event can change that.
                    log::debug!("proc_monitor: nothing to monitor, waiting for events");
                    match self.ctl_rx.recv() {
                        Ok(event) => {
                            if !self.handle_control(event) {
                                self.teardown();
                                return;
                            }
                        }
                        Err(_) => {
                            self.teardown();
                            return;
                        }
                    }
                }
                Err(err) => log::warn!("proc_monitor: wait failed: {err}"),
            }
        }
    }

    fn spawn_workers(&mut self) {
        if let Some(fork_rx) = self.fork_rx.take() {
            inspector::spawn_pool(
                &self.config,
                fork_rx,
                Arc::clone(&self.registry),
                Arc::clone(&self.tracer),
                Arc::clone(&self.proc),
                Arc::clone(&self.ops),
                Arc::clone(&self.shutdown),
            );
        }
    }

    fn spawn_producers(&mut self) {
        match timer::start(
            self.config.rescan_interval,
            Arc::clone(&self.rescan_armed),
            Arc::clone(&self.shutdown),
            self.ctl_tx.clone(),
            Arc::clone(&self.tracer),
        ) {
            Ok(handle) => self.producers.push(handle),
            Err(err) => log::warn!("proc_monitor: starting rescan timer failed: {err}"),
        }
        if let Some(handle) = watcher::start(
            &self.config,
            Arc::clone(&self.shutdown),
            self.ctl_tx.clone(),
            Arc::clone(&self.tracer),
        ) {
            self.producers.push(handle);
        }
    }

    /// Returns false when the monitor should tear down.
    pub(crate) fn handle_control(&mut self, event: ControlEvent) -> bool {
        match event {
            ControlEvent::Rescan => self.scan_once(),
            ControlEvent::PackageDbWrite => {
                log::debug!("proc_monitor: package database updated");
                self.ops.update_uid_map();
                self.scan_once();
            }
            ControlEvent::Terminate => return false,
        }
        true
    }

    pub(crate) fn handle_wait_status(&mut self, status: WaitStatus) {
        match status {
            WaitStatus::PtraceEvent(pid, _, event) if self.registry.contains(pid) => {
                self.handle_spawner_event(pid, event)
            }
            WaitStatus::PtraceEvent(pid, _, _) => self.detach(pid),
            WaitStatus::Stopped(pid, Signal::SIGSTOP) => self.handle_sigstop(pid),
            WaitStatus::Stopped(pid, signal) => {
                // Not caused by us: pass it on.
                log::debug!("proc_monitor: forwarding signal {signal} to PID=[{pid}]");
                if let Err(err) = self.tracer.cont(pid, Some(signal)) {
                    log_error("proc_monitor: forwarding signal failed", err);
                    self.detach(pid);
                }
            }
            WaitStatus::StillAlive => {}
            status => {
                // Not a ptrace-stop: the pid is done for.
                if let Some(pid) = status.pid() {
                    if self.registry.forget(pid) {
                        log::debug!("proc_monitor: spawner PID=[{pid}] is gone");
                        self.update_rescan_arm();
                    }
                    self.detach(pid);
                }
            }
        }
    }

    fn handle_spawner_event(&mut self, pid: Pid, event: i32) {
        if event == Event::PTRACE_EVENT_FORK as i32 || event == Event::PTRACE_EVENT_VFORK as i32 {
            match self.tracer.event_message(pid) {
                Ok(msg) => {
                    let child = Pid::from_raw(msg as i32);
                    if child.as_raw() > 0 {
                        log::debug!("proc_monitor: spawner PID=[{pid}] forked PID=[{child}]");
                        self.attaches.clear(child);
                        self.detach(child);
                        self.dispatch_child(child);
                    }
                }
                Err(err) => log_error("proc_monitor: reading fork event failed", err),
            }
            if let Err(err) = self.tracer.cont(pid, None) {
                log_error("proc_monitor: resuming spawner failed", err);
                self.forget_spawner(pid);
            }
        } else {
            if event == Event::PTRACE_EVENT_EXIT as i32 {
                log::debug!("proc_monitor: spawner PID=[{pid}] exiting");
            }
            self.forget_spawner(pid);
        }
    }

    fn handle_sigstop(&mut self, pid: Pid) {
        let confirmed =
            self.attaches.test(pid) || matches!(self.proc.is_thread_group_leader(pid), Ok(true));
        if !confirmed {
            // A thread, not a process: not ours to follow.
            log::debug!("proc_monitor: SIGSTOP from thread PID=[{pid}]");
            self.detach(pid);
            return;
        }
        let options = Options::PTRACE_O_TRACECLONE
            | Options::PTRACE_O_TRACEEXEC
            | Options::PTRACE_O_TRACEEXIT;
        let followed = self
            .tracer
            .set_options(pid, options)
            .and_then(|()| self.tracer.cont(pid, None));
        match followed {
            Ok(()) => self.attaches.set(pid),
            Err(err) => {
                log_error("proc_monitor: following process failed", err);
                self.detach(pid);
            }
        }
    }

    /// Best-effort detach; the attachment bit is cleared unconditionally.
    pub(crate) fn detach(&mut self, pid: Pid) {
        self.attaches.clear(pid);
        if let Err(err) = self.tracer.detach(pid, None) {
            log::debug!("proc_monitor: detach of PID=[{pid}] failed: {err}");
        }
    }

    fn forget_spawner(&mut self, pid: Pid) {
        self.registry.forget(pid);
        self.detach(pid);
        self.update_rescan_arm();
    }

    fn dispatch_child(&mut self, child: Pid) {
        let Some(fork_tx) = &self.fork_tx else {
            return;
        };
        if fork_tx.try_send(child).is_err() {
            log::warn!("proc_monitor: inspector queue full, skipping PID=[{child}]");
        }
    }

    /// The rescan timer is armed exactly while discovery is incomplete.
    pub(crate) fn update_rescan_arm(&self) {
        let armed = self.registry.count() < self.config.expected_spawners;
        if self.rescan_armed.swap(armed, Ordering::Relaxed) != armed {
            log::debug!(
                "proc_monitor: periodic rescan {}",
                if armed { "armed" } else { "disarmed" }
            );
        }
    }

    /// Release everything and restore the signal plane. Idempotent.
    pub(crate) fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        log::debug!("proc_monitor: cleaning up");
        self.shutdown.store(true, Ordering::SeqCst);
        for pid in self.registry.pids() {
            self.detach(pid);
        }
        let children: Vec<Pid> = self.attaches.iter().collect();
        for pid in children {
            self.detach(pid);
        }
        self.registry.clear();
        self.attaches.clear_all();
        self.fork_tx.take();
        for handle in self.producers.drain(..) {
            let _ = handle.join();
        }
        self.tracer.unregister_waiter();
        log::debug!("proc_monitor: terminate");
    }
}
