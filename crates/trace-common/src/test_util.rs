//! Test doubles for the tracing and procfs seams.
//!
//! [`FakeTracer`] records every trace operation and replays injected wait
//! outcomes; [`FakeProcessSource`] serves a scripted process table. Both are
//! meant for driving the monitor deterministically in tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use nix::errno::Errno;
use nix::sys::ptrace::{Event, Options};
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use nix::unistd::{Pid, Uid};

use crate::parsing::{MountNsId, ProcessSource, ProcfsError};
use crate::{TraceError, Tracer, WakeSignal};

pub fn ns(dev: u64, ino: u64) -> MountNsId {
    MountNsId { dev, ino }
}

enum WaitOutcome {
    Status(WaitStatus),
    Interrupt,
}

#[derive(Default)]
struct TracerState {
    attached: HashSet<Pid>,
    options: HashMap<Pid, Options>,
    event_messages: HashMap<Pid, VecDeque<u64>>,
    attach_failures: HashSet<Pid>,
    detach_failures: HashSet<Pid>,
    signals: Vec<(Pid, Signal)>,
    detaches: Vec<Pid>,
    conts: Vec<(Pid, Option<Signal>)>,
}

pub struct FakeTracer {
    state: Mutex<TracerState>,
    wait_tx: Sender<WaitOutcome>,
    wait_rx: Receiver<WaitOutcome>,
    signal_tx: Sender<(Pid, Signal)>,
    signal_rx: Receiver<(Pid, Signal)>,
    echild_when_idle: AtomicBool,
    waiter_registered: AtomicBool,
    defaults_restored: AtomicBool,
}

impl Default for FakeTracer {
    fn default() -> Self {
        let (wait_tx, wait_rx) = unbounded();
        let (signal_tx, signal_rx) = unbounded();
        Self {
            state: Mutex::default(),
            wait_tx,
            wait_rx,
            signal_tx,
            signal_rx,
            echild_when_idle: AtomicBool::new(false),
            waiter_registered: AtomicBool::new(false),
            defaults_restored: AtomicBool::new(false),
        }
    }
}

impl FakeTracer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a wait outcome for the event router.
    pub fn inject_status(&self, status: WaitStatus) {
        self.wait_tx
            .send(WaitOutcome::Status(status))
            .expect("wait queue closed");
    }

    /// Queue a fork ptrace-event-stop from `spawner` producing `child`.
    pub fn inject_fork(&self, spawner: Pid, child: Pid) {
        self.set_event_message(spawner, child.as_raw() as u64);
        self.inject_status(WaitStatus::PtraceEvent(
            spawner,
            Signal::SIGTRAP,
            Event::PTRACE_EVENT_FORK as i32,
        ));
    }

    /// Queue the value the next event-message read for `pid` will return.
    pub fn set_event_message(&self, pid: Pid, message: u64) {
        self.state
            .lock()
            .unwrap()
            .event_messages
            .entry(pid)
            .or_default()
            .push_back(message);
    }

    pub fn fail_attach(&self, pid: Pid) {
        self.state.lock().unwrap().attach_failures.insert(pid);
    }

    pub fn fail_detach(&self, pid: Pid) {
        self.state.lock().unwrap().detach_failures.insert(pid);
    }

    /// When idle and no outcome is queued, report ECHILD instead of blocking.
    pub fn set_echild_when_idle(&self, value: bool) {
        self.echild_when_idle.store(value, Ordering::SeqCst);
    }

    pub fn attached(&self, pid: Pid) -> bool {
        self.state.lock().unwrap().attached.contains(&pid)
    }

    pub fn attached_pids(&self) -> Vec<Pid> {
        let mut pids: Vec<Pid> = self.state.lock().unwrap().attached.iter().copied().collect();
        pids.sort_unstable();
        pids
    }

    pub fn options_for(&self, pid: Pid) -> Option<Options> {
        self.state.lock().unwrap().options.get(&pid).copied()
    }

    pub fn signals(&self) -> Vec<(Pid, Signal)> {
        self.state.lock().unwrap().signals.clone()
    }

    /// Wait for the next plain signal sent through the tracer.
    pub fn next_signal(&self, timeout: Duration) -> Option<(Pid, Signal)> {
        self.signal_rx.recv_timeout(timeout).ok()
    }

    pub fn detaches(&self) -> Vec<Pid> {
        self.state.lock().unwrap().detaches.clone()
    }

    pub fn conts(&self) -> Vec<(Pid, Option<Signal>)> {
        self.state.lock().unwrap().conts.clone()
    }

    pub fn waiter_registered(&self) -> bool {
        self.waiter_registered.load(Ordering::SeqCst)
    }

    pub fn defaults_restored(&self) -> bool {
        self.defaults_restored.load(Ordering::SeqCst)
    }
}

impl Tracer for FakeTracer {
    fn attach(&self, pid: Pid) -> Result<(), TraceError> {
        let mut state = self.state.lock().unwrap();
        if state.attach_failures.contains(&pid) {
            return Err(TraceError::Attach {
                pid,
                source: Errno::ESRCH,
            });
        }
        state.attached.insert(pid);
        Ok(())
    }

    fn detach(&self, pid: Pid, _signal: Option<Signal>) -> Result<(), TraceError> {
        let mut state = self.state.lock().unwrap();
        state.detaches.push(pid);
        state.attached.remove(&pid);
        if state.detach_failures.contains(&pid) {
            return Err(TraceError::Detach {
                pid,
                source: Errno::ESRCH,
            });
        }
        Ok(())
    }

    fn cont(&self, pid: Pid, signal: Option<Signal>) -> Result<(), TraceError> {
        self.state.lock().unwrap().conts.push((pid, signal));
        Ok(())
    }

    fn set_options(&self, pid: Pid, options: Options) -> Result<(), TraceError> {
        self.state.lock().unwrap().options.insert(pid, options);
        Ok(())
    }

    fn event_message(&self, pid: Pid) -> Result<u64, TraceError> {
        self.state
            .lock()
            .unwrap()
            .event_messages
            .get_mut(&pid)
            .and_then(VecDeque::pop_front)
            .ok_or(TraceError::EventMessage {
                pid,
                source: Errno::ESRCH,
            })
    }

    fn wait_any(&self) -> Result<WaitStatus, Errno> {
        if self.echild_when_idle.load(Ordering::SeqCst) && self.wait_rx.is_empty() {
            return Err(Errno::ECHILD);
        }
        match self.wait_rx.recv() {
            Ok(WaitOutcome::Status(status)) => Ok(status),
            Ok(WaitOutcome::Interrupt) => Err(Errno::EINTR),
            Err(_) => Err(Errno::ECHILD),
        }
    }

    fn wait_for_stop(&self, _pid: Pid) -> Result<(), TraceError> {
        Ok(())
    }

    fn signal(&self, pid: Pid, signal: Signal) -> Result<(), Errno> {
        self.state.lock().unwrap().signals.push((pid, signal));
        let _ = self.signal_tx.send((pid, signal));
        Ok(())
    }

    fn register_waiter(&self) {
        self.waiter_registered.store(true, Ordering::SeqCst);
    }

    fn unregister_waiter(&self) {
        self.defaults_restored.store(true, Ordering::SeqCst);
    }

    fn wake(&self, _reason: WakeSignal) {
        let _ = self.wait_tx.send(WaitOutcome::Interrupt);
    }
}

#[derive(Debug, Clone)]
pub struct FakeProcess {
    cmdline: VecDeque<String>,
    ppid: Pid,
    uid: Uid,
    mount_ns: VecDeque<MountNsId>,
    thread_group_leader: bool,
}

impl FakeProcess {
    pub fn new(cmdline: &str, ppid: i32, uid: u32, mount_ns: MountNsId) -> Self {
        Self {
            cmdline: VecDeque::from([cmdline.to_string()]),
            ppid: Pid::from_raw(ppid),
            uid: Uid::from_raw(uid),
            mount_ns: VecDeque::from([mount_ns]),
            thread_group_leader: true,
        }
    }

    /// Successive command-line reads walk this script and stick on the
    /// final entry.
    pub fn cmdline_script(mut self, steps: &[&str]) -> Self {
        self.cmdline = steps.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Successive namespace reads walk this script and stick on the final
    /// entry.
    pub fn ns_script(mut self, steps: &[MountNsId]) -> Self {
        self.mount_ns = steps.iter().copied().collect();
        self
    }

    pub fn thread(mut self) -> Self {
        self.thread_group_leader = false;
        self
    }
}

#[derive(Default)]
pub struct FakeProcessSource {
    procs: Mutex<HashMap<Pid, FakeProcess>>,
}

impl FakeProcessSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, pid: i32, process: FakeProcess) {
        self.procs
            .lock()
            .unwrap()
            .insert(Pid::from_raw(pid), process);
    }

    /// Make the process disappear, as if it died mid-inspection.
    pub fn remove(&self, pid: Pid) {
        self.procs.lock().unwrap().remove(&pid);
    }

    fn read<R>(&self, pid: Pid, f: impl FnOnce(&mut FakeProcess) -> R) -> Result<R, ProcfsError> {
        match self.procs.lock().unwrap().get_mut(&pid) {
            Some(process) => Ok(f(process)),
            None => Err(ProcfsError::ReadFile {
                source: io::Error::from_raw_os_error(Errno::ESRCH as i32),
                path: format!("/proc/{pid}"),
            }),
        }
    }
}

fn script_read<T: Clone>(script: &mut VecDeque<T>) -> T {
    if script.len() > 1 {
        script.pop_front().unwrap()
    } else {
        script.front().cloned().unwrap()
    }
}

impl ProcessSource for FakeProcessSource {
    fn running_processes(&self) -> Result<Vec<Pid>, ProcfsError> {
        let mut pids: Vec<Pid> = self.procs.lock().unwrap().keys().copied().collect();
        pids.sort_unstable();
        Ok(pids)
    }

    fn command_name(&self, pid: Pid) -> Result<String, ProcfsError> {
        self.read(pid, |p| script_read(&mut p.cmdline))
    }

    fn parent_pid(&self, pid: Pid) -> Result<Pid, ProcfsError> {
        self.read(pid, |p| p.ppid)
    }

    fn process_uid(&self, pid: Pid) -> Result<Uid, ProcfsError> {
        self.read(pid, |p| p.uid)
    }

    fn mount_ns(&self, pid: Pid) -> Result<MountNsId, ProcfsError> {
        self.read(pid, |p| script_read(&mut p.mount_ns))
    }

    fn is_thread_group_leader(&self, pid: Pid) -> Result<bool, ProcfsError> {
        self.read(pid, |p| p.thread_group_leader)
    }
}
