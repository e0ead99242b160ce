//! Thin wrappers around ptrace, waitpid and signal delivery.
//!
//! The [`Tracer`] trait is the seam between the monitor and the kernel:
//! production code uses [`PtraceTracer`], the test suite substitutes a
//! scripted implementation to drive the event router deterministically.

use std::sync::Mutex;

use nix::errno::Errno;
use nix::sys::pthread::{pthread_self, Pthread};
use nix::sys::ptrace::{self, Options};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use thiserror::Error;

use crate::signal as wake;

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("attach to {pid} failed")]
    Attach {
        pid: Pid,
        #[source]
        source: Errno,
    },
    #[error("setting trace options for {pid} failed")]
    SetOptions {
        pid: Pid,
        #[source]
        source: Errno,
    },
    #[error("resuming {pid} failed")]
    Resume {
        pid: Pid,
        #[source]
        source: Errno,
    },
    #[error("detaching {pid} failed")]
    Detach {
        pid: Pid,
        #[source]
        source: Errno,
    },
    #[error("reading event message of {pid} failed")]
    EventMessage {
        pid: Pid,
        #[source]
        source: Errno,
    },
    #[error("waiting for first stop of {pid} failed")]
    WaitStop {
        pid: Pid,
        #[source]
        source: Errno,
    },
}

/// Which producer is waking the monitor out of its wait. Each reason maps
/// to one wake signal symbol, so interruptions stay attributable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeSignal {
    Rescan,
    Filesystem,
    Terminate,
}

impl WakeSignal {
    fn as_signal(self) -> Signal {
        match self {
            WakeSignal::Rescan => Signal::SIGALRM,
            WakeSignal::Filesystem => Signal::SIGIO,
            WakeSignal::Terminate => Signal::SIGUSR1,
        }
    }
}

pub trait Tracer: Send + Sync + 'static {
    fn attach(&self, pid: Pid) -> Result<(), TraceError>;
    fn detach(&self, pid: Pid, signal: Option<Signal>) -> Result<(), TraceError>;
    fn cont(&self, pid: Pid, signal: Option<Signal>) -> Result<(), TraceError>;
    fn set_options(&self, pid: Pid, options: Options) -> Result<(), TraceError>;
    fn event_message(&self, pid: Pid) -> Result<u64, TraceError>;

    /// Block until any traced process changes state.
    fn wait_any(&self) -> Result<WaitStatus, Errno>;

    /// Block until `pid` delivers its first stop after an attach.
    fn wait_for_stop(&self, pid: Pid) -> Result<(), TraceError>;

    /// Plain (non-ptrace) signal delivery, used to freeze and thaw children.
    fn signal(&self, pid: Pid, signal: Signal) -> Result<(), Errno>;

    /// Called once by the thread that will sit in [`Tracer::wait_any`]:
    /// installs the wake handlers and records the thread identity.
    fn register_waiter(&self);

    /// Restores the default handlers; [`Tracer::wake`] becomes a no-op.
    fn unregister_waiter(&self);

    /// Interrupt a blocked [`Tracer::wait_any`], making it fail with `EINTR`.
    fn wake(&self, reason: WakeSignal);
}

/// The real kernel debugging interface.
#[derive(Debug, Default)]
pub struct PtraceTracer {
    waiter: Mutex<Option<Pthread>>,
}

impl PtraceTracer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Tracer for PtraceTracer {
    fn attach(&self, pid: Pid) -> Result<(), TraceError> {
        ptrace::attach(pid).map_err(|source| TraceError::Attach { pid, source })
    }

    fn detach(&self, pid: Pid, signal: Option<Signal>) -> Result<(), TraceError> {
        ptrace::detach(pid, signal).map_err(|source| TraceError::Detach { pid, source })
    }

    fn cont(&self, pid: Pid, signal: Option<Signal>) -> Result<(), TraceError> {
        ptrace::cont(pid, signal).map_err(|source| TraceError::Resume { pid, source })
    }

    fn set_options(&self, pid: Pid, options: Options) -> Result<(), TraceError> {
        ptrace::setoptions(pid, options).map_err(|source| TraceError::SetOptions { pid, source })
    }

    fn event_message(&self, pid: Pid) -> Result<u64, TraceError> {
        ptrace::getevent(pid)
            .map(|msg| msg as u64)
            .map_err(|source| TraceError::EventMessage { pid, source })
    }

    fn wait_any(&self) -> Result<WaitStatus, Errno> {
        waitpid(
            None::<Pid>,
            Some(WaitPidFlag::__WALL | WaitPidFlag::__WNOTHREAD),
        )
    }

    fn wait_for_stop(&self, pid: Pid) -> Result<(), TraceError> {
        waitpid(pid, Some(WaitPidFlag::__WALL | WaitPidFlag::__WNOTHREAD))
            .map(|_| ())
            .map_err(|source| TraceError::WaitStop { pid, source })
    }

    fn signal(&self, pid: Pid, signal: Signal) -> Result<(), Errno> {
        signal::kill(pid, signal)
    }

    fn register_waiter(&self) {
        if let Err(err) = wake::install_wake_handlers() {
            log::warn!("proc_monitor: installing wake handlers failed: {err}");
        }
        *self.waiter.lock().unwrap() = Some(pthread_self());
    }

    fn unregister_waiter(&self) {
        self.waiter.lock().unwrap().take();
        wake::restore_default_handlers();
    }

    fn wake(&self, reason: WakeSignal) {
        if let Some(thread) = *self.waiter.lock().unwrap() {
            wake::wake_thread(thread, reason.as_signal());
        }
    }
}
