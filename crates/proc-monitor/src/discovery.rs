//! Spawner discovery: one procfs sweep at boot, then again on every timer
//! tick and after package database activity, until the expected number of
//! spawners is under trace.

use nix::sys::ptrace::Options;
use trace_common::parsing::ProcessSource;
use trace_common::{log_error, Tracer};

use crate::monitor::Monitor;
use crate::{HideOps, INIT_PID, SPAWNER_COMMAND};

impl<T: Tracer, P: ProcessSource, H: HideOps> Monitor<T, P, H> {
    /// One pass over every live process, adopting any spawner found, then
    /// recompute the rescan timer arming.
    pub(crate) fn scan_once(&mut self) {
        match self.proc.running_processes() {
            Ok(pids) => {
                for pid in pids {
                    let named_spawner = matches!(
                        self.proc.command_name(pid),
                        Ok(cmd) if cmd.starts_with(SPAWNER_COMMAND)
                    );
                    if !named_spawner {
                        continue;
                    }
                    if matches!(self.proc.parent_pid(pid), Ok(ppid) if ppid == INIT_PID) {
                        self.adopt(pid);
                    }
                }
            }
            Err(err) => log_error("proc_monitor: enumerating processes failed", err),
        }
        self.update_rescan_arm();
    }

    /// Bring a spawner under trace, or refresh the fingerprint of a known
    /// one without re-attaching.
    fn adopt(&mut self, pid: nix::unistd::Pid) {
        let ns = match self.proc.mount_ns(pid) {
            Ok(ns) => ns,
            Err(_) => return,
        };
        if self.registry.contains(pid) {
            self.registry.upsert(pid, ns);
            return;
        }

        log::debug!("proc_monitor: tracing spawner PID=[{pid}]");
        self.registry.upsert(pid, ns);
        if let Err(err) = self.tracer.attach(pid) {
            log_error("proc_monitor: attaching spawner failed", err);
            self.registry.forget(pid);
            return;
        }
        // The first stop after attach is where the trace options go in.
        let armed = self
            .tracer
            .wait_for_stop(pid)
            .and_then(|()| {
                self.tracer.set_options(
                    pid,
                    Options::PTRACE_O_TRACEFORK
                        | Options::PTRACE_O_TRACEVFORK
                        | Options::PTRACE_O_TRACEEXIT,
                )
            })
            .and_then(|()| self.tracer.cont(pid, None));
        if let Err(err) = armed {
            log_error("proc_monitor: arming spawner trace failed", err);
            self.registry.forget(pid);
            self.detach(pid);
        }
    }
}
