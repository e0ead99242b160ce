//! Wake signals used to interrupt the monitor thread out of a blocking wait.
//!
//! The handlers themselves do nothing: every event travels over the control
//! queue, and the signal only exists to make a pending `waitpid` return
//! `EINTR`. Handlers are therefore installed without `SA_RESTART`, and the
//! symbols keep their traditional roles: SIGALRM for the rescan timer,
//! SIGIO for filesystem activity, SIGUSR1 for termination.

use libc::c_int;
use nix::errno::Errno;
use nix::sys::pthread::{pthread_kill, Pthread};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

pub const WAKE_SIGNALS: [Signal; 3] = [Signal::SIGALRM, Signal::SIGIO, Signal::SIGUSR1];

extern "C" fn wake_handler(_: c_int) {}

/// Install the no-op wake handlers. Must run on the waiting thread before
/// any producer is allowed to wake it.
pub fn install_wake_handlers() -> Result<(), Errno> {
    let action = SigAction::new(
        SigHandler::Handler(wake_handler),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for sig in WAKE_SIGNALS {
        unsafe { sigaction(sig, &action) }?;
    }
    Ok(())
}

/// Put the wake signals back to their default dispositions.
pub fn restore_default_handlers() {
    let action = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    for sig in WAKE_SIGNALS {
        let _ = unsafe { sigaction(sig, &action) };
    }
}

/// Deliver `signal` to a specific thread. Failure means the thread is gone,
/// which is fine: there is nobody left to wake.
pub fn wake_thread(thread: Pthread, signal: Signal) {
    let _ = pthread_kill(thread, signal);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[serial_test::serial]
    fn install_and_restore_round_trip() {
        let _ = env_logger::builder().is_test(true).try_init();
        install_wake_handlers().unwrap();

        // Re-installing returns the previous action: it must be our handler,
        // registered without SA_RESTART.
        let probe = SigAction::new(
            SigHandler::Handler(wake_handler),
            SaFlags::empty(),
            SigSet::empty(),
        );
        for sig in WAKE_SIGNALS {
            let old = unsafe { sigaction(sig, &probe) }.unwrap();
            assert!(matches!(old.handler(), SigHandler::Handler(_)));
            assert!(!old.flags().contains(SaFlags::SA_RESTART));
        }

        restore_default_handlers();
        for sig in WAKE_SIGNALS {
            let old = unsafe { sigaction(sig, &probe) }.unwrap();
            assert!(matches!(old.handler(), SigHandler::SigDfl));
        }
        // restoring twice is fine
        restore_default_handlers();
        restore_default_handlers();
    }
}
