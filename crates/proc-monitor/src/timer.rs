//! Periodic rescan ticks for the discovery engine.
//!
//! The thread always runs; the armed flag decides whether a tick actually
//! reaches the monitor. The monitor recomputes the flag after every scan
//! and after every spawner loss, so ticks flow exactly while discovery is
//! incomplete.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::Sender;
use trace_common::{Tracer, WakeSignal};

use crate::monitor::ControlEvent;

pub(crate) fn start<T: Tracer>(
    interval: Duration,
    armed: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    ctl_tx: Sender<ControlEvent>,
    tracer: Arc<T>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("proc-rescan".into())
        .spawn(move || loop {
            thread::sleep(interval);
            if shutdown.load(Ordering::Relaxed) {
                return;
            }
            if !armed.load(Ordering::Relaxed) {
                continue;
            }
            if ctl_tx.send(ControlEvent::Rescan).is_err() {
                return;
            }
            tracer.wake(WakeSignal::Rescan);
        })
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use crossbeam_channel::unbounded;
    use trace_common::test_util::FakeTracer;

    use super::*;

    #[test]
    fn ticks_only_while_armed() {
        let armed = Arc::new(AtomicBool::new(true));
        let shutdown = Arc::new(AtomicBool::new(false));
        let (ctl_tx, ctl_rx) = unbounded();
        let tracer = Arc::new(FakeTracer::new());

        let handle = start(
            Duration::from_millis(5),
            Arc::clone(&armed),
            Arc::clone(&shutdown),
            ctl_tx,
            tracer,
        )
        .unwrap();

        assert_eq!(
            ctl_rx.recv_timeout(Duration::from_secs(2)),
            Ok(ControlEvent::Rescan)
        );

        armed.store(false, Ordering::Relaxed);
        // drain ticks already in flight, then expect silence
        let quiet_after = Instant::now() + Duration::from_millis(50);
        while ctl_rx.recv_deadline(quiet_after).is_ok() {}
        assert!(ctl_rx
            .recv_timeout(Duration::from_millis(50))
            .is_err());

        shutdown.store(true, Ordering::Relaxed);
        handle.join().unwrap();
    }
}
