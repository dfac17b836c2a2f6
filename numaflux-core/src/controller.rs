use std::sync::mpsc::{self, Receiver, RecvTimeoutError, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, warn};
use numaflux_io::affinity::pin_thread_to_core;

use crate::error::{escalate, CoreError, Result};
use crate::hook::ReentryGuard;

/// A running controller thread.
///
/// The thread is detached when the handle is dropped; the process owns its
/// lifetime, not the handle.
pub struct ControllerHandle {
    name: &'static str,
    thread: Option<JoinHandle<()>>,
    done: Receiver<()>,
}

impl ControllerHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        !matches!(self.done.try_recv(), Err(TryRecvError::Empty))
    }

    /// Waits up to `grace` for the controller to finish. Returns `false` if
    /// it was still running and has been left behind.
    pub fn wait(mut self, grace: Duration) -> bool {
        let finished = match self.done.recv_timeout(grace) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
            Err(RecvTimeoutError::Timeout) => false,
        };
        if finished {
            if let Some(thread) = self.thread.take() {
                if thread.join().is_err() {
                    warn!("Controller '{}' panicked", self.name);
                }
            }
        } else {
            debug!("Controller '{}' still running after {:?}", self.name, grace);
        }
        finished
    }
}

/// Starts `body` on its own thread.
///
/// The thread holds a [`ReentryGuard`] for its whole life, so the memory it
/// allocates is never tracked or placed. Errors returned by `body` go
/// through [`escalate`].
pub(crate) fn spawn<F>(name: &'static str, core: Option<usize>, body: F) -> Result<ControllerHandle>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    let (tx, done) = mpsc::channel();
    let thread = thread::Builder::new()
        .name(format!("numaflux-{}", name))
        .spawn(move || {
            let _guard = ReentryGuard::enter();
            if let Some(core) = core {
                pin_thread_to_core(core);
            }
            info!("Controller '{}' running", name);
            escalate(body());
            let _ = tx.send(());
        })
        .map_err(CoreError::Spawn)?;

    Ok(ControllerHandle { name, thread: Some(thread), done })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Barrier};

    #[test]
    fn test_body_runs_with_the_guard_held() {
        let guarded = Arc::new(AtomicBool::new(false));
        let seen = Arc::clone(&guarded);
        let handle = spawn("test", None, move || {
            seen.store(ReentryGuard::is_active(), Ordering::SeqCst);
            assert_eq!(thread::current().name(), Some("numaflux-test"));
            Ok(())
        })
        .unwrap();
        assert!(handle.wait(Duration::from_secs(5)));
        assert!(guarded.load(Ordering::SeqCst));
    }

    #[test]
    fn test_wait_gives_up_after_the_grace_period() {
        let gate = Arc::new(Barrier::new(2));
        let inner = Arc::clone(&gate);
        let handle = spawn("slow", None, move || {
            inner.wait();
            Ok(())
        })
        .unwrap();
        assert!(!handle.is_finished());
        assert_eq!(handle.name(), "slow");
        let left_behind = !handle.wait(Duration::from_millis(10));
        gate.wait();
        assert!(left_behind);
    }

    #[test]
    fn test_non_fatal_errors_are_swallowed() {
        let handle = spawn("again", None, || Err(CoreError::AlreadyStarted("again"))).unwrap();
        assert!(handle.wait(Duration::from_secs(5)));
    }
}
