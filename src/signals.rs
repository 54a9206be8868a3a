//! Signal handling
//!
//! SIGINT, SIGUSR1 and SIGUSR2 are blocked in every copy thread and
//! collected by one listener thread with sigwait(), so no signal handler
//! ever interrupts a worker in the middle of an ioctl.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{Scope, ScopedJoinHandle};

use anyhow::{format_err, Error};
use nix::sys::pthread::{pthread_kill, pthread_self, Pthread};
use nix::sys::signal::{SigSet, SigmaskHow, Signal};

use crate::collection::Collection;

fn listened_signals() -> SigSet {
    let mut set = SigSet::empty();
    set.add(Signal::SIGINT);
    set.add(Signal::SIGUSR1);
    set.add(Signal::SIGUSR2);
    set
}

/// Blocks the listened signals in the calling thread until dropped
///
/// Threads spawned meanwhile inherit the blocked mask.
pub struct BlockedSignals {
    old: SigSet,
}

impl BlockedSignals {
    pub fn block() -> Result<Self, Error> {
        let old = listened_signals()
            .thread_swap_mask(SigmaskHow::SIG_BLOCK)
            .map_err(|err| format_err!("unable to block signals - {}", err))?;
        Ok(Self { old })
    }
}

impl Drop for BlockedSignals {
    fn drop(&mut self) {
        if let Err(err) = self.old.thread_set_mask() {
            log::warn!("unable to restore signal mask - {}", err);
        }
    }
}

pub struct SignalListener<'scope> {
    thread: Pthread,
    shutdown: Arc<AtomicBool>,
    handle: ScopedJoinHandle<'scope, ()>,
}

impl<'scope> SignalListener<'scope> {
    /// Start the listener, the signals must already be blocked
    pub fn spawn<'env>(
        scope: &'scope Scope<'scope, 'env>,
        coll: &'env Collection,
    ) -> Result<Self, Error> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel();

        let flag = Arc::clone(&shutdown);
        let handle = std::thread::Builder::new()
            .name("sgh_dd signals".to_string())
            .spawn_scoped(scope, move || {
                let _ = tx.send(pthread_self());
                listen(coll, &flag);
            })?;
        let thread = rx
            .recv()
            .map_err(|_| format_err!("signal listener thread did not start"))?;

        Ok(Self {
            thread,
            shutdown,
            handle,
        })
    }

    /// Deliver `signal` to the listener thread
    pub fn raise(&self, signal: Signal) -> Result<(), Error> {
        pthread_kill(self.thread, signal)
            .map_err(|err| format_err!("unable to send {} to the listener - {}", signal, err))
    }

    /// Shut the listener down and join it
    pub fn stop(self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Err(err) = self.raise(Signal::SIGINT) {
            log::warn!("{}", err);
        }
        if let Err(panic) = self.handle.join() {
            match panic.downcast::<&str>() {
                Ok(panic_msg) => log::error!("signal listener paniced: {}", panic_msg),
                Err(_) => log::error!("signal listener paniced"),
            }
        }
    }
}

fn listen(coll: &Collection, shutdown: &AtomicBool) {
    let set = listened_signals();
    loop {
        let signal = match set.wait() {
            Ok(signal) => signal,
            Err(err) => {
                log::error!("sigwait failed - {}", err);
                return;
            }
        };
        match signal {
            Signal::SIGINT => {
                if shutdown.load(Ordering::SeqCst) {
                    return;
                }
                log::info!("interrupted by SIGINT, stopping the copy");
                coll.shared.request_interrupt();
                coll.log_progress();
            }
            Signal::SIGUSR1 => coll.log_progress(),
            Signal::SIGUSR2 => {
                // also kick workers waiting for their turn to write
                coll.log_progress();
                coll.shared.notify_out();
            }
            other => log::debug!("ignoring {}", other),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use sg_pt::emulate::EmulatedDisk;

    use crate::error::EXIT_INTERRUPTED;
    use crate::options::Options;

    #[test]
    fn sigint_interrupts_the_copy() -> Result<(), Error> {
        let src = EmulatedDisk::new(512, 64);
        let coll = Collection::with_pass_through(
            Options::default(),
            Some(Arc::new(src.opener("src"))),
            None,
        )?;

        let _blocked = BlockedSignals::block()?;
        std::thread::scope(|s| -> Result<(), Error> {
            let listener = SignalListener::spawn(s, &coll)?;
            listener.raise(Signal::SIGUSR1)?;
            listener.raise(Signal::SIGINT)?;

            let start = Instant::now();
            while coll.shared.exit_status() != EXIT_INTERRUPTED {
                if start.elapsed() > Duration::from_secs(10) {
                    break;
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            listener.stop();
            Ok(())
        })?;

        assert_eq!(coll.shared.exit_status(), EXIT_INTERRUPTED);
        assert!(coll.shared.stopped());
        Ok(())
    }
}
