//! Interruptible blocking waits and the cancellation token that drives them.
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use tracing::debug;

use crate::{constants::CANCEL_POLL_INTERVAL, error::Interrupted};

/// Shared flag flipped by the signal handler when the operator asks to abort.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Creates a token in the non-cancelled state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Installs a Ctrl-C / SIGTERM handler that cancels this token.
    pub fn install_handler(&self) -> Result<(), ctrlc::Error> {
        let token = self.clone();
        ctrlc::set_handler(move || {
            if !token.is_cancelled() {
                eprintln!("redeploy: interrupt received, aborting deployment...");
            }
            token.cancel();
        })
    }
}

/// Blocking delay capability.
///
/// Components never call `thread::sleep` directly so that cancellation can cut a
/// wait short and tests can observe how long a component would have waited.
pub trait Wait {
    /// Blocks for `duration`, returning early with `Interrupted` on cancellation.
    fn wait(&self, duration: Duration) -> Result<(), Interrupted>;

    /// Whether a cancellation request is pending.
    fn interrupted(&self) -> bool;
}

/// Real-time waiter backed by `thread::sleep`.
#[derive(Debug, Clone, Default)]
pub struct ThreadWait {
    token: Option<CancelToken>,
}

impl ThreadWait {
    /// A waiter that observes `token` every few milliseconds.
    pub fn interruptible(token: CancelToken) -> Self {
        Self { token: Some(token) }
    }

    /// A waiter that always sleeps the full duration. Used during rollback.
    pub fn uninterruptible() -> Self {
        Self { token: None }
    }
}

impl Wait for ThreadWait {
    fn wait(&self, duration: Duration) -> Result<(), Interrupted> {
        let Some(token) = &self.token else {
            thread::sleep(duration);
            return Ok(());
        };

        let deadline = Instant::now() + duration;
        loop {
            if token.is_cancelled() {
                debug!("Wait of {:?} cut short by cancellation", duration);
                return Err(Interrupted);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            thread::sleep(CANCEL_POLL_INTERVAL.min(deadline - now));
        }
    }

    fn interrupted(&self) -> bool {
        self.token.as_ref().is_some_and(CancelToken::is_cancelled)
    }
}
