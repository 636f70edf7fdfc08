//! Cooperative cancellation for running producers and for the joining thread.
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use thiserror::Error;

/// Returned by [`CancelToken::check`] and [`CancelToken::sleep`] once the task
/// has been cancelled by a join.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("task was cancelled")]
pub struct Cancelled;

#[derive(Default)]
struct Signal {
    cancelled: Mutex<bool>,
    wake: Condvar,
}

impl Signal {
    fn lock(&self) -> MutexGuard<'_, bool> {
        self.cancelled.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cancellation signal handed to every producer.
///
/// Work that cannot observe the token keeps running until it returns on its
/// own, but its result is discarded. Producers that block should prefer
/// [`sleep`](Self::sleep) or poll [`check`](Self::check) between steps so
/// that a timed out join actually frees the worker.
#[derive(Clone, Default)]
pub struct CancelToken {
    signal: Arc<Signal>,
}

impl CancelToken {
    /// A token nobody else can cancel, for calling producers outside a
    /// session.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn cancel(&self) {
        let mut cancelled = self.signal.lock();
        *cancelled = true;
        self.signal.wake.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.signal.lock()
    }

    /// Fails with [`Cancelled`] if the task has been cancelled.
    pub fn check(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }

    /// Blocks for `duration`, returning early with [`Cancelled`] when the task
    /// is cancelled in the meantime. A duration too large to add to the
    /// current instant, such as `Duration::MAX`, blocks until cancellation.
    pub fn sleep(&self, duration: Duration) -> Result<(), Cancelled> {
        let deadline = Instant::now().checked_add(duration);
        let mut cancelled = self.signal.lock();

        while !*cancelled {
            let Some(deadline) = deadline else {
                cancelled = self
                    .signal
                    .wake
                    .wait(cancelled)
                    .unwrap_or_else(PoisonError::into_inner);
                continue;
            };

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(());
            }

            cancelled = self
                .signal
                .wake
                .wait_timeout(cancelled, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }

        Err(Cancelled)
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Aborts a session's join from another thread.
///
/// An interrupt that arrives while no join is running stays pending and
/// aborts the next one. Repeated interrupts collapse into one.
#[derive(Clone, Debug)]
pub struct Interrupter {
    tx: Sender<()>,
}

impl Interrupter {
    pub fn interrupt(&self) {
        match self.tx.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => {}
            Err(TrySendError::Disconnected(())) => {
                tracing::debug!("interrupt sent to a session that no longer exists");
            }
        }
    }
}

pub(crate) fn interrupt_channel() -> (Interrupter, Receiver<()>) {
    let (tx, rx) = crossbeam_channel::bounded(1);
    (Interrupter { tx }, rx)
}
