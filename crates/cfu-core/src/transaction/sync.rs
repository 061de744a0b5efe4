//! Completion/cancellation event pair.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Why a wait returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The completion event was set (and has been consumed).
    Completed,
    /// The cancellation event is set.
    Cancelled,
    TimedOut,
}

#[derive(Debug, Default)]
struct Events {
    completed: bool,
    cancelled: bool,
}

/// Two events observed by a single multi-wait.
///
/// Completion is auto-reset: a successful wait consumes it. Cancellation is
/// manual-reset and stays set until [`clear_cancellation`] so every waiter
/// after a stop request sees it.
///
/// [`clear_cancellation`]: TransactionSync::clear_cancellation
#[derive(Debug, Default)]
pub struct TransactionSync {
    events: Mutex<Events>,
    cond: Condvar,
}

impl TransactionSync {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal_completion(&self) {
        self.events.lock().completed = true;
        self.cond.notify_all();
    }

    pub fn reset_completion(&self) {
        self.events.lock().completed = false;
    }

    pub fn signal_cancellation(&self) {
        self.events.lock().cancelled = true;
        self.cond.notify_all();
    }

    pub fn clear_cancellation(&self) {
        self.events.lock().cancelled = false;
    }

    pub fn is_cancelled(&self) -> bool {
        self.events.lock().cancelled
    }

    /// Block until completion, cancellation or `timeout`. `None` waits forever.
    /// Cancellation wins over a pending completion.
    pub fn wait(&self, timeout: Option<Duration>) -> WaitOutcome {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut events = self.events.lock();
        loop {
            if events.cancelled {
                return WaitOutcome::Cancelled;
            }
            if events.completed {
                events.completed = false;
                return WaitOutcome::Completed;
            }
            match deadline {
                None => self.cond.wait(&mut events),
                Some(deadline) => {
                    if self.cond.wait_until(&mut events, deadline).timed_out() {
                        if events.cancelled {
                            return WaitOutcome::Cancelled;
                        }
                        if events.completed {
                            events.completed = false;
                            return WaitOutcome::Completed;
                        }
                        return WaitOutcome::TimedOut;
                    }
                }
            }
        }
    }
}
