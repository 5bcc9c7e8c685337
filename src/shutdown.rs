//! Process-wide cooperative shutdown primitive
//!
//! One [ShutdownToken] is created by the orchestrator and cloned into every
//! supervisor. All sleeps on the recovery path go through [ShutdownToken::sleep]
//! so a triggered shutdown wakes the sleeper immediately instead of waiting
//! out the interval.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Clonable shutdown flag shared between the interrupt handler and the
/// supervisor threads.
#[derive(Debug, Clone, Default)]
pub struct ShutdownToken {
    inner: Arc<TokenInner>,
}

#[derive(Debug, Default)]
struct TokenInner {
    triggered: Mutex<bool>,
    cond: Condvar,
}

impl ShutdownToken {
    /// Creates a new, untriggered token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Flags the shutdown and wakes every thread currently sleeping on the
    /// token. Triggering more than once is harmless.
    pub fn trigger(&self) {
        let mut triggered = self.inner.triggered.lock().unwrap();
        *triggered = true;
        self.inner.cond.notify_all();
    }

    /// Returns true once [ShutdownToken::trigger] has been called.
    pub fn is_triggered(&self) -> bool {
        *self.inner.triggered.lock().unwrap()
    }

    /// Sleeps for up to `duration`, returning early when the shutdown fires.
    ///
    /// Returns true if the shutdown was triggered (before or during the
    /// sleep), false if the full interval elapsed.
    pub fn sleep(&self, duration: Duration) -> bool {
        let guard = self.inner.triggered.lock().unwrap();
        let (guard, _timeout) = self
            .inner
            .cond
            .wait_timeout_while(guard, duration, |triggered| !*triggered)
            .unwrap();
        *guard
    }
}
