//! Small synchronisation helpers shared by the feedback managers.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Lock `mutex`, recovering the guard if a previous holder panicked.
///
/// A blink or sound thread that panics mid-update must not wedge the
/// pipeline, so poisoning is ignored everywhere in this crate.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Join `handle`, giving up after `timeout`.
///
/// Returns `false` if the thread was still running at the deadline; it is
/// then detached and left to observe its stop signal on its own.
pub(crate) fn join_bounded(handle: JoinHandle<()>, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    if handle.join().is_err() {
        log::warn!("worker thread panicked before join");
    }
    true
}

// ---------------------------------------------------------------------------
// StopSignal
// ---------------------------------------------------------------------------

/// A settable event that worker threads poll or sleep on.
///
/// `wait_timeout` doubles as an interruptible sleep: it returns as soon as
/// the signal is set, so a blink loop or tone hold reacts within one wakeup
/// instead of finishing its full delay.
#[derive(Debug, Default)]
pub struct StopSignal {
    flag: Mutex<bool>,
    cond: Condvar,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        *lock(&self.flag) = true;
        self.cond.notify_all();
    }

    pub fn clear(&self) {
        *lock(&self.flag) = false;
    }

    pub fn is_set(&self) -> bool {
        *lock(&self.flag)
    }

    /// Sleep for up to `timeout`.  Returns `true` if the signal was set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut set = lock(&self.flag);
        while !*set {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            set = match self.cond.wait_timeout(set, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }
}
