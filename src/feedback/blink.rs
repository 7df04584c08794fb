//! A cancellable blink thread bound to one indicator.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::sync::{join_bounded, StopSignal};

/// How long `cancel` waits for a blink thread to notice its stop signal.
pub const BLINK_JOIN_TIMEOUT: Duration = Duration::from_millis(500);

/// A (stop signal, thread) pair.
///
/// Owners keep at most one live handle per indicator and always
/// [`cancel`](BlinkHandle::cancel) the old one before spawning its
/// replacement.
#[derive(Debug)]
pub struct BlinkHandle {
    stop: Arc<StopSignal>,
    thread: Option<JoinHandle<()>>,
}

impl BlinkHandle {
    /// Spawn `body` on a named thread.  `body` must return promptly once the
    /// signal it is handed is set.
    pub fn spawn<F>(name: &str, body: F) -> Self
    where
        F: FnOnce(&StopSignal) + Send + 'static,
    {
        let stop = Arc::new(StopSignal::new());
        let thread_stop = Arc::clone(&stop);

        let thread = std::thread::Builder::new()
            .name(format!("blink-{name}"))
            .spawn(move || body(&thread_stop));

        let thread = match thread {
            Ok(t) => Some(t),
            Err(e) => {
                log::warn!("blink: could not spawn thread for {name}: {e}");
                None
            }
        };

        Self { stop, thread }
    }

    /// `true` while the thread is still running.
    pub fn is_live(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Signal the thread and join it with a bounded wait.
    pub fn cancel(mut self) {
        self.stop.set();
        if let Some(thread) = self.thread.take() {
            if !join_bounded(thread, BLINK_JOIN_TIMEOUT) {
                log::warn!("blink: thread did not stop within {BLINK_JOIN_TIMEOUT:?}");
            }
        }
    }
}

impl Drop for BlinkHandle {
    fn drop(&mut self) {
        // A handle dropped without `cancel` must still stop its thread.
        self.stop.set();
    }
}
