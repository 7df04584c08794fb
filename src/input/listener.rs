//! Dedicated OS-thread line reader.
//!
//! Reading stdin blocks with no way to cancel it, so the thread is never
//! joined.  Dropping [`InputListener`] sets a stop flag and the thread
//! discards whatever it reads afterwards.  End of input closes the channel.

use std::io::BufRead;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tokio::sync::mpsc;

use super::{parse_line, InputEvent};

/// Handle to a running input thread.
pub struct InputListener {
    stop: Arc<AtomicBool>,
    _thread: std::thread::JoinHandle<()>,
}

impl InputListener {
    /// Read events from the process's stdin.
    pub fn stdin(tx: mpsc::Sender<InputEvent>) -> std::io::Result<Self> {
        Self::spawn(std::io::BufReader::new(std::io::stdin()), tx)
    }

    /// Read events from any line source on a new thread.
    pub fn spawn<R>(reader: R, tx: mpsc::Sender<InputEvent>) -> std::io::Result<Self>
    where
        R: BufRead + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_clone = Arc::clone(&stop);

        let thread = std::thread::Builder::new()
            .name("input-listener".into())
            .spawn(move || {
                for line in reader.lines() {
                    if stop_clone.load(Ordering::Relaxed) {
                        return;
                    }
                    let line = match line {
                        Ok(line) => line,
                        Err(e) => {
                            log::error!("input-listener: read failed: {e}");
                            return;
                        }
                    };
                    let Some(event) = parse_line(&line) else {
                        log::warn!("input-listener: unknown command {:?}", line.trim());
                        continue;
                    };
                    // blocking_send is safe to call from non-async threads.
                    if tx.blocking_send(event).is_err() {
                        return;
                    }
                }
                log::debug!("input-listener: end of input");
            })?;

        Ok(Self {
            stop,
            _thread: thread,
        })
    }
}

impl Drop for InputListener {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}
