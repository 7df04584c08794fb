//! Cancellable subprocess handles.
//!
//! Recording and playback run as OS processes.  The orchestrator holds them
//! as `Arc<dyn ManagedProcess>` so cleanup can terminate whichever one is in
//! flight while the driver thread is blocked waiting on it.

use std::io;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::sync::lock;

const POLL: Duration = Duration::from_millis(20);

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub success: bool,
    /// `None` when the process was ended by a signal.
    pub code: Option<i32>,
}

impl From<ExitStatus> for ProcessExit {
    fn from(status: ExitStatus) -> Self {
        Self {
            success: status.success(),
            code: status.code(),
        }
    }
}

/// A running process the pipeline may need to stop early.
pub trait ManagedProcess: Send + Sync {
    fn id(&self) -> u32;

    fn is_running(&self) -> bool;

    /// Ask the process to exit (SIGTERM).
    fn terminate(&self) -> io::Result<()>;

    /// Kill the process outright (SIGKILL).
    fn kill(&self) -> io::Result<()>;

    /// Wait up to `timeout` for the process to exit.  `None` on timeout.
    fn wait_timeout(&self, timeout: Duration) -> Option<ProcessExit>;
}

/// Terminate `process`, wait up to `grace`, then kill.  Never fails.
pub fn terminate_gracefully(process: &dyn ManagedProcess, grace: Duration) {
    if !process.is_running() {
        return;
    }
    let pid = process.id();
    if let Err(e) = process.terminate() {
        log::debug!("process {pid}: terminate failed: {e}");
    }
    if process.wait_timeout(grace).is_some() {
        log::debug!("process {pid}: exited after terminate");
        return;
    }

    log::warn!("process {pid}: still running after {grace:?}; killing");
    if let Err(e) = process.kill() {
        log::debug!("process {pid}: kill failed: {e}");
    }
    if process.wait_timeout(grace).is_none() {
        log::warn!("process {pid}: did not exit after kill");
    }
}

/// Best-effort `pkill -f <pattern>` for processes the pipeline lost track of.
pub fn kill_by_name(pattern: &str) {
    let result = Command::new("pkill")
        .args(["-f", pattern])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    match result {
        // pkill exits 1 when nothing matched.
        Ok(status) if status.success() => log::info!("process: killed stray {pattern}"),
        Ok(_) => log::trace!("process: no stray {pattern}"),
        Err(e) => log::debug!("process: pkill {pattern} unavailable: {e}"),
    }
}

// ---------------------------------------------------------------------------
// ChildProcess
// ---------------------------------------------------------------------------

/// [`ManagedProcess`] over a `std::process::Child`.
#[derive(Debug)]
pub struct ChildProcess {
    pid: u32,
    label: String,
    child: Mutex<Child>,
    exit: Mutex<Option<ProcessExit>>,
}

impl ChildProcess {
    /// Spawn `command` with stdin closed.
    pub fn spawn(label: impl Into<String>, mut command: Command) -> io::Result<Self> {
        let child = command.stdin(Stdio::null()).spawn()?;
        Ok(Self::from_child(label, child))
    }

    pub fn from_child(label: impl Into<String>, child: Child) -> Self {
        let label = label.into();
        let pid = child.id();
        log::debug!("process {pid}: started {label}");
        Self {
            pid,
            label,
            child: Mutex::new(child),
            exit: Mutex::new(None),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    fn poll(&self) -> Option<ProcessExit> {
        let mut exit = lock(&self.exit);
        if exit.is_none() {
            match lock(&self.child).try_wait() {
                Ok(Some(status)) => *exit = Some(status.into()),
                Ok(None) => {}
                Err(e) => {
                    log::warn!("process {}: wait failed: {e}", self.pid);
                    *exit = Some(ProcessExit {
                        success: false,
                        code: None,
                    });
                }
            }
        }
        *exit
    }
}

impl ManagedProcess for ChildProcess {
    fn id(&self) -> u32 {
        self.pid
    }

    fn is_running(&self) -> bool {
        self.poll().is_none()
    }

    fn terminate(&self) -> io::Result<()> {
        if !self.is_running() {
            return Ok(());
        }
        let status = Command::new("kill")
            .args(["-TERM", &self.pid.to_string()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()?;
        if status.success() {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::Other,
                format!("kill -TERM {} exited with {status}", self.pid),
            ))
        }
    }

    fn kill(&self) -> io::Result<()> {
        if !self.is_running() {
            return Ok(());
        }
        lock(&self.child).kill()
    }

    fn wait_timeout(&self, timeout: Duration) -> Option<ProcessExit> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(exit) = self.poll() {
                return Some(exit);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            std::thread::sleep(POLL.min(deadline - now));
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
