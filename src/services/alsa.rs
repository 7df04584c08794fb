//! Recording and playback through the ALSA command-line tools.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use super::{AudioCapture, AudioPlayer, ServiceError};
use crate::config::AudioConfig;
use crate::pipeline::process::{ChildProcess, ManagedProcess};

fn spawn(label: &str, command: Command) -> Result<Arc<dyn ManagedProcess>, ServiceError> {
    let process = ChildProcess::spawn(label, command).map_err(|source| ServiceError::Spawn {
        program: label.to_string(),
        source,
    })?;
    Ok(Arc::new(process))
}

// ---------------------------------------------------------------------------
// ArecordCapture
// ---------------------------------------------------------------------------

/// `arecord -D <device> -f S16_LE -r <rate> -c <channels> -d <secs> <file>`
#[derive(Debug, Clone)]
pub struct ArecordCapture {
    binary: PathBuf,
    sample_rate: u32,
    channels: u16,
}

impl ArecordCapture {
    pub fn from_config(config: &AudioConfig) -> Self {
        Self {
            binary: PathBuf::from("arecord"),
            sample_rate: config.sample_rate,
            channels: config.channels,
        }
    }

    pub fn command(&self, duration: Duration, device: &str, output: &Path) -> Command {
        let secs = duration.as_secs().max(1);
        let mut cmd = Command::new(&self.binary);
        cmd.args(["-D", device, "-f", "S16_LE"])
            .args(["-r", &self.sample_rate.to_string()])
            .args(["-c", &self.channels.to_string()])
            .args(["-d", &secs.to_string()])
            .arg(output)
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        cmd
    }
}

impl AudioCapture for ArecordCapture {
    fn start(
        &self,
        duration: Duration,
        device: &str,
        output: &Path,
    ) -> Result<Arc<dyn ManagedProcess>, ServiceError> {
        log::debug!("capture: {}s from {device}", duration.as_secs());
        spawn("arecord", self.command(duration, device, output))
    }
}

// ---------------------------------------------------------------------------
// AplayPlayer
// ---------------------------------------------------------------------------

/// `aplay -D <device> <file>`
#[derive(Debug, Clone)]
pub struct AplayPlayer {
    binary: PathBuf,
}

impl AplayPlayer {
    pub fn new() -> Self {
        Self {
            binary: PathBuf::from("aplay"),
        }
    }

    pub fn command(&self, file: &Path, device: &str) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(["-D", device])
            .arg(file)
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        cmd
    }
}

impl Default for AplayPlayer {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioPlayer for AplayPlayer {
    fn start(&self, file: &Path, device: &str) -> Result<Arc<dyn ManagedProcess>, ServiceError> {
        log::debug!("playback: {} on {device}", file.display());
        spawn("aplay", self.command(file, device))
    }
}
