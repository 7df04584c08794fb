//! Where the controller keeps its files, resolved with the `dirs` crate.
//!
//! | Path            | Linux                                   |
//! |-----------------|-----------------------------------------|
//! | `settings_file` | `~/.config/rover-pipeline/settings.toml`|
//! | `scratch_dir`   | `~/.cache/rover-pipeline/audio/`        |
//!
//! `scratch_dir` holds the per-cycle capture and reply WAV files.  They are
//! deleted when the cycle ends, so the directory is normally empty.

use std::path::{Path, PathBuf};

const APP_NAME: &str = "rover-pipeline";

#[derive(Debug, Clone)]
pub struct AppPaths {
    pub settings_file: PathBuf,
    pub scratch_dir: PathBuf,
}

impl AppPaths {
    /// Platform locations, falling back to the current directory.
    pub fn new() -> Self {
        let config_dir = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        let cache_dir = dirs::cache_dir().unwrap_or_else(std::env::temp_dir);
        Self {
            settings_file: config_dir.join(APP_NAME).join("settings.toml"),
            scratch_dir: cache_dir.join(APP_NAME).join("audio"),
        }
    }

    /// Platform locations, but with settings read from `settings_file`.
    pub fn with_settings(settings_file: impl AsRef<Path>) -> Self {
        Self {
            settings_file: settings_file.as_ref().to_path_buf(),
            ..Self::new()
        }
    }

    pub fn config_dir(&self) -> &Path {
        self.settings_file.parent().unwrap_or_else(|| Path::new("."))
    }
}

impl Default for AppPaths {
    fn default() -> Self {
        Self::new()
    }
}
