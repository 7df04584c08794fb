//! Speech synthesis with the `piper` command-line tool.
//!
//! Voices live in one directory as `<voice>.onnx` plus `<voice>.onnx.json`.
//! Text is fed on stdin and piper writes a WAV file to `--output_file`.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use super::{ServiceError, Synthesizer};
use crate::config::ServiceConfig;

pub struct PiperSynthesizer {
    binary: PathBuf,
    voices_dir: PathBuf,
}

impl PiperSynthesizer {
    pub fn new(binary: impl Into<PathBuf>, voices_dir: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            voices_dir: voices_dir.into(),
        }
    }

    pub fn from_config(config: &ServiceConfig) -> Self {
        Self::new(&config.tts_binary, &config.voices_dir)
    }

    /// `(model, config)` paths for `voice`.
    pub fn voice_files(&self, voice: &str) -> (PathBuf, PathBuf) {
        let model = self.voices_dir.join(format!("{voice}.onnx"));
        let config = self.voices_dir.join(format!("{voice}.onnx.json"));
        (model, config)
    }

    /// Voice names with a model file in the voices directory.
    pub fn available_voices(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.voices_dir) else {
            return Vec::new();
        };
        let mut voices: Vec<String> = entries
            .filter_map(Result::ok)
            .filter_map(|e| {
                let name = e.file_name().into_string().ok()?;
                name.strip_suffix(".onnx").map(str::to_string)
            })
            .collect();
        voices.sort();
        voices
    }
}

impl Synthesizer for PiperSynthesizer {
    fn synthesize(&self, text: &str, voice: &str, output: &Path) -> Result<(), ServiceError> {
        let (model, config) = self.voice_files(voice);
        for (what, path) in [("voice model", &model), ("voice config", &config)] {
            if !path.exists() {
                return Err(ServiceError::Missing {
                    what,
                    path: path.display().to_string(),
                });
            }
        }

        let program = self.binary.display().to_string();
        let mut child = Command::new(&self.binary)
            .arg("--model")
            .arg(&model)
            .arg("--config")
            .arg(&config)
            .arg("--output_file")
            .arg(output)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ServiceError::Spawn {
                program: program.clone(),
                source,
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(text.as_bytes())?;
        }

        let result = child.wait_with_output()?;
        if !result.status.success() {
            log::warn!(
                "tts: piper failed: {}",
                String::from_utf8_lossy(&result.stderr).trim()
            );
            return Err(ServiceError::Exit {
                program,
                code: result.status.code(),
            });
        }
        if !output.exists() {
            return Err(ServiceError::Empty { service: "tts" });
        }
        log::debug!("tts: {} chars rendered with {voice}", text.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn voices() -> (tempfile::TempDir, PiperSynthesizer) {
        let dir = tempdir().expect("temp dir");
        for name in ["en_GB-jarvis.onnx", "en_GB-jarvis.onnx.json", "en_US-amy.onnx"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        let synth = PiperSynthesizer::new("/nonexistent/piper", dir.path());
        (dir, synth)
    }

    #[test]
    fn lists_voices_by_model_file() {
        let (_dir, synth) = voices();
        assert_eq!(synth.available_voices(), vec!["en_GB-jarvis", "en_US-amy"]);
    }

    #[test]
    fn missing_voice_config_is_reported() {
        let (dir, synth) = voices();
        let err = synth
            .synthesize("hi", "en_US-amy", &dir.path().join("out.wav"))
            .unwrap_err();
        assert!(matches!(err, ServiceError::Missing { what: "voice config", .. }), "{err}");
    }

    #[test]
    fn missing_binary_is_a_spawn_error() {
        let (dir, synth) = voices();
        let err = synth
            .synthesize("hi", "en_GB-jarvis", &dir.path().join("out.wav"))
            .unwrap_err();
        assert!(matches!(err, ServiceError::Spawn { .. }), "{err}");
    }
}
