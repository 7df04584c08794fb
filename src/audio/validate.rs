//! Sanity checks on a captured recording before it is sent to ASR.
//!
//! | Check  | Description                                              |
//! |--------|----------------------------------------------------------|
//! | Exists | The capture file is present                              |
//! | Size   | At least `min_bytes` (a bare WAV header is 44 bytes)     |
//! | Header | Parses as WAV with the expected sample rate and channels |
//! | Data   | Holds at least one sample                                |
//!
//! # Example
//!
//! ```rust,no_run
//! use rover_pipeline::audio::RecordingValidator;
//! use rover_pipeline::config::AudioConfig;
//!
//! let validator = RecordingValidator::from_config(&AudioConfig::default());
//! let info = validator.validate("/tmp/capture.wav".as_ref()).unwrap();
//! println!("{:.1}s recorded", info.duration.as_secs_f32());
//! ```

use std::path::Path;
use std::time::Duration;

use thiserror::Error;

use crate::config::AudioConfig;

// ---------------------------------------------------------------------------
// RecordingError
// ---------------------------------------------------------------------------

/// Reason a recording was rejected.
#[derive(Debug, Error)]
pub enum RecordingError {
    #[error("recording not found: {0}")]
    Missing(String),

    /// Smaller than the configured minimum; usually a capture that never
    /// received audio.
    #[error("recording too small: {bytes} bytes (minimum {min})")]
    TooSmall { bytes: u64, min: u64 },

    #[error("recording is not a readable WAV file: {0}")]
    Malformed(String),

    #[error(
        "unexpected recording format: {rate} Hz x{channels} (expected {expected_rate} Hz x{expected_channels})"
    )]
    Format {
        rate: u32,
        channels: u16,
        expected_rate: u32,
        expected_channels: u16,
    },

    #[error("recording contains no samples")]
    NoSamples,
}

/// What a valid recording contains.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecordingInfo {
    pub bytes: u64,
    pub samples: u32,
    pub duration: Duration,
}

// ---------------------------------------------------------------------------
// RecordingValidator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RecordingValidator {
    pub min_bytes: u64,
    pub sample_rate: u32,
    pub channels: u16,
}

impl RecordingValidator {
    pub fn from_config(config: &AudioConfig) -> Self {
        Self {
            min_bytes: config.min_recording_bytes,
            sample_rate: config.sample_rate,
            channels: config.channels,
        }
    }

    pub fn validate(&self, path: &Path) -> Result<RecordingInfo, RecordingError> {
        let meta = std::fs::metadata(path)
            .map_err(|_| RecordingError::Missing(path.display().to_string()))?;
        let bytes = meta.len();
        if bytes < self.min_bytes {
            return Err(RecordingError::TooSmall {
                bytes,
                min: self.min_bytes,
            });
        }

        let reader =
            hound::WavReader::open(path).map_err(|e| RecordingError::Malformed(e.to_string()))?;
        let spec = reader.spec();
        if spec.sample_rate != self.sample_rate || spec.channels != self.channels {
            return Err(RecordingError::Format {
                rate: spec.sample_rate,
                channels: spec.channels,
                expected_rate: self.sample_rate,
                expected_channels: self.channels,
            });
        }

        let samples = reader.len();
        if samples == 0 {
            return Err(RecordingError::NoSamples);
        }

        let frames = samples / u32::from(spec.channels.max(1));
        let duration = Duration::from_secs_f64(f64::from(frames) / f64::from(spec.sample_rate));
        Ok(RecordingInfo {
            bytes,
            samples,
            duration,
        })
    }
}

impl Default for RecordingValidator {
    fn default() -> Self {
        Self::from_config(&AudioConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::mock::write_wav;
    use tempfile::tempdir;

    #[test]
    fn accepts_expected_format() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("ok.wav");
        write_wav(&path, 16_000, 1, 16_000);

        let info = RecordingValidator::default().validate(&path).unwrap();
        assert_eq!(info.samples, 16_000);
        assert_eq!(info.duration, Duration::from_secs(1));
    }

    #[test]
    fn missing_file() {
        let dir = tempdir().expect("temp dir");
        let err = RecordingValidator::default()
            .validate(&dir.path().join("none.wav"))
            .unwrap_err();
        assert!(matches!(err, RecordingError::Missing(_)));
    }

    #[test]
    fn header_only_capture_is_too_small() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("empty.wav");
        write_wav(&path, 16_000, 1, 0);

        let err = RecordingValidator::default().validate(&path).unwrap_err();
        assert!(matches!(err, RecordingError::TooSmall { bytes: 44, min: 1000 }), "{err}");
    }

    #[test]
    fn header_only_capture_without_size_floor_has_no_samples() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("empty.wav");
        write_wav(&path, 16_000, 1, 0);

        let validator = RecordingValidator {
            min_bytes: 0,
            ..RecordingValidator::default()
        };
        assert!(matches!(validator.validate(&path), Err(RecordingError::NoSamples)));
    }

    #[test]
    fn garbage_is_malformed() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("noise.wav");
        std::fs::write(&path, vec![0x55u8; 4096]).unwrap();

        let err = RecordingValidator::default().validate(&path).unwrap_err();
        assert!(matches!(err, RecordingError::Malformed(_)));
    }

    #[test]
    fn wrong_rate_is_rejected() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("cd.wav");
        write_wav(&path, 44_100, 2, 4_000);

        let err = RecordingValidator::default().validate(&path).unwrap_err();
        assert!(
            matches!(err, RecordingError::Format { rate: 44_100, channels: 2, .. }),
            "{err}"
        );
    }
}
