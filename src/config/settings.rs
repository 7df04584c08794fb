//! Application settings structs, defaults and TOML persistence.
//!
//! All structs implement `Serialize`, `Deserialize`, `Default` and `Clone`
//! so they can be round-tripped through TOML files and shared across threads.
//! Every section is `#[serde(default)]` so a partial `settings.toml` only has
//! to name the values it changes.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::AppPaths;
use crate::hardware::Rgb;
use crate::pipeline::SystemState;

// ---------------------------------------------------------------------------
// AudioConfig
// ---------------------------------------------------------------------------

/// Capture, validation and playback settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// ALSA capture device passed to `arecord -D`.
    pub mic_device: String,
    /// ALSA playback device passed to `aplay -D`.
    pub playback_device: String,
    /// Device retried once when playback on `playback_device` exits non-zero.
    pub fallback_playback_device: String,
    /// Fixed capture length in seconds.
    pub record_secs: u32,
    /// Captures smaller than this are treated as "no audio".
    pub min_recording_bytes: u64,
    /// Sample rate the capture must report in its WAV header.
    pub sample_rate: u32,
    /// Channel count the capture must report in its WAV header.
    pub channels: u16,
    /// Maximum seconds to wait for playback before terminating it.
    pub playback_timeout_secs: u64,
    /// Maximum seconds to wait for the fallback-device retry.
    pub fallback_timeout_secs: u64,
    /// Where temporary capture / synthesis files go.  `None` = system temp.
    pub temp_dir: Option<PathBuf>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            mic_device: "default".into(),
            playback_device: "default".into(),
            fallback_playback_device: "default".into(),
            record_secs: 10,
            min_recording_bytes: 1000,
            sample_rate: 16_000,
            channels: 1,
            playback_timeout_secs: 30,
            fallback_timeout_secs: 15,
            temp_dir: None,
        }
    }
}

// ---------------------------------------------------------------------------
// ServiceConfig
// ---------------------------------------------------------------------------

/// Endpoints and binaries for the external ASR / LLM / TTS stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Base URL of an OpenAI-compatible transcription server.
    pub asr_url: String,
    /// Model name sent with each transcription request.
    pub asr_model: String,
    /// Base URL of the Ollama server.
    pub llm_url: String,
    /// Chat model identifier (e.g. `"tinydolphin:1.1b"`).
    pub llm_model: String,
    /// System prompt.  `None` uses the built-in assistant prompt.
    pub system_prompt: Option<String>,
    /// Path or name of the `piper` executable.
    pub tts_binary: PathBuf,
    /// Directory holding `<voice>.onnx` / `<voice>.onnx.json` pairs.
    pub voices_dir: PathBuf,
    /// Voice used for replies.
    pub voice: String,
    /// Per-request HTTP timeout in seconds.
    pub timeout_secs: u64,
    /// Drop `<think>…</think>` blocks before speaking a reply.
    pub strip_think_tags: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            asr_url: "http://localhost:8000".into(),
            asr_model: "base".into(),
            llm_url: "http://localhost:11434".into(),
            llm_model: "tinydolphin:1.1b".into(),
            system_prompt: None,
            tts_binary: PathBuf::from("piper"),
            voices_dir: PathBuf::from("/opt/piper/voices"),
            voice: "en_GB-jarvis".into(),
            timeout_secs: 120,
            strip_think_tags: true,
        }
    }
}

// ---------------------------------------------------------------------------
// PipelineConfig
// ---------------------------------------------------------------------------

/// Orchestrator and driver behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// How often the stuck-state monitor wakes, in seconds.
    pub monitor_interval_secs: u64,
    /// Per-state timeout in seconds, keyed by state name (`"contemplating"`).
    /// States not listed never time out; an empty table disables the monitor.
    pub state_timeouts_secs: BTreeMap<String, u64>,
    /// Grace period between terminate and kill for registered processes.
    pub process_grace_ms: u64,
    /// Number of previous exchanges sent to the LLM as context.
    pub history_len: usize,
    /// Pause after force-stopping a previous cycle before starting a new one.
    pub settle_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let state_timeouts_secs = [
            ("listening", 30),
            ("processing_speech", 60),
            ("contemplating", 180),
            ("synthesizing", 120),
            ("expressing", 120),
            ("interrupted", 10),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        Self {
            monitor_interval_secs: 5,
            state_timeouts_secs,
            process_grace_ms: 1000,
            history_len: 4,
            settle_ms: 100,
        }
    }
}

impl PipelineConfig {
    /// Resolve the timeout table into typed states.  Unknown names are
    /// logged and skipped.
    pub fn state_timeouts(&self) -> HashMap<SystemState, Duration> {
        let mut out = HashMap::new();
        for (name, secs) in &self.state_timeouts_secs {
            match name.parse::<SystemState>() {
                Ok(state) => {
                    out.insert(state, Duration::from_secs(*secs));
                }
                Err(_) => log::warn!("config: ignoring timeout for unknown state {name:?}"),
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// HardwareConfig
// ---------------------------------------------------------------------------

/// Which device backend drives the feedback hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HardwareBackend {
    #[default]
    Simulated,
    Sysfs,
}

/// Pixel and colour for one activity channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub pixel: usize,
    pub colour: Rgb,
}

/// Feedback device layout and timings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    pub backend: HardwareBackend,
    /// Indicator LED name → LED class directory (sysfs backend).
    pub button_leds: BTreeMap<String, PathBuf>,
    /// Exported PWM channel driving the buzzer.
    pub buzzer_pwm_path: PathBuf,
    /// Multicolour LED class prefix; pixel `i` is `<strip_path><i>`.
    pub strip_path: PathBuf,
    pub strip_pixels: usize,
    /// Standard blink half-period.
    pub blink_ms: u64,
    /// Fast blink half-period (recording / synthesis).
    pub fast_blink_ms: u64,
    pub asr_channel: ChannelConfig,
    pub llm_channel: ChannelConfig,
    pub tts_channel: ChannelConfig,
    /// Half-period of an active activity channel's blink.
    pub activity_blink_ms: u64,
    /// Flash count and half-period of the cycle-complete flourish.
    pub flourish_flashes: u32,
    pub flourish_ms: u64,
    /// Granularity of interruptible tone holds.
    pub sound_slice_ms: u64,
    /// Play sound cues at all.
    pub sound_enabled: bool,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        let button_leds = [("A", "red:a"), ("B", "green:b"), ("C", "blue:c")]
            .into_iter()
            .map(|(name, dev)| {
                (
                    name.to_string(),
                    PathBuf::from(format!("/sys/class/leds/rover:{dev}")),
                )
            })
            .collect();

        Self {
            backend: HardwareBackend::default(),
            button_leds,
            buzzer_pwm_path: PathBuf::from("/sys/class/pwm/pwmchip0/pwm0"),
            strip_path: PathBuf::from("/sys/class/leds/rover:rgb:"),
            strip_pixels: 7,
            blink_ms: 300,
            fast_blink_ms: 120,
            asr_channel: ChannelConfig {
                pixel: 6,
                colour: Rgb(255, 0, 0),
            },
            llm_channel: ChannelConfig {
                pixel: 3,
                colour: Rgb(0, 0, 255),
            },
            tts_channel: ChannelConfig {
                pixel: 0,
                colour: Rgb(0, 255, 0),
            },
            activity_blink_ms: 250,
            flourish_flashes: 3,
            flourish_ms: 150,
            sound_slice_ms: 50,
            sound_enabled: true,
        }
    }
}

// ---------------------------------------------------------------------------
// AppConfig  (top-level)
// ---------------------------------------------------------------------------

/// Top-level application configuration, serialised as `settings.toml`.
///
/// ```rust,no_run
/// use rover_pipeline::config::AppConfig;
///
/// // Load (returns Default when file is missing)
/// let config = AppConfig::load().unwrap();
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub audio: AudioConfig,
    pub services: ServiceConfig,
    pub pipeline: PipelineConfig,
    pub hardware: HardwareConfig,
}

impl AppConfig {
    /// Load configuration from the platform-appropriate `settings.toml`.
    ///
    /// Returns `Ok(AppConfig::default())` when the file does not exist yet.
    pub fn load() -> Result<Self> {
        Self::load_from(&AppPaths::new().settings_file)
    }

    /// Load from an explicit path (`--config`, tests).
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Self =
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    /// Save configuration to the platform-appropriate `settings.toml`,
    /// creating parent directories as needed.
    pub fn save(&self) -> Result<()> {
        self.save_to(&AppPaths::new().settings_file)
    }

    /// Save to an explicit path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
