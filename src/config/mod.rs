//! Configuration: one TOML file with a section per subsystem.
//!
//! ```toml
//! [audio]      # arecord / aplay devices, recording length, validation
//! [services]   # ASR and LLM endpoints, piper binary and voice
//! [pipeline]   # state timeouts, monitor interval, history length
//! [hardware]   # backend, LED names, strip channels, blink timings
//! ```
//!
//! [`AppConfig::load`] returns defaults when the file does not exist yet;
//! `rover-pipeline --write-default-config` writes them out for editing.

pub mod paths;
pub mod settings;

pub use paths::AppPaths;
pub use settings::{
    AppConfig, AudioConfig, ChannelConfig, HardwareBackend, HardwareConfig, PipelineConfig,
    ServiceConfig,
};
