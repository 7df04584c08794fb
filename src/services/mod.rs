//! External collaborators the pipeline driver calls into.
//!
//! Every collaborator is a blocking, object-safe `Send + Sync` trait so the
//! driver can hold it as `Arc<dyn ...>` and call it from its worker thread.
//!
//! | Trait           | Default implementation | Backend                        |
//! |-----------------|------------------------|--------------------------------|
//! | [`AudioCapture`]| [`ArecordCapture`]     | `arecord` subprocess           |
//! | [`Transcriber`] | [`HttpTranscriber`]    | `/v1/audio/transcriptions`     |
//! | [`ChatModel`]   | [`OllamaChat`]         | Ollama `/api/chat`             |
//! | [`Synthesizer`] | [`PiperSynthesizer`]   | `piper` subprocess             |
//! | [`AudioPlayer`] | [`AplayPlayer`]        | `aplay` subprocess             |
//!
//! Any `Err` is a hard stage failure; the driver never retries except for
//! the single fallback-device playback attempt.

pub mod alsa;
pub mod asr;
pub mod llm;
pub mod tts;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pipeline::process::ManagedProcess;

pub use alsa::{AplayPlayer, ArecordCapture};
pub use asr::HttpTranscriber;
pub use llm::OllamaChat;
pub use tts::PiperSynthesizer;

// ---------------------------------------------------------------------------
// ServiceError
// ---------------------------------------------------------------------------

/// Failures of an external collaborator.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// HTTP transport or connection error.
    #[error("{service} request failed: {message}")]
    Request {
        service: &'static str,
        message: String,
    },

    /// The request did not complete within the configured timeout.
    #[error("{service} request timed out")]
    Timeout { service: &'static str },

    /// The response could not be parsed as expected.
    #[error("failed to parse {service} response: {message}")]
    Parse {
        service: &'static str,
        message: String,
    },

    /// The service answered but produced no usable content.
    #[error("{service} returned an empty result")]
    Empty { service: &'static str },

    /// A required file (model, voice) does not exist.
    #[error("missing {what}: {path}")]
    Missing { what: &'static str, path: String },

    /// A subprocess could not be started.
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// A subprocess exited unsuccessfully.
    #[error("{program} exited with {}", exit_description(.code))]
    Exit { program: String, code: Option<i32> },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn exit_description(code: &Option<i32>) -> String {
    code.map_or_else(|| "a signal".to_string(), |c| format!("status {c}"))
}

impl ServiceError {
    pub(crate) fn from_reqwest(service: &'static str, e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ServiceError::Timeout { service }
        } else {
            ServiceError::Request {
                service,
                message: e.to_string(),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Chat messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One message of a chat-completion request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Collaborator traits
// ---------------------------------------------------------------------------

/// Starts a fixed-length microphone recording into `output`.
pub trait AudioCapture: Send + Sync {
    fn start(
        &self,
        duration: Duration,
        device: &str,
        output: &Path,
    ) -> Result<Arc<dyn ManagedProcess>, ServiceError>;
}

/// Speech recognition on a recorded WAV file.
pub trait Transcriber: Send + Sync {
    fn transcribe(&self, audio: &Path) -> Result<String, ServiceError>;
}

/// A chat-completion language model.
pub trait ChatModel: Send + Sync {
    fn chat_completion(&self, model: &str, messages: &[ChatMessage])
        -> Result<String, ServiceError>;
}

/// Text-to-speech rendering into a WAV file at `output`.
pub trait Synthesizer: Send + Sync {
    fn synthesize(&self, text: &str, voice: &str, output: &Path) -> Result<(), ServiceError>;
}

/// Starts playback of a WAV file on `device`.
pub trait AudioPlayer: Send + Sync {
    fn start(&self, file: &Path, device: &str) -> Result<Arc<dyn ManagedProcess>, ServiceError>;
}

// ---------------------------------------------------------------------------
// Test doubles
// ---------------------------------------------------------------------------
