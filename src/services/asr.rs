//! Speech recognition over an OpenAI-compatible transcription endpoint.
//!
//! Works with faster-whisper-server, whisper.cpp's server, LocalAI and any
//! other provider that accepts a multipart upload on
//! `/v1/audio/transcriptions` and answers `{"text": "..."}`.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use super::{ServiceError, Transcriber};
use crate::config::ServiceConfig;

const SERVICE: &str = "asr";

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    #[serde(default)]
    text: String,
}

pub struct HttpTranscriber {
    client: reqwest::blocking::Client,
    endpoint: String,
    model: String,
}

impl HttpTranscriber {
    /// Build a transcriber from the service settings.
    ///
    /// Falls back to a default client (no timeout) if the builder fails.
    pub fn from_config(config: &ServiceConfig) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_else(|_| reqwest::blocking::Client::new());

        Self {
            client,
            endpoint: endpoint(&config.asr_url),
            model: config.asr_model.clone(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

fn endpoint(base: &str) -> String {
    format!("{}/v1/audio/transcriptions", base.trim_end_matches('/'))
}

impl Transcriber for HttpTranscriber {
    fn transcribe(&self, audio: &Path) -> Result<String, ServiceError> {
        let form = reqwest::blocking::multipart::Form::new()
            .text("model", self.model.clone())
            .text("response_format", "json")
            .file("file", audio)?;

        let response = self
            .client
            .post(&self.endpoint)
            .multipart(form)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| ServiceError::from_reqwest(SERVICE, e))?;

        let body: TranscriptionResponse = response.json().map_err(|e| ServiceError::Parse {
            service: SERVICE,
            message: e.to_string(),
        })?;

        let text = body.text.trim().to_string();
        if text.is_empty() {
            return Err(ServiceError::Empty { service: SERVICE });
        }
        log::debug!("asr: {} chars transcribed", text.len());
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_tolerates_trailing_slash() {
        assert_eq!(
            endpoint("http://localhost:8000/"),
            "http://localhost:8000/v1/audio/transcriptions"
        );
    }

    #[test]
    fn from_config_uses_configured_model() {
        let cfg = ServiceConfig {
            asr_url: "http://asr.local:9000".into(),
            asr_model: "small".into(),
            ..ServiceConfig::default()
        };
        let t = HttpTranscriber::from_config(&cfg);
        assert_eq!(t.endpoint(), "http://asr.local:9000/v1/audio/transcriptions");
        assert_eq!(t.model, "small");
    }

    #[test]
    fn missing_audio_file_is_an_io_error() {
        let t = HttpTranscriber::from_config(&ServiceConfig::default());
        let err = t
            .transcribe(Path::new("/nonexistent/rover-pipeline-test.wav"))
            .unwrap_err();
        assert!(matches!(err, ServiceError::Io(_)), "{err}");
    }

    #[test]
    fn response_without_text_parses_as_empty() {
        let body: TranscriptionResponse = serde_json::from_str("{}").unwrap();
        assert!(body.text.is_empty());
    }
}
