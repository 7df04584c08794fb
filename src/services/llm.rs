//! Chat completion against an Ollama server (`/api/chat`).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{ChatMessage, ChatModel, ServiceError};
use crate::config::ServiceConfig;

const SERVICE: &str = "llm";

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: Option<ResponseMessage>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: String,
}

pub struct OllamaChat {
    client: reqwest::blocking::Client,
    endpoint: String,
}

impl OllamaChat {
    /// Build a client from the service settings.
    ///
    /// Falls back to a default client (no timeout) if the builder fails.
    pub fn from_config(config: &ServiceConfig) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_else(|_| reqwest::blocking::Client::new());

        Self {
            client,
            endpoint: format!("{}/api/chat", config.llm_url.trim_end_matches('/')),
        }
    }
}

/// Pull the reply text out of an `/api/chat` response body.
fn reply_text(body: ChatResponse) -> Result<String, ServiceError> {
    let content = body
        .message
        .map(|m| m.content.trim().to_string())
        .unwrap_or_default();
    if content.is_empty() {
        Err(ServiceError::Empty { service: SERVICE })
    } else {
        Ok(content)
    }
}

impl ChatModel for OllamaChat {
    fn chat_completion(
        &self,
        model: &str,
        messages: &[ChatMessage],
    ) -> Result<String, ServiceError> {
        let request = ChatRequest {
            model,
            messages,
            stream: false,
        };
        log::debug!("llm: {} message(s) to {model}", messages.len());

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| ServiceError::from_reqwest(SERVICE, e))?;

        let body: ChatResponse = response.json().map_err(|e| ServiceError::Parse {
            service: SERVICE,
            message: e.to_string(),
        })?;
        reply_text(body)
    }
}
