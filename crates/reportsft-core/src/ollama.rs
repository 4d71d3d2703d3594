//! Minimal client for a local Ollama server, used to compare a base model
//! with its fine-tuned counterpart.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";
pub const DEFAULT_BASE_MODEL: &str = "qwen2.5:7b-instruct";
pub const DEFAULT_FINETUNED_MODEL: &str = "qwen3-8b-rbi";

/// Local generation is slow on CPU; allow a few minutes per answer.
const GENERATE_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Error, Debug)]
pub enum OllamaError {
    #[error("request to Ollama failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Ollama returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
}

/// Sampling options forwarded in the `options` object.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SamplingOptions {
    pub temperature: f32,
    pub top_p: f32,
}

impl Default for SamplingOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.9,
        }
    }
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: SamplingOptions,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

#[derive(Debug, Clone)]
pub struct OllamaClient {
    client: reqwest::Client,
    base_url: String,
}

impl OllamaClient {
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn generate_url(&self) -> String {
        format!("{}/api/generate", self.base_url)
    }

    /// Run a single non-streaming completion and return the response text.
    pub async fn generate(
        &self,
        model: &str,
        prompt: &str,
        options: SamplingOptions,
    ) -> Result<String, OllamaError> {
        tracing::debug!(model, url = %self.generate_url(), "querying Ollama");
        let resp = self
            .client
            .post(self.generate_url())
            .timeout(GENERATE_TIMEOUT)
            .json(&GenerateRequest {
                model,
                prompt,
                stream: false,
                options,
            })
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(OllamaError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let parsed: GenerateResponse = resp.json().await?;
        Ok(parsed.response)
    }
}
