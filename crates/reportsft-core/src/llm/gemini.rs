//! Google Gemini `generateContent` backend.
//!
//! Auth is the `?key=` query parameter. The model is asked for
//! `application/json` output so the reply can be parsed directly.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde_json::{Value, json};

use super::prompt::{DEFAULT_DOMAIN, build_prompt};
use super::{GenerationError, ParagraphRequest, QaGenerator, Verdict, parse_verdict};
use crate::rate_limit::check_rate_limit_response;

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_MODEL: &str = "gemini-2.0-flash";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

pub struct GeminiGenerator {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    domain: String,
    timeout: Duration,
}

impl std::fmt::Debug for GeminiGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiGenerator")
            .field("base_url", &self.base_url)
            .field("api_key", &"***")
            .field("model", &self.model)
            .field("domain", &self.domain)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl GeminiGenerator {
    pub fn new(client: reqwest::Client, api_key: impl Into<String>, model: &str) -> Self {
        Self {
            client,
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.into(),
            model: normalize_model_name(model).to_string(),
            domain: DEFAULT_DOMAIN.to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Subject matter named in the prompt (e.g., "annual reports").
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn endpoint_url(&self) -> String {
        format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url,
            self.model,
            urlencoding::encode(&self.api_key)
        )
    }

    fn request_body(prompt: &str) -> Value {
        json!({
            "contents": [{
                "role": "user",
                "parts": [{ "text": prompt }]
            }],
            "generationConfig": {
                "responseMimeType": "application/json"
            }
        })
    }
}

/// `models/gemini-2.0-flash` and `gemini-2.0-flash` name the same model.
fn normalize_model_name(model: &str) -> &str {
    model.strip_prefix("models/").unwrap_or(model)
}

impl QaGenerator for GeminiGenerator {
    fn name(&self) -> &str {
        &self.model
    }

    fn generate<'a>(
        &'a self,
        request: ParagraphRequest<'a>,
    ) -> Pin<Box<dyn Future<Output = Result<Verdict, GenerationError>> + Send + 'a>> {
        Box::pin(async move {
            let prompt = build_prompt(&self.domain, request.context, request.target);
            tracing::trace!(model = %self.model, chars = prompt.len(), "sending generateContent");

            let resp = self
                .client
                .post(self.endpoint_url())
                .timeout(self.timeout)
                .json(&Self::request_body(&prompt))
                .send()
                .await
                .map_err(map_send_error)?;

            check_rate_limit_response(&resp)?;
            let status = resp.status();
            let body = resp.text().await.map_err(map_send_error)?;
            if !status.is_success() {
                return Err(map_status(status.as_u16(), body));
            }

            let data: Value = serde_json::from_str(&body)
                .map_err(|e| GenerationError::Malformed(format!("invalid API envelope: {}", e)))?;
            let text = response_text(&data)?;
            parse_verdict(&text)
        })
    }
}

fn map_send_error(e: reqwest::Error) -> GenerationError {
    if e.is_timeout() {
        GenerationError::Timeout
    } else {
        GenerationError::Transport(e.to_string())
    }
}

fn map_status(status: u16, body: String) -> GenerationError {
    match status {
        401 | 403 => GenerationError::Auth(format!("HTTP {}", status)),
        500..=599 => GenerationError::Server { status, body },
        _ => GenerationError::Api { status, body },
    }
}

/// Concatenate the text parts of the first candidate.
fn response_text(data: &Value) -> Result<String, GenerationError> {
    let Some(candidate) = data["candidates"].as_array().and_then(|c| c.first()) else {
        if let Some(reason) = data["promptFeedback"]["blockReason"].as_str() {
            return Err(GenerationError::Blocked(reason.to_string()));
        }
        return Err(GenerationError::Malformed("no candidates in response".into()));
    };

    let text: String = candidate["content"]["parts"]
        .as_array()
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p["text"].as_str())
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();

    if text.trim().is_empty() {
        let reason = candidate["finishReason"].as_str().unwrap_or("EMPTY");
        return if matches!(reason, "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT") {
            Err(GenerationError::Blocked(reason.to_string()))
        } else {
            Err(GenerationError::Malformed(format!(
                "empty candidate (finishReason {})",
                reason
            )))
        };
    }
    Ok(text)
}

/// A model that supports `generateContent`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSummary {
    /// Full resource name, e.g. `models/gemini-2.0-flash`.
    pub name: String,
    pub display_name: Option<String>,
    pub input_token_limit: Option<u64>,
}

/// List models usable for generation, following pagination.
pub async fn list_models(
    client: &reqwest::Client,
    base_url: &str,
    api_key: &str,
) -> Result<Vec<ModelSummary>, GenerationError> {
    let base_url = base_url.trim_end_matches('/');
    let mut models = Vec::new();
    let mut page_token: Option<String> = None;

    loop {
        let mut url = format!(
            "{}/models?key={}&pageSize=1000",
            base_url,
            urlencoding::encode(api_key)
        );
        if let Some(ref token) = page_token {
            url.push_str(&format!("&pageToken={}", urlencoding::encode(token)));
        }

        let resp = client
            .get(&url)
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(map_send_error)?;
        check_rate_limit_response(&resp)?;
        let status = resp.status();
        let body = resp.text().await.map_err(map_send_error)?;
        if !status.is_success() {
            return Err(map_status(status.as_u16(), body));
        }

        let data: Value = serde_json::from_str(&body)
            .map_err(|e| GenerationError::Malformed(format!("invalid models response: {}", e)))?;
        models.extend(parse_models_page(&data));

        match data["nextPageToken"].as_str() {
            Some(token) if !token.is_empty() => page_token = Some(token.to_string()),
            _ => break,
        }
    }

    Ok(models)
}

fn parse_models_page(data: &Value) -> Vec<ModelSummary> {
    data["models"]
        .as_array()
        .map(|models| {
            models
                .iter()
                .filter(|m| {
                    m["supportedGenerationMethods"]
                        .as_array()
                        .map(|methods| {
                            methods
                                .iter()
                                .any(|x| x.as_str() == Some("generateContent"))
                        })
                        .unwrap_or(false)
                })
                .filter_map(|m| {
                    Some(ModelSummary {
                        name: m["name"].as_str()?.to_string(),
                        display_name: m["displayName"].as_str().map(str::to_string),
                        input_token_limit: m["inputTokenLimit"].as_u64(),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}
