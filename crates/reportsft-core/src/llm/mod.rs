//! Paragraph judgement: the generator trait, its verdicts, and implementations.

pub mod gemini;
pub mod mock;
pub mod prompt;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde_json::Value;

pub use gemini::{GeminiGenerator, ModelSummary, list_models};
pub use mock::{MockGenerator, MockResponse};

/// A paragraph to judge, with the paragraphs that precede it.
#[derive(Debug, Clone, Copy)]
pub struct ParagraphRequest<'a> {
    pub context: &'a [String],
    pub target: &'a str,
}

/// A question/answer pair produced from one paragraph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QaPair {
    pub question: String,
    pub answer: String,
}

/// The model's decision about a paragraph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Paragraph carries knowledge worth a training example.
    Accepted(QaPair),
    /// Table of contents, disclaimer, page artefact, fragment, etc.
    Rejected,
}

/// Error from a generation call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationError {
    /// Server returned 429 Too Many Requests.
    RateLimited { retry_after: Option<Duration> },
    /// Credentials missing or refused (401/403).
    Auth(String),
    /// Connection-level failure.
    Transport(String),
    Timeout,
    /// 5xx from the API.
    Server { status: u16, body: String },
    /// Any other non-success status.
    Api { status: u16, body: String },
    /// The API refused to answer (safety filters).
    Blocked(String),
    /// The answer was not the JSON object we asked for.
    Malformed(String),
}

impl GenerationError {
    /// Whether the same request may succeed if tried again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GenerationError::RateLimited { .. }
                | GenerationError::Transport(_)
                | GenerationError::Timeout
                | GenerationError::Server { .. }
        )
    }

    /// Whether the failure concerns only this paragraph's content, so the run
    /// can skip it and move on.
    pub fn is_content_error(&self) -> bool {
        matches!(
            self,
            GenerationError::Blocked(_) | GenerationError::Malformed(_)
        )
    }
}

impl std::fmt::Display for GenerationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GenerationError::RateLimited {
                retry_after: Some(d),
            } => write!(f, "Rate limited (429), retry after {:.1}s", d.as_secs_f64()),
            GenerationError::RateLimited { retry_after: None } => write!(f, "Rate limited (429)"),
            GenerationError::Auth(msg) => write!(f, "Authentication failed: {}", msg),
            GenerationError::Transport(msg) => write!(f, "Request failed: {}", msg),
            GenerationError::Timeout => write!(f, "Request timed out"),
            GenerationError::Server { status, body } => {
                write!(f, "Server error (HTTP {}): {}", status, truncate(body, 200))
            }
            GenerationError::Api { status, body } => {
                write!(f, "API error (HTTP {}): {}", status, truncate(body, 200))
            }
            GenerationError::Blocked(reason) => write!(f, "Response blocked: {}", reason),
            GenerationError::Malformed(msg) => write!(f, "Malformed response: {}", msg),
        }
    }
}

impl std::error::Error for GenerationError {}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() > max_chars {
        let cut: String = s.chars().take(max_chars).collect();
        format!("{}...", cut)
    } else {
        s.to_string()
    }
}

/// A model that turns a paragraph into a [`Verdict`].
pub trait QaGenerator: Send + Sync {
    /// Human-readable name (e.g., "gemini-2.0-flash").
    fn name(&self) -> &str;

    /// Judge `request.target` given its context.
    fn generate<'a>(
        &'a self,
        request: ParagraphRequest<'a>,
    ) -> Pin<Box<dyn Future<Output = Result<Verdict, GenerationError>> + Send + 'a>>;
}

/// Parse the model's JSON answer into a [`Verdict`].
///
/// Accepts a bare object or an array whose first element is an object.
/// Code fences around the JSON are tolerated.
pub fn parse_verdict(text: &str) -> Result<Verdict, GenerationError> {
    let body = strip_code_fence(text);
    let value: Value = serde_json::from_str(body).map_err(|e| {
        GenerationError::Malformed(format!("{} | text: {}", e, truncate(body, 100)))
    })?;

    let object = match value {
        Value::Object(_) => value,
        Value::Array(items) => match items.into_iter().next() {
            Some(first @ Value::Object(_)) => first,
            _ => {
                return Err(GenerationError::Malformed(
                    "array response without an object".into(),
                ));
            }
        },
        other => {
            return Err(GenerationError::Malformed(format!(
                "expected a JSON object, got {}",
                truncate(&other.to_string(), 100)
            )));
        }
    };

    let valid = match object.get("valid") {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.trim().eq_ignore_ascii_case("true"),
        _ => false,
    };
    if !valid {
        return Ok(Verdict::Rejected);
    }

    let field = |name: &str| {
        object
            .get(name)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    match (field("question"), field("answer")) {
        (Some(question), Some(answer)) => Ok(Verdict::Accepted(QaPair { question, answer })),
        _ => Err(GenerationError::Malformed(
            "valid response without question and answer".into(),
        )),
    }
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}
