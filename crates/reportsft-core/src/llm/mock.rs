//! Mock generator for tests.

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::{GenerationError, ParagraphRequest, QaGenerator, QaPair, Verdict};

/// A configurable mock response for [`MockGenerator`].
#[derive(Clone, Debug)]
pub enum MockResponse {
    /// Return this verdict.
    Verdict(Verdict),
    /// Accept every paragraph, echoing it back as the answer.
    Echo,
    /// Fail with this error.
    Error(GenerationError),
}

/// A hand-rolled mock implementing [`QaGenerator`].
///
/// Supports:
/// - A fixed response (used for every call), **or**
/// - A sequence of responses (one per call, repeating the fallback once exhausted).
/// - Optional per-call latency.
/// - Call counting and a log of the targets it was asked about.
pub struct MockGenerator {
    responses: Mutex<Vec<MockResponse>>,
    fallback: MockResponse,
    delay: Option<Duration>,
    call_count: AtomicUsize,
    seen: Mutex<Vec<(Vec<String>, String)>>,
}

impl MockGenerator {
    /// Create a mock that always returns `response`.
    pub fn new(response: MockResponse) -> Self {
        Self {
            responses: Mutex::new(Vec::new()),
            fallback: response,
            delay: None,
            call_count: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Create a mock that returns responses in order, then repeats the last one.
    pub fn with_sequence(mut responses: Vec<MockResponse>) -> Self {
        let fallback = responses.last().cloned().unwrap_or(MockResponse::Echo);
        // Reverse so we can pop() from the front cheaply.
        responses.reverse();
        Self {
            responses: Mutex::new(responses),
            fallback,
            delay: None,
            call_count: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Set simulated network latency per call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// How many times `generate()` has been called.
    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    /// `(context, target)` of every call, in order.
    pub fn requests(&self) -> Vec<(Vec<String>, String)> {
        self.seen.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn next_response(&self) -> MockResponse {
        let mut seq = match self.responses.lock() {
            Ok(seq) => seq,
            Err(poisoned) => poisoned.into_inner(),
        };
        seq.pop().unwrap_or_else(|| self.fallback.clone())
    }
}

impl QaGenerator for MockGenerator {
    fn name(&self) -> &str {
        "mock"
    }

    fn generate<'a>(
        &'a self,
        request: ParagraphRequest<'a>,
    ) -> Pin<Box<dyn Future<Output = Result<Verdict, GenerationError>> + Send + 'a>> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut seen) = self.seen.lock() {
            seen.push((request.context.to_vec(), request.target.to_string()));
        }
        let response = self.next_response();
        let delay = self.delay;

        Box::pin(async move {
            if let Some(d) = delay {
                tokio::time::sleep(d).await;
            }

            match response {
                MockResponse::Verdict(v) => Ok(v),
                MockResponse::Echo => Ok(Verdict::Accepted(QaPair {
                    question: format!("What does this passage say? ({} chars)", request.target.len()),
                    answer: request.target.to_string(),
                })),
                MockResponse::Error(e) => Err(e),
            }
        })
    }
}
