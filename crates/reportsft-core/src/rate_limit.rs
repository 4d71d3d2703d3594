//! Adaptive rate limiting and retry for metered LLM calls.
//!
//! Each generation call waits for a governor permit via `until_ready()`,
//! which spaces requests at the configured rate. On 429 the governor is
//! slowed down, and restored after a quiet minute.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};

use crate::llm::{GenerationError, ParagraphRequest, QaGenerator, Verdict};

/// Type alias for governor's direct rate limiter.
type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Default request budget; matches the free tier of the flash models.
pub const DEFAULT_REQUESTS_PER_MINUTE: u32 = 15;

fn quota_for(period: Duration) -> Quota {
    Quota::with_period(period).unwrap_or_else(|| Quota::per_second(NonZeroU32::MIN))
}

/// Rate limiter with adaptive slowdown via ArcSwap.
///
/// When a 429 is received, the governor is atomically swapped to a slower rate.
/// After a cooldown period (60s) with no 429s, the original rate is restored.
pub struct AdaptiveLimiter {
    limiter: ArcSwap<DirectLimiter>,
    /// Base period between allowed requests.
    base_period: Duration,
    /// Current slowdown factor (1 = normal, 2 = half rate, etc.).
    current_factor: AtomicU32,
    /// Timestamp of the last 429 response.
    last_429: std::sync::Mutex<Option<Instant>>,
}

impl std::fmt::Debug for AdaptiveLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptiveLimiter")
            .field("base_period", &self.base_period)
            .field("current_factor", &self.current_factor.load(Ordering::SeqCst))
            .finish()
    }
}

impl AdaptiveLimiter {
    /// Create a new limiter with the given period between requests.
    pub fn new(period: Duration) -> Self {
        let limiter = Arc::new(DirectLimiter::direct(quota_for(period)));
        Self {
            limiter: ArcSwap::from(limiter),
            base_period: period,
            current_factor: AtomicU32::new(1),
            last_429: std::sync::Mutex::new(None),
        }
    }

    /// Create a limiter allowing `n` requests per minute.
    ///
    /// The period is computed in nanoseconds so very high rates never
    /// truncate to zero.
    pub fn per_minute(n: u32) -> Self {
        let nanos = 60_000_000_000 / u64::from(n.max(1));
        Self::new(Duration::from_nanos(nanos))
    }

    pub fn base_period(&self) -> Duration {
        self.base_period
    }

    pub fn slowdown_factor(&self) -> u32 {
        self.current_factor.load(Ordering::SeqCst)
    }

    /// Wait until the rate limiter allows a request.
    pub async fn acquire(&self) {
        self.try_decay();
        let limiter = self.limiter.load();
        limiter.until_ready().await;
    }

    /// Called when a 429 is received. Doubles the slowdown factor and swaps the governor.
    pub fn on_rate_limited(&self) {
        if let Ok(mut last) = self.last_429.lock() {
            *last = Some(Instant::now());
        }

        // Double factor, cap at 16x slowdown
        let _ = self
            .current_factor
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |f| {
                Some((f * 2).min(16))
            });

        let factor = self.current_factor.load(Ordering::SeqCst);
        if let Some(scaled) = self.base_period.checked_mul(factor)
            && let Some(quota) = Quota::with_period(scaled)
        {
            let new_limiter = Arc::new(DirectLimiter::direct(quota));
            self.limiter.store(new_limiter);
        }
        tracing::debug!(factor, "rate limited, slowing down");
    }

    /// If 60s have passed since the last 429, restore the original rate.
    fn try_decay(&self) {
        let should_restore = self
            .last_429
            .lock()
            .ok()
            .and_then(|last| last.map(|t| t.elapsed().as_secs() >= 60))
            .unwrap_or(false);

        if should_restore && self.current_factor.load(Ordering::SeqCst) > 1 {
            self.current_factor.store(1, Ordering::SeqCst);
            let limiter = Arc::new(DirectLimiter::direct(quota_for(self.base_period)));
            self.limiter.store(limiter);
            tracing::debug!("rate limit cooldown elapsed, restoring base rate");
        }
    }
}

/// Check if an HTTP response is a 429 and extract Retry-After if present.
///
/// Returns `Err(GenerationError::RateLimited { .. })` if 429, `Ok(())` otherwise.
pub fn check_rate_limit_response(resp: &reqwest::Response) -> Result<(), GenerationError> {
    if resp.status().as_u16() == 429 {
        let retry_after = resp
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        Err(GenerationError::RateLimited { retry_after })
    } else {
        Ok(())
    }
}

/// Parse a Retry-After header value (seconds or HTTP-date).
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    if let Ok(secs) = value.trim().parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    // HTTP-date: use a conservative fallback rather than parsing it
    if value.contains(',') || value.contains("GMT") {
        return Some(Duration::from_secs(5));
    }
    None
}

/// How hard to try before giving up on a paragraph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(120),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff for the given (0-based) retry, capped, plus up to 25% jitter.
    pub fn backoff(&self, retry: u32) -> Duration {
        let exp = self
            .base_backoff
            .checked_mul(1u32 << retry.min(16))
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff);
        let jitter_ms = fastrand::u64(0..=(exp.as_millis() as u64 / 4));
        exp + Duration::from_millis(jitter_ms)
    }
}

/// A pause before retrying a failed call.
#[derive(Debug, Clone)]
pub struct RetryWait {
    /// 1-based retry number.
    pub attempt: u32,
    pub wait: Duration,
    pub error: GenerationError,
}

/// Call `generator` under the rate limiter, retrying transient failures.
///
/// 1. Acquires a governor permit before every attempt
/// 2. On 429: slows the limiter and waits `Retry-After` (or the backoff)
/// 3. On other retryable errors: waits the exponential backoff
/// 4. Non-retryable errors, and the last error once retries run out, are returned
pub async fn generate_with_retry(
    generator: &dyn QaGenerator,
    request: ParagraphRequest<'_>,
    limiter: &AdaptiveLimiter,
    policy: &RetryPolicy,
    on_wait: &(dyn Fn(&RetryWait) + Send + Sync),
) -> Result<Verdict, GenerationError> {
    let mut retry = 0u32;
    loop {
        limiter.acquire().await;

        let err = match generator.generate(request).await {
            Ok(verdict) => return Ok(verdict),
            Err(e) => e,
        };

        if !err.is_retryable() || retry >= policy.max_retries {
            return Err(err);
        }

        let wait = match &err {
            GenerationError::RateLimited { retry_after } => {
                limiter.on_rate_limited();
                retry_after
                    .unwrap_or_else(|| policy.backoff(retry))
                    .min(policy.max_backoff)
            }
            _ => policy.backoff(retry),
        };
        retry += 1;

        tracing::info!(
            generator = generator.name(),
            attempt = retry,
            wait_secs = wait.as_secs_f64(),
            error = %err,
            "retrying generation"
        );
        on_wait(&RetryWait {
            attempt: retry,
            wait,
            error: err,
        });
        tokio::time::sleep(wait).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{MockGenerator, MockResponse, QaPair};
    use std::sync::Mutex;

    fn request() -> ParagraphRequest<'static> {
        ParagraphRequest {
            context: &[],
            target: "The bank raised its policy rate by 25 basis points in June.",
        }
    }

    fn fast_limiter() -> AdaptiveLimiter {
        AdaptiveLimiter::new(Duration::from_millis(1))
    }

    fn accepted() -> MockResponse {
        MockResponse::Verdict(Verdict::Accepted(QaPair {
            question: "What happened in June?".into(),
            answer: "The policy rate rose by 25 bps.".into(),
        }))
    }

    // ── parse_retry_after ──────────────────────────────────────────────

    #[test]
    fn parse_integer_seconds() {
        assert_eq!(parse_retry_after("5"), Some(Duration::from_secs(5)));
        assert_eq!(parse_retry_after(" 0 "), Some(Duration::from_secs(0)));
    }

    #[test]
    fn parse_http_date_gmt() {
        let val = "Wed, 21 Oct 2015 07:28:00 GMT";
        assert_eq!(parse_retry_after(val), Some(Duration::from_secs(5)));
    }

    #[test]
    fn parse_garbage_none() {
        assert_eq!(parse_retry_after("xyz"), None);
    }

    // ── check_rate_limit_response ──────────────────────────────────────

    #[test]
    fn ok_on_200() {
        let http_resp = http::Response::builder().status(200).body("").unwrap();
        let resp = reqwest::Response::from(http_resp);
        assert!(check_rate_limit_response(&resp).is_ok());
    }

    #[test]
    fn rate_limited_429_with_retry_after() {
        let http_resp = http::Response::builder()
            .status(429)
            .header("retry-after", "10")
            .body("")
            .unwrap();
        let resp = reqwest::Response::from(http_resp);
        match check_rate_limit_response(&resp).unwrap_err() {
            GenerationError::RateLimited { retry_after } => {
                assert_eq!(retry_after, Some(Duration::from_secs(10)));
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    // ── AdaptiveLimiter ────────────────────────────────────────────────

    #[test]
    fn per_minute_sets_period() {
        assert_eq!(
            AdaptiveLimiter::per_minute(15).base_period(),
            Duration::from_secs(4)
        );
        assert_eq!(
            AdaptiveLimiter::per_minute(0).base_period(),
            Duration::from_secs(60)
        );
    }

    #[tokio::test]
    async fn high_rate_keeps_a_nonzero_period() {
        let limiter = AdaptiveLimiter::per_minute(120_000);
        assert_eq!(limiter.base_period(), Duration::from_micros(500));
        assert_eq!(
            AdaptiveLimiter::per_minute(u32::MAX).base_period(),
            Duration::from_nanos(13)
        );

        let start = std::time::Instant::now();
        for _ in 0..3 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn on_rate_limited_doubles_and_caps() {
        let limiter = AdaptiveLimiter::per_minute(600);
        assert_eq!(limiter.slowdown_factor(), 1);
        limiter.on_rate_limited();
        assert_eq!(limiter.slowdown_factor(), 2);
        for _ in 0..10 {
            limiter.on_rate_limited();
        }
        assert_eq!(limiter.slowdown_factor(), 16);
    }

    #[tokio::test]
    async fn decay_restores_after_60s() {
        let limiter = fast_limiter();
        limiter.on_rate_limited();
        limiter.on_rate_limited();
        assert_eq!(limiter.slowdown_factor(), 4);

        {
            let mut last = limiter.last_429.lock().unwrap();
            *last = Some(Instant::now() - Duration::from_secs(61));
        }

        limiter.acquire().await;
        assert_eq!(limiter.slowdown_factor(), 1);
    }

    // ── RetryPolicy ────────────────────────────────────────────────────

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(10),
        };
        let first = policy.backoff(0);
        assert!(first >= Duration::from_secs(1) && first <= Duration::from_millis(1250));
        let third = policy.backoff(2);
        assert!(third >= Duration::from_secs(4) && third <= Duration::from_secs(5));
        let capped = policy.backoff(30);
        assert!(capped >= Duration::from_secs(10) && capped <= Duration::from_millis(12_500));
    }

    // ── generate_with_retry ────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn success_first_try() {
        let generator = MockGenerator::new(accepted());
        let verdict = generate_with_retry(
            &generator,
            request(),
            &fast_limiter(),
            &RetryPolicy::default(),
            &|_| {},
        )
        .await
        .unwrap();
        assert!(matches!(verdict, Verdict::Accepted(_)));
        assert_eq!(generator.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_then_success_honours_retry_after() {
        let generator = MockGenerator::with_sequence(vec![
            MockResponse::Error(GenerationError::RateLimited {
                retry_after: Some(Duration::from_secs(7)),
            }),
            accepted(),
        ]);
        let limiter = fast_limiter();
        let waits = Mutex::new(Vec::new());

        let verdict = generate_with_retry(
            &generator,
            request(),
            &limiter,
            &RetryPolicy::default(),
            &|w: &RetryWait| waits.lock().unwrap().push(w.wait),
        )
        .await
        .unwrap();

        assert!(matches!(verdict, Verdict::Accepted(_)));
        assert_eq!(generator.call_count(), 2);
        assert_eq!(*waits.lock().unwrap(), vec![Duration::from_secs(7)]);
        assert_eq!(limiter.slowdown_factor(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_retries() {
        let generator = MockGenerator::new(MockResponse::Error(GenerationError::Timeout));
        let policy = RetryPolicy {
            max_retries: 2,
            ..RetryPolicy::default()
        };

        let err = generate_with_retry(&generator, request(), &fast_limiter(), &policy, &|_| {})
            .await
            .unwrap_err();

        assert_eq!(err, GenerationError::Timeout);
        // initial attempt + 2 retries
        assert_eq!(generator.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_error_returns_immediately() {
        let generator =
            MockGenerator::new(MockResponse::Error(GenerationError::Auth("bad key".into())));
        let err = generate_with_retry(
            &generator,
            request(),
            &fast_limiter(),
            &RetryPolicy::default(),
            &|_| {},
        )
        .await
        .unwrap_err();
        assert!(matches!(err, GenerationError::Auth(_)));
        assert_eq!(generator.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_is_not_retried() {
        let generator = MockGenerator::new(MockResponse::Error(GenerationError::Malformed(
            "not json".into(),
        )));
        let err = generate_with_retry(
            &generator,
            request(),
            &fast_limiter(),
            &RetryPolicy::default(),
            &|_| {},
        )
        .await
        .unwrap_err();
        assert!(err.is_content_error());
        assert_eq!(generator.call_count(), 1);
    }
}
