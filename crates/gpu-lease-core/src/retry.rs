//! The retry/backoff/rate-limit policy shared by every provider client
//! (design §4.2, §9 "Shared retry/backoff primitive"). Each client owns one
//! `RateLimiter` and drives its requests through `retry`, supplying a
//! send closure and a classifier for its own wire format.

use std::time::Duration;

use log::{debug, warn};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{ErrorCode, ProviderError};

pub const MAX_ATTEMPTS: u32 = 5;
const BASE_BACKOFF: Duration = Duration::from_secs(2);
const BACKOFF_MULTIPLIER: u32 = 2;
const MAX_BACKOFF: Duration = Duration::from_secs(60);
const RATE_LIMIT_DELAY: Duration = Duration::from_secs(5);
const MIN_SEND_INTERVAL: Duration = Duration::from_millis(100);

/// How a single attempt's outcome should be treated by the retry loop.
pub enum Outcome<T> {
    /// A 2xx response, decoded into the caller's result type.
    Success(T),
    /// HTTP 429 or an explicit `Retry-After`. Carries the header value, if any.
    RateLimited { retry_after: Option<String> },
    /// Any 5xx or a network-layer failure (connection refused, DNS, reset, I/O).
    Transient(ProviderError),
    /// A 4xx other than 429, or a GraphQL `errors` array: maps to a domain
    /// error and is never retried.
    Permanent(ProviderError),
}

/// Per-client rate-limit state: the only shared mutable state inside a
/// provider client (design §5). Guarded by a mutex so concurrent callers
/// within one process serialize through it.
pub struct RateLimiter {
    state: Mutex<RateLimiterState>,
}

struct RateLimiterState {
    last_send: Option<Instant>,
    /// Earliest time a future send may occur, set by a `Retry-After` fence.
    retry_after_fence: Option<Instant>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RateLimiterState {
                last_send: None,
                retry_after_fence: None,
            }),
        }
    }

    /// Block until a send is permitted: at least [`MIN_SEND_INTERVAL`] after
    /// the previous send, and not before any `Retry-After` fence. Cancellation
    /// aware: returns promptly with a cancellation error if `cancel` fires
    /// while waiting.
    pub async fn acquire(
        &self,
        provider: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ProviderError> {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let mut earliest = state.last_send.map(|t| t + MIN_SEND_INTERVAL);
                if let Some(fence) = state.retry_after_fence {
                    earliest = Some(earliest.map_or(fence, |e| e.max(fence)));
                }
                match earliest {
                    Some(t) if t > now => Some(t - now),
                    _ => {
                        state.last_send = Some(now);
                        state.retry_after_fence = None;
                        None
                    }
                }
            };
            match wait {
                None => return Ok(()),
                Some(delay) => {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => continue,
                        _ = cancel.cancelled() => return Err(ProviderError::cancelled(provider)),
                    }
                }
            }
        }
    }

    /// Record a `Retry-After` fence so the next `acquire` waits at least
    /// until it elapses.
    async fn set_fence(&self, delay: Duration) {
        let mut state = self.state.lock().await;
        let fence = Instant::now() + delay;
        state.retry_after_fence = Some(match state.retry_after_fence {
            Some(existing) => existing.max(fence),
            None => fence,
        });
    }
}

/// Parse a `Retry-After` header value: first as integer seconds, then as an
/// HTTP date. Falls back to the fixed 5s rate-limit delay on failure.
pub fn parse_retry_after(value: Option<&str>) -> Duration {
    let Some(value) = value else {
        return RATE_LIMIT_DELAY;
    };
    if let Ok(secs) = value.trim().parse::<u64>() {
        return Duration::from_secs(secs);
    }
    if let Ok(when) = httpdate::parse_http_date(value.trim()) {
        if let Ok(delay) = when.duration_since(std::time::SystemTime::now()) {
            return delay;
        }
    }
    RATE_LIMIT_DELAY
}

fn backoff_for_attempt(attempt: u32) -> Duration {
    let millis = BASE_BACKOFF.as_millis() as u64 * BACKOFF_MULTIPLIER.pow(attempt.saturating_sub(1)) as u64;
    Duration::from_millis(millis).min(MAX_BACKOFF)
}

/// Drive one logical request through the shared policy: acquire the rate
/// limit permit, then attempt up to [`MAX_ATTEMPTS`] times, classifying each
/// outcome and sleeping the exponential backoff schedule (2s, 4s, 8s, 16s,
/// 32s, capped at 60s; a fixed 5s, or the `Retry-After` value, on 429).
///
/// `send` is called once per attempt and must reuse already-serialized
/// request bytes rather than re-encoding the body.
pub async fn retry<T, F, Fut>(
    provider: &str,
    limiter: &RateLimiter,
    cancel: &CancellationToken,
    mut send: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Outcome<T>>,
{
    limiter.acquire(provider, cancel).await?;

    let mut last_err: Option<ProviderError> = None;
    for attempt in 1..=MAX_ATTEMPTS {
        if cancel.is_cancelled() {
            return Err(ProviderError::cancelled(provider));
        }
        if attempt > 1 {
            limiter.acquire(provider, cancel).await?;
        }
        debug!("{provider}: attempt {attempt}/{MAX_ATTEMPTS}");
        match send().await {
            Outcome::Success(value) => return Ok(value),
            Outcome::Permanent(err) => return Err(err),
            Outcome::RateLimited { retry_after } => {
                let delay = parse_retry_after(retry_after.as_deref());
                limiter.set_fence(delay).await;
                warn!("{provider}: rate limited, sleeping {delay:?}");
                last_err = Some(ProviderError::rate_limited(provider));
                if attempt == MAX_ATTEMPTS {
                    break;
                }
                if !sleep_cancellable(delay, cancel).await {
                    return Err(ProviderError::cancelled(provider));
                }
            }
            Outcome::Transient(err) => {
                warn!("{provider}: transient failure on attempt {attempt}: {err}");
                last_err = Some(err);
                if attempt == MAX_ATTEMPTS {
                    break;
                }
                let delay = backoff_for_attempt(attempt);
                if !sleep_cancellable(delay, cancel).await {
                    return Err(ProviderError::cancelled(provider));
                }
            }
        }
    }
    Err(last_err.unwrap_or_else(|| {
        ProviderError::new(provider, ErrorCode::RequestFailed, "retries exhausted")
    }))
}

/// Sleep for `delay`, returning `false` if `cancel` fires first.
async fn sleep_cancellable(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = cancel.cancelled() => false,
    }
}

/// Whether an HTTP status code is retryable per the classification table:
/// 429 or any 5xx.
pub fn is_retryable_status(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_schedule_matches_design() {
        assert_eq!(backoff_for_attempt(1), Duration::from_secs(2));
        assert_eq!(backoff_for_attempt(2), Duration::from_secs(4));
        assert_eq!(backoff_for_attempt(3), Duration::from_secs(8));
        assert_eq!(backoff_for_attempt(4), Duration::from_secs(16));
        assert_eq!(backoff_for_attempt(5), Duration::from_secs(32));
    }

    #[test]
    fn backoff_caps_at_sixty_seconds() {
        assert_eq!(backoff_for_attempt(10), MAX_BACKOFF);
    }

    #[test]
    fn retry_after_parses_integer_seconds() {
        assert_eq!(parse_retry_after(Some("7")), Duration::from_secs(7));
    }

    #[test]
    fn retry_after_falls_back_to_fixed_delay() {
        assert_eq!(parse_retry_after(Some("not-a-date")), RATE_LIMIT_DELAY);
        assert_eq!(parse_retry_after(None), RATE_LIMIT_DELAY);
    }

    #[tokio::test]
    async fn retry_returns_success_without_retrying() {
        let limiter = RateLimiter::new();
        let cancel = CancellationToken::new();
        let mut calls = 0;
        let result = retry::<i32, _, _>("vast", &limiter, &cancel, || {
            calls += 1;
            async { Outcome::Success(42) }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn retry_stops_immediately_on_permanent_error() {
        let limiter = RateLimiter::new();
        let cancel = CancellationToken::new();
        let mut calls = 0;
        let result = retry::<i32, _, _>("vast", &limiter, &cancel, || {
            calls += 1;
            async { Outcome::Permanent(ProviderError::authentication_failed("vast")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn retry_exhausts_all_five_attempts_on_persistent_transient_failure() {
        tokio::time::pause();
        let limiter = RateLimiter::new();
        let cancel = CancellationToken::new();
        let mut calls = 0;
        let result = retry::<i32, _, _>("vast", &limiter, &cancel, || {
            calls += 1;
            async { Outcome::Transient(ProviderError::service_unavailable("vast", "boom")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, MAX_ATTEMPTS);
    }
}
