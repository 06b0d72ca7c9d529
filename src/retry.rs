//! Retry logic with exponential backoff for transient request failures.
//!
//! Failures are classified into a [`FailureType`]; the [`RetryPolicy`] then
//! decides whether another attempt is worthwhile and how long to back off.
//! [`run_with_retry`] drives the loop: every attempt passes through the
//! politeness ledger first, server `Retry-After` values are handed back to the
//! ledger, and cancellation interrupts both the admission wait and the backoff.
//!
//! # Example
//!
//! ```
//! use harvester_core::{FailureType, RetryDecision, RetryPolicy};
//!
//! let policy = RetryPolicy::default();
//! match policy.should_retry(FailureType::Transient, 1) {
//!     RetryDecision::Retry { delay, attempt } => {
//!         println!("Retrying in {:?} (attempt {})", delay, attempt);
//!     }
//!     RetryDecision::DoNotRetry { reason } => {
//!         println!("Not retrying: {}", reason);
//!     }
//! }
//! ```

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::http::HttpError;
use crate::politeness::{PolitenessLedger, parse_retry_after};

/// Default maximum attempts (including the first).
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default base delay for exponential backoff (1 second).
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Default maximum delay cap (32 seconds).
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(32);

/// Default backoff multiplier (doubles each attempt).
const DEFAULT_BACKOFF_MULTIPLIER: f32 = 2.0;

/// Maximum jitter added to delays (500ms).
const MAX_JITTER: Duration = Duration::from_millis(500);

/// Classification of request failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// Temporary failure that may succeed on retry (timeouts, resets, 5xx, 408).
    Transient,
    /// Failure that won't change on retry (404, 403, TLS, validation).
    Permanent,
    /// Server rate limiting (HTTP 429).
    RateLimited,
}

/// Decision on whether to retry a failed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the specified delay.
    Retry {
        /// How long to wait before retrying.
        delay: Duration,
        /// Which attempt number this will be (1-indexed, so first retry is attempt 2).
        attempt: u32,
    },

    /// Do not retry.
    DoNotRetry {
        /// Human-readable reason why retry is not attempted.
        reason: String,
    },
}

/// Configuration for retry behavior with exponential backoff.
///
/// ```text
/// delay = min(base_delay * multiplier^(attempt-1), max_delay) + jitter
/// ```
///
/// With defaults, delays are approximately 1s then 2s before the third and
/// final attempt.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    backoff_multiplier: f32,
    jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Creates a new retry policy with custom settings.
    ///
    /// `max_attempts` includes the initial attempt and is clamped to at least 1.
    #[must_use]
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f32,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            backoff_multiplier,
            jitter: true,
        }
    }

    /// Creates a policy with a custom `max_attempts`, using defaults for other settings.
    #[must_use]
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Disables jitter so delays are exact (used by tests and replay tooling).
    #[must_use]
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Returns the maximum number of attempts configured.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Determines whether to retry after attempt number `attempt` (1-indexed) failed.
    #[instrument(skip(self), fields(max_attempts = self.max_attempts))]
    pub fn should_retry(&self, failure_type: FailureType, attempt: u32) -> RetryDecision {
        if failure_type == FailureType::Permanent {
            return RetryDecision::DoNotRetry {
                reason: "permanent failure - retry would not help".to_string(),
            };
        }

        if attempt >= self.max_attempts {
            debug!(attempt, max = self.max_attempts, "max attempts reached");
            return RetryDecision::DoNotRetry {
                reason: format!("max attempts ({}) exhausted", self.max_attempts),
            };
        }

        let delay = self.calculate_delay(attempt);
        debug!(
            attempt,
            next_attempt = attempt + 1,
            delay_ms = delay.as_millis(),
            "will retry"
        );

        RetryDecision::Retry {
            delay,
            attempt: attempt + 1,
        }
    }

    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let multiplier = f64::from(self.backoff_multiplier);
        let exponent = f64::from(attempt.saturating_sub(1));
        let delay_ms = base_ms * multiplier.powf(exponent);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);

        let jitter = if self.jitter {
            let jitter_ms = rand::thread_rng().gen_range(0..=MAX_JITTER.as_millis() as u64);
            Duration::from_millis(jitter_ms)
        } else {
            Duration::ZERO
        };

        Duration::from_millis(capped_ms as u64) + jitter
    }
}

/// Errors that know how they should be retried.
pub trait Retryable {
    /// Classifies the failure for [`RetryPolicy::should_retry`].
    fn failure_type(&self) -> FailureType;

    /// Server-mandated delay, if the failure carried one.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

impl Retryable for HttpError {
    fn failure_type(&self) -> FailureType {
        classify_http_error(self)
    }

    fn retry_after(&self) -> Option<Duration> {
        HttpError::retry_after(self).and_then(parse_retry_after)
    }
}

/// Classifies a transport error into a failure type.
///
/// | Error | Type |
/// |-------|------|
/// | Timeout | Transient |
/// | Network (TLS) | Permanent |
/// | Network (other) | Transient |
/// | 408, 5xx | Transient |
/// | 429 | `RateLimited` |
/// | other 4xx | Permanent |
/// | `InvalidUrl`, `Build` | Permanent |
#[must_use]
pub fn classify_http_error(error: &HttpError) -> FailureType {
    match error {
        HttpError::HttpStatus { status, .. } => classify_http_status(*status),
        HttpError::Timeout { .. } => FailureType::Transient,
        HttpError::Network { source, .. } => {
            if is_tls_error(source) {
                FailureType::Permanent
            } else {
                FailureType::Transient
            }
        }
        HttpError::InvalidUrl { .. } | HttpError::Build { .. } => FailureType::Permanent,
    }
}

/// Classifies an HTTP status code into a failure type.
#[must_use]
pub fn classify_http_status(status: u16) -> FailureType {
    match status {
        408 => FailureType::Transient,
        429 => FailureType::RateLimited,
        500..=599 => FailureType::Transient,
        _ => FailureType::Permanent,
    }
}

fn is_tls_error(error: &reqwest::Error) -> bool {
    let error_string = error.to_string().to_lowercase();
    error_string.contains("certificate")
        || error_string.contains("tls")
        || error_string.contains("ssl")
}

/// Terminal outcome of [`run_with_retry`] when no attempt succeeded.
#[derive(Debug)]
pub enum RetryError<E> {
    /// The last attempt failed and no further retry was allowed.
    Exhausted {
        /// Error from the final attempt.
        error: E,
        /// Number of attempts made.
        attempts: u32,
    },
    /// The run was cancelled during admission, an attempt, or backoff.
    Cancelled,
}

/// Shared state for a retry loop.
#[derive(Debug, Clone, Copy)]
pub struct RetryContext<'a> {
    /// Backoff policy.
    pub policy: &'a RetryPolicy,
    /// Admission gate consulted before every attempt.
    pub ledger: &'a PolitenessLedger,
    /// Run cancellation.
    pub cancel: &'a CancellationToken,
}

/// Runs `attempt_fn` until it succeeds, fails permanently, or exhausts the
/// policy. Each attempt first acquires a ledger grant for `url`.
///
/// # Errors
///
/// Returns [`RetryError::Exhausted`] with the last error, or
/// [`RetryError::Cancelled`] if the cancellation token fires at any point;
/// an in-flight attempt is dropped.
pub async fn run_with_retry<T, E, F, Fut>(
    ctx: RetryContext<'_>,
    url: &str,
    mut attempt_fn: F,
) -> Result<T, RetryError<E>>
where
    E: Retryable + Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt: u32 = 1;
    loop {
        tokio::select! {
            biased;
            () = ctx.cancel.cancelled() => return Err(RetryError::Cancelled),
            _grant = ctx.ledger.acquire(url) => {}
        }

        let outcome = tokio::select! {
            biased;
            () = ctx.cancel.cancelled() => return Err(RetryError::Cancelled),
            outcome = attempt_fn() => outcome,
        };
        let error = match outcome {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        let failure_type = error.failure_type();
        if failure_type == FailureType::RateLimited
            && let Some(delay) = error.retry_after()
        {
            ctx.ledger.defer(url, delay);
        }

        match ctx.policy.should_retry(failure_type, attempt) {
            RetryDecision::Retry {
                delay,
                attempt: next_attempt,
            } => {
                warn!(
                    url,
                    attempt,
                    next_attempt,
                    delay_ms = delay.as_millis(),
                    error = %error,
                    "request failed, retrying"
                );
                tokio::select! {
                    biased;
                    () = ctx.cancel.cancelled() => return Err(RetryError::Cancelled),
                    () = tokio::time::sleep(delay) => {}
                }
                attempt = next_attempt;
            }
            RetryDecision::DoNotRetry { reason } => {
                debug!(url, attempt, reason = %reason, error = %error, "giving up");
                return Err(RetryError::Exhausted {
                    error,
                    attempts: attempt,
                });
            }
        }
    }
}
