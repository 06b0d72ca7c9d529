//! Per-domain admission gate with an optional global request ceiling.
//!
//! Requests to different domains proceed in parallel; requests to the same
//! domain are serialized and spaced by that domain's minimum interval. When a
//! global requests-per-minute quota is configured, every grant also waits on
//! it before being stamped.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use harvester_core::politeness::RateLimiter;
//!
//! # async fn example() {
//! let limiter = RateLimiter::new(Duration::from_secs(3), 0);
//!
//! // First request proceeds immediately
//! limiter.acquire("https://docs.agency.gov/a.pdf").await;
//!
//! // Second request to the same domain waits out the interval
//! limiter.acquire("https://docs.agency.gov/b.pdf").await;
//!
//! // Other domains are not held up
//! limiter.acquire("https://www.energy.gov/c.pdf").await;
//! # }
//! ```

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::Quota;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

/// Warning threshold for cumulative delay per domain (30 seconds).
const CUMULATIVE_DELAY_WARNING_THRESHOLD: Duration = Duration::from_secs(30);

/// Maximum Retry-After value (1 hour) to prevent excessive delays.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Upper bound for a robots.txt `Crawl-delay`.
pub const MAX_CRAWL_DELAY: Duration = Duration::from_secs(60);

/// Sentinel for "no per-domain interval override".
const NO_OVERRIDE: u64 = u64::MAX;

type GlobalLimiter = governor::RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Proof that a request to `domain` was admitted.
#[derive(Debug, Clone)]
pub struct DomainGrant {
    /// Lowercased host the grant applies to.
    pub domain: String,
    /// Instant the grant was stamped.
    pub granted_at: Instant,
    /// Time spent waiting for the domain interval.
    pub waited: Duration,
}

/// Per-domain rate limiter shared by every outbound request.
///
/// Designed to be wrapped in `Arc` and shared across tasks. The `DashMap`
/// shard lock is never held across an await: the per-domain state is cloned
/// out as an `Arc` first.
pub struct RateLimiter {
    default_interval: Duration,
    global: Option<GlobalLimiter>,
    domains: DashMap<String, Arc<DomainState>>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("default_interval", &self.default_interval)
            .field("global_ceiling", &self.global.is_some())
            .field("domains", &self.domains.len())
            .finish()
    }
}

#[derive(Debug)]
struct DomainState {
    /// Last grant; `None` until the first request. Held across the wait so
    /// grants for one domain are strictly ordered.
    last_request: Mutex<Option<Instant>>,
    /// Earliest instant the next grant may be issued (server-mandated).
    not_before: std::sync::Mutex<Option<Instant>>,
    /// Per-domain interval override in milliseconds, or `NO_OVERRIDE`.
    min_interval_ms: AtomicU64,
    cumulative_delay_ms: AtomicU64,
}

impl DomainState {
    fn new() -> Self {
        Self {
            last_request: Mutex::new(None),
            not_before: std::sync::Mutex::new(None),
            min_interval_ms: AtomicU64::new(NO_OVERRIDE),
            cumulative_delay_ms: AtomicU64::new(0),
        }
    }

    fn min_interval(&self, default: Duration) -> Duration {
        match self.min_interval_ms.load(Ordering::SeqCst) {
            NO_OVERRIDE => default,
            ms => Duration::from_millis(ms),
        }
    }

    fn not_before(&self) -> Option<Instant> {
        *self
            .not_before
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn push_not_before(&self, until: Instant) {
        let mut guard = self
            .not_before
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if guard.is_none_or(|current| current < until) {
            *guard = Some(until);
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn add_cumulative_delay(&self, delay: Duration) -> Duration {
        let delay_ms = delay.as_millis() as u64;
        let new_total = self
            .cumulative_delay_ms
            .fetch_add(delay_ms, Ordering::SeqCst)
            + delay_ms;
        Duration::from_millis(new_total)
    }
}

impl RateLimiter {
    /// Creates a limiter with `default_interval` between same-domain grants
    /// and a global ceiling of `requests_per_minute` (0 disables the ceiling).
    #[must_use]
    #[instrument(skip_all, fields(interval_ms = default_interval.as_millis(), requests_per_minute = requests_per_minute))]
    pub fn new(default_interval: Duration, requests_per_minute: u32) -> Self {
        let global = NonZeroU32::new(requests_per_minute)
            .map(|rpm| governor::RateLimiter::direct(Quota::per_minute(rpm)));
        debug!("creating rate limiter");
        Self {
            default_interval,
            global,
            domains: DashMap::new(),
        }
    }

    /// Creates a limiter that spaces nothing. Deferrals are still honoured.
    #[must_use]
    pub fn disabled() -> Self {
        Self::new(Duration::ZERO, 0)
    }

    /// Returns the default interval between same-domain requests.
    #[must_use]
    pub fn default_interval(&self) -> Duration {
        self.default_interval
    }

    /// Returns the interval currently enforced for `domain`.
    #[must_use]
    pub fn min_interval(&self, domain: &str) -> Duration {
        self.domains
            .get(domain)
            .map_or(self.default_interval, |state| {
                state.min_interval(self.default_interval)
            })
    }

    /// Overrides the interval for `domain`. Never lowers it below the default.
    #[allow(clippy::cast_possible_truncation)]
    pub fn set_min_interval(&self, domain: &str, interval: Duration) {
        let interval = interval.max(self.default_interval);
        self.state_for(domain)
            .min_interval_ms
            .store(interval.as_millis() as u64, Ordering::SeqCst);
        debug!(domain, interval_ms = interval.as_millis(), "domain interval raised");
    }

    /// Waits until a request to `url`'s domain may be issued, then stamps it.
    ///
    /// The first request to any domain proceeds without delay.
    #[instrument(skip(self), fields(domain))]
    pub async fn acquire(&self, url: &str) -> DomainGrant {
        let domain = extract_domain(url);
        tracing::Span::current().record("domain", domain.as_str());

        let state = self.state_for(&domain);
        let mut last_request = state.last_request.lock().await;

        let interval = state.min_interval(self.default_interval);
        let spaced_until = last_request.map(|last| last + interval);
        let wait_until = match (spaced_until, state.not_before()) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };

        let mut waited = Duration::ZERO;
        if let Some(until) = wait_until {
            let now = Instant::now();
            if until > now {
                waited = until - now;
                let cumulative = state.add_cumulative_delay(waited);
                debug!(
                    domain = %domain,
                    delay_ms = waited.as_millis(),
                    cumulative_ms = cumulative.as_millis(),
                    "applying politeness delay"
                );
                if cumulative >= CUMULATIVE_DELAY_WARNING_THRESHOLD {
                    warn!(
                        domain = %domain,
                        cumulative_delay_secs = cumulative.as_secs(),
                        "excessive politeness delay - consider fewer terms for this domain"
                    );
                }
                tokio::time::sleep_until(until).await;
            }
        }

        if let Some(global) = &self.global {
            global.until_ready().await;
        }

        let granted_at = Instant::now();
        *last_request = Some(granted_at);
        DomainGrant {
            domain,
            granted_at,
            waited,
        }
    }

    /// Records a server-mandated delay (from a Retry-After header): no grant
    /// for the domain is issued before `now + delay`.
    #[instrument(skip(self), fields(domain))]
    pub fn defer(&self, url: &str, delay: Duration) {
        let domain = extract_domain(url);
        tracing::Span::current().record("domain", domain.as_str());

        let delay = delay.min(MAX_RETRY_AFTER);
        let state = self.state_for(&domain);
        state.push_not_before(Instant::now() + delay);
        let cumulative = state.add_cumulative_delay(delay);

        debug!(
            domain = %domain,
            delay_ms = delay.as_millis(),
            cumulative_ms = cumulative.as_millis(),
            "recorded server rate limit"
        );
        if cumulative >= CUMULATIVE_DELAY_WARNING_THRESHOLD {
            warn!(
                domain = %domain,
                cumulative_delay_secs = cumulative.as_secs(),
                "excessive server rate limiting - site may be under heavy load"
            );
        }
    }

    fn state_for(&self, domain: &str) -> Arc<DomainState> {
        self.domains
            .entry(domain.to_string())
            .or_insert_with(|| Arc::new(DomainState::new()))
            .clone()
    }
}

/// Extracts the lowercased host from a URL, or "unknown" when it has none,
/// so malformed URLs are still rate limited together.
///
/// ```
/// use harvester_core::politeness::extract_domain;
///
/// assert_eq!(extract_domain("https://Docs.Agency.GOV/a.pdf"), "docs.agency.gov");
/// assert_eq!(extract_domain("http://localhost:8080/x"), "localhost");
/// assert_eq!(extract_domain("not a url"), "unknown");
/// ```
#[must_use]
pub fn extract_domain(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_lowercase))
        .unwrap_or_else(|| "unknown".to_string())
}

/// Parses a Retry-After header value (integer seconds or HTTP-date).
///
/// Returns `None` if the value cannot be parsed; caps values at 1 hour and
/// maps dates in the past to zero.
///
/// ```
/// use std::time::Duration;
/// use harvester_core::politeness::parse_retry_after;
///
/// assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
/// assert_eq!(parse_retry_after("invalid"), None);
/// ```
#[must_use]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    if let Ok(seconds) = header_value.parse::<i64>() {
        let Ok(seconds) = u64::try_from(seconds) else {
            debug!(seconds, "negative Retry-After value, ignoring");
            return None;
        };
        return Some(Duration::from_secs(seconds).min(MAX_RETRY_AFTER));
    }

    match httpdate::parse_http_date(header_value) {
        Ok(datetime) => Some(
            datetime
                .duration_since(std::time::SystemTime::now())
                .map_or(Duration::ZERO, |d| d.min(MAX_RETRY_AFTER)),
        ),
        Err(_) => {
            debug!(header_value, "unparseable Retry-After value");
            None
        }
    }
}
