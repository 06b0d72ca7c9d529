//! Domain politeness ledger.
//!
//! Every outbound request asks the [`PolitenessLedger`] for a grant first.
//! The ledger owns the per-domain admission gate (minimum interval,
//! server-mandated deferrals, the global requests-per-minute ceiling) and the
//! per-origin robots.txt cache.

mod rate_limiter;
mod robots;

use std::time::Duration;

use tracing::{debug, instrument};
use url::Url;

pub use rate_limiter::{
    DomainGrant, MAX_CRAWL_DELAY, RateLimiter, extract_domain, parse_retry_after,
};
pub use robots::{MAX_ROBOTS_ATTEMPTS, RobotsCache, RobotsError, RobotsRules, origin_for_robots};

use crate::http::HttpClient;
use crate::user_agent::PRODUCT_TOKEN;

/// Ledger settings.
#[derive(Debug, Clone)]
pub struct PolitenessOptions {
    /// Minimum spacing between requests to one domain.
    pub per_domain_delay: Duration,
    /// Global ceiling across all domains; 0 disables it.
    pub global_requests_per_minute: u32,
    /// Agent name matched against robots.txt groups.
    pub product_token: String,
}

impl Default for PolitenessOptions {
    fn default() -> Self {
        Self {
            per_domain_delay: Duration::from_secs(3),
            global_requests_per_minute: 60,
            product_token: PRODUCT_TOKEN.to_string(),
        }
    }
}

/// Shared per-domain politeness state. Wrap in `Arc` and share.
#[derive(Debug)]
pub struct PolitenessLedger {
    limiter: RateLimiter,
    robots: RobotsCache,
    client: HttpClient,
}

impl PolitenessLedger {
    /// Creates a ledger whose robots.txt retrievals go through `client`.
    #[must_use]
    pub fn new(client: HttpClient, options: &PolitenessOptions) -> Self {
        debug!(
            delay_ms = options.per_domain_delay.as_millis(),
            rpm = options.global_requests_per_minute,
            "creating politeness ledger"
        );
        Self {
            limiter: RateLimiter::new(
                options.per_domain_delay,
                options.global_requests_per_minute,
            ),
            robots: RobotsCache::new(options.product_token.clone()),
            client,
        }
    }

    /// Waits for the domain's interval (and the global ceiling), then stamps
    /// the domain's last request time.
    pub async fn acquire(&self, url: &str) -> DomainGrant {
        self.limiter.acquire(url).await
    }

    /// Returns whether robots.txt permits fetching `url`. Fail-closed.
    #[instrument(skip(self), fields(url = %url))]
    pub async fn robots_allows(&self, url: &Url) -> bool {
        self.robots.is_allowed(url, &self.client, &self.limiter).await
    }

    /// Pushes the domain's next grant out by `delay` (HTTP 429 Retry-After).
    pub fn defer(&self, url: &str, delay: Duration) {
        self.limiter.defer(url, delay);
    }

    /// Interval currently enforced for `domain`.
    #[must_use]
    pub fn min_interval(&self, domain: &str) -> Duration {
        self.limiter.min_interval(domain)
    }

    /// Raises the interval for one domain.
    pub fn set_min_interval(&self, domain: &str, interval: Duration) {
        self.limiter.set_min_interval(domain, interval);
    }

    /// Ledger with no spacing and no global ceiling.
    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self::new(
            HttpClient::new(),
            &PolitenessOptions {
                per_domain_delay: Duration::ZERO,
                global_requests_per_minute: 0,
                product_token: PRODUCT_TOKEN.to_string(),
            },
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tokio::time::Instant;

    use super::*;

    #[tokio::test]
    async fn test_ledger_spaces_same_domain() {
        tokio::time::pause();
        let ledger = PolitenessLedger::new(
            HttpClient::new(),
            &PolitenessOptions {
                per_domain_delay: Duration::from_secs(2),
                global_requests_per_minute: 0,
                product_token: PRODUCT_TOKEN.to_string(),
            },
        );
        let start = Instant::now();
        let first = ledger.acquire("https://a.gov/1.pdf").await;
        let second = ledger.acquire("https://a.gov/2.pdf").await;
        assert!(second.granted_at >= first.granted_at);
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_ledger_unreachable_robots_disallows() {
        let ledger = PolitenessLedger::for_tests();
        let url = Url::parse("http://127.0.0.1:1/doc.pdf").unwrap();
        assert!(!ledger.robots_allows(&url).await);
    }
}
