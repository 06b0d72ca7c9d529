//! robots.txt fetching, parsing and caching.
//!
//! Policies are cached per origin for 24h. Retrieval is fail-closed: any
//! failure other than 404/410 disallows the whole origin until a backoff has
//! elapsed, and after [`MAX_ROBOTS_ATTEMPTS`] failures the origin stays
//! disallowed for the rest of the run.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};
use url::Url;

use super::rate_limiter::{MAX_CRAWL_DELAY, RateLimiter};
use crate::http::{HttpClient, HttpError, read_prefix};

const ROBOTS_TTL: Duration = Duration::from_secs(24 * 3600);

/// Base delay before re-fetching a robots.txt that failed.
const ROBOTS_RETRY_BASE: Duration = Duration::from_secs(30);

/// Failed fetches after which an origin stays disallowed.
pub const MAX_ROBOTS_ATTEMPTS: u32 = 3;

/// Largest robots.txt body read (RFC 9309 requires at least 500 KiB).
const MAX_ROBOTS_BYTES: usize = 512 * 1024;

/// Errors from robots.txt retrieval. All of them mean "disallow".
#[derive(Debug, thiserror::Error)]
pub enum RobotsError {
    /// Transport failure.
    #[error("failed to fetch robots.txt: {0}")]
    Fetch(#[source] HttpError),
    /// Non-success status other than 404/410.
    #[error("robots.txt returned status {status} for {url}")]
    Status {
        /// robots.txt URL.
        url: String,
        /// HTTP status code.
        status: u16,
    },
    /// Body is not UTF-8 text or is an HTML page.
    #[error("robots.txt at {url} is not a robots policy")]
    Unparsable {
        /// robots.txt URL.
        url: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct RobotsRule {
    allow: bool,
    pattern: String,
}

/// Parsed rule set that applies to this harvester.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RobotsRules {
    rules: Vec<RobotsRule>,
    crawl_delay: Option<Duration>,
}

#[derive(Debug, Default)]
struct Group {
    agents: Vec<String>,
    rules: Vec<RobotsRule>,
    crawl_delay: Option<Duration>,
}

impl RobotsRules {
    /// A policy that allows everything (no robots.txt).
    #[must_use]
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// Parses a robots.txt body, keeping the groups addressed to
    /// `product_token`, or the `*` groups when none are.
    #[must_use]
    pub fn parse(body: &str, product_token: &str) -> Self {
        let mut groups: Vec<Group> = Vec::new();
        let mut current = Group::default();
        let mut last_was_agent = false;

        for raw_line in body.lines() {
            let line = raw_line.split('#').next().unwrap_or_default().trim();
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim();

            match key.as_str() {
                "user-agent" => {
                    if !last_was_agent && !current.agents.is_empty() {
                        groups.push(std::mem::take(&mut current));
                    }
                    current.agents.push(value.to_ascii_lowercase());
                    last_was_agent = true;
                }
                "allow" | "disallow" => {
                    last_was_agent = false;
                    if current.agents.is_empty() || value.is_empty() {
                        continue;
                    }
                    current.rules.push(RobotsRule {
                        allow: key == "allow",
                        pattern: normalize_pattern(value),
                    });
                }
                "crawl-delay" => {
                    last_was_agent = false;
                    if let Ok(secs) = value.parse::<f64>()
                        && secs.is_finite()
                        && secs > 0.0
                    {
                        let delay = Duration::from_secs_f64(secs.min(MAX_CRAWL_DELAY.as_secs_f64()));
                        current.crawl_delay = Some(delay);
                    }
                }
                _ => {}
            }
        }
        if !current.agents.is_empty() {
            groups.push(current);
        }

        let token = product_token.to_ascii_lowercase();
        let addressed_to_us = |agent: &str| {
            let name = agent.split('/').next().unwrap_or_default().trim();
            name == token
        };
        let specific = groups
            .iter()
            .any(|g| g.agents.iter().any(|a| addressed_to_us(a.as_str())));

        let mut merged = Self::default();
        for group in groups.into_iter().filter(|g| {
            if specific {
                g.agents.iter().any(|a| addressed_to_us(a.as_str()))
            } else {
                g.agents.iter().any(|a| a == "*")
            }
        }) {
            merged.rules.extend(group.rules);
            merged.crawl_delay = merged.crawl_delay.max(group.crawl_delay);
        }
        merged
    }

    /// Returns whether `path` (path plus optional `?query`) may be fetched.
    ///
    /// The longest matching pattern wins; `Allow` wins ties.
    #[must_use]
    pub fn is_allowed(&self, path: &str) -> bool {
        if path == "/robots.txt" {
            return true;
        }
        let mut best: Option<(usize, bool)> = None;
        for rule in &self.rules {
            if !pattern_matches(&rule.pattern, path) {
                continue;
            }
            let len = rule.pattern.len();
            best = match best {
                Some((best_len, best_allow))
                    if best_len > len || (best_len == len && best_allow) =>
                {
                    Some((best_len, best_allow))
                }
                _ => Some((len, rule.allow)),
            };
        }
        best.is_none_or(|(_, allow)| allow)
    }

    /// `Crawl-delay` for this agent, already capped.
    #[must_use]
    pub fn crawl_delay(&self) -> Option<Duration> {
        self.crawl_delay
    }
}

fn normalize_pattern(value: &str) -> String {
    if value.starts_with('/') || value.starts_with('*') {
        value.to_string()
    } else {
        format!("/{value}")
    }
}

/// Matches a robots pattern supporting `*` (any run) and a trailing `$` anchor.
fn pattern_matches(pattern: &str, path: &str) -> bool {
    let (pattern, anchored) = match pattern.strip_suffix('$') {
        Some(stripped) => (stripped, true),
        None => (pattern, false),
    };
    let parts: Vec<&str> = pattern.split('*').collect();
    let Some((first, rest)) = parts.split_first() else {
        return true;
    };
    if !path.starts_with(first) {
        return false;
    }
    if rest.is_empty() {
        return !anchored || path.len() == first.len();
    }

    let mut pos = first.len();
    for (i, part) in rest.iter().enumerate() {
        let is_last = i == rest.len() - 1;
        if part.is_empty() {
            continue;
        }
        if is_last && anchored {
            return path.len() >= pos + part.len() && path.ends_with(part);
        }
        match path[pos..].find(part) {
            Some(idx) => pos += idx + part.len(),
            None => return false,
        }
    }
    // Pattern ended in `*` (or `*$`), which matches any remainder.
    true
}

enum RobotsEntry {
    Fetched {
        rules: Arc<RobotsRules>,
        fetched_at: Instant,
    },
    Failed {
        attempts: u32,
        retry_at: Option<Instant>,
    },
}

/// Per-origin robots.txt cache.
#[derive(Default)]
pub struct RobotsCache {
    entries: DashMap<String, Arc<Mutex<Option<RobotsEntry>>>>,
    product_token: String,
}

impl std::fmt::Debug for RobotsCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RobotsCache")
            .field("origins", &self.entries.len())
            .field("product_token", &self.product_token)
            .finish()
    }
}

impl RobotsCache {
    /// Creates an empty cache matching groups for `product_token`.
    #[must_use]
    pub fn new(product_token: impl Into<String>) -> Self {
        Self {
            entries: DashMap::new(),
            product_token: product_token.into(),
        }
    }

    /// Returns whether `url` may be fetched, retrieving robots.txt for its
    /// origin when the cache has no fresh entry. Concurrent checks for one
    /// origin share a single retrieval.
    #[instrument(skip(self, client, limiter), fields(url = %url))]
    pub async fn is_allowed(&self, url: &Url, client: &HttpClient, limiter: &RateLimiter) -> bool {
        let Some(origin) = origin_for_robots(url) else {
            return false;
        };
        let slot = self
            .entries
            .entry(origin.clone())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone();
        let mut entry = slot.lock().await;

        let now = Instant::now();
        let previous_attempts = match &*entry {
            Some(RobotsEntry::Fetched { rules, fetched_at })
                if now.duration_since(*fetched_at) < ROBOTS_TTL =>
            {
                return rules.is_allowed(&path_and_query(url));
            }
            Some(RobotsEntry::Failed { retry_at: None, .. }) => return false,
            Some(RobotsEntry::Failed {
                retry_at: Some(at), ..
            }) if now < *at => return false,
            Some(RobotsEntry::Failed { attempts, .. }) => *attempts,
            Some(RobotsEntry::Fetched { .. }) | None => 0,
        };

        match fetch_robots(&origin, &self.product_token, client, limiter).await {
            Ok(rules) => {
                if let Some(delay) = rules.crawl_delay() {
                    let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
                    limiter.set_min_interval(&host, delay);
                }
                let allowed = rules.is_allowed(&path_and_query(url));
                *entry = Some(RobotsEntry::Fetched {
                    rules: Arc::new(rules),
                    fetched_at: Instant::now(),
                });
                allowed
            }
            Err(error) => {
                let attempts = previous_attempts + 1;
                let retry_at = (attempts < MAX_ROBOTS_ATTEMPTS)
                    .then(|| Instant::now() + ROBOTS_RETRY_BASE * 2u32.pow(attempts - 1));
                warn!(
                    origin = %origin,
                    attempts,
                    permanent = retry_at.is_none(),
                    error = %error,
                    "robots.txt unavailable, disallowing origin"
                );
                *entry = Some(RobotsEntry::Failed { attempts, retry_at });
                false
            }
        }
    }
}

async fn fetch_robots(
    origin: &str,
    product_token: &str,
    client: &HttpClient,
    limiter: &RateLimiter,
) -> Result<RobotsRules, RobotsError> {
    let robots_url = format!("{origin}/robots.txt");
    limiter.acquire(&robots_url).await;

    let response = client
        .inner()
        .get(&robots_url)
        .send()
        .await
        .map_err(|e| RobotsError::Fetch(HttpError::from_transport(&robots_url, e)))?;
    let status = response.status().as_u16();
    if matches!(status, 404 | 410) {
        debug!(origin, status, "no robots.txt, allowing origin");
        return Ok(RobotsRules::allow_all());
    }
    if !response.status().is_success() {
        return Err(RobotsError::Status {
            url: robots_url,
            status,
        });
    }

    let bytes = read_prefix(&robots_url, response, MAX_ROBOTS_BYTES)
        .await
        .map_err(RobotsError::Fetch)?;
    let body = String::from_utf8(bytes).map_err(|_| RobotsError::Unparsable {
        url: robots_url.clone(),
    })?;
    let head = body.trim_start().get(..64).unwrap_or(body.trim_start()).to_ascii_lowercase();
    if head.starts_with("<!doctype") || head.starts_with("<html") {
        return Err(RobotsError::Unparsable { url: robots_url });
    }

    Ok(RobotsRules::parse(&body, product_token))
}

fn path_and_query(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{query}", url.path()),
        None => url.path().to_string(),
    }
}

/// Builds the origin string (scheme + host + explicit port) used as the cache key.
#[must_use]
pub fn origin_for_robots(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{}://{host}:{port}", url.scheme()),
        None => format!("{}://{host}", url.scheme()),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    #[test]
    fn test_parse_empty_allows_everything() {
        let rules = RobotsRules::parse("", "harvester");
        assert!(rules.is_allowed("/anything.pdf"));
        assert_eq!(rules.crawl_delay(), None);
    }

    #[test]
    fn test_star_group_disallow_prefix() {
        let rules = RobotsRules::parse("User-agent: *\nDisallow: /private/\n", "harvester");
        assert!(!rules.is_allowed("/private/a.pdf"));
        assert!(rules.is_allowed("/public/a.pdf"));
    }

    #[test]
    fn test_specific_group_overrides_star_group() {
        let body = "User-agent: *\nDisallow: /\n\nUser-agent: Harvester\nDisallow: /drafts/\n";
        let rules = RobotsRules::parse(body, "harvester");
        assert!(rules.is_allowed("/manuals/a.pdf"));
        assert!(!rules.is_allowed("/drafts/a.pdf"));
    }

    #[test]
    fn test_other_agents_groups_ignored() {
        let body = "User-agent: googlebot\nDisallow: /\n";
        let rules = RobotsRules::parse(body, "harvester");
        assert!(rules.is_allowed("/a.pdf"));
    }

    #[test]
    fn test_consecutive_agent_lines_share_rules() {
        let body = "User-agent: otherbot\nUser-agent: *\nDisallow: /x\n";
        let rules = RobotsRules::parse(body, "harvester");
        assert!(!rules.is_allowed("/x/y.pdf"));
    }

    #[test]
    fn test_longest_match_wins_and_allow_wins_ties() {
        let body = "User-agent: *\nDisallow: /docs/\nAllow: /docs/public/\nAllow: /tie\nDisallow: /tie\n";
        let rules = RobotsRules::parse(body, "harvester");
        assert!(!rules.is_allowed("/docs/internal.pdf"));
        assert!(rules.is_allowed("/docs/public/guide.pdf"));
        assert!(rules.is_allowed("/tie/a.pdf"));
    }

    #[test]
    fn test_wildcard_and_end_anchor() {
        let body = "User-agent: *\nDisallow: /*.pdf$\nAllow: /open/*.pdf$\n";
        let rules = RobotsRules::parse(body, "harvester");
        assert!(!rules.is_allowed("/a/b/manual.pdf"));
        assert!(rules.is_allowed("/a/b/manual.pdf?x=1"));
        assert!(rules.is_allowed("/open/manual.pdf"));
        assert!(rules.is_allowed("/a/b/manual.html"));
    }

    #[test]
    fn test_comments_and_empty_disallow() {
        let body = "# hello\nUser-agent: * # everyone\nDisallow:   # nothing\n";
        let rules = RobotsRules::parse(body, "harvester");
        assert!(rules.is_allowed("/a.pdf"));
    }

    #[test]
    fn test_crawl_delay_parsed_and_capped() {
        let rules = RobotsRules::parse("User-agent: *\nCrawl-delay: 5\n", "harvester");
        assert_eq!(rules.crawl_delay(), Some(Duration::from_secs(5)));
        let rules = RobotsRules::parse("User-agent: *\nCrawl-delay: 600\n", "harvester");
        assert_eq!(rules.crawl_delay(), Some(MAX_CRAWL_DELAY));
    }

    #[test]
    fn test_robots_txt_itself_always_allowed() {
        let rules = RobotsRules::parse("User-agent: *\nDisallow: /\n", "harvester");
        assert!(rules.is_allowed("/robots.txt"));
        assert!(!rules.is_allowed("/"));
    }

    #[test]
    fn test_pattern_matches_cases() {
        assert!(pattern_matches("/", "/anything"));
        assert!(pattern_matches("/a*b", "/a/x/b/c"));
        assert!(!pattern_matches("/a*b$", "/a/x/b/c"));
        assert!(pattern_matches("/a*b$", "/a/x/b"));
        assert!(pattern_matches("/exact$", "/exact"));
        assert!(!pattern_matches("/exact$", "/exact/more"));
        assert!(pattern_matches("*/print", "/docs/print"));
    }

    #[test]
    fn test_origin_for_robots_keeps_explicit_port() {
        let url = Url::parse("http://127.0.0.1:8080/a.pdf").unwrap();
        assert_eq!(origin_for_robots(&url).unwrap(), "http://127.0.0.1:8080");
        let url = Url::parse("https://docs.agency.gov/a.pdf").unwrap();
        assert_eq!(origin_for_robots(&url).unwrap(), "https://docs.agency.gov");
    }

    #[tokio::test]
    async fn test_missing_robots_allows() {
        let server = MockServer::start().await;
        let cache = RobotsCache::new("harvester");
        let url = Url::parse(&format!("{}/a.pdf", server.uri())).unwrap();
        assert!(
            cache
                .is_allowed(&url, &HttpClient::new(), &RateLimiter::disabled())
                .await
        );
    }

    #[tokio::test]
    async fn test_server_error_disallows_and_is_cached() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/robots.txt"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;

        let cache = RobotsCache::new("harvester");
        let client = HttpClient::new();
        let limiter = RateLimiter::disabled();
        for name in ["a.pdf", "b.pdf", "c.pdf"] {
            let url = Url::parse(&format!("{}/{name}", server.uri())).unwrap();
            assert!(!cache.is_allowed(&url, &client, &limiter).await);
        }
    }

    #[tokio::test]
    async fn test_html_body_disallows() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/robots.txt"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string("<!DOCTYPE html><html>login</html>"),
            )
            .mount(&server)
            .await;

        let cache = RobotsCache::new("harvester");
        let url = Url::parse(&format!("{}/a.pdf", server.uri())).unwrap();
        assert!(
            !cache
                .is_allowed(&url, &HttpClient::new(), &RateLimiter::disabled())
                .await
        );
    }

    #[tokio::test]
    async fn test_crawl_delay_raises_domain_interval() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/robots.txt"))
            .respond_with(ResponseTemplate::new(200).set_body_string("User-agent: *\nCrawl-delay: 7\n"))
            .mount(&server)
            .await;

        let cache = RobotsCache::new("harvester");
        let limiter = RateLimiter::disabled();
        let url = Url::parse(&format!("{}/a.pdf", server.uri())).unwrap();
        assert!(cache.is_allowed(&url, &HttpClient::new(), &limiter).await);
        assert_eq!(limiter.min_interval("127.0.0.1"), Duration::from_secs(7));
    }
}
