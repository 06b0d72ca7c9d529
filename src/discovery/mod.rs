//! Query source adapters.
//!
//! Each adapter turns a [`SearchTerm`](crate::SearchTerm) into a lazy, finite
//! stream of [`CandidateUrl`]s. Streams do no network work until polled and
//! every call to [`SourceAdapter::discover`] builds a fresh one. All
//! outbound requests wait for a politeness grant and stop when the run's
//! cancellation token fires.
//!
//! Adapters:
//! - [`ApiAdapter`] - programmable search JSON API
//! - [`EngineAdapter`] - one engine result page, parsed by a [`ResultPageParser`]
//! - [`SeedAdapter`] - one hop from configured seed pages

mod api;
mod engine;
mod parsers;
mod seed;

use std::sync::Arc;

use futures_util::stream::BoxStream;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

pub use api::{ApiAdapter, ApiCredentials, DEFAULT_API_BASE_URL, MAX_API_RESULTS, PAGE_SIZE};
pub use engine::EngineAdapter;
pub use parsers::{
    BingParser, DuckDuckGoParser, GoogleParser, ResultPageParser, YahooParser, extract_links,
    parser_for,
};
pub use seed::{MAX_HEAD_CHECKS_PER_SEED, SeedAdapter};

use crate::http::{HttpClient, HttpError};
use crate::model::{CandidateUrl, SourceKind};
use crate::normalize::{follow_redirect, needs_redirect_follow, normalize, normalize_with_base};
use crate::politeness::PolitenessLedger;

/// Largest result or seed page read.
pub const MAX_PAGE_BYTES: usize = 4 * 1024 * 1024;

/// Errors reported by a discovery stream. None of them are fatal to the run.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// Credentials were rejected.
    #[error("{source_name}: credentials rejected (HTTP {status})")]
    Unauthorized {
        /// Adapter name.
        source_name: String,
        /// 401 or 403.
        status: u16,
    },
    /// Daily quota or rate limit exhausted.
    #[error("{source_name}: quota exceeded")]
    QuotaExceeded {
        /// Adapter name.
        source_name: String,
    },
    /// robots.txt forbids fetching the page.
    #[error("{source_name}: robots.txt disallows {url}")]
    RobotsDisallowed {
        /// Adapter name.
        source_name: String,
        /// Page that was not fetched.
        url: String,
    },
    /// Network or HTTP status failure.
    #[error("{source_name}: {source}")]
    Transport {
        /// Adapter name.
        source_name: String,
        /// Underlying error.
        #[source]
        source: HttpError,
    },
    /// The page could not be understood.
    #[error("{source_name}: invalid response: {reason}")]
    InvalidResponse {
        /// Adapter name.
        source_name: String,
        /// What was wrong.
        reason: String,
    },
}

impl DiscoveryError {
    /// Wraps a transport error for `source_name`.
    pub fn transport(source_name: impl Into<String>, source: HttpError) -> Self {
        Self::Transport {
            source_name: source_name.into(),
            source,
        }
    }
}

/// One discovery call.
#[derive(Debug, Clone, Copy)]
pub struct DiscoveryRequest<'a> {
    /// Term being searched.
    pub term: &'a crate::SearchTerm,
    /// Candidates wanted; adapters use it to decide how far to paginate.
    pub limit: usize,
    /// Run cancellation.
    pub cancel: &'a CancellationToken,
}

/// A source of candidate document URLs.
pub trait SourceAdapter: Send + Sync {
    /// Name used in logs and the run summary.
    fn name(&self) -> &str;

    /// Provenance stamped on produced candidates.
    fn kind(&self) -> SourceKind;

    /// Builds a fresh lazy stream of candidates for `request`. Errors are
    /// yielded in-band and are not fatal to the run.
    fn discover<'a>(
        &'a self,
        request: DiscoveryRequest<'a>,
    ) -> BoxStream<'a, Result<CandidateUrl, DiscoveryError>>;
}

/// Client plus ledger shared by every adapter.
#[derive(Debug, Clone)]
pub struct DiscoveryContext {
    /// Shared HTTP client.
    pub client: HttpClient,
    /// Shared politeness ledger.
    pub ledger: Arc<PolitenessLedger>,
}

impl DiscoveryContext {
    /// Creates a context.
    #[must_use]
    pub fn new(client: HttpClient, ledger: Arc<PolitenessLedger>) -> Self {
        Self { client, ledger }
    }

    /// Waits for a ledger grant. Returns `false` if the run was cancelled first.
    pub(crate) async fn admit(&self, url: &str, cancel: &CancellationToken) -> bool {
        tokio::select! {
            biased;
            () = cancel.cancelled() => false,
            _grant = self.ledger.acquire(url) => true,
        }
    }

    /// GETs a page as text after a ledger grant. `Ok(None)` means cancelled.
    pub(crate) async fn fetch_page(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, HttpError> {
        if !self.admit(url, cancel).await {
            return Ok(None);
        }
        tokio::select! {
            biased;
            () = cancel.cancelled() => Ok(None),
            page = self.client.get_text(url, MAX_PAGE_BYTES) => page.map(Some),
        }
    }

    /// Normalizes a discovered link, following opaque redirectors.
    /// Rejected links are logged and dropped.
    pub(crate) async fn resolve_link(
        &self,
        raw: &str,
        base: Option<&Url>,
        kind: SourceKind,
        cancel: &CancellationToken,
    ) -> Option<Url> {
        let normalized = match base {
            Some(base) => normalize_with_base(raw, base, kind),
            None => normalize(raw, kind),
        };
        let url = match normalized {
            Ok(url) => url,
            Err(rejection) => {
                debug!(raw, source = %kind, %rejection, "dropped link");
                return None;
            }
        };
        if !needs_redirect_follow(&url) {
            return Some(url);
        }

        let followed = tokio::select! {
            biased;
            () = cancel.cancelled() => return None,
            followed = follow_redirect(&self.client, &self.ledger, &url, kind) => followed,
        };
        match followed {
            Ok(target) => Some(target),
            Err(error) => {
                debug!(url = %url, source = %kind, error = %error, "dropped unresolvable redirector");
                None
            }
        }
    }
}
