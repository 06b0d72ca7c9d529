//! Programmable search JSON API adapter.
//!
//! Speaks the Google Custom Search JSON shape: results in `items[].link`,
//! the next page announced in `queries.nextPage[0].startIndex`.

use futures_util::stream::{self, BoxStream, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::{DiscoveryContext, DiscoveryError, DiscoveryRequest, MAX_PAGE_BYTES, SourceAdapter};
use crate::http::{HttpError, read_prefix};
use crate::model::{CandidateUrl, SourceKind};

/// Default endpoint.
pub const DEFAULT_API_BASE_URL: &str = "https://www.googleapis.com/customsearch/v1";

/// Results per API page.
pub const PAGE_SIZE: u32 = 10;

/// The API never serves results past this index.
pub const MAX_API_RESULTS: u32 = 100;

const SOURCE_NAME: &str = "api";

/// API key plus search engine id.
#[derive(Clone)]
pub struct ApiCredentials {
    /// API key (secret).
    pub api_key: String,
    /// Programmable search engine id (`cx`).
    pub engine_id: String,
}

impl std::fmt::Debug for ApiCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiCredentials")
            .field("api_key", &"<redacted>")
            .field("engine_id", &self.engine_id)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    items: Vec<SearchItem>,
    #[serde(default)]
    queries: Option<SearchQueries>,
}

#[derive(Debug, Deserialize)]
struct SearchItem {
    #[serde(default)]
    link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchQueries {
    #[serde(default, rename = "nextPage")]
    next_page: Vec<PageInfo>,
}

#[derive(Debug, Deserialize)]
struct PageInfo {
    #[serde(rename = "startIndex")]
    start_index: u32,
}

/// Paginated search API adapter.
#[derive(Debug)]
pub struct ApiAdapter {
    ctx: DiscoveryContext,
    credentials: ApiCredentials,
    base_url: Url,
}

impl ApiAdapter {
    /// Creates an adapter against `base_url`.
    #[must_use]
    pub fn new(ctx: DiscoveryContext, credentials: ApiCredentials, base_url: Url) -> Self {
        Self {
            ctx,
            credentials,
            base_url,
        }
    }

    fn page_url(&self, query: &str, start: u32) -> Url {
        let mut url = self.base_url.clone();
        url.query_pairs_mut()
            .append_pair("key", &self.credentials.api_key)
            .append_pair("cx", &self.credentials.engine_id)
            .append_pair("q", query)
            .append_pair("num", &PAGE_SIZE.to_string())
            .append_pair("start", &start.to_string());
        url
    }

    /// Fetches one page. `Ok(None)` means the run was cancelled.
    #[instrument(skip(self, query, request), fields(query = %query))]
    async fn fetch_page(
        &self,
        query: &str,
        start: u32,
        request: DiscoveryRequest<'_>,
    ) -> Result<Option<SearchResponse>, DiscoveryError> {
        let url = self.page_url(query, start);
        // The key stays out of logs and errors.
        let display_url = self.base_url.as_str();
        if !self.ctx.admit(url.as_str(), request.cancel).await {
            return Ok(None);
        }

        let response = tokio::select! {
            biased;
            () = request.cancel.cancelled() => return Ok(None),
            response = self.ctx.client.get(url.as_str()) => response,
        };
        let response = response.map_err(|error| map_api_error(display_url, error))?;
        let body = read_prefix(display_url, response, MAX_PAGE_BYTES)
            .await
            .map_err(|error| DiscoveryError::transport(SOURCE_NAME, error))?;

        serde_json::from_slice(&body)
            .map(Some)
            .map_err(|e| DiscoveryError::InvalidResponse {
                source_name: SOURCE_NAME.to_string(),
                reason: e.to_string(),
            })
    }
}

fn map_api_error(display_url: &str, error: HttpError) -> DiscoveryError {
    match error.status() {
        Some(status @ (401 | 403)) => DiscoveryError::Unauthorized {
            source_name: SOURCE_NAME.to_string(),
            status,
        },
        Some(429) => DiscoveryError::QuotaExceeded {
            source_name: SOURCE_NAME.to_string(),
        },
        Some(status) => {
            DiscoveryError::transport(SOURCE_NAME, HttpError::http_status(display_url, status))
        }
        None => DiscoveryError::transport(SOURCE_NAME, error),
    }
}

/// Start index of the page after `page`, if another page is worth fetching.
fn next_start(page: &SearchResponse, fetched: usize, limit: usize) -> Option<u32> {
    if page.items.is_empty() || fetched >= limit {
        return None;
    }
    let next = page.queries.as_ref()?.next_page.first()?.start_index;
    (next.saturating_add(PAGE_SIZE - 1) <= MAX_API_RESULTS).then_some(next)
}

impl SourceAdapter for ApiAdapter {
    fn name(&self) -> &str {
        SOURCE_NAME
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Api
    }

    fn discover<'a>(
        &'a self,
        request: DiscoveryRequest<'a>,
    ) -> BoxStream<'a, Result<CandidateUrl, DiscoveryError>> {
        let query = request.term.document_query();
        info!(query = %query, limit = request.limit, "querying search API");

        // State: (query, next start index, links seen so far).
        let pages = stream::unfold(
            (query, Some(1u32), 0usize),
            move |(query, start, fetched)| async move {
                let start = start?;
                let page = match self.fetch_page(&query, start, request).await {
                    Ok(Some(page)) => page,
                    Ok(None) => return None,
                    Err(error) => {
                        warn!(query = %query, error = %error, "search API failed");
                        return Some((vec![Err(error)], (query, None, fetched)));
                    }
                };

                let fetched = fetched + page.items.len();
                let next = next_start(&page, fetched, request.limit);
                debug!(start, items = page.items.len(), ?next, "search API page");

                let mut candidates = Vec::with_capacity(page.items.len());
                for link in page.items.into_iter().filter_map(|item| item.link) {
                    if let Some(url) = self
                        .ctx
                        .resolve_link(&link, None, SourceKind::Api, request.cancel)
                        .await
                    {
                        candidates.push(Ok(CandidateUrl::new(
                            url,
                            SourceKind::Api,
                            query.clone(),
                            request.term.clone(),
                        )));
                    }
                }
                Some((candidates, (query, next, fetched)))
            },
        );
        pages.flat_map(stream::iter).boxed()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use futures_util::StreamExt;
    use tokio_util::sync::CancellationToken;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::http::HttpClient;
    use crate::model::SearchTerm;
    use crate::politeness::PolitenessLedger;

    fn adapter(server: &MockServer) -> ApiAdapter {
        let ctx = DiscoveryContext::new(HttpClient::new(), Arc::new(PolitenessLedger::for_tests()));
        ApiAdapter::new(
            ctx,
            ApiCredentials {
                api_key: "secret".to_string(),
                engine_id: "cx1".to_string(),
            },
            Url::parse(&format!("{}/customsearch/v1", server.uri())).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_paginates_until_no_next_page() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/customsearch/v1"))
            .and(query_param("start", "1"))
            .and(query_param("q", "switch guide filetype:pdf"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [
                    {"link": "https://a.gov/1.pdf"},
                    {"link": "https://a.gov/2.pdf?utm_source=api"},
                ],
                "queries": {"nextPage": [{"startIndex": 11}]}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/customsearch/v1"))
            .and(query_param("start", "11"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [{"link": "https://b.edu/3.pdf"}]
            })))
            .mount(&server)
            .await;

        let adapter = adapter(&server);
        let term = SearchTerm::new("Networking", "switch guide");
        let cancel = CancellationToken::new();
        let results: Vec<_> = adapter
            .discover(DiscoveryRequest {
                term: &term,
                limit: 50,
                cancel: &cancel,
            })
            .collect()
            .await;

        let urls: Vec<String> = results
            .into_iter()
            .map(|r| r.unwrap().url.to_string())
            .collect();
        assert_eq!(
            urls,
            vec!["https://a.gov/1.pdf", "https://a.gov/2.pdf", "https://b.edu/3.pdf"]
        );
    }

    #[tokio::test]
    async fn test_stops_paginating_at_limit() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/customsearch/v1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [{"link": "https://a.gov/1.pdf"}, {"link": "https://a.gov/2.pdf"}],
                "queries": {"nextPage": [{"startIndex": 11}]}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let adapter = adapter(&server);
        let term = SearchTerm::new("c", "t");
        let cancel = CancellationToken::new();
        let count = adapter
            .discover(DiscoveryRequest {
                term: &term,
                limit: 2,
                cancel: &cancel,
            })
            .count()
            .await;
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn test_unauthorized_and_quota_errors() {
        for (status, unauthorized) in [(403, true), (429, false)] {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .respond_with(ResponseTemplate::new(status))
                .mount(&server)
                .await;

            let adapter = adapter(&server);
            let term = SearchTerm::new("c", "t");
            let cancel = CancellationToken::new();
            let results: Vec<_> = adapter
                .discover(DiscoveryRequest {
                    term: &term,
                    limit: 10,
                    cancel: &cancel,
                })
                .collect()
                .await;
            assert_eq!(results.len(), 1);
            let error = results.into_iter().next().unwrap().unwrap_err();
            if unauthorized {
                assert!(matches!(error, DiscoveryError::Unauthorized { status: 403, .. }));
            } else {
                assert!(matches!(error, DiscoveryError::QuotaExceeded { .. }));
            }
            assert!(!error.to_string().contains("secret"));
        }
    }

    #[tokio::test]
    async fn test_invalid_json_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>nope</html>"))
            .mount(&server)
            .await;

        let adapter = adapter(&server);
        let term = SearchTerm::new("c", "t");
        let cancel = CancellationToken::new();
        let mut stream = adapter.discover(DiscoveryRequest {
            term: &term,
            limit: 10,
            cancel: &cancel,
        });
        assert!(matches!(
            stream.next().await,
            Some(Err(DiscoveryError::InvalidResponse { .. }))
        ));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_cancelled_before_polling_yields_nothing() {
        let server = MockServer::start().await;
        let adapter = adapter(&server);
        let term = SearchTerm::new("c", "t");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let count = adapter
            .discover(DiscoveryRequest {
                term: &term,
                limit: 10,
                cancel: &cancel,
            })
            .count()
            .await;
        assert_eq!(count, 0);
    }

    #[test]
    fn test_credentials_debug_redacts_key() {
        let creds = ApiCredentials {
            api_key: "topsecret".to_string(),
            engine_id: "cx".to_string(),
        };
        assert!(!format!("{creds:?}").contains("topsecret"));
    }
}
