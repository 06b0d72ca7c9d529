//! Seed page adapter: one hop from configured index pages.
//!
//! Seed pages do not depend on the search term, so each page is fetched once
//! per run and its document links are cached. Later terms replay the cache
//! and the orchestrator's run-level seen set hands out links not yet taken.

use std::sync::Arc;

use dashmap::DashMap;
use futures_util::stream::{self, BoxStream, StreamExt};
use reqwest::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::parsers::extract_links;
use super::{DiscoveryContext, DiscoveryError, DiscoveryRequest, SourceAdapter};
use crate::eligibility::is_pdf_content_type;
use crate::http::header_value;
use crate::model::{CandidateUrl, SourceKind};
use crate::normalize::{has_document_extension, is_ambiguous_document_link};
use crate::store::parse_content_disposition;

/// Ambiguous links HEAD-checked per seed page.
pub const MAX_HEAD_CHECKS_PER_SEED: usize = 20;

const SOURCE_NAME: &str = "seed";

/// Yields document links found on seed pages.
#[derive(Debug)]
pub struct SeedAdapter {
    ctx: DiscoveryContext,
    seeds: Vec<Url>,
    cache: DashMap<Url, Arc<Vec<Url>>>,
}

impl SeedAdapter {
    /// Creates an adapter over `seeds`, visited in order.
    #[must_use]
    pub fn new(ctx: DiscoveryContext, seeds: Vec<Url>) -> Self {
        Self {
            ctx,
            seeds,
            cache: DashMap::new(),
        }
    }

    /// Configured seed pages.
    #[must_use]
    pub fn seeds(&self) -> &[Url] {
        &self.seeds
    }

    /// Document links on `seed`, from cache or by fetching the page.
    /// `Ok(None)` means the run was cancelled.
    async fn document_links(
        &self,
        seed: &Url,
        cancel: &CancellationToken,
    ) -> Result<Option<Arc<Vec<Url>>>, DiscoveryError> {
        if let Some(cached) = self.cache.get(seed) {
            return Ok(Some(Arc::clone(cached.value())));
        }
        let Some(links) = self.scan(seed, cancel).await? else {
            return Ok(None);
        };
        let links = Arc::new(links);
        self.cache.insert(seed.clone(), Arc::clone(&links));
        Ok(Some(links))
    }

    #[instrument(skip(self, cancel), fields(seed = %seed))]
    async fn scan(
        &self,
        seed: &Url,
        cancel: &CancellationToken,
    ) -> Result<Option<Vec<Url>>, DiscoveryError> {
        let allowed = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(None),
            allowed = self.ctx.ledger.robots_allows(seed) => allowed,
        };
        if !allowed {
            return Err(DiscoveryError::RobotsDisallowed {
                source_name: SOURCE_NAME.to_string(),
                url: seed.to_string(),
            });
        }

        let Some(page) = self
            .ctx
            .fetch_page(seed.as_str(), cancel)
            .await
            .map_err(|error| DiscoveryError::transport(SOURCE_NAME, error))?
        else {
            return Ok(None);
        };
        let hrefs = extract_links(&page, seed);

        let mut documents = Vec::new();
        let mut head_checks = 0usize;
        for href in hrefs {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            let Some(url) = self
                .ctx
                .resolve_link(&href, Some(seed), SourceKind::Seed, cancel)
                .await
            else {
                continue;
            };
            if documents.contains(&url) {
                continue;
            }
            if has_document_extension(&url) {
                documents.push(url);
            } else if is_ambiguous_document_link(&url) {
                if head_checks >= MAX_HEAD_CHECKS_PER_SEED {
                    debug!(url = %url, "head check budget spent, skipping ambiguous link");
                    continue;
                }
                head_checks += 1;
                if self.head_confirms_document(&url, cancel).await {
                    documents.push(url);
                }
            }
        }
        info!(documents = documents.len(), head_checks, "scanned seed page");
        Ok(Some(documents))
    }

    /// HEAD-checks an ambiguous link for a PDF `Content-Disposition` name or
    /// a PDF `Content-Type`.
    async fn head_confirms_document(&self, url: &Url, cancel: &CancellationToken) -> bool {
        if !self.ctx.admit(url.as_str(), cancel).await {
            return false;
        }
        let response = tokio::select! {
            biased;
            () = cancel.cancelled() => return false,
            response = self.ctx.client.head(url.as_str()) => response,
        };
        match response {
            Ok(response) if response.status().is_success() => {
                let headers = response.headers();
                let named_pdf = header_value(headers, CONTENT_DISPOSITION.as_str())
                    .and_then(|value| parse_content_disposition(&value))
                    .is_some_and(|name| name.to_ascii_lowercase().ends_with(".pdf"));
                let typed_pdf = header_value(headers, CONTENT_TYPE.as_str())
                    .is_some_and(|value| is_pdf_content_type(&value));
                debug!(url = %url, named_pdf, typed_pdf, "head checked ambiguous link");
                named_pdf || typed_pdf
            }
            Ok(response) => {
                debug!(url = %url, status = response.status().as_u16(), "head check refused");
                false
            }
            Err(error) => {
                debug!(url = %url, error = %error, "head check failed");
                false
            }
        }
    }
}

impl SourceAdapter for SeedAdapter {
    fn name(&self) -> &str {
        SOURCE_NAME
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Seed
    }

    /// A failing seed page is reported and the remaining seeds are still
    /// visited; each seed page is an independent source.
    fn discover<'a>(
        &'a self,
        request: DiscoveryRequest<'a>,
    ) -> BoxStream<'a, Result<CandidateUrl, DiscoveryError>> {
        stream::iter(self.seeds.iter())
            .then(move |seed| async move {
                if request.cancel.is_cancelled() {
                    return Vec::new();
                }
                let candidates: Vec<Result<CandidateUrl, DiscoveryError>> =
                    match self.document_links(seed, request.cancel).await {
                        Ok(Some(links)) => links
                            .iter()
                            .map(|url| {
                                Ok(CandidateUrl::new(
                                    url.clone(),
                                    SourceKind::Seed,
                                    seed.as_str(),
                                    request.term.clone(),
                                ))
                            })
                            .collect(),
                        Ok(None) => Vec::new(),
                        Err(error) => {
                            warn!(seed = %seed, error = %error, "seed page failed");
                            vec![Err(error)]
                        }
                    };
                candidates
            })
            .flat_map(stream::iter)
            .boxed()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::http::HttpClient;
    use crate::model::SearchTerm;
    use crate::politeness::PolitenessLedger;

    fn adapter(seeds: Vec<Url>) -> SeedAdapter {
        let ctx = DiscoveryContext::new(HttpClient::new(), Arc::new(PolitenessLedger::for_tests()));
        SeedAdapter::new(ctx, seeds)
    }

    async fn collect_urls(adapter: &SeedAdapter) -> Vec<Result<String, String>> {
        let term = SearchTerm::new("Storage", "array guide");
        let cancel = CancellationToken::new();
        adapter
            .discover(DiscoveryRequest {
                term: &term,
                limit: 10,
                cancel: &cancel,
            })
            .map(|r| r.map(|c| c.url.to_string()).map_err(|e| e.to_string()))
            .collect()
            .await
    }

    #[tokio::test]
    async fn test_seed_page_yields_pdf_links_and_confirmed_ambiguous_links() {
        let server = MockServer::start().await;
        let page = r#"<html><body>
            <a href="/files/manual.PDF">Manual</a>
            <a href="/files/manual.PDF#page=2">Same manual</a>
            <a href="/download/77">Datasheet</a>
            <a href="/download/78">Spreadsheet</a>
            <a href="/about.html">About</a>
            <a href="ftp://old.example.com/x.pdf">FTP</a>
        </body></html>"#;
        Mock::given(method("GET"))
            .and(path("/library"))
            .respond_with(ResponseTemplate::new(200).set_body_string(page))
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/download/77"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Content-Disposition", "attachment; filename=\"sheet.pdf\""),
            )
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/download/78"))
            .respond_with(ResponseTemplate::new(200).insert_header("Content-Type", "text/csv"))
            .mount(&server)
            .await;

        let seed = Url::parse(&format!("{}/library", server.uri())).unwrap();
        let adapter = adapter(vec![seed]);
        let urls = collect_urls(&adapter).await;
        assert_eq!(
            urls,
            vec![
                Ok(format!("{}/files/manual.PDF", server.uri())),
                Ok(format!("{}/download/77", server.uri())),
            ]
        );
    }

    #[tokio::test]
    async fn test_seed_page_fetched_once_per_run() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/library"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"<a href="a.pdf">A</a>"#))
            .expect(1)
            .mount(&server)
            .await;

        let seed = Url::parse(&format!("{}/library", server.uri())).unwrap();
        let adapter = adapter(vec![seed]);
        assert_eq!(collect_urls(&adapter).await.len(), 1);
        assert_eq!(collect_urls(&adapter).await.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_seed_reported_and_next_seed_visited() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/broken"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/ok"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"<a href="/b.pdf">B</a>"#))
            .mount(&server)
            .await;

        let adapter = adapter(vec![
            Url::parse(&format!("{}/broken", server.uri())).unwrap(),
            Url::parse(&format!("{}/ok", server.uri())).unwrap(),
        ]);
        let urls = collect_urls(&adapter).await;
        assert_eq!(urls.len(), 2);
        assert!(urls[0].is_err());
        assert_eq!(urls[1], Ok(format!("{}/b.pdf", server.uri())));
    }

    #[tokio::test]
    async fn test_head_checks_bounded_per_page() {
        let server = MockServer::start().await;
        let page: String = (0..30)
            .map(|i| format!(r#"<a href="/download/{i}">D{i}</a>"#))
            .collect();
        Mock::given(method("GET"))
            .and(path("/library"))
            .respond_with(ResponseTemplate::new(200).set_body_string(page))
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(200).insert_header("Content-Type", "application/pdf"))
            .expect(MAX_HEAD_CHECKS_PER_SEED as u64)
            .mount(&server)
            .await;

        let seed = Url::parse(&format!("{}/library", server.uri())).unwrap();
        let adapter = adapter(vec![seed]);
        assert_eq!(collect_urls(&adapter).await.len(), MAX_HEAD_CHECKS_PER_SEED);
    }
}
