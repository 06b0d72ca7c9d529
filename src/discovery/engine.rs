//! Search engine result-page adapter.

use futures_util::stream::{self, BoxStream, StreamExt};
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::parsers::{ResultPageParser, parser_for};
use super::{DiscoveryContext, DiscoveryError, DiscoveryRequest, SourceAdapter};
use crate::model::{CandidateUrl, EngineKind, SourceKind};

fn default_search_url(engine: EngineKind) -> &'static str {
    match engine {
        EngineKind::DuckDuckGo => "https://html.duckduckgo.com/html/",
        EngineKind::Bing => "https://www.bing.com/search",
        EngineKind::Google => "https://www.google.com/search",
        EngineKind::Yahoo => "https://search.yahoo.com/search",
    }
}

fn query_param(engine: EngineKind) -> &'static str {
    match engine {
        EngineKind::Yahoo => "p",
        EngineKind::DuckDuckGo | EngineKind::Bing | EngineKind::Google => "q",
    }
}

/// Scrapes the first result page of one engine.
pub struct EngineAdapter {
    ctx: DiscoveryContext,
    engine: EngineKind,
    name: String,
    search_url: Url,
    parser: Box<dyn ResultPageParser>,
}

impl std::fmt::Debug for EngineAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineAdapter")
            .field("engine", &self.engine)
            .field("search_url", &self.search_url.as_str())
            .finish_non_exhaustive()
    }
}

impl EngineAdapter {
    /// Creates an adapter for `engine` against its public endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error only if the built-in endpoint fails to parse.
    pub fn new(ctx: DiscoveryContext, engine: EngineKind) -> Result<Self, url::ParseError> {
        let search_url = Url::parse(default_search_url(engine))?;
        Ok(Self::with_search_url(ctx, engine, search_url))
    }

    /// Creates an adapter for `engine` against a custom endpoint.
    #[must_use]
    pub fn with_search_url(ctx: DiscoveryContext, engine: EngineKind, search_url: Url) -> Self {
        Self {
            ctx,
            engine,
            name: SourceKind::Engine(engine).to_string(),
            search_url,
            parser: parser_for(engine),
        }
    }

    fn page_url(&self, query: &str) -> Url {
        let mut url = self.search_url.clone();
        url.query_pairs_mut()
            .append_pair(query_param(self.engine), query);
        url
    }

    #[instrument(skip(self, request), fields(engine = %self.engine, term = %request.term.term))]
    async fn collect_page(&self, request: DiscoveryRequest<'_>) -> Vec<Result<CandidateUrl, DiscoveryError>> {
        let query = request.term.document_query();
        let page_url = self.page_url(&query);

        let allowed = tokio::select! {
            biased;
            () = request.cancel.cancelled() => return Vec::new(),
            allowed = self.ctx.ledger.robots_allows(&page_url) => allowed,
        };
        if !allowed {
            warn!(url = %page_url, "robots.txt disallows result page");
            return vec![Err(DiscoveryError::RobotsDisallowed {
                source_name: self.name.clone(),
                url: page_url.to_string(),
            })];
        }

        let page = match self.ctx.fetch_page(page_url.as_str(), request.cancel).await {
            Ok(Some(page)) => page,
            Ok(None) => return Vec::new(),
            Err(error) => return vec![Err(DiscoveryError::transport(self.name.clone(), error))],
        };

        let links = self.parser.parse(&page, &page_url);
        info!(links = links.len(), "parsed result page");

        let kind = self.kind();
        let mut candidates = Vec::with_capacity(links.len());
        for link in links {
            if request.cancel.is_cancelled() {
                break;
            }
            if let Some(url) = self
                .ctx
                .resolve_link(&link, Some(&page_url), kind, request.cancel)
                .await
            {
                candidates.push(Ok(CandidateUrl::new(
                    url,
                    kind,
                    query.clone(),
                    request.term.clone(),
                )));
            }
        }
        debug!(candidates = candidates.len(), "engine candidates");
        candidates
    }
}

impl SourceAdapter for EngineAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Engine(self.engine)
    }

    fn discover<'a>(
        &'a self,
        request: DiscoveryRequest<'a>,
    ) -> BoxStream<'a, Result<CandidateUrl, DiscoveryError>> {
        stream::once(self.collect_page(request))
            .flat_map(stream::iter)
            .boxed()
    }
}
