//! Core data types that flow through the pipeline.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use url::Url;

/// A `(category, term)` pair from the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct SearchTerm {
    /// Catalog category the term belongs to.
    pub category: String,
    /// Free-text search phrase.
    pub term: String,
}

impl SearchTerm {
    /// Creates a search term.
    pub fn new(category: impl Into<String>, term: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            term: term.into(),
        }
    }

    /// Query sent to search backends for this term.
    #[must_use]
    pub fn document_query(&self) -> String {
        format!("{} filetype:pdf", self.term)
    }
}

/// Search engines with a result-page parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineKind {
    /// DuckDuckGo HTML endpoint.
    DuckDuckGo,
    /// Bing web search.
    Bing,
    /// Google web search.
    Google,
    /// Yahoo web search.
    Yahoo,
}

impl EngineKind {
    /// All supported engines.
    pub const ALL: [EngineKind; 4] = [Self::DuckDuckGo, Self::Bing, Self::Google, Self::Yahoo];

    /// Lowercase configuration name.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::DuckDuckGo => "duckduckgo",
            Self::Bing => "bing",
            Self::Google => "google",
            Self::Yahoo => "yahoo",
        }
    }

    /// Parses a configuration name (case-insensitive).
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim();
        Self::ALL
            .into_iter()
            .find(|engine| engine.name().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which adapter produced a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    /// Programmable search JSON API.
    Api,
    /// Scraped engine result page.
    Engine(EngineKind),
    /// Configured seed page.
    Seed,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Api => f.write_str("api"),
            Self::Engine(engine) => write!(f, "engine:{engine}"),
            Self::Seed => f.write_str("seed"),
        }
    }
}

/// A normalized document URL plus where it came from.
#[derive(Debug, Clone)]
pub struct CandidateUrl {
    /// Normalized absolute URL.
    pub url: Url,
    /// Adapter that discovered it.
    pub source: SourceKind,
    /// Query string or seed page URL that produced it.
    pub origin_query: String,
    /// Term the candidate was discovered for.
    pub term: SearchTerm,
    /// When it was discovered.
    pub discovered_at: DateTime<Utc>,
}

impl CandidateUrl {
    /// Creates a candidate stamped with the current time.
    pub fn new(
        url: Url,
        source: SourceKind,
        origin_query: impl Into<String>,
        term: SearchTerm,
    ) -> Self {
        Self {
            url,
            source,
            origin_query: origin_query.into(),
            term,
            discovered_at: Utc::now(),
        }
    }

    /// Lowercased host of the candidate URL.
    #[must_use]
    pub fn host(&self) -> String {
        self.url.host_str().unwrap_or_default().to_ascii_lowercase()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_names_round_trip() {
        for engine in EngineKind::ALL {
            assert_eq!(EngineKind::from_name(engine.name()), Some(engine));
        }
        assert_eq!(EngineKind::from_name(" Bing "), Some(EngineKind::Bing));
        assert_eq!(EngineKind::from_name("altavista"), None);
    }

    #[test]
    fn test_source_kind_display() {
        assert_eq!(SourceKind::Api.to_string(), "api");
        assert_eq!(
            SourceKind::Engine(EngineKind::DuckDuckGo).to_string(),
            "engine:duckduckgo"
        );
        assert_eq!(SourceKind::Seed.to_string(), "seed");
    }

    #[test]
    fn test_document_query_appends_filetype() {
        let term = SearchTerm::new("Networking", "Cisco Nexus 9000 configuration guide");
        assert_eq!(
            term.document_query(),
            "Cisco Nexus 9000 configuration guide filetype:pdf"
        );
    }
}
