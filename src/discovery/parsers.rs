//! Search engine result-page parsers.
//!
//! Each parser pulls organic result links out of one engine's HTML. Engines
//! change markup often, so every parser tries a primary selector and then
//! fallbacks; a page with no recognizable anchors parses to an empty list.

use std::sync::LazyLock;

use scraper::{Html, Selector};
use url::Url;

use crate::model::EngineKind;

fn compile_static_selector(selector: &str) -> Selector {
    Selector::parse(selector).unwrap_or_else(|e| panic!("invalid static selector '{selector}': {e:?}"))
}

static ANY_LINK: LazyLock<Selector> = LazyLock::new(|| compile_static_selector("a[href]"));

static DDG_RESULTS: LazyLock<Vec<Selector>> = LazyLock::new(|| {
    vec![
        compile_static_selector("a.result__a"),
        compile_static_selector("a.result-link"),
    ]
});

static BING_RESULTS: LazyLock<Vec<Selector>> = LazyLock::new(|| {
    vec![
        compile_static_selector("li.b_algo h2 a"),
        compile_static_selector("#b_results h2 a"),
    ]
});

static GOOGLE_RESULTS: LazyLock<Vec<Selector>> = LazyLock::new(|| {
    vec![
        compile_static_selector("a[href^='/url?']"),
        compile_static_selector("div.g a[href^='http']"),
    ]
});

static YAHOO_RESULTS: LazyLock<Vec<Selector>> = LazyLock::new(|| {
    vec![
        compile_static_selector("div.algo h3 a"),
        compile_static_selector("h3.title a"),
    ]
});

/// Extracts result links from one engine's result page.
pub trait ResultPageParser: Send + Sync {
    /// Engine this parser understands.
    fn engine(&self) -> EngineKind;

    /// Returns result hrefs in page order, resolved against `base` when
    /// relative. Wrapped redirect links are returned as-is.
    fn parse(&self, page: &str, base: &Url) -> Vec<String>;
}

/// `html.duckduckgo.com` results (`uddg` wrappers).
#[derive(Debug, Default, Clone, Copy)]
pub struct DuckDuckGoParser;

/// Bing results (`/ck/a` wrappers).
#[derive(Debug, Default, Clone, Copy)]
pub struct BingParser;

/// Google results (`/url?q=` wrappers).
#[derive(Debug, Default, Clone, Copy)]
pub struct GoogleParser;

/// Yahoo results (`/RU=` path wrappers).
#[derive(Debug, Default, Clone, Copy)]
pub struct YahooParser;

impl ResultPageParser for DuckDuckGoParser {
    fn engine(&self) -> EngineKind {
        EngineKind::DuckDuckGo
    }

    fn parse(&self, page: &str, base: &Url) -> Vec<String> {
        select_first_matching(page, base, &DDG_RESULTS)
    }
}

impl ResultPageParser for BingParser {
    fn engine(&self) -> EngineKind {
        EngineKind::Bing
    }

    fn parse(&self, page: &str, base: &Url) -> Vec<String> {
        select_first_matching(page, base, &BING_RESULTS)
    }
}

impl ResultPageParser for GoogleParser {
    fn engine(&self) -> EngineKind {
        EngineKind::Google
    }

    fn parse(&self, page: &str, base: &Url) -> Vec<String> {
        select_first_matching(page, base, &GOOGLE_RESULTS)
    }
}

impl ResultPageParser for YahooParser {
    fn engine(&self) -> EngineKind {
        EngineKind::Yahoo
    }

    fn parse(&self, page: &str, base: &Url) -> Vec<String> {
        select_first_matching(page, base, &YAHOO_RESULTS)
    }
}

/// Parser for `engine`.
#[must_use]
pub fn parser_for(engine: EngineKind) -> Box<dyn ResultPageParser> {
    match engine {
        EngineKind::DuckDuckGo => Box::new(DuckDuckGoParser),
        EngineKind::Bing => Box::new(BingParser),
        EngineKind::Google => Box::new(GoogleParser),
        EngineKind::Yahoo => Box::new(YahooParser),
    }
}

/// Uses the first selector that matches anything.
fn select_first_matching(page: &str, base: &Url, selectors: &[Selector]) -> Vec<String> {
    let document = Html::parse_document(page);
    for selector in selectors {
        let links: Vec<String> = document
            .select(selector)
            .filter_map(|anchor| anchor.value().attr("href"))
            .filter_map(|href| absolutize(href, base))
            .collect();
        if !links.is_empty() {
            return dedup_in_order(links);
        }
    }
    Vec::new()
}

/// All `a[href]` targets of a page, absolutized against `base`, in order.
#[must_use]
pub fn extract_links(page: &str, base: &Url) -> Vec<String> {
    let document = Html::parse_document(page);
    let links = document
        .select(&ANY_LINK)
        .filter_map(|anchor| anchor.value().attr("href"))
        .filter_map(|href| absolutize(href, base))
        .collect();
    dedup_in_order(links)
}

fn absolutize(href: &str, base: &Url) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') {
        return None;
    }
    base.join(href).ok().map(String::from)
}

fn dedup_in_order(links: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    links
        .into_iter()
        .filter(|link| seen.insert(link.clone()))
        .collect()
}
