//! URL normalization and redirect-wrapper unwrapping.
//!
//! Every discovered link passes through [`normalize`] (or
//! [`normalize_with_base`] for relative hrefs) before it becomes a
//! [`CandidateUrl`](crate::CandidateUrl). The result is canonical and
//! idempotent: normalizing an already-normalized URL returns it unchanged.
//!
//! Steps, in order:
//! 1. trim and enforce [`MAX_URL_LENGTH`]
//! 2. resolve against the base (or the engine's origin for engine links)
//! 3. require `http`/`https` and a host
//! 4. unwrap engine redirect wrappers, at most [`MAX_UNWRAP_DEPTH`] layers
//! 5. reject links back into an engine's own pages
//! 6. drop the fragment and tracking parameters

use std::sync::LazyLock;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use thiserror::Error;
use tracing::{debug, instrument};
use url::Url;

use crate::http::{HttpClient, HttpError};
use crate::model::{EngineKind, SourceKind};
use crate::politeness::PolitenessLedger;

/// Maximum URL length accepted.
pub const MAX_URL_LENGTH: usize = 2000;

/// Maximum nested redirect wrappers unwrapped before giving up.
pub const MAX_UNWRAP_DEPTH: usize = 3;

/// Query parameters dropped outright.
const TRACKING_PARAMS: &[&str] = &[
    "gclid", "fbclid", "msclkid", "mc_cid", "mc_eid", "_ga", "yclid", "igshid", "ref_src",
];

/// Link shorteners whose target is only visible by following them.
const SHORTENER_HOSTS: &[&str] = &[
    "t.co",
    "bit.ly",
    "lnkd.in",
    "tinyurl.com",
    "ow.ly",
    "goo.gl",
    "buff.ly",
];

static DUCKDUCKGO_BASE: LazyLock<Option<Url>> =
    LazyLock::new(|| Url::parse("https://html.duckduckgo.com/").ok());
static BING_BASE: LazyLock<Option<Url>> = LazyLock::new(|| Url::parse("https://www.bing.com/").ok());
static GOOGLE_BASE: LazyLock<Option<Url>> =
    LazyLock::new(|| Url::parse("https://www.google.com/").ok());
static YAHOO_BASE: LazyLock<Option<Url>> =
    LazyLock::new(|| Url::parse("https://search.yahoo.com/").ok());

/// Why a raw link was dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeRejection {
    /// Nothing left after trimming.
    #[error("empty URL")]
    Empty,
    /// Longer than [`MAX_URL_LENGTH`].
    #[error("URL is {length} characters, limit is {MAX_URL_LENGTH}")]
    TooLong {
        /// Observed length.
        length: usize,
    },
    /// Unparseable.
    #[error("malformed URL: {reason}")]
    Malformed {
        /// Parser message.
        reason: String,
    },
    /// Not http or https.
    #[error("unsupported scheme: {scheme}")]
    UnsupportedScheme {
        /// The rejected scheme.
        scheme: String,
    },
    /// No host component.
    #[error("URL has no host")]
    MissingHost,
    /// Wrapped more deeply than [`MAX_UNWRAP_DEPTH`].
    #[error("more than {MAX_UNWRAP_DEPTH} nested redirect wrappers")]
    TooManyWrappers,
    /// Points at a search engine's own pages.
    #[error("link points back into search engine host {host}")]
    EngineSelfLink {
        /// Engine host.
        host: String,
    },
}

/// Errors from [`follow_redirect`].
#[derive(Debug, Error)]
pub enum FollowError {
    /// The HEAD request failed.
    #[error(transparent)]
    Http(#[from] HttpError),
    /// The final URL did not survive normalization.
    #[error("redirect target rejected: {0}")]
    Rejected(#[from] NormalizeRejection),
}

/// Normalizes an absolute link.
///
/// Engine-sourced links may be protocol- or path-relative to the engine's own
/// origin; those are resolved against it.
///
/// # Errors
///
/// Returns a [`NormalizeRejection`] describing why the link was dropped.
///
/// ```
/// use harvester_core::{normalize, SourceKind};
///
/// let url = normalize(
///     "https://Docs.Agency.gov/guide.pdf?utm_source=x&id=7#page=2",
///     SourceKind::Seed,
/// )
/// .unwrap();
/// assert_eq!(url.as_str(), "https://docs.agency.gov/guide.pdf?id=7");
/// ```
pub fn normalize(raw: &str, kind: SourceKind) -> Result<Url, NormalizeRejection> {
    let base = match kind {
        SourceKind::Engine(engine) => engine_base(engine),
        SourceKind::Api | SourceKind::Seed => None,
    };
    normalize_inner(raw, base, kind)
}

/// Normalizes a link found on the page at `base`.
///
/// # Errors
///
/// Returns a [`NormalizeRejection`] describing why the link was dropped.
pub fn normalize_with_base(
    raw: &str,
    base: &Url,
    kind: SourceKind,
) -> Result<Url, NormalizeRejection> {
    normalize_inner(raw, Some(base), kind)
}

fn normalize_inner(
    raw: &str,
    base: Option<&Url>,
    kind: SourceKind,
) -> Result<Url, NormalizeRejection> {
    let mut url = parse_checked(raw, base)?;

    let mut depth = 0;
    loop {
        match wrapper_target(&url) {
            WrapperTarget::Target(target) => {
                if depth == MAX_UNWRAP_DEPTH {
                    return Err(NormalizeRejection::TooManyWrappers);
                }
                depth += 1;
                debug!(%url, %target, depth, source = %kind, "unwrapped redirect wrapper");
                url = parse_checked(&target, Some(&url))?;
            }
            WrapperTarget::Opaque | WrapperTarget::NotWrapper => break,
        }
    }

    if let Some(host) = engine_self_link(&url) {
        return Err(NormalizeRejection::EngineSelfLink { host });
    }

    url.set_fragment(None);
    strip_tracking_params(&mut url);
    Ok(url)
}

fn parse_checked(raw: &str, base: Option<&Url>) -> Result<Url, NormalizeRejection> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(NormalizeRejection::Empty);
    }
    let length = trimmed.chars().count();
    if length > MAX_URL_LENGTH {
        return Err(NormalizeRejection::TooLong { length });
    }

    let parsed = match base {
        Some(base) => base.join(trimmed),
        None => Url::parse(trimmed),
    }
    .map_err(|e| NormalizeRejection::Malformed {
        reason: e.to_string(),
    })?;

    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(NormalizeRejection::UnsupportedScheme {
            scheme: parsed.scheme().to_string(),
        });
    }
    if parsed.host_str().is_none_or(str::is_empty) {
        return Err(NormalizeRejection::MissingHost);
    }
    if parsed.as_str().len() > MAX_URL_LENGTH {
        return Err(NormalizeRejection::TooLong {
            length: parsed.as_str().len(),
        });
    }
    Ok(parsed)
}

fn engine_base(engine: EngineKind) -> Option<&'static Url> {
    match engine {
        EngineKind::DuckDuckGo => DUCKDUCKGO_BASE.as_ref(),
        EngineKind::Bing => BING_BASE.as_ref(),
        EngineKind::Google => GOOGLE_BASE.as_ref(),
        EngineKind::Yahoo => YAHOO_BASE.as_ref(),
    }
}

#[derive(Debug, PartialEq, Eq)]
enum WrapperTarget {
    NotWrapper,
    Target(String),
    /// A wrapper whose target cannot be decoded locally.
    Opaque,
}

fn engine_for_host(host: &str) -> Option<EngineKind> {
    let host = host.to_ascii_lowercase();
    let host = host.trim_end_matches('.');
    if matches!(
        host,
        "duckduckgo.com" | "html.duckduckgo.com" | "lite.duckduckgo.com" | "links.duckduckgo.com"
    ) {
        return Some(EngineKind::DuckDuckGo);
    }
    if matches!(host, "bing.com" | "www.bing.com" | "cc.bingj.com") {
        return Some(EngineKind::Bing);
    }
    let bare = host.strip_prefix("www.").unwrap_or(host);
    if let Some(tld) = bare.strip_prefix("google.")
        && !tld.is_empty()
        && tld.split('.').all(|label| label.len() <= 3)
    {
        return Some(EngineKind::Google);
    }
    if host == "search.yahoo.com" || host.ends_with(".search.yahoo.com") {
        return Some(EngineKind::Yahoo);
    }
    None
}

fn wrapper_target(url: &Url) -> WrapperTarget {
    let Some(engine) = url.host_str().and_then(engine_for_host) else {
        return WrapperTarget::NotWrapper;
    };
    let path = url.path();
    match engine {
        EngineKind::DuckDuckGo if path == "/l/" || path == "/l" => {
            query_value(url, &["uddg"]).map_or(WrapperTarget::Opaque, WrapperTarget::Target)
        }
        EngineKind::Google if path == "/url" => {
            query_value(url, &["q", "url"]).map_or(WrapperTarget::Opaque, WrapperTarget::Target)
        }
        EngineKind::Bing if path == "/ck/a" => query_value(url, &["u"])
            .and_then(|u| decode_bing_target(&u))
            .map_or(WrapperTarget::Opaque, WrapperTarget::Target),
        EngineKind::Yahoo if path.contains("/RU=") => {
            yahoo_target(path).map_or(WrapperTarget::Opaque, WrapperTarget::Target)
        }
        _ => WrapperTarget::NotWrapper,
    }
}

fn query_value(url: &Url, names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| {
        url.query_pairs()
            .find(|(key, value)| key == name && !value.is_empty())
            .map(|(_, value)| value.into_owned())
    })
}

/// Bing click-through targets are `a1` + unpadded base64url.
fn decode_bing_target(encoded: &str) -> Option<String> {
    let payload = encoded.strip_prefix("a1")?.trim_end_matches('=');
    let bytes = URL_SAFE_NO_PAD.decode(payload).ok()?;
    let target = String::from_utf8(bytes).ok()?;
    target.starts_with("http").then_some(target)
}

/// Yahoo targets live in a `/RU=<percent-encoded>/` path segment.
fn yahoo_target(path: &str) -> Option<String> {
    let segment = path.split('/').find_map(|seg| seg.strip_prefix("RU="))?;
    let decoded = urlencoding::decode(segment).ok()?;
    (!decoded.is_empty()).then(|| decoded.into_owned())
}

fn engine_self_link(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    engine_for_host(host)?;
    // Undecodable wrappers are left for `follow_redirect`.
    if wrapper_target(url) == WrapperTarget::Opaque {
        return None;
    }
    Some(host.to_ascii_lowercase())
}

fn is_tracking_param(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.starts_with("utm_") || TRACKING_PARAMS.contains(&lower.as_str())
}

fn strip_tracking_params(url: &mut Url) {
    if url.query().is_none() {
        return;
    }
    let total = url.query_pairs().count();
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| !is_tracking_param(key))
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    if kept.len() == total {
        return;
    }
    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }
}

/// Whether `url` is an opaque redirector that must be followed to learn
/// its target (undecodable engine wrapper or known link shortener).
#[must_use]
pub fn needs_redirect_follow(url: &Url) -> bool {
    if wrapper_target(url) == WrapperTarget::Opaque {
        return true;
    }
    url.host_str()
        .is_some_and(|host| SHORTENER_HOSTS.contains(&host.to_ascii_lowercase().as_str()))
}

/// Resolves an opaque redirector with a ledger-gated HEAD request and
/// normalizes the final URL.
///
/// # Errors
///
/// Returns [`FollowError::Http`] on transport failure or
/// [`FollowError::Rejected`] if the target fails normalization.
#[instrument(skip(client, ledger), fields(url = %url))]
pub async fn follow_redirect(
    client: &HttpClient,
    ledger: &PolitenessLedger,
    url: &Url,
    kind: SourceKind,
) -> Result<Url, FollowError> {
    ledger.acquire(url.as_str()).await;
    let response = client.head(url.as_str()).await?;
    let final_url = response.url().clone();
    debug!(target = %final_url, status = response.status().as_u16(), "followed redirect");
    let normalized = normalize(final_url.as_str(), kind)?;
    if needs_redirect_follow(&normalized) {
        return Err(FollowError::Rejected(NormalizeRejection::TooManyWrappers));
    }
    Ok(normalized)
}

/// Whether the path names a PDF (`.pdf` suffix, case-insensitive).
#[must_use]
pub fn has_document_extension(url: &Url) -> bool {
    url.path().to_ascii_lowercase().ends_with(".pdf")
}

/// Whether the link might serve a document without saying so in its name.
#[must_use]
pub fn is_ambiguous_document_link(url: &Url) -> bool {
    if has_document_extension(url) {
        return false;
    }
    let path = url.path().to_ascii_lowercase();
    if ["download", "attachment", "getfile", "document"]
        .iter()
        .any(|hint| path.contains(hint))
    {
        return true;
    }
    url.query_pairs().any(|(key, value)| {
        matches!(key.to_ascii_lowercase().as_str(), "format" | "type" | "ext")
            && value.eq_ignore_ascii_case("pdf")
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const SEED: SourceKind = SourceKind::Seed;

    #[test]
    fn test_strips_fragment_and_tracking_params() {
        let url = normalize(
            "https://example.gov/a.pdf?utm_source=news&UTM_Medium=mail&gclid=1&id=42#p3",
            SEED,
        )
        .unwrap();
        assert_eq!(url.as_str(), "https://example.gov/a.pdf?id=42");
    }

    #[test]
    fn test_drops_query_when_only_tracking() {
        let url = normalize("https://example.gov/a.pdf?fbclid=abc", SEED).unwrap();
        assert_eq!(url.as_str(), "https://example.gov/a.pdf");
    }

    #[test]
    fn test_untouched_query_keeps_original_encoding() {
        let url = normalize("https://example.gov/a.pdf?q=a%20b&x=1", SEED).unwrap();
        assert_eq!(url.as_str(), "https://example.gov/a.pdf?q=a%20b&x=1");
    }

    #[test]
    fn test_rejects_bad_inputs() {
        assert_eq!(normalize("   ", SEED), Err(NormalizeRejection::Empty));
        assert!(matches!(
            normalize("ftp://example.gov/a.pdf", SEED),
            Err(NormalizeRejection::UnsupportedScheme { .. })
        ));
        assert!(matches!(
            normalize("mailto:someone@example.gov", SEED),
            Err(NormalizeRejection::UnsupportedScheme { .. })
        ));
        assert!(matches!(
            normalize("not a url", SEED),
            Err(NormalizeRejection::Malformed { .. })
        ));
        let long = format!("https://example.gov/{}", "a".repeat(MAX_URL_LENGTH));
        assert!(matches!(
            normalize(&long, SEED),
            Err(NormalizeRejection::TooLong { .. })
        ));
    }

    #[test]
    fn test_relative_link_resolved_against_base() {
        let base = Url::parse("https://docs.agency.gov/manuals/index.html").unwrap();
        let url = normalize_with_base("../files/guide.pdf", &base, SEED).unwrap();
        assert_eq!(url.as_str(), "https://docs.agency.gov/files/guide.pdf");
    }

    #[test]
    fn test_unwraps_duckduckgo() {
        let kind = SourceKind::Engine(EngineKind::DuckDuckGo);
        let url = normalize(
            "//duckduckgo.com/l/?uddg=https%3A%2F%2Fwww.energy.gov%2Fguide.pdf&rut=abc",
            kind,
        )
        .unwrap();
        assert_eq!(url.as_str(), "https://www.energy.gov/guide.pdf");
    }

    #[test]
    fn test_unwraps_google_relative_url() {
        let kind = SourceKind::Engine(EngineKind::Google);
        let url = normalize(
            "/url?q=https://www.nist.gov/document.pdf&sa=U&ved=2ah",
            kind,
        )
        .unwrap();
        assert_eq!(url.as_str(), "https://www.nist.gov/document.pdf");
    }

    #[test]
    fn test_unwraps_bing_base64_target() {
        let encoded = URL_SAFE_NO_PAD.encode("https://example.edu/paper.pdf");
        let raw = format!("https://www.bing.com/ck/a?!&&p=abc&u=a1{encoded}&ntb=1");
        let url = normalize(&raw, SourceKind::Engine(EngineKind::Bing)).unwrap();
        assert_eq!(url.as_str(), "https://example.edu/paper.pdf");
    }

    #[test]
    fn test_unwraps_yahoo_path_segment() {
        let raw = "https://r.search.yahoo.com/_ylt=Awr/RV=2/RE=17/RO=10/RU=https%3a%2f%2fwww.osha.gov%2fguide.pdf/RK=2/RS=x-";
        let url = normalize(raw, SourceKind::Engine(EngineKind::Yahoo)).unwrap();
        assert_eq!(url.as_str(), "https://www.osha.gov/guide.pdf");
    }

    #[test]
    fn test_unwraps_nested_wrappers_up_to_limit() {
        let inner = "https://example.gov/a.pdf";
        let one = format!(
            "https://www.google.com/url?q={}",
            urlencoding::encode(inner)
        );
        let two = format!(
            "https://duckduckgo.com/l/?uddg={}",
            urlencoding::encode(&one)
        );
        let url = normalize(&two, SEED).unwrap();
        assert_eq!(url.as_str(), inner);

        let three = format!("https://www.google.com/url?q={}", urlencoding::encode(&two));
        let four = format!("https://www.google.com/url?q={}", urlencoding::encode(&three));
        assert_eq!(
            normalize(&four, SEED),
            Err(NormalizeRejection::TooManyWrappers)
        );
    }

    #[test]
    fn test_rejects_engine_self_links() {
        assert!(matches!(
            normalize("https://www.bing.com/search?q=more", SEED),
            Err(NormalizeRejection::EngineSelfLink { .. })
        ));
        assert!(matches!(
            normalize(
                "/html/?q=next+page",
                SourceKind::Engine(EngineKind::DuckDuckGo)
            ),
            Err(NormalizeRejection::EngineSelfLink { .. })
        ));
        assert!(matches!(
            normalize("https://www.google.co.uk/search?q=x", SEED),
            Err(NormalizeRejection::EngineSelfLink { .. })
        ));
    }

    #[test]
    fn test_non_engine_google_hosts_kept() {
        let url = normalize("https://docs.google.com/viewer?url=x.pdf", SEED).unwrap();
        assert_eq!(url.host_str(), Some("docs.google.com"));
    }

    #[test]
    fn test_opaque_wrapper_flagged_for_follow() {
        let url = normalize("https://www.bing.com/ck/a?p=opaque", SEED).unwrap();
        assert!(needs_redirect_follow(&url));
        let short = normalize("https://bit.ly/3abc", SEED).unwrap();
        assert!(needs_redirect_follow(&short));
        let plain = normalize("https://example.gov/a.pdf", SEED).unwrap();
        assert!(!needs_redirect_follow(&plain));
    }

    #[test]
    fn test_normalization_is_idempotent() {
        let inputs = [
            "https://Example.GOV:443/a/./b/../c.pdf?utm_campaign=x&b=2&a=1#frag",
            "http://example.edu/download?format=pdf&id=3&gclid=9",
            "//duckduckgo.com/l/?uddg=https%3A%2F%2Fexample.org%2Fx%20y.pdf",
            "https://www.google.com/url?q=https://example.org/r%C3%A9sum%C3%A9.pdf",
            "https://example.org/path with spaces/file.PDF",
            "https://www.bing.com/ck/a?p=opaque",
            "https://example.org/?",
        ];
        let kinds = [
            SourceKind::Seed,
            SourceKind::Api,
            SourceKind::Engine(EngineKind::DuckDuckGo),
        ];
        for raw in inputs {
            for kind in kinds {
                let Ok(once) = normalize(raw, kind) else {
                    continue;
                };
                let twice = normalize(once.as_str(), kind).unwrap();
                assert_eq!(once, twice, "not idempotent for {raw} ({kind})");
            }
        }
    }

    #[test]
    fn test_document_link_heuristics() {
        let pdf = Url::parse("https://example.gov/files/Guide.PDF").unwrap();
        assert!(has_document_extension(&pdf));
        assert!(!is_ambiguous_document_link(&pdf));

        let download = Url::parse("https://example.gov/download/123").unwrap();
        assert!(is_ambiguous_document_link(&download));

        let format = Url::parse("https://example.gov/view?id=3&format=PDF").unwrap();
        assert!(is_ambiguous_document_link(&format));

        let page = Url::parse("https://example.gov/about").unwrap();
        assert!(!is_ambiguous_document_link(&page));
    }
}
