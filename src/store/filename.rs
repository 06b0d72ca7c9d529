//! Stored filename derivation: `<12 hex of sha256>__<sanitized name>.pdf`.

use std::path::{Component, Path};

use url::Url;

/// Hex characters of the fingerprint used as the filename prefix.
pub const HASH_PREFIX_LEN: usize = 12;

/// Longest sanitized stem kept in a stored name.
const MAX_STEM_CHARS: usize = 120;

/// Builds the stored filename for a document.
///
/// The name comes from the URL's last path segment when it is a `.pdf` name,
/// then from the `Content-Disposition` suggestion, then from the search term.
#[must_use]
pub fn stored_filename(
    sha256: &str,
    url: &Url,
    suggested: Option<&str>,
    search_term: &str,
) -> String {
    let prefix: String = sha256.chars().take(HASH_PREFIX_LEN).collect();
    let stem = pdf_name_from_url(url)
        .or_else(|| suggested.and_then(pdf_stem))
        .map(|stem| sanitize_filename(&stem))
        .filter(|stem| !stem.trim_matches('_').is_empty())
        .unwrap_or_else(|| term_stem(search_term));
    let stem: String = stem.chars().take(MAX_STEM_CHARS).collect();
    format!("{prefix}__{stem}.pdf")
}

/// Stem of the URL's last path segment when it ends in `.pdf`.
fn pdf_name_from_url(url: &Url) -> Option<String> {
    let last = url.path_segments()?.next_back()?;
    let decoded = urlencoding::decode(last).ok()?;
    pdf_stem(&decoded)
}

fn pdf_stem(name: &str) -> Option<String> {
    let name = name.trim();
    let lower = name.to_ascii_lowercase();
    let stem = lower.strip_suffix(".pdf").map(|_| &name[..name.len() - 4])?;
    (!stem.trim().is_empty()).then(|| stem.to_string())
}

/// Search-term fallback: whitespace to underscores.
fn term_stem(term: &str) -> String {
    let joined = term.split_whitespace().collect::<Vec<_>>().join("_");
    let cleaned = sanitize_filename(&joined);
    if cleaned.trim_matches('_').is_empty() {
        "document".to_string()
    } else {
        cleaned
    }
}

/// Parses a `Content-Disposition` header for its filename.
///
/// Handles `filename="a.pdf"`, `filename=a.pdf` and the RFC 5987
/// `filename*=UTF-8''a%20b.pdf` form, preferring the latter.
#[must_use]
pub fn parse_content_disposition(header: &str) -> Option<String> {
    if let Some(pos) = header.find("filename*=") {
        let value = header[pos + 10..].trim();
        if let Some(quote_pos) = value.find("''") {
            let encoded = &value[quote_pos + 2..];
            let end = encoded.find(';').unwrap_or(encoded.len());
            if let Ok(decoded) = urlencoding::decode(encoded[..end].trim()) {
                return Some(decoded.into_owned());
            }
        }
    }

    let pos = header.find("filename=")?;
    let value = header[pos + 9..].trim();
    if let Some(stripped) = value.strip_prefix('"') {
        let end = stripped.find('"')?;
        return Some(stripped[..end].to_string());
    }
    let end = value.find(';').unwrap_or(value.len());
    let filename = value[..end].trim();
    (!filename.is_empty()).then(|| filename.to_string())
}

/// Replaces characters that are unsafe on common filesystems.
///
/// Whitespace runs become a single `_`; dot-only names are rewritten so the
/// result is never a path component like `..`.
#[must_use]
pub fn sanitize_filename(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut prev_sep = false;
    for ch in name.chars() {
        let mapped = match ch {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() || c.is_whitespace() => '_',
            c => c,
        };
        if mapped == '_' {
            if !prev_sep {
                out.push('_');
            }
            prev_sep = true;
        } else {
            out.push(mapped);
            prev_sep = false;
        }
    }

    if out.is_empty() {
        return "_".to_string();
    }
    if is_safe_filename_segment(&out) {
        out
    } else {
        out.replace('.', "_")
    }
}

fn is_safe_filename_segment(name: &str) -> bool {
    !Path::new(name).components().any(|component| {
        matches!(
            component,
            Component::CurDir | Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const SHA: &str = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

    #[test]
    fn test_name_from_url_segment() {
        let url = Url::parse("https://docs.agency.gov/pubs/Cooling%20Guide.PDF?x=1").unwrap();
        assert_eq!(
            stored_filename(SHA, &url, None, "ignored"),
            "0123456789ab__Cooling_Guide.pdf"
        );
    }

    #[test]
    fn test_falls_back_to_disposition_then_term() {
        let url = Url::parse("https://docs.agency.gov/download?id=7").unwrap();
        assert_eq!(
            stored_filename(SHA, &url, Some("UPS Sizing.pdf"), "ups sizing"),
            "0123456789ab__UPS_Sizing.pdf"
        );
        assert_eq!(
            stored_filename(SHA, &url, None, "hot aisle containment"),
            "0123456789ab__hot_aisle_containment.pdf"
        );
        assert_eq!(
            stored_filename(SHA, &url, Some("report.docx"), "  "),
            "0123456789ab__document.pdf"
        );
    }

    #[test]
    fn test_traversal_names_are_neutralized() {
        let url = Url::parse("https://docs.agency.gov/a/..%2F..%2Fetc%2Fpasswd.pdf").unwrap();
        let name = stored_filename(SHA, &url, None, "t");
        assert!(!name.contains('/'));
        assert!(name.starts_with("0123456789ab__"));
        assert_eq!(sanitize_filename(".."), "__");
        assert_eq!(sanitize_filename("."), "_");
    }

    #[test]
    fn test_sanitize_filename_replaces_invalid_chars() {
        assert_eq!(sanitize_filename("file<name>.pdf"), "file_name_.pdf");
        assert_eq!(sanitize_filename("a:b|c"), "a_b_c");
        assert_eq!(sanitize_filename("日本語"), "日本語");
    }

    #[test]
    fn test_parse_content_disposition_forms() {
        assert_eq!(
            parse_content_disposition(r#"attachment; filename="example.pdf"; size=1"#),
            Some("example.pdf".to_string())
        );
        assert_eq!(
            parse_content_disposition("attachment; filename=example.pdf"),
            Some("example.pdf".to_string())
        );
        assert_eq!(
            parse_content_disposition("attachment; filename*=UTF-8''example%20file.pdf"),
            Some("example file.pdf".to_string())
        );
        assert_eq!(parse_content_disposition("inline"), None);
    }
}
