//! Header, markup and text heuristics used by the evaluator.

use std::sync::LazyLock;

use regex::Regex;

use super::verdict::LicenseSignal;

/// Robots directives that opt a resource out of archiving.
pub const OPT_OUT_DIRECTIVES: &[&str] = &["noarchive", "noindex", "none", "noai", "noimageai"];

/// X-Robots-Tag directives that carry their own `name: value` syntax and
/// must not be mistaken for an agent prefix.
const VALUED_DIRECTIVES: &[&str] = &[
    "max-snippet",
    "max-image-preview",
    "max-video-preview",
    "unavailable_after",
];

const PDF_TYPES: &[&str] = &[
    "application/pdf",
    "application/x-pdf",
    "application/acrobat",
    "application/vnd.pdf",
    "applications/vnd.pdf",
    "text/pdf",
    "text/x-pdf",
];

const GENERIC_TYPES: &[&str] = &[
    "application/octet-stream",
    "binary/octet-stream",
    "application/download",
    "application/force-download",
    "application/x-download",
    "application/unknown",
];

const PUBLIC_INTEREST_TLDS: &[&str] = &["gov", "mil", "edu", "int"];
const PUBLIC_INTEREST_SECOND_LEVEL: &[&str] = &["gov", "ac", "edu", "gob", "govt", "gouv"];
const PUBLIC_INTEREST_SUFFIXES: &[&str] = &["gc.ca", "europa.eu"];

fn compile_static_regex(pattern: &str) -> Regex {
    Regex::new(pattern).unwrap_or_else(|e| panic!("invalid static regex '{pattern}': {e}"))
}

static META_TAG_RE: LazyLock<Regex> = LazyLock::new(|| compile_static_regex(r"(?is)<meta\b[^>]*>"));
static META_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r#"(?i)\bname\s*=\s*["']?([^"'\s>]+)"#));
static META_CONTENT_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r#"(?i)\bcontent\s*=\s*(?:"([^"]*)"|'([^']*)')"#));

static RESTRICTIVE_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)all\s+rights\s+reserved",
        r"(?is)no\s+part\s+of\s+this\b.{0,120}?\bmay\s+be\s+reproduced",
        r"(?i)proprietary\s+and\s+confidential",
        r"(?is)unauthori[sz]ed\s+(?:reproduction|distribution|copying)\b.{0,120}?\bprohibited",
    ]
    .into_iter()
    .map(compile_static_regex)
    .collect()
});

static XMP_MARKED_RE: LazyLock<Regex> = LazyLock::new(|| {
    compile_static_regex(r#"(?i)xmpRights:Marked\s*(?:=\s*["']|>)\s*True"#)
});
static XMP_USAGE_TERMS_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r"(?i)xmpRights:UsageTerms"));

static PERMISSIVE_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)creativecommons\.org/(?:licenses|publicdomain)/[a-z0-9./-]*",
        r"(?i)creative\s+commons",
        r"(?i)public\s+domain",
        r"(?i)not\s+subject\s+to\s+copyright",
        r"(?i)open\s+government\s+licen[cs]e",
        r"(?i)GNU\s+Free\s+Documentation\s+License",
        r"(?i)permission\s+is\s+granted\s+to\s+copy",
    ]
    .into_iter()
    .map(compile_static_regex)
    .collect()
});

/// Coarse class of a declared content type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentClass {
    /// A PDF media type.
    Document,
    /// Absent or generic binary; the bytes decide.
    Generic,
    /// Anything else (`text/html`, `image/*`, `application/json`, ...).
    NonDocument,
}

fn media_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Classifies a `Content-Type` value (`None` when the header was absent).
#[must_use]
pub fn classify_content_type(content_type: Option<&str>) -> ContentClass {
    let Some(content_type) = content_type else {
        return ContentClass::Generic;
    };
    let media = media_type(content_type);
    if media.is_empty() || GENERIC_TYPES.contains(&media.as_str()) {
        ContentClass::Generic
    } else if PDF_TYPES.contains(&media.as_str()) {
        ContentClass::Document
    } else {
        ContentClass::NonDocument
    }
}

/// Whether `content_type` names a PDF media type.
#[must_use]
pub fn is_pdf_content_type(content_type: &str) -> bool {
    classify_content_type(Some(content_type)) == ContentClass::Document
}

fn opt_out_directive(directives: &str) -> Option<String> {
    directives
        .split(',')
        .map(|d| d.trim().to_ascii_lowercase())
        .find(|d| OPT_OUT_DIRECTIVES.contains(&d.as_str()))
}

/// Finds an opt-out directive in `X-Robots-Tag` values that applies to us:
/// unprefixed directives, or those prefixed with `*` or `product_token`.
#[must_use]
pub fn x_robots_opt_out(values: &[String], product_token: &str) -> Option<String> {
    for value in values {
        let mut applies = true;
        for piece in value.split(',') {
            let piece = piece.trim();
            let directive = match piece.split_once(':') {
                Some((name, rest))
                    if !VALUED_DIRECTIVES.contains(&name.trim().to_ascii_lowercase().as_str()) =>
                {
                    let agent = name.trim();
                    applies = agent == "*" || agent.eq_ignore_ascii_case(product_token);
                    rest.trim()
                }
                _ => piece,
            };
            if applies && let Some(found) = opt_out_directive(directive) {
                return Some(found);
            }
        }
    }
    None
}

/// Finds an opt-out directive in `<meta name="robots">` (or a meta tag named
/// for `product_token`) within an HTML prefix.
#[must_use]
pub fn meta_robots_opt_out(body: &[u8], product_token: &str) -> Option<String> {
    let text = String::from_utf8_lossy(body);
    META_TAG_RE.find_iter(&text).find_map(|tag| {
        let tag = tag.as_str();
        let name = META_NAME_RE.captures(tag)?.get(1)?.as_str();
        if !(name.eq_ignore_ascii_case("robots") || name.eq_ignore_ascii_case(product_token)) {
            return None;
        }
        let content = META_CONTENT_RE.captures(tag)?;
        let content = content.get(1).or_else(|| content.get(2))?.as_str();
        opt_out_directive(content)
    })
}

/// Scans a content prefix for rights language. Restrictive markers win over
/// permissive ones.
#[must_use]
pub fn scan_license_text(body: &[u8]) -> LicenseSignal {
    let text = String::from_utf8_lossy(body);
    if let Some(found) = RESTRICTIVE_RES.iter().find_map(|re| re.find(&text)) {
        return LicenseSignal::Restrictive(found.as_str().to_string());
    }
    if let Some(marked) = XMP_MARKED_RE.find(&text)
        && XMP_USAGE_TERMS_RE.is_match(&text)
    {
        return LicenseSignal::Restrictive(marked.as_str().to_string());
    }
    if let Some(found) = PERMISSIVE_RES.iter().find_map(|re| re.find(&text)) {
        return LicenseSignal::Permissive(found.as_str().to_string());
    }
    LicenseSignal::None
}

/// Whether a `Link: rel="license"` target is an open license.
#[must_use]
pub fn is_permissive_license_link(target: &str) -> bool {
    let lower = target.to_ascii_lowercase();
    lower.contains("creativecommons.org/")
        || lower.contains("/publicdomain/")
        || lower.contains("opendatacommons.org/")
        || lower.contains("nationalarchives.gov.uk/doc/open-government-licence")
        || lower.contains("gnu.org/licenses/fdl")
}

/// Whether `host` equals one of `suffixes` or is a subdomain of one.
#[must_use]
pub fn matches_domain_suffix(host: &str, suffixes: &[String]) -> bool {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    suffixes.iter().any(|suffix| {
        let suffix = suffix.trim().trim_start_matches('.').to_ascii_lowercase();
        !suffix.is_empty() && (host == suffix || host.ends_with(&format!(".{suffix}")))
    })
}

/// Whether `host` is government, military, academic, intergovernmental or
/// an allow-listed vendor domain.
#[must_use]
pub fn is_public_interest_host(host: &str, vendor_domains: &[String]) -> bool {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    let labels: Vec<&str> = host.split('.').collect();
    let Some((tld, rest)) = labels.split_last() else {
        return false;
    };
    if rest.is_empty() {
        return false;
    }
    if PUBLIC_INTEREST_TLDS.contains(tld) {
        return true;
    }
    if tld.len() == 2
        && rest
            .last()
            .is_some_and(|second| PUBLIC_INTEREST_SECOND_LEVEL.contains(second))
    {
        return true;
    }
    if PUBLIC_INTEREST_SUFFIXES
        .iter()
        .any(|suffix| host == *suffix || host.ends_with(&format!(".{suffix}")))
    {
        return true;
    }
    matches_domain_suffix(&host, vendor_domains)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_content_type_classes() {
        assert_eq!(
            classify_content_type(Some("application/pdf; charset=binary")),
            ContentClass::Document
        );
        assert_eq!(classify_content_type(Some("APPLICATION/X-PDF")), ContentClass::Document);
        assert_eq!(
            classify_content_type(Some("application/octet-stream")),
            ContentClass::Generic
        );
        assert_eq!(classify_content_type(None), ContentClass::Generic);
        for other in ["text/html; charset=utf-8", "image/png", "video/mp4", "application/json"] {
            assert_eq!(classify_content_type(Some(other)), ContentClass::NonDocument);
        }
    }

    #[test]
    fn test_x_robots_tag_scoping() {
        let token = "harvester";
        assert_eq!(
            x_robots_opt_out(&strings(&["noarchive"]), token).as_deref(),
            Some("noarchive")
        );
        assert_eq!(
            x_robots_opt_out(&strings(&["NoAI, noimageai"]), token).as_deref(),
            Some("noai")
        );
        assert_eq!(x_robots_opt_out(&strings(&["googlebot: noindex"]), token), None);
        assert_eq!(
            x_robots_opt_out(&strings(&["googlebot: nofollow", "Harvester: none"]), token)
                .as_deref(),
            Some("none")
        );
        assert_eq!(
            x_robots_opt_out(&strings(&["*: noindex"]), token).as_deref(),
            Some("noindex")
        );
        assert_eq!(
            x_robots_opt_out(&strings(&["unavailable_after: 25 Jun 2030 15:00:00 PST"]), token),
            None
        );
        assert_eq!(x_robots_opt_out(&strings(&["nofollow, max-snippet:20"]), token), None);
    }

    #[test]
    fn test_meta_robots_opt_out() {
        let html = br#"<html><head><meta name="robots" content="noindex, nofollow"></head></html>"#;
        assert_eq!(meta_robots_opt_out(html, "harvester").as_deref(), Some("noindex"));

        let html = br#"<meta content='noarchive' name=HARVESTER>"#;
        assert_eq!(meta_robots_opt_out(html, "harvester").as_deref(), Some("noarchive"));

        let html = br#"<meta name="description" content="none of your business">"#;
        assert_eq!(meta_robots_opt_out(html, "harvester"), None);
    }

    #[test]
    fn test_restrictive_beats_permissive() {
        let body = b"Licensed under Creative Commons. Copyright 2023 Vendor Inc. All Rights Reserved.";
        assert!(matches!(scan_license_text(body), LicenseSignal::Restrictive(_)));
    }

    #[test]
    fn test_restrictive_phrases() {
        for text in [
            "No part of this publication may be reproduced without consent",
            "PROPRIETARY AND CONFIDENTIAL",
            "Unauthorized reproduction of this manual is strictly prohibited",
        ] {
            assert!(
                matches!(scan_license_text(text.as_bytes()), LicenseSignal::Restrictive(_)),
                "{text}"
            );
        }
    }

    #[test]
    fn test_xmp_marked_requires_usage_terms() {
        let marked_only = br#"<rdf:Description xmpRights:Marked="True"/>"#;
        assert_eq!(scan_license_text(marked_only), LicenseSignal::None);
        let with_terms = br#"<rdf:Description xmpRights:Marked="True"><xmpRights:UsageTerms>Internal</xmpRights:UsageTerms>"#;
        assert!(matches!(scan_license_text(with_terms), LicenseSignal::Restrictive(_)));
    }

    #[test]
    fn test_permissive_markers() {
        for text in [
            "https://creativecommons.org/licenses/by/4.0/",
            "This work is in the public domain.",
            "This document is not subject to copyright in the United States.",
            "Contains public sector information licensed under the Open Government Licence v3.0.",
            "Permission is granted to copy, distribute and/or modify this document",
        ] {
            assert!(
                matches!(scan_license_text(text.as_bytes()), LicenseSignal::Permissive(_)),
                "{text}"
            );
        }
        assert_eq!(scan_license_text(b"%PDF-1.7 plain manual"), LicenseSignal::None);
    }

    #[test]
    fn test_public_interest_hosts() {
        let vendors = strings(&["dell.com", ".supermicro.com"]);
        for host in [
            "energy.gov",
            "www.nist.gov",
            "army.mil",
            "mit.edu",
            "who.int",
            "gov.uk",
            "www.legislation.gov.uk",
            "ox.ac.uk",
            "unimelb.edu.au",
            "canada.gc.ca",
            "eur-lex.europa.eu",
            "dl.dell.com",
            "www.supermicro.com",
        ] {
            assert!(is_public_interest_host(host, &vendors), "{host}");
        }
        for host in ["example.com", "gov.example.com", "notdell.com", "localhost", "gov"] {
            assert!(!is_public_interest_host(host, &vendors), "{host}");
        }
    }

    #[test]
    fn test_domain_suffix_matching() {
        let suffixes = strings(&["gov", ".edu", "Cisco.com"]);
        assert!(matches_domain_suffix("www.energy.gov", &suffixes));
        assert!(matches_domain_suffix("cisco.com", &suffixes));
        assert!(matches_domain_suffix("www.cisco.com.", &suffixes));
        assert!(!matches_domain_suffix("notcisco.com", &suffixes));
        assert!(!matches_domain_suffix("example.org", &suffixes));
    }

    #[test]
    fn test_license_links() {
        assert!(is_permissive_license_link("https://creativecommons.org/licenses/by-sa/4.0/"));
        assert!(!is_permissive_license_link("https://vendor.example.com/eula"));
    }
}
