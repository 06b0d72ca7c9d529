//! Verdict types produced by the eligibility evaluator.

use std::fmt;

use reqwest::header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE, HeaderMap, LINK};
use serde::Serialize;

use crate::http::header_value;

/// Outcome of an eligibility check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// Fetch and keep.
    Accept,
    /// Do not fetch.
    Reject,
    /// No evidence either way. Handled as [`Decision::Reject`].
    Indeterminate,
}

/// Machine-readable reason recorded in the manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    /// Host outside `allowed_domain_suffixes`.
    DomainNotAllowed,
    /// robots.txt forbids the path (or could not be retrieved).
    RobotsDisallowed,
    /// `X-Robots-Tag` or robots meta tag opts out of archiving.
    OptOutSignal,
    /// Server declared a non-document content type.
    NonDocumentType,
    /// Government, military, academic or allow-listed vendor host.
    PublicInterestDomain,
    /// Open license marker found.
    PermissiveLicense,
    /// Rights-reserved language found.
    RestrictiveRights,
    /// Nothing found either way.
    NoLicenseSignal,
    /// Header probe or content inspection failed.
    ProbeFailed,
    /// The run was cancelled mid-evaluation.
    Cancelled,
}

impl ReasonCode {
    /// Stable snake_case name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DomainNotAllowed => "domain_not_allowed",
            Self::RobotsDisallowed => "robots_disallowed",
            Self::OptOutSignal => "opt_out_signal",
            Self::NonDocumentType => "non_document_type",
            Self::PublicInterestDomain => "public_interest_domain",
            Self::PermissiveLicense => "permissive_license",
            Self::RestrictiveRights => "restrictive_rights",
            Self::NoLicenseSignal => "no_license_signal",
            Self::ProbeFailed => "probe_failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Response headers captured by the probe.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HeaderSnapshot {
    /// HTTP status of the probe.
    pub status: u16,
    /// Declared `Content-Type`.
    pub content_type: Option<String>,
    /// Declared `Content-Length`.
    pub content_length: Option<u64>,
    /// Every `X-Robots-Tag` value.
    pub x_robots_tag: Vec<String>,
    /// `Content-Disposition`.
    pub content_disposition: Option<String>,
    /// Target of a `Link: <...>; rel="license"` header.
    pub link_license: Option<String>,
}

impl HeaderSnapshot {
    /// Captures the interesting headers of a response.
    #[must_use]
    pub fn capture(status: u16, headers: &HeaderMap) -> Self {
        Self {
            status,
            content_type: header_value(headers, CONTENT_TYPE.as_str()),
            content_length: header_value(headers, CONTENT_LENGTH.as_str())
                .and_then(|v| v.parse().ok()),
            x_robots_tag: headers
                .get_all("x-robots-tag")
                .iter()
                .filter_map(|v| v.to_str().ok())
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .collect(),
            content_disposition: header_value(headers, CONTENT_DISPOSITION.as_str()),
            link_license: headers
                .get_all(LINK)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .find_map(license_link_target),
        }
    }
}

/// Pulls the target of the first `rel="license"` entry out of a `Link` header.
fn license_link_target(value: &str) -> Option<String> {
    value.split(',').find_map(|entry| {
        let (target, params) = entry.split_once(';')?;
        let is_license = params.split(';').any(|param| {
            param
                .trim()
                .split_once('=')
                .is_some_and(|(k, v)| {
                    k.trim().eq_ignore_ascii_case("rel")
                        && v.trim().trim_matches('"').eq_ignore_ascii_case("license")
                })
        });
        let target = target.trim().strip_prefix('<')?.strip_suffix('>')?;
        is_license.then(|| target.to_string())
    })
}

/// License or opt-out evidence found for a candidate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "marker", rename_all = "snake_case")]
pub enum LicenseSignal {
    /// Nothing found.
    #[default]
    None,
    /// An open license marker.
    Permissive(String),
    /// Rights-reserved language.
    Restrictive(String),
    /// An archiving opt-out directive.
    OptOut(String),
}

/// What the verdict was based on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Evidence {
    /// Probe headers, when the probe ran.
    pub headers: Option<HeaderSnapshot>,
    /// License signal found.
    pub license_signal: LicenseSignal,
    /// Free-form detail (error text, matched host rule).
    pub detail: Option<String>,
}

impl Evidence {
    /// Evidence carrying only a detail string.
    pub fn detail(detail: impl Into<String>) -> Self {
        Self {
            detail: Some(detail.into()),
            ..Self::default()
        }
    }
}

/// Decision plus reason and evidence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EligibilityVerdict {
    /// The decision.
    pub decision: Decision,
    /// Why.
    pub reason: ReasonCode,
    /// Supporting evidence.
    pub evidence: Evidence,
}

impl EligibilityVerdict {
    /// An accept verdict.
    #[must_use]
    pub fn accept(reason: ReasonCode, evidence: Evidence) -> Self {
        Self {
            decision: Decision::Accept,
            reason,
            evidence,
        }
    }

    /// A reject verdict.
    #[must_use]
    pub fn reject(reason: ReasonCode, evidence: Evidence) -> Self {
        Self {
            decision: Decision::Reject,
            reason,
            evidence,
        }
    }

    /// An indeterminate verdict (`no_license_signal`).
    #[must_use]
    pub fn indeterminate(evidence: Evidence) -> Self {
        Self {
            decision: Decision::Indeterminate,
            reason: ReasonCode::NoLicenseSignal,
            evidence,
        }
    }

    /// Whether the candidate may be fetched. Indeterminate is not.
    #[must_use]
    pub fn is_accept(&self) -> bool {
        self.decision == Decision::Accept
    }
}
