//! Eligibility evaluation.
//!
//! Decides, before any full download, whether a candidate may be fetched and
//! kept. Checks short-circuit in order:
//!
//! 0. configured domain allow-list
//! 1. robots.txt (via the politeness ledger, fail-closed)
//! 2. header probe: HEAD, or a ranged GET when HEAD is refused; opt-out
//!    directives and decisively non-document content types reject
//! 3. public-interest hosts accept
//! 4. bounded content inspection for rights language
//!
//! The evaluator never fails: transport problems become a
//! [`ReasonCode::ProbeFailed`] rejection.

mod signals;
mod verdict;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

pub use signals::{
    ContentClass, OPT_OUT_DIRECTIVES, classify_content_type, is_pdf_content_type,
    is_permissive_license_link, is_public_interest_host, matches_domain_suffix,
    meta_robots_opt_out, scan_license_text, x_robots_opt_out,
};
pub use verdict::{
    Decision, EligibilityVerdict, Evidence, HeaderSnapshot, LicenseSignal, ReasonCode,
};

use crate::http::{HttpClient, HttpError, ensure_success, read_prefix};
use crate::model::CandidateUrl;
use crate::politeness::PolitenessLedger;
use crate::retry::{RetryContext, RetryError, RetryPolicy, run_with_retry};
use crate::user_agent::PRODUCT_TOKEN;

/// Bytes inspected from the start of a document.
pub const INSPECTION_BYTES: usize = 64 * 1024;

/// Evaluator settings.
#[derive(Debug, Clone)]
pub struct EligibilityOptions {
    /// When non-empty, hosts outside these suffixes are rejected.
    pub allowed_domain_suffixes: Vec<String>,
    /// Vendor domains treated like public-interest hosts.
    pub vendor_domains: Vec<String>,
    /// Agent name matched in opt-out directives.
    pub product_token: String,
}

impl Default for EligibilityOptions {
    fn default() -> Self {
        Self {
            allowed_domain_suffixes: Vec::new(),
            vendor_domains: Vec::new(),
            product_token: PRODUCT_TOKEN.to_string(),
        }
    }
}

/// What the header probe learned.
#[derive(Debug)]
struct Probe {
    headers: HeaderSnapshot,
    /// Body prefix, when the probe had to use a ranged GET.
    body: Option<Vec<u8>>,
}

enum ProbeFailure {
    Cancelled,
    Failed(String),
}

impl From<RetryError<HttpError>> for ProbeFailure {
    fn from(error: RetryError<HttpError>) -> Self {
        match error {
            RetryError::Cancelled => Self::Cancelled,
            RetryError::Exhausted { error, attempts } => {
                Self::Failed(format!("{error} (after {attempts} attempts)"))
            }
        }
    }
}

/// Evaluates candidates. Share behind an `Arc`.
#[derive(Debug)]
pub struct EligibilityEvaluator {
    client: HttpClient,
    ledger: Arc<PolitenessLedger>,
    retry: RetryPolicy,
    options: EligibilityOptions,
}

impl EligibilityEvaluator {
    /// Creates an evaluator.
    #[must_use]
    pub fn new(
        client: HttpClient,
        ledger: Arc<PolitenessLedger>,
        retry: RetryPolicy,
        options: EligibilityOptions,
    ) -> Self {
        Self {
            client,
            ledger,
            retry,
            options,
        }
    }

    /// Evaluates one candidate.
    #[instrument(skip(self, candidate, cancel), fields(url = %candidate.url))]
    pub async fn evaluate(
        &self,
        candidate: &CandidateUrl,
        cancel: &CancellationToken,
    ) -> EligibilityVerdict {
        let verdict = self.evaluate_inner(candidate, cancel).await;
        info!(
            decision = ?verdict.decision,
            reason = %verdict.reason,
            "eligibility verdict"
        );
        verdict
    }

    async fn evaluate_inner(
        &self,
        candidate: &CandidateUrl,
        cancel: &CancellationToken,
    ) -> EligibilityVerdict {
        let host = candidate.host();
        let url = candidate.url.as_str();

        if !self.options.allowed_domain_suffixes.is_empty()
            && !matches_domain_suffix(&host, &self.options.allowed_domain_suffixes)
        {
            return EligibilityVerdict::reject(
                ReasonCode::DomainNotAllowed,
                Evidence::detail(format!("host {host} is outside the allow-list")),
            );
        }

        let robots_allowed = tokio::select! {
            biased;
            () = cancel.cancelled() => return cancelled(),
            allowed = self.ledger.robots_allows(&candidate.url) => allowed,
        };
        if !robots_allowed {
            return EligibilityVerdict::reject(
                ReasonCode::RobotsDisallowed,
                Evidence::detail("robots.txt disallows or could not be retrieved"),
            );
        }

        let probe = match self.probe(url, cancel).await {
            Ok(probe) => probe,
            Err(ProbeFailure::Cancelled) => return cancelled(),
            Err(ProbeFailure::Failed(detail)) => {
                return EligibilityVerdict::reject(ReasonCode::ProbeFailed, Evidence::detail(detail));
            }
        };

        let opt_out = x_robots_opt_out(&probe.headers.x_robots_tag, &self.options.product_token)
            .or_else(|| {
                probe
                    .body
                    .as_deref()
                    .and_then(|body| meta_robots_opt_out(body, &self.options.product_token))
            });
        if let Some(directive) = opt_out {
            return EligibilityVerdict::reject(
                ReasonCode::OptOutSignal,
                Evidence {
                    headers: Some(probe.headers),
                    license_signal: LicenseSignal::OptOut(directive),
                    detail: None,
                },
            );
        }

        if classify_content_type(probe.headers.content_type.as_deref()) == ContentClass::NonDocument {
            let detail = probe.headers.content_type.clone();
            return EligibilityVerdict::reject(
                ReasonCode::NonDocumentType,
                Evidence {
                    headers: Some(probe.headers),
                    license_signal: LicenseSignal::None,
                    detail,
                },
            );
        }

        if is_public_interest_host(&host, &self.options.vendor_domains) {
            return EligibilityVerdict::accept(
                ReasonCode::PublicInterestDomain,
                Evidence {
                    headers: Some(probe.headers),
                    license_signal: LicenseSignal::None,
                    detail: Some(host),
                },
            );
        }

        let body = match probe.body {
            Some(body) => body,
            None => match self.ranged_prefix(url, cancel).await {
                Ok((_, body)) => body,
                Err(ProbeFailure::Cancelled) => return cancelled(),
                Err(ProbeFailure::Failed(detail)) => {
                    return EligibilityVerdict::reject(
                        ReasonCode::ProbeFailed,
                        Evidence {
                            headers: Some(probe.headers),
                            license_signal: LicenseSignal::None,
                            detail: Some(detail),
                        },
                    );
                }
            },
        };

        let signal = match scan_license_text(&body) {
            LicenseSignal::None => probe
                .headers
                .link_license
                .as_deref()
                .filter(|target| is_permissive_license_link(target))
                .map_or(LicenseSignal::None, |target| {
                    LicenseSignal::Permissive(target.to_string())
                }),
            found => found,
        };
        debug!(?signal, inspected = body.len(), "content inspected");

        let evidence = Evidence {
            headers: Some(probe.headers),
            license_signal: signal.clone(),
            detail: None,
        };
        match signal {
            LicenseSignal::Restrictive(_) => {
                EligibilityVerdict::reject(ReasonCode::RestrictiveRights, evidence)
            }
            LicenseSignal::Permissive(_) => {
                EligibilityVerdict::accept(ReasonCode::PermissiveLicense, evidence)
            }
            LicenseSignal::OptOut(_) => EligibilityVerdict::reject(ReasonCode::OptOutSignal, evidence),
            LicenseSignal::None => EligibilityVerdict::indeterminate(evidence),
        }
    }

    /// HEAD probe, falling back to a ranged GET when HEAD is answered 405/501.
    async fn probe(&self, url: &str, cancel: &CancellationToken) -> Result<Probe, ProbeFailure> {
        let ctx = RetryContext {
            policy: &self.retry,
            ledger: &self.ledger,
            cancel,
        };
        let client = &self.client;
        let head = run_with_retry(ctx, url, move || async move {
            let response = client.head(url).await?;
            if matches!(response.status().as_u16(), 405 | 501) {
                debug!(url, status = response.status().as_u16(), "HEAD refused, using ranged GET");
                return Ok(None);
            }
            let response = ensure_success(url, response)?;
            Ok::<_, HttpError>(Some(HeaderSnapshot::capture(
                response.status().as_u16(),
                response.headers(),
            )))
        })
        .await?;

        match head {
            Some(headers) => Ok(Probe {
                headers,
                body: None,
            }),
            None => {
                let (headers, body) = self.ranged_prefix(url, cancel).await?;
                Ok(Probe {
                    headers,
                    body: Some(body),
                })
            }
        }
    }

    /// GETs the first [`INSPECTION_BYTES`] of `url`.
    async fn ranged_prefix(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<(HeaderSnapshot, Vec<u8>), ProbeFailure> {
        let ctx = RetryContext {
            policy: &self.retry,
            ledger: &self.ledger,
            cancel,
        };
        let client = &self.client;
        let result = run_with_retry(ctx, url, move || async move {
            let response = ensure_success(url, client.get_range(url, INSPECTION_BYTES).await?)?;
            let headers = HeaderSnapshot::capture(response.status().as_u16(), response.headers());
            let body = read_prefix(url, response, INSPECTION_BYTES).await?;
            Ok::<_, HttpError>((headers, body))
        })
        .await?;
        Ok(result)
    }
}

fn cancelled() -> EligibilityVerdict {
    EligibilityVerdict::reject(ReasonCode::Cancelled, Evidence::default())
}
