//! Fetch & verify: bounded streaming download of accepted candidates.
//!
//! The whole body is held in memory (bounded by `max_bytes`) while the
//! SHA-256 fingerprint is computed chunk by chunk; nothing touches the disk
//! here, so a failed or cancelled fetch never leaves a partial file.

mod verify;

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};
use url::Url;

pub use verify::{MAGIC_WINDOW, PDF_MAGIC, has_pdf_magic, verify_pdf};

use crate::eligibility::{ContentClass, classify_content_type};
use crate::http::{HttpClient, HttpError, header_value};
use crate::model::CandidateUrl;
use crate::politeness::{PolitenessLedger, parse_retry_after};
use crate::retry::{
    FailureType, RetryContext, RetryError, RetryPolicy, Retryable, classify_http_error,
    classify_http_status, run_with_retry,
};
use crate::store::{ManifestStatus, parse_content_disposition};

/// Default document size ceiling (50 MiB).
pub const DEFAULT_MAX_DOCUMENT_BYTES: u64 = 50 * 1024 * 1024;

/// A downloaded and verified document, held in memory until committed.
#[derive(Debug, Clone)]
pub struct FetchedDocument {
    /// Document bytes.
    pub bytes: Vec<u8>,
    /// Declared content type.
    pub content_type: Option<String>,
    /// Body size in bytes.
    pub size: u64,
    /// Lowercase hex SHA-256 of `bytes`.
    pub sha256: String,
    /// URL the document was fetched from.
    pub source_url: Url,
    /// Final HTTP status.
    pub http_status: u16,
    /// Filename offered by `Content-Disposition`.
    pub suggested_filename: Option<String>,
}

/// Why a fetch failed.
#[derive(Debug, Error)]
pub enum FetchFailure {
    /// Connect or read timed out.
    #[error("timeout fetching {url}")]
    Timeout {
        /// Document URL.
        url: String,
    },
    /// Body larger than the configured ceiling.
    #[error("{url} exceeds the {limit} byte limit ({observed} bytes seen)")]
    Oversize {
        /// Document URL.
        url: String,
        /// Configured ceiling.
        limit: u64,
        /// Declared length or bytes received before giving up.
        observed: u64,
    },
    /// Declared type or leading bytes are not a PDF.
    #[error("{url} is not a PDF: {detail}")]
    TypeMismatch {
        /// Document URL.
        url: String,
        /// Declared content type.
        declared: Option<String>,
        /// What did not match.
        detail: String,
    },
    /// Non-success HTTP status.
    #[error("HTTP {status} fetching {url}")]
    HttpStatus {
        /// Document URL.
        url: String,
        /// Status code.
        status: u16,
        /// `Retry-After` value, if any.
        retry_after: Option<String>,
    },
    /// Network failure other than a timeout.
    #[error("transport error fetching {url}: {source}")]
    Transport {
        /// Document URL.
        url: String,
        /// Underlying error.
        #[source]
        source: HttpError,
    },
    /// The run was cancelled mid-fetch.
    #[error("fetch of {url} cancelled")]
    Cancelled {
        /// Document URL.
        url: String,
    },
}

impl FetchFailure {
    /// Maps a transport error for `url`.
    #[must_use]
    pub fn from_http(url: &str, error: HttpError) -> Self {
        match error {
            HttpError::Timeout { .. } => Self::Timeout {
                url: url.to_string(),
            },
            HttpError::HttpStatus {
                status,
                retry_after,
                ..
            } => Self::HttpStatus {
                url: url.to_string(),
                status,
                retry_after,
            },
            other => Self::Transport {
                url: url.to_string(),
                source: other,
            },
        }
    }

    /// Manifest reason string.
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "timeout",
            Self::Oversize { .. } => "oversize",
            Self::TypeMismatch { .. } => "type_mismatch",
            Self::HttpStatus { .. } => "http_status",
            Self::Transport { .. } => "transport_error",
            Self::Cancelled { .. } => "cancelled",
        }
    }

    /// Manifest status: cancellations are skips, everything else an error.
    #[must_use]
    pub fn manifest_status(&self) -> ManifestStatus {
        match self {
            Self::Cancelled { .. } => ManifestStatus::Skipped,
            _ => ManifestStatus::Error,
        }
    }

    /// HTTP status, when the failure carried one.
    #[must_use]
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Declared content type, when known.
    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        match self {
            Self::TypeMismatch { declared, .. } => declared.as_deref(),
            _ => None,
        }
    }
}

impl Retryable for FetchFailure {
    fn failure_type(&self) -> FailureType {
        match self {
            Self::Timeout { .. } => FailureType::Transient,
            Self::HttpStatus { status, .. } => classify_http_status(*status),
            Self::Transport { source, .. } => classify_http_error(source),
            Self::Oversize { .. } | Self::TypeMismatch { .. } | Self::Cancelled { .. } => {
                FailureType::Permanent
            }
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::HttpStatus {
                retry_after: Some(value),
                ..
            } => parse_retry_after(value),
            _ => None,
        }
    }
}

/// Downloads accepted candidates. Share behind an `Arc`.
#[derive(Debug)]
pub struct DocumentFetcher {
    client: HttpClient,
    ledger: Arc<PolitenessLedger>,
    retry: RetryPolicy,
    max_bytes: u64,
}

impl DocumentFetcher {
    /// Creates a fetcher with a `max_bytes` size ceiling.
    #[must_use]
    pub fn new(
        client: HttpClient,
        ledger: Arc<PolitenessLedger>,
        retry: RetryPolicy,
        max_bytes: u64,
    ) -> Self {
        Self {
            client,
            ledger,
            retry,
            max_bytes,
        }
    }

    /// Size ceiling in bytes.
    #[must_use]
    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Fetches and verifies one document, retrying transient failures.
    ///
    /// # Errors
    ///
    /// Returns the [`FetchFailure`] of the last attempt, or
    /// [`FetchFailure::Cancelled`] when `cancel` fires.
    #[instrument(skip(self, candidate, cancel), fields(url = %candidate.url))]
    pub async fn fetch(
        &self,
        candidate: &CandidateUrl,
        cancel: &CancellationToken,
    ) -> Result<FetchedDocument, FetchFailure> {
        let url = &candidate.url;
        let ctx = RetryContext {
            policy: &self.retry,
            ledger: &self.ledger,
            cancel,
        };
        let result = run_with_retry(ctx, url.as_str(), move || self.download(url)).await;

        match result {
            Ok(document) => {
                info!(size = document.size, sha256 = %document.sha256, "fetched document");
                Ok(document)
            }
            Err(RetryError::Cancelled) => Err(FetchFailure::Cancelled {
                url: url.to_string(),
            }),
            Err(RetryError::Exhausted { error, attempts }) => {
                debug!(attempts, error = %error, "fetch failed");
                Err(error)
            }
        }
    }

    async fn download(&self, url: &Url) -> Result<FetchedDocument, FetchFailure> {
        let url_str = url.as_str();
        let response = self
            .client
            .get(url_str)
            .await
            .map_err(|e| FetchFailure::from_http(url_str, e))?;
        let http_status = response.status().as_u16();
        let headers = response.headers();
        let content_type = header_value(headers, CONTENT_TYPE.as_str());
        let suggested_filename = header_value(headers, CONTENT_DISPOSITION.as_str())
            .and_then(|value| parse_content_disposition(&value));

        if classify_content_type(content_type.as_deref()) == ContentClass::NonDocument {
            return Err(FetchFailure::TypeMismatch {
                url: url_str.to_string(),
                detail: format!(
                    "declared content type {} is not a document type",
                    content_type.as_deref().unwrap_or_default()
                ),
                declared: content_type,
            });
        }
        if let Some(declared) = response.content_length()
            && declared > self.max_bytes
        {
            return Err(FetchFailure::Oversize {
                url: url_str.to_string(),
                limit: self.max_bytes,
                observed: declared,
            });
        }

        let capacity = response
            .content_length()
            .and_then(|len| usize::try_from(len).ok())
            .unwrap_or(64 * 1024);
        let mut bytes = Vec::with_capacity(capacity);
        let mut hasher = Sha256::new();
        let mut received: u64 = 0;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| {
                FetchFailure::from_http(url_str, HttpError::from_transport(url_str, e))
            })?;
            received += chunk.len() as u64;
            if received > self.max_bytes {
                return Err(FetchFailure::Oversize {
                    url: url_str.to_string(),
                    limit: self.max_bytes,
                    observed: received,
                });
            }
            hasher.update(&chunk);
            bytes.extend_from_slice(&chunk);
        }

        if let Err(detail) = verify_pdf(&bytes, content_type.as_deref()) {
            return Err(FetchFailure::TypeMismatch {
                url: url_str.to_string(),
                declared: content_type,
                detail,
            });
        }

        Ok(FetchedDocument {
            size: received,
            sha256: format!("{:x}", hasher.finalize()),
            bytes,
            content_type,
            source_url: url.clone(),
            http_status,
            suggested_filename,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::model::{SearchTerm, SourceKind};

    fn fetcher(max_bytes: u64) -> DocumentFetcher {
        DocumentFetcher::new(
            HttpClient::new(),
            Arc::new(PolitenessLedger::for_tests()),
            RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5), 2.0)
                .without_jitter(),
            max_bytes,
        )
    }

    fn candidate(server: &MockServer, file: &str) -> CandidateUrl {
        CandidateUrl::new(
            Url::parse(&format!("{}/{file}", server.uri())).unwrap(),
            SourceKind::Api,
            "q",
            SearchTerm::new("c", "t"),
        )
    }

    const PDF: &[u8] = b"%PDF-1.7\n1 0 obj\n<<>>\nendobj\n%%EOF\n";

    #[tokio::test]
    async fn test_fetch_computes_sha256() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/doc.pdf"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Content-Type", "application/pdf")
                    .insert_header("Content-Disposition", "attachment; filename=\"Guide v2.pdf\"")
                    .set_body_bytes(PDF.to_vec()),
            )
            .mount(&server)
            .await;

        let document = fetcher(1024)
            .fetch(&candidate(&server, "doc.pdf"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(document.size, PDF.len() as u64);
        assert_eq!(document.sha256, format!("{:x}", Sha256::digest(PDF)));
        assert_eq!(document.suggested_filename.as_deref(), Some("Guide v2.pdf"));
        assert_eq!(document.http_status, 200);
    }

    #[tokio::test]
    async fn test_declared_length_over_limit_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Content-Type", "application/pdf")
                    .set_body_bytes(vec![b'x'; 4096]),
            )
            .expect(1)
            .mount(&server)
            .await;

        let failure = fetcher(1024)
            .fetch(&candidate(&server, "big.pdf"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(failure, FetchFailure::Oversize { limit: 1024, .. }));
        assert_eq!(failure.reason_code(), "oversize");
        assert_eq!(failure.manifest_status(), ManifestStatus::Error);
    }

    #[tokio::test]
    async fn test_html_login_page_is_type_mismatch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(b"<html>please log in</html>".to_vec(), "application/pdf"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let failure = fetcher(1024)
            .fetch(&candidate(&server, "a.pdf"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(failure.reason_code(), "type_mismatch");
        assert_eq!(failure.content_type(), Some("application/pdf"));
        assert!(matches!(
            failure,
            FetchFailure::TypeMismatch { ref detail, .. } if detail.contains("%PDF-")
        ));
    }

    #[tokio::test]
    async fn test_transient_status_retried_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(PDF.to_vec()))
            .mount(&server)
            .await;

        let document = fetcher(1024)
            .fetch(&candidate(&server, "a.pdf"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(document.bytes, PDF);
    }

    #[tokio::test]
    async fn test_not_found_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let failure = fetcher(1024)
            .fetch(&candidate(&server, "a.pdf"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(failure.http_status(), Some(404));
        assert_eq!(failure.reason_code(), "http_status");
    }

    #[tokio::test]
    async fn test_cancel_interrupts_slow_download() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(PDF.to_vec())
                    .set_delay(Duration::from_secs(30)),
            )
            .mount(&server)
            .await;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let failure = fetcher(1024)
            .fetch(&candidate(&server, "a.pdf"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(failure, FetchFailure::Cancelled { .. }));
        assert_eq!(failure.manifest_status(), ManifestStatus::Skipped);
    }
}
