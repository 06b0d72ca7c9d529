//! HTTP client wrapper shared by discovery, probing and fetching.
//!
//! This module provides the `HttpClient` struct which owns one pooled
//! `reqwest` client configured with the harvester's timeouts, identifying
//! User-Agent and optional DNS host overrides.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::{HeaderMap, RANGE, RETRY_AFTER};
use reqwest::{Client, Response};
use tracing::{debug, instrument};

use super::error::HttpError;
use crate::user_agent;

/// Default connect timeout (seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default whole-request timeout (seconds), sized for large documents.
pub const READ_TIMEOUT_SECS: u64 = 300;

/// Construction options for [`HttpClient`].
#[derive(Debug, Clone)]
pub struct HttpClientOptions {
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Whole-request timeout.
    pub read_timeout: Duration,
    /// User-Agent sent with every request.
    pub user_agent: String,
    /// Hosts pinned to fixed addresses instead of DNS.
    pub host_overrides: Vec<(String, IpAddr)>,
}

impl Default for HttpClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            read_timeout: Duration::from_secs(READ_TIMEOUT_SECS),
            user_agent: user_agent::default_user_agent(),
            host_overrides: Vec::new(),
        }
    }
}

/// Pooled HTTP client. Cheap to clone.
///
/// # Example
///
/// ```no_run
/// use harvester_core::HttpClient;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = HttpClient::new();
/// let page = client.get_text("https://example.gov/manuals/", 1 << 20).await?;
/// println!("{} bytes of HTML", page.len());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient {
    /// Creates a client with default timeouts and User-Agent.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client builder fails with the static default
    /// configuration. This should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn new() -> Self {
        Self::build(&HttpClientOptions::default())
            .expect("failed to build HTTP client with static configuration")
    }

    /// Creates a client from explicit options.
    ///
    /// # Errors
    ///
    /// Returns [`HttpError::Build`] if reqwest rejects the configuration.
    #[instrument(skip(options), fields(overrides = options.host_overrides.len()))]
    pub fn build(options: &HttpClientOptions) -> Result<Self, HttpError> {
        let mut builder = Client::builder()
            .connect_timeout(options.connect_timeout)
            .timeout(options.read_timeout)
            .gzip(true)
            .user_agent(options.user_agent.clone());
        for (host, ip) in &options.host_overrides {
            // Port 0 keeps whatever port the request URL names.
            builder = builder.resolve(host, SocketAddr::new(*ip, 0));
            debug!(host = %host, ip = %ip, "pinned host to fixed address");
        }
        let client = builder
            .build()
            .map_err(|source| HttpError::Build { source })?;
        Ok(Self { client })
    }

    /// Sends a HEAD request. Any HTTP status is returned as `Ok`.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` or `Network` on transport failure.
    pub async fn head(&self, url: &str) -> Result<Response, HttpError> {
        self.client
            .head(url)
            .send()
            .await
            .map_err(|e| HttpError::from_transport(url, e))
    }

    /// Sends a GET request and fails on non-success statuses.
    ///
    /// # Errors
    ///
    /// Returns `HttpStatus` (with any Retry-After value) for non-2xx
    /// responses, or `Timeout` / `Network` on transport failure.
    pub async fn get(&self, url: &str) -> Result<Response, HttpError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| HttpError::from_transport(url, e))?;
        ensure_success(url, response)
    }

    /// Sends a GET asking for only the first `limit` bytes. Any HTTP status
    /// is returned as `Ok`; servers that ignore `Range` answer 200.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` or `Network` on transport failure.
    pub async fn get_range(&self, url: &str, limit: usize) -> Result<Response, HttpError> {
        let last = limit.saturating_sub(1);
        self.client
            .get(url)
            .header(RANGE, format!("bytes=0-{last}"))
            .send()
            .await
            .map_err(|e| HttpError::from_transport(url, e))
    }

    /// GETs a page and returns at most `limit` bytes of it as text.
    ///
    /// # Errors
    ///
    /// See [`HttpClient::get`]; body read failures map to `Network`.
    pub async fn get_text(&self, url: &str, limit: usize) -> Result<String, HttpError> {
        let response = self.get(url).await?;
        let bytes = read_prefix(url, response, limit).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Returns a reference to the underlying reqwest client.
    #[must_use]
    pub fn inner(&self) -> &Client {
        &self.client
    }
}

/// Converts a non-success response into [`HttpError::HttpStatus`].
///
/// # Errors
///
/// Returns `HttpStatus` when the status is not 2xx.
pub fn ensure_success(url: &str, response: Response) -> Result<Response, HttpError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let retry_after = header_value(response.headers(), RETRY_AFTER.as_str());
    Err(HttpError::http_status_with_retry_after(
        url,
        response.status().as_u16(),
        retry_after,
    ))
}

/// Reads at most `limit` bytes of a response body, dropping the rest.
///
/// # Errors
///
/// Returns `Timeout` or `Network` if the body stream fails.
pub async fn read_prefix(
    url: &str,
    response: Response,
    limit: usize,
) -> Result<Vec<u8>, HttpError> {
    let mut stream = response.bytes_stream();
    let mut buffer = Vec::with_capacity(limit.min(64 * 1024));
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| HttpError::from_transport(url, e))?;
        let room = limit - buffer.len();
        if chunk.len() >= room {
            buffer.extend_from_slice(&chunk[..room]);
            break;
        }
        buffer.extend_from_slice(&chunk);
    }
    Ok(buffer)
}

/// Returns a header as an owned string when present and valid ASCII.
#[must_use]
pub fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::net::Ipv4Addr;

    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    #[tokio::test]
    async fn test_get_text_truncates_to_limit() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/page"))
            .respond_with(ResponseTemplate::new(200).set_body_string("abcdefghij"))
            .mount(&server)
            .await;

        let client = HttpClient::new();
        let text = client
            .get_text(&format!("{}/page", server.uri()), 4)
            .await
            .unwrap();
        assert_eq!(text, "abcd");
    }

    #[tokio::test]
    async fn test_get_maps_status_and_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/busy"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "7"))
            .mount(&server)
            .await;

        let client = HttpClient::new();
        let error = client
            .get(&format!("{}/busy", server.uri()))
            .await
            .unwrap_err();
        assert_eq!(error.status(), Some(429));
        assert_eq!(error.retry_after(), Some("7"));
    }

    #[tokio::test]
    async fn test_head_returns_non_success_responses() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/doc.pdf"))
            .respond_with(ResponseTemplate::new(405))
            .mount(&server)
            .await;

        let client = HttpClient::new();
        let response = client
            .head(&format!("{}/doc.pdf", server.uri()))
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 405);
    }

    #[tokio::test]
    async fn test_get_range_sends_range_header() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/doc.pdf"))
            .and(header("range", "bytes=0-15"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(b"%PDF-1.7 partial".to_vec()))
            .mount(&server)
            .await;

        let client = HttpClient::new();
        let response = client
            .get_range(&format!("{}/doc.pdf", server.uri()), 16)
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 206);
    }

    #[tokio::test]
    async fn test_host_override_routes_named_host_to_mock() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/hello"))
            .respond_with(ResponseTemplate::new(200).set_body_string("pinned"))
            .mount(&server)
            .await;

        let options = HttpClientOptions {
            host_overrides: vec![(
                "docs.agency.gov".to_string(),
                IpAddr::V4(Ipv4Addr::LOCALHOST),
            )],
            ..HttpClientOptions::default()
        };
        let client = HttpClient::build(&options).unwrap();
        let port = server.address().port();
        let text = client
            .get_text(&format!("http://docs.agency.gov:{port}/hello"), 1024)
            .await
            .unwrap();
        assert_eq!(text, "pinned");
    }

    #[tokio::test]
    async fn test_connection_refused_is_network_error() {
        let client = HttpClient::new();
        let error = client.get("http://127.0.0.1:1/nothing").await.unwrap_err();
        assert!(matches!(error, HttpError::Network { .. }));
    }
}
