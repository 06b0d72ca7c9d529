//! Run configuration: JSON file with per-field defaults, then validation.
//!
//! Every field is optional in the file. CLI overrides are applied by the
//! binary before [`HarvestConfig::validate`] runs.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::discovery::{ApiCredentials, DEFAULT_API_BASE_URL};
use crate::eligibility::EligibilityOptions;
use crate::fetch::DEFAULT_MAX_DOCUMENT_BYTES;
use crate::http::{CONNECT_TIMEOUT_SECS, HttpClientOptions, READ_TIMEOUT_SECS};
use crate::model::EngineKind;
use crate::politeness::PolitenessOptions;
use crate::retry::{DEFAULT_MAX_RETRIES, RetryPolicy};
use crate::user_agent::{PRODUCT_TOKEN, default_user_agent};

/// Default candidates per term.
pub const DEFAULT_MAX_RESULTS_PER_TERM: usize = 10;

/// Default worker count.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Default global ceiling in requests per minute.
pub const DEFAULT_GLOBAL_REQUESTS_PER_MINUTE: u32 = 60;

/// Default spacing between requests to one domain, in seconds.
pub const DEFAULT_PER_DOMAIN_DELAY_SECONDS: f64 = 3.0;

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File could not be read.
    #[error("failed to read config {path}: {source}")]
    Io {
        /// Config path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Not valid JSON, or an unknown/mistyped field.
    #[error("invalid config file: {0}")]
    Parse(#[source] serde_json::Error),

    /// A value outside its allowed range.
    #[error("Invalid config value for `{field}`: {value}. Expected {expected}")]
    OutOfRange {
        /// Field name.
        field: &'static str,
        /// Offending value.
        value: String,
        /// Allowed values.
        expected: &'static str,
    },
}

impl ConfigError {
    fn out_of_range(field: &'static str, value: impl fmt::Display, expected: &'static str) -> Self {
        Self::OutOfRange {
            field,
            value: value.to_string(),
            expected,
        }
    }
}

/// Harvest settings.
#[derive(Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HarvestConfig {
    /// Candidates handed to workers per term.
    pub max_results_per_term: usize,
    /// Global request ceiling; 0 disables it.
    pub global_requests_per_minute: u32,
    /// Minimum spacing between requests to one domain.
    pub per_domain_delay_seconds: f64,
    /// Largest document accepted, in bytes.
    pub max_document_bytes: u64,
    /// When non-empty, only hosts under these suffixes are eligible.
    pub allowed_domain_suffixes: Vec<String>,
    /// Search API key (secret).
    pub search_api_key: Option<String>,
    /// Programmable search engine id.
    pub search_engine_id: Option<String>,
    /// Search API endpoint.
    pub search_api_base_url: String,
    /// Engines scraped for results, in order.
    pub engines: Vec<String>,
    /// Pages scanned one hop for PDF links.
    pub seed_urls: Vec<String>,
    /// Vendor domains treated like public-interest hosts. Empty unless
    /// configured.
    pub vendor_domains: Vec<String>,
    /// Concurrent candidate workers.
    pub concurrency: usize,
    /// Attempts per request, including the first.
    pub max_retries: u32,
    /// Stop discovering once this many candidates were dispatched.
    pub max_total_results: Option<usize>,
    /// TCP connect timeout in seconds.
    pub connect_timeout_secs: u64,
    /// Whole-request timeout in seconds.
    pub read_timeout_secs: u64,
    /// SQLite fingerprint database; in-memory index when absent.
    pub fingerprint_db: Option<PathBuf>,
    /// Host to address pins, bypassing DNS.
    pub host_overrides: BTreeMap<String, IpAddr>,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            max_results_per_term: DEFAULT_MAX_RESULTS_PER_TERM,
            global_requests_per_minute: DEFAULT_GLOBAL_REQUESTS_PER_MINUTE,
            per_domain_delay_seconds: DEFAULT_PER_DOMAIN_DELAY_SECONDS,
            max_document_bytes: DEFAULT_MAX_DOCUMENT_BYTES,
            allowed_domain_suffixes: Vec::new(),
            search_api_key: None,
            search_engine_id: None,
            search_api_base_url: DEFAULT_API_BASE_URL.to_string(),
            engines: vec![EngineKind::DuckDuckGo.name().to_string()],
            seed_urls: Vec::new(),
            vendor_domains: Vec::new(),
            concurrency: DEFAULT_CONCURRENCY,
            max_retries: DEFAULT_MAX_RETRIES,
            max_total_results: None,
            connect_timeout_secs: CONNECT_TIMEOUT_SECS,
            read_timeout_secs: READ_TIMEOUT_SECS,
            fingerprint_db: None,
            host_overrides: BTreeMap::new(),
        }
    }
}

impl fmt::Debug for HarvestConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HarvestConfig")
            .field("max_results_per_term", &self.max_results_per_term)
            .field("global_requests_per_minute", &self.global_requests_per_minute)
            .field("per_domain_delay_seconds", &self.per_domain_delay_seconds)
            .field("max_document_bytes", &self.max_document_bytes)
            .field("allowed_domain_suffixes", &self.allowed_domain_suffixes)
            .field(
                "search_api_key",
                &self.search_api_key.as_ref().map(|_| "<redacted>"),
            )
            .field("search_engine_id", &self.search_engine_id)
            .field("search_api_base_url", &self.search_api_base_url)
            .field("engines", &self.engines)
            .field("seed_urls", &self.seed_urls)
            .field("vendor_domains", &self.vendor_domains)
            .field("concurrency", &self.concurrency)
            .field("max_retries", &self.max_retries)
            .field("max_total_results", &self.max_total_results)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("read_timeout_secs", &self.read_timeout_secs)
            .field("fingerprint_db", &self.fingerprint_db)
            .field("host_overrides", &self.host_overrides)
            .finish()
    }
}

impl HarvestConfig {
    /// Parses a JSON config document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] on malformed JSON or unknown fields.
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(raw).map_err(ConfigError::Parse)
    }

    /// Reads a JSON config file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] on read failure, otherwise as
    /// [`HarvestConfig::from_json_str`].
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    /// Checks every value against its allowed range.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError::OutOfRange`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=1000).contains(&self.max_results_per_term) {
            return Err(ConfigError::out_of_range(
                "max_results_per_term",
                self.max_results_per_term,
                "range 1..=1000",
            ));
        }
        if self.global_requests_per_minute > 6000 {
            return Err(ConfigError::out_of_range(
                "global_requests_per_minute",
                self.global_requests_per_minute,
                "range 0..=6000",
            ));
        }
        if !self.per_domain_delay_seconds.is_finite()
            || !(0.0..=600.0).contains(&self.per_domain_delay_seconds)
        {
            return Err(ConfigError::out_of_range(
                "per_domain_delay_seconds",
                self.per_domain_delay_seconds,
                "range 0..=600",
            ));
        }
        if self.max_document_bytes == 0 || self.max_document_bytes > 2 * 1024 * 1024 * 1024 {
            return Err(ConfigError::out_of_range(
                "max_document_bytes",
                self.max_document_bytes,
                "range 1..=2147483648",
            ));
        }
        if !(1..=100).contains(&self.concurrency) {
            return Err(ConfigError::out_of_range(
                "concurrency",
                self.concurrency,
                "range 1..=100",
            ));
        }
        if !(1..=10).contains(&self.max_retries) {
            return Err(ConfigError::out_of_range(
                "max_retries",
                self.max_retries,
                "range 1..=10",
            ));
        }
        if self.max_total_results == Some(0) {
            return Err(ConfigError::out_of_range(
                "max_total_results",
                0,
                "a positive number or null",
            ));
        }
        validate_timeout_secs("connect_timeout_secs", self.connect_timeout_secs)?;
        validate_timeout_secs("read_timeout_secs", self.read_timeout_secs)?;

        if let Err(bad) = self.engine_kinds() {
            return Err(ConfigError::out_of_range(
                "engines",
                bad,
                "one of duckduckgo, bing, google, yahoo",
            ));
        }
        if let Err(bad) = self.parsed_seed_urls() {
            return Err(ConfigError::out_of_range(
                "seed_urls",
                bad,
                "absolute http(s) URLs",
            ));
        }
        if self.api_base_url().is_none() {
            return Err(ConfigError::out_of_range(
                "search_api_base_url",
                &self.search_api_base_url,
                "an absolute http(s) URL",
            ));
        }
        Ok(())
    }

    /// Engines to scrape, in configured order.
    ///
    /// # Errors
    ///
    /// Returns the first unrecognized engine name.
    pub fn engine_kinds(&self) -> Result<Vec<EngineKind>, String> {
        self.engines
            .iter()
            .map(|name| EngineKind::from_name(name).ok_or_else(|| name.clone()))
            .collect()
    }

    /// Seed URLs, parsed.
    ///
    /// # Errors
    ///
    /// Returns the first entry that is not an absolute http(s) URL.
    pub fn parsed_seed_urls(&self) -> Result<Vec<Url>, String> {
        self.seed_urls
            .iter()
            .map(|raw| parse_http_url(raw).ok_or_else(|| raw.clone()))
            .collect()
    }

    /// Search API endpoint, if it parses.
    #[must_use]
    pub fn api_base_url(&self) -> Option<Url> {
        parse_http_url(&self.search_api_base_url)
    }

    /// API credentials when both key and engine id are set and non-empty.
    #[must_use]
    pub fn api_credentials(&self) -> Option<ApiCredentials> {
        let api_key = self.search_api_key.as_deref()?.trim();
        let engine_id = self.search_engine_id.as_deref()?.trim();
        if api_key.is_empty() || engine_id.is_empty() {
            return None;
        }
        Some(ApiCredentials {
            api_key: api_key.to_string(),
            engine_id: engine_id.to_string(),
        })
    }

    /// HTTP client settings.
    #[must_use]
    pub fn http_options(&self) -> HttpClientOptions {
        HttpClientOptions {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            read_timeout: Duration::from_secs(self.read_timeout_secs),
            user_agent: default_user_agent(),
            host_overrides: self
                .host_overrides
                .iter()
                .map(|(host, addr)| (host.clone(), *addr))
                .collect(),
        }
    }

    /// Politeness ledger settings.
    #[must_use]
    pub fn politeness_options(&self) -> PolitenessOptions {
        PolitenessOptions {
            per_domain_delay: Duration::from_secs_f64(self.per_domain_delay_seconds.max(0.0)),
            global_requests_per_minute: self.global_requests_per_minute,
            product_token: PRODUCT_TOKEN.to_string(),
        }
    }

    /// Retry policy shared by every outbound request.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::with_max_attempts(self.max_retries)
    }

    /// Eligibility evaluator settings; suffixes are lowercased and stripped
    /// of leading dots.
    #[must_use]
    pub fn eligibility_options(&self) -> EligibilityOptions {
        EligibilityOptions {
            allowed_domain_suffixes: normalize_domains(&self.allowed_domain_suffixes),
            vendor_domains: normalize_domains(&self.vendor_domains),
            product_token: PRODUCT_TOKEN.to_string(),
        }
    }
}

fn validate_timeout_secs(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if !(1..=3600).contains(&value) {
        return Err(ConfigError::out_of_range(field, value, "range 1..=3600"));
    }
    Ok(())
}

fn parse_http_url(raw: &str) -> Option<Url> {
    let url = Url::parse(raw.trim()).ok()?;
    (matches!(url.scheme(), "http" | "https") && url.host_str().is_some()).then_some(url)
}

fn normalize_domains(domains: &[String]) -> Vec<String> {
    domains
        .iter()
        .map(|d| d.trim().trim_start_matches('.').to_ascii_lowercase())
        .filter(|d| !d.is_empty())
        .collect()
}
