//! Harvester Core Library
//!
//! Discovers candidate PDF documents for a catalog of search terms, vets each
//! candidate for crawl politeness and reuse rights, and archives the accepted
//! ones with a content-addressed file layout and an append-only manifest.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`politeness`] - Per-domain admission gate, robots.txt cache, global rate ceiling
//! - [`discovery`] - Search API, engine result-page and seed-page source adapters
//! - [`normalize`] - Redirect unwrapping and URL canonicalization
//! - [`eligibility`] - Robots, header probe, domain and license heuristics
//! - [`fetch`] - Bounded streaming download with PDF verification
//! - [`store`] - Fingerprint dedup, atomic file placement, manifest writer
//! - [`pipeline`] - Run orchestration over the catalog
//! - [`http`] / [`retry`] - Shared client plumbing and backoff policy

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod catalog;
pub mod config;
pub mod discovery;
pub mod eligibility;
pub mod error;
pub mod fetch;
pub mod http;
pub mod model;
pub mod normalize;
pub mod pipeline;
pub mod politeness;
pub mod retry;
pub mod store;
mod user_agent;

// Re-export commonly used types
pub use catalog::{Catalog, CatalogError};
pub use config::{ConfigError, HarvestConfig};
pub use discovery::{DiscoveryError, DiscoveryRequest, SourceAdapter};
pub use eligibility::{Decision, EligibilityEvaluator, EligibilityVerdict, ReasonCode};
pub use error::HarvestError;
pub use fetch::{DEFAULT_MAX_DOCUMENT_BYTES, DocumentFetcher, FetchFailure, FetchedDocument};
pub use http::{HttpClient, HttpClientOptions, HttpError};
pub use model::{CandidateUrl, EngineKind, SearchTerm, SourceKind};
pub use normalize::{NormalizeRejection, normalize, normalize_with_base};
pub use pipeline::{Orchestrator, RunObserver, RunSummary, SavedFile, SilentObserver};
pub use politeness::{DomainGrant, PolitenessLedger};
pub use retry::{FailureType, RetryDecision, RetryPolicy};
pub use store::{
    CommitOutcome, DocumentStore, ManifestRecord, ManifestStatus, ManifestWriter, StoreError,
    StoredDocument,
};
pub use user_agent::{PRODUCT_TOKEN, default_user_agent};
