//! Pipeline orchestrator: drives catalog terms through discovery,
//! eligibility, fetch and store.
//!
//! # Concurrency Model
//!
//! - Discovery runs on the caller's task, one term at a time, adapters in order
//! - Each unique candidate gets its own Tokio task once a semaphore permit is free
//! - Workers of earlier terms keep running while later terms are discovered
//! - Every candidate handed to a worker ends in exactly one manifest row
//!
//! # Example
//!
//! ```no_run
//! use harvester_core::{Catalog, HarvestConfig, Orchestrator};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = HarvestConfig::default();
//! let orchestrator = Orchestrator::from_config(&config, std::path::Path::new("harvest")).await?;
//! let summary = orchestrator.run(&Catalog::builtin()).await?;
//! println!("saved {} of {} candidates", summary.saved, summary.discovered);
//! # Ok(())
//! # }
//! ```

mod stats;

use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use futures_util::StreamExt;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use url::Url;

pub use stats::{RunSummary, SavedFile};

use crate::catalog::Catalog;
use crate::config::HarvestConfig;
use crate::discovery::{
    ApiAdapter, DiscoveryContext, DiscoveryRequest, EngineAdapter, SeedAdapter, SourceAdapter,
};
use crate::eligibility::{EligibilityEvaluator, ReasonCode};
use crate::error::HarvestError;
use crate::fetch::DocumentFetcher;
use crate::http::HttpClient;
use crate::model::{CandidateUrl, SearchTerm};
use crate::politeness::PolitenessLedger;
use crate::store::{
    CommitOutcome, DocumentStore, MANIFEST_FILE_NAME, ManifestRecord, ManifestStatus,
    ManifestWriter, StoreError,
};
use stats::RunStats;

/// Reason recorded for candidates stopped by cancellation.
pub const REASON_CANCELLED: &str = "cancelled";

/// Reason recorded when identical bytes were already stored.
pub const REASON_DUPLICATE: &str = "duplicate";

/// Reason recorded when the store failed to place a document.
pub const REASON_STORE_ERROR: &str = "store_error";

/// Reason recorded when a candidate's worker task panicked.
pub const REASON_WORKER_PANICKED: &str = "worker_panicked";

/// Progress callbacks. All methods default to no-ops.
pub trait RunObserver: Send + Sync {
    /// Called once before the first term.
    fn run_started(&self, _terms: usize) {}

    /// Called when discovery for a term begins.
    fn term_started(&self, _index: usize, _term: &SearchTerm) {}

    /// Called after a manifest row is written.
    fn candidate_finished(&self, _record: &ManifestRecord) {}
}

/// Observer that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentObserver;

impl RunObserver for SilentObserver {}

/// Run limits.
#[derive(Debug, Clone, Copy)]
struct RunLimits {
    max_results_per_term: usize,
    max_total_results: Option<usize>,
    concurrency: usize,
}

/// Everything a candidate worker needs.
struct Worker {
    evaluator: EligibilityEvaluator,
    fetcher: DocumentFetcher,
    store: DocumentStore,
    manifest: ManifestWriter,
    observer: Arc<dyn RunObserver>,
    cancel: CancellationToken,
    manifest_failure: Mutex<Option<StoreError>>,
}

/// Runs a harvest over a catalog.
pub struct Orchestrator {
    adapters: Vec<Box<dyn SourceAdapter>>,
    worker: Arc<Worker>,
    limits: RunLimits,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let adapters: Vec<&str> = self.adapters.iter().map(|a| a.name()).collect();
        f.debug_struct("Orchestrator")
            .field("adapters", &adapters)
            .field("limits", &self.limits)
            .field("store", &self.worker.store.root())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Builds the pipeline with the adapters `config` asks for: the search
    /// API when credentials are set, then each configured engine, then seeds.
    ///
    /// # Errors
    ///
    /// Returns [`HarvestError`] for invalid configuration, an unwritable
    /// output directory, or a store/manifest that cannot be opened.
    pub async fn from_config(config: &HarvestConfig, output_dir: &Path) -> Result<Self, HarvestError> {
        Self::with_adapters(config, output_dir, |ctx| default_adapters(config, ctx)).await
    }

    /// Builds the pipeline with caller-supplied adapters. `build` receives the
    /// shared client and ledger so adapters obey the same politeness state.
    ///
    /// # Errors
    ///
    /// As [`Orchestrator::from_config`], plus whatever `build` returns.
    #[instrument(skip(config, output_dir, build), fields(output_dir = %output_dir.display()))]
    pub async fn with_adapters<F>(
        config: &HarvestConfig,
        output_dir: &Path,
        build: F,
    ) -> Result<Self, HarvestError>
    where
        F: FnOnce(&DiscoveryContext) -> Result<Vec<Box<dyn SourceAdapter>>, HarvestError>,
    {
        config.validate()?;
        tokio::fs::create_dir_all(output_dir)
            .await
            .map_err(|source| HarvestError::OutputDir {
                path: output_dir.to_path_buf(),
                source,
            })?;

        let client = HttpClient::build(&config.http_options()).map_err(HarvestError::Client)?;
        let ledger = Arc::new(PolitenessLedger::new(
            client.clone(),
            &config.politeness_options(),
        ));
        let ctx = DiscoveryContext::new(client.clone(), Arc::clone(&ledger));
        let adapters = build(&ctx)?;

        let retry = config.retry_policy();
        let evaluator = EligibilityEvaluator::new(
            client.clone(),
            Arc::clone(&ledger),
            retry.clone(),
            config.eligibility_options(),
        );
        let fetcher = DocumentFetcher::new(client, ledger, retry, config.max_document_bytes);
        let store = DocumentStore::open(output_dir, config.fingerprint_db.as_deref())
            .await
            .map_err(HarvestError::Store)?;
        let manifest = ManifestWriter::open(&output_dir.join(MANIFEST_FILE_NAME))
            .await
            .map_err(HarvestError::Store)?;

        debug!(
            adapters = adapters.len(),
            concurrency = config.concurrency,
            "pipeline ready"
        );

        Ok(Self {
            adapters,
            worker: Arc::new(Worker {
                evaluator,
                fetcher,
                store,
                manifest,
                observer: Arc::new(SilentObserver),
                cancel: CancellationToken::new(),
                manifest_failure: Mutex::new(None),
            }),
            limits: RunLimits {
                max_results_per_term: config.max_results_per_term,
                max_total_results: config.max_total_results,
                concurrency: config.concurrency,
            },
        })
    }

    /// Installs a progress observer. Call before [`Orchestrator::run`].
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn RunObserver>) -> Self {
        if let Some(worker) = Arc::get_mut(&mut self.worker) {
            worker.observer = observer;
        }
        self
    }

    /// Token that cancels the run when triggered.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.worker.cancel.clone()
    }

    /// Names of the configured adapters, in drain order.
    #[must_use]
    pub fn adapter_names(&self) -> Vec<&str> {
        self.adapters.iter().map(|a| a.name()).collect()
    }

    /// Manifest location.
    #[must_use]
    pub fn manifest_path(&self) -> &Path {
        self.worker.manifest.path()
    }

    /// Processes every catalog term and waits for all workers.
    ///
    /// Candidate-level failures become manifest rows and never fail the run.
    ///
    /// # Errors
    ///
    /// Returns [`HarvestError::Manifest`] if a manifest row could not be
    /// written; the run is cancelled at that point.
    #[instrument(skip(self, catalog), fields(terms = catalog.term_count()))]
    pub async fn run(&self, catalog: &Catalog) -> Result<RunSummary, HarvestError> {
        let started_at = Utc::now();
        let cancel = &self.worker.cancel;
        let stats = Arc::new(RunStats::default());
        let semaphore = Arc::new(Semaphore::new(self.limits.concurrency));
        let mut handles: Vec<(CandidateUrl, JoinHandle<()>)> = Vec::new();
        let mut seen: HashSet<Url> = HashSet::new();
        let mut dispatched = 0usize;

        let terms = catalog.terms();
        self.worker.observer.run_started(terms.len());
        info!(terms = terms.len(), adapters = self.adapters.len(), "starting harvest");

        for (index, term) in terms.iter().enumerate() {
            if cancel.is_cancelled() || self.total_cap_reached(dispatched) {
                break;
            }
            self.worker.observer.term_started(index, term);
            info!(category = %term.category, term = %term.term, "discovering");

            let mut for_term = 0usize;
            for adapter in &self.adapters {
                if cancel.is_cancelled()
                    || for_term >= self.limits.max_results_per_term
                    || self.total_cap_reached(dispatched)
                {
                    break;
                }
                let request = DiscoveryRequest {
                    term,
                    limit: self.limits.max_results_per_term - for_term,
                    cancel,
                };
                let mut candidates = adapter.discover(request);

                loop {
                    let next = tokio::select! {
                        biased;
                        () = cancel.cancelled() => None,
                        next = candidates.next() => next,
                    };
                    let Some(next) = next else { break };

                    let candidate = match next {
                        Ok(candidate) => candidate,
                        Err(error) => {
                            warn!(source = adapter.name(), error = %error, "discovery error");
                            stats.record_discovery_error();
                            continue;
                        }
                    };
                    if !seen.insert(candidate.url.clone()) {
                        debug!(url = %candidate.url, "already processed in this run");
                        continue;
                    }

                    stats.record_discovered(adapter.name());
                    for_term += 1;
                    dispatched += 1;
                    if let Some(spawned) = self.dispatch(candidate, &semaphore, &stats).await {
                        handles.push(spawned);
                    }

                    if for_term >= self.limits.max_results_per_term
                        || self.total_cap_reached(dispatched)
                    {
                        break;
                    }
                }
            }

            if !cancel.is_cancelled() {
                stats.record_term_processed();
            }
            debug!(term = %term.term, candidates = for_term, "term discovery finished");
        }

        debug!(task_count = handles.len(), "waiting for workers");
        for (candidate, handle) in handles {
            self.join_worker(&candidate, handle, &stats).await;
        }

        let failure = self
            .worker
            .manifest_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(failure) = failure {
            return Err(HarvestError::Manifest(failure));
        }

        let summary = stats.summary(started_at, catalog, cancel.is_cancelled());
        info!(
            discovered = summary.discovered,
            saved = summary.saved,
            rejected = summary.rejected,
            skipped = summary.skipped,
            errors = summary.errors,
            cancelled = summary.cancelled,
            "harvest complete"
        );
        Ok(summary)
    }

    fn total_cap_reached(&self, dispatched: usize) -> bool {
        self.limits
            .max_total_results
            .is_some_and(|cap| dispatched >= cap)
    }

    /// Waits for a worker slot and spawns the candidate. Candidates still
    /// waiting when the run is cancelled get their `skipped` row inline.
    async fn dispatch(
        &self,
        candidate: CandidateUrl,
        semaphore: &Arc<Semaphore>,
        stats: &Arc<RunStats>,
    ) -> Option<(CandidateUrl, JoinHandle<()>)> {
        let cancel = &self.worker.cancel;
        let permit = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            permit = Arc::clone(semaphore).acquire_owned() => permit.ok(),
        };

        let Some(permit) = permit else {
            let record = Worker::row(&candidate, ManifestStatus::Skipped, REASON_CANCELLED);
            self.worker.finish(record, None, stats).await;
            return None;
        };

        let worker = Arc::clone(&self.worker);
        let stats = Arc::clone(stats);
        let task_candidate = candidate.clone();
        let handle = tokio::spawn(async move {
            let _permit = permit;
            let (record, saved) = worker.process(&task_candidate).await;
            worker.finish(record, saved, &stats).await;
        });
        Some((candidate, handle))
    }

    /// Awaits one worker. A panicked worker still gets an `error` row.
    async fn join_worker(
        &self,
        candidate: &CandidateUrl,
        handle: JoinHandle<()>,
        stats: &RunStats,
    ) {
        if let Err(e) = handle.await {
            warn!(url = %candidate.url, error = %e, "candidate worker panicked");
            let record = Worker::row(candidate, ManifestStatus::Error, REASON_WORKER_PANICKED);
            self.worker.finish(record, None, stats).await;
        }
    }
}

impl Worker {
    fn row(candidate: &CandidateUrl, status: ManifestStatus, reason: &str) -> ManifestRecord {
        let mut record = ManifestRecord::new(candidate.url.as_str(), status, reason);
        record.category.clone_from(&candidate.term.category);
        record.search_term.clone_from(&candidate.term.term);
        record.discovered_via = candidate.source.to_string();
        record
    }

    /// Evaluate, fetch, commit. Produces the candidate's single manifest row.
    #[instrument(skip(self, candidate), fields(url = %candidate.url))]
    async fn process(&self, candidate: &CandidateUrl) -> (ManifestRecord, Option<SavedFile>) {
        if self.cancel.is_cancelled() {
            return (
                Self::row(candidate, ManifestStatus::Skipped, REASON_CANCELLED),
                None,
            );
        }

        let verdict = self.evaluator.evaluate(candidate, &self.cancel).await;
        let mut record = Self::row(candidate, ManifestStatus::Rejected, verdict.reason.as_str());
        if let Some(headers) = &verdict.evidence.headers {
            record.http_status = (headers.status != 0).then_some(headers.status);
            record.content_type.clone_from(&headers.content_type);
        }
        if verdict.reason == ReasonCode::Cancelled {
            record.status = ManifestStatus::Skipped;
            return (record, None);
        }
        if !verdict.is_accept() {
            return (record, None);
        }

        let document = match self.fetcher.fetch(candidate, &self.cancel).await {
            Ok(document) => document,
            Err(failure) => {
                warn!(error = %failure, "fetch failed");
                record.status = failure.manifest_status();
                record.reason = failure.reason_code().to_string();
                record.http_status = failure.http_status().or(record.http_status);
                if let Some(declared) = failure.content_type() {
                    record.content_type = Some(declared.to_string());
                }
                return (record, None);
            }
        };

        record.http_status = Some(document.http_status);
        record.content_type.clone_from(&document.content_type);
        record.sha256.clone_from(&document.sha256);

        match self.store.commit(&document, &candidate.term.term).await {
            Ok(CommitOutcome::Stored(stored)) => {
                record.status = ManifestStatus::Saved;
                record.saved_path = stored.path.display().to_string();
                let saved = SavedFile {
                    filename: stored
                        .path
                        .file_name()
                        .map(|name| name.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                    path: record.saved_path.clone(),
                    url: stored.source_url.to_string(),
                    category: candidate.term.category.clone(),
                    search_term: candidate.term.term.clone(),
                    size: stored.size,
                    sha256: stored.sha256,
                    timestamp: record.timestamp,
                };
                (record, Some(saved))
            }
            Ok(CommitOutcome::Duplicate { existing, .. }) => {
                debug!(existing = %existing.display(), "duplicate content, not stored");
                record.status = ManifestStatus::Skipped;
                record.reason = REASON_DUPLICATE.to_string();
                (record, None)
            }
            Err(e) => {
                warn!(error = %e, "failed to store document");
                record.status = ManifestStatus::Error;
                record.reason = REASON_STORE_ERROR.to_string();
                (record, None)
            }
        }
    }

    /// Writes the manifest row and updates counters. A manifest write failure
    /// cancels the run.
    async fn finish(&self, record: ManifestRecord, saved: Option<SavedFile>, stats: &RunStats) {
        if let Err(e) = self.manifest.append(&record).await {
            error!(error = %e, url = %record.source_url, "manifest write failed, cancelling run");
            self.manifest_failure
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get_or_insert(e);
            self.cancel.cancel();
        }
        stats.record_row(&record);
        if let Some(saved) = saved {
            stats.record_saved(saved);
        }
        self.observer.candidate_finished(&record);
    }
}

/// Adapters for a configuration, in drain order.
fn default_adapters(
    config: &HarvestConfig,
    ctx: &DiscoveryContext,
) -> Result<Vec<Box<dyn SourceAdapter>>, HarvestError> {
    let mut adapters: Vec<Box<dyn SourceAdapter>> = Vec::new();

    if let Some(credentials) = config.api_credentials() {
        let base_url = config.api_base_url().ok_or_else(|| HarvestError::Adapter {
            reason: format!("bad search_api_base_url `{}`", config.search_api_base_url),
        })?;
        adapters.push(Box::new(ApiAdapter::new(ctx.clone(), credentials, base_url)));
    } else {
        debug!("search API credentials not set, API adapter disabled");
    }

    let engines = config.engine_kinds().map_err(|name| HarvestError::Adapter {
        reason: format!("unknown engine `{name}`"),
    })?;
    for engine in engines {
        let adapter = EngineAdapter::new(ctx.clone(), engine).map_err(|e| HarvestError::Adapter {
            reason: format!("engine {engine}: {e}"),
        })?;
        adapters.push(Box::new(adapter));
    }

    let seeds = config.parsed_seed_urls().map_err(|raw| HarvestError::Adapter {
        reason: format!("bad seed URL `{raw}`"),
    })?;
    if !seeds.is_empty() {
        adapters.push(Box::new(SeedAdapter::new(ctx.clone(), seeds)));
    }

    Ok(adapters)
}
