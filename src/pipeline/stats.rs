//! Run counters and the serializable run summary.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

use crate::catalog::Catalog;
use crate::store::{ManifestRecord, ManifestStatus};

/// One document saved during the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SavedFile {
    /// Stored file name.
    pub filename: String,
    /// Full stored path.
    pub path: String,
    /// Source URL.
    pub url: String,
    /// Catalog category.
    pub category: String,
    /// Search term.
    pub search_term: String,
    /// Size in bytes.
    pub size: u64,
    /// Content fingerprint.
    pub sha256: String,
    /// When it was stored.
    pub timestamp: DateTime<Utc>,
}

/// End-of-run report, printed by the CLI and written to
/// `harvest_report.json`.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// Run start.
    pub started_at: DateTime<Utc>,
    /// When the summary was produced.
    pub generated_at: DateTime<Utc>,
    /// Whether the run was cancelled.
    pub cancelled: bool,
    /// Terms in the catalog.
    pub terms_total: usize,
    /// Terms whose discovery completed.
    pub terms_processed: usize,
    /// Unique candidates handed to workers.
    pub discovered: usize,
    /// Manifest rows with status `saved`.
    pub saved: usize,
    /// Manifest rows with status `rejected`.
    pub rejected: usize,
    /// Manifest rows with status `skipped`.
    pub skipped: usize,
    /// Manifest rows with status `error`.
    pub errors: usize,
    /// Non-fatal adapter errors.
    pub discovery_errors: usize,
    /// Same as `saved`; kept for report consumers that expect it.
    pub total_files: usize,
    /// Saved documents per category, in catalog order.
    #[serde(serialize_with = "serialize_pairs")]
    pub categories: Vec<(String, usize)>,
    /// Candidates per discovering adapter.
    pub discovered_by_source: BTreeMap<String, usize>,
    /// Manifest rows per reason code.
    pub reasons: BTreeMap<String, usize>,
    /// Every saved document.
    pub files: Vec<SavedFile>,
}

impl RunSummary {
    /// Manifest rows written (one per processed candidate).
    #[must_use]
    pub fn processed(&self) -> usize {
        self.saved + self.rejected + self.skipped + self.errors
    }
}

fn serialize_pairs<S: Serializer>(pairs: &[(String, usize)], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_map(pairs.iter().map(|(k, v)| (k, v)))
}

/// Thread-safe counters updated by workers.
#[derive(Debug, Default)]
pub(crate) struct RunStats {
    discovered: AtomicUsize,
    saved: AtomicUsize,
    rejected: AtomicUsize,
    skipped: AtomicUsize,
    errors: AtomicUsize,
    discovery_errors: AtomicUsize,
    terms_processed: AtomicUsize,
    by_source: Mutex<BTreeMap<String, usize>>,
    reasons: Mutex<BTreeMap<String, usize>>,
    files: Mutex<Vec<SavedFile>>,
}

impl RunStats {
    pub(crate) fn record_discovered(&self, source: &str) {
        self.discovered.fetch_add(1, Ordering::SeqCst);
        *self
            .by_source
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(source.to_string())
            .or_default() += 1;
    }

    pub(crate) fn record_discovery_error(&self) {
        self.discovery_errors.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_term_processed(&self) {
        self.terms_processed.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_row(&self, record: &ManifestRecord) {
        let counter = match record.status {
            ManifestStatus::Saved => &self.saved,
            ManifestStatus::Rejected => &self.rejected,
            ManifestStatus::Skipped => &self.skipped,
            ManifestStatus::Error => &self.errors,
        };
        counter.fetch_add(1, Ordering::SeqCst);
        *self
            .reasons
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(record.reason.clone())
            .or_default() += 1;
    }

    pub(crate) fn record_saved(&self, file: SavedFile) {
        self.files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(file);
    }

    pub(crate) fn summary(
        &self,
        started_at: DateTime<Utc>,
        catalog: &Catalog,
        cancelled: bool,
    ) -> RunSummary {
        let mut files = self
            .files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        files.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));

        let categories = catalog
            .category_names()
            .into_iter()
            .map(|name| {
                let count = files.iter().filter(|f| f.category == name).count();
                (name.to_string(), count)
            })
            .collect();

        let saved = self.saved.load(Ordering::SeqCst);
        RunSummary {
            started_at,
            generated_at: Utc::now(),
            cancelled,
            terms_total: catalog.term_count(),
            terms_processed: self.terms_processed.load(Ordering::SeqCst),
            discovered: self.discovered.load(Ordering::SeqCst),
            saved,
            rejected: self.rejected.load(Ordering::SeqCst),
            skipped: self.skipped.load(Ordering::SeqCst),
            errors: self.errors.load(Ordering::SeqCst),
            discovery_errors: self.discovery_errors.load(Ordering::SeqCst),
            total_files: saved,
            categories,
            discovered_by_source: self
                .by_source
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            reasons: self
                .reasons
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            files,
        }
    }
}
