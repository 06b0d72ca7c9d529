//! Append-only JSON Lines manifest, one row per processed candidate.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::instrument;

use super::StoreError;

/// Manifest file name inside the output directory.
pub const MANIFEST_FILE_NAME: &str = "manifest.jsonl";

/// Terminal state of a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManifestStatus {
    /// Fetched, verified and stored (or already stored under the same hash).
    Saved,
    /// Eligibility said no.
    Rejected,
    /// Not processed: duplicate content or cancelled.
    Skipped,
    /// Fetch or store failed.
    Error,
}

impl ManifestStatus {
    /// Stable name written to the manifest.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Saved => "saved",
            Self::Rejected => "rejected",
            Self::Skipped => "skipped",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ManifestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One manifest row. Field order is the on-disk column order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestRecord {
    /// When the row was written.
    pub timestamp: DateTime<Utc>,
    /// Candidate URL.
    pub source_url: String,
    /// Terminal state.
    pub status: ManifestStatus,
    /// Reason code (`public_interest_domain`, `oversize`, `duplicate`, ...).
    pub reason: String,
    /// HTTP status of the last relevant response.
    pub http_status: Option<u16>,
    /// Declared content type.
    pub content_type: Option<String>,
    /// Stored path; empty unless saved.
    pub saved_path: String,
    /// Content fingerprint; empty unless fetched.
    pub sha256: String,
    /// Catalog category of the term.
    pub category: String,
    /// Search term the candidate was discovered for.
    pub search_term: String,
    /// Discovering adapter (`api`, `engine:<name>`, `seed`).
    pub discovered_via: String,
}

impl ManifestRecord {
    /// A row stamped now with empty optional fields.
    pub fn new(
        source_url: impl Into<String>,
        status: ManifestStatus,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            source_url: source_url.into(),
            status,
            reason: reason.into(),
            http_status: None,
            content_type: None,
            saved_path: String::new(),
            sha256: String::new(),
            category: String::new(),
            search_term: String::new(),
            discovered_via: String::new(),
        }
    }
}

/// Serialized appender for `manifest.jsonl`.
#[derive(Debug)]
pub struct ManifestWriter {
    path: PathBuf,
    file: Mutex<File>,
}

impl ManifestWriter {
    /// Opens `path` for appending, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the file cannot be opened.
    #[instrument(skip(path), fields(path = %path.display()))]
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|source| StoreError::io(path, source))?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    /// Manifest location.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one row and flushes it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] on write failure.
    pub async fn append(&self, record: &ManifestRecord) -> Result<(), StoreError> {
        let mut line = serde_json::to_string(record).map_err(StoreError::Serialize)?;
        line.push('\n');
        let mut file = self.file.lock().await;
        file.write_all(line.as_bytes())
            .await
            .map_err(|source| StoreError::io(&self.path, source))?;
        file.flush()
            .await
            .map_err(|source| StoreError::io(&self.path, source))
    }
}

/// Reads every row of a manifest file.
///
/// # Errors
///
/// Returns [`StoreError::Io`] on read failure or [`StoreError::Serialize`]
/// on a malformed row.
pub async fn read_manifest(path: &Path) -> Result<Vec<ManifestRecord>, StoreError> {
    let file = File::open(path)
        .await
        .map_err(|source| StoreError::io(path, source))?;
    let mut lines = BufReader::new(file).lines();
    let mut records = Vec::new();
    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|source| StoreError::io(path, source))?
    {
        if line.trim().is_empty() {
            continue;
        }
        records.push(serde_json::from_str(&line).map_err(StoreError::Serialize)?);
    }
    Ok(records)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rows_keep_column_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(MANIFEST_FILE_NAME);
        let writer = ManifestWriter::open(&path).await.unwrap();

        let mut record = ManifestRecord::new(
            "https://docs.agency.gov/a.pdf",
            ManifestStatus::Saved,
            "public_interest_domain",
        );
        record.http_status = Some(200);
        writer.append(&record).await.unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        let keys: Vec<&str> = [
            "\"timestamp\"",
            "\"source_url\"",
            "\"status\"",
            "\"reason\"",
            "\"http_status\"",
            "\"content_type\"",
            "\"saved_path\"",
            "\"sha256\"",
        ]
        .to_vec();
        let positions: Vec<usize> = keys.iter().map(|k| raw.find(k).unwrap()).collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
        assert!(raw.contains("\"status\":\"saved\""));
        assert!(raw.ends_with('\n'));
    }

    #[tokio::test]
    async fn test_reopen_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(MANIFEST_FILE_NAME);
        for status in [ManifestStatus::Rejected, ManifestStatus::Error] {
            let writer = ManifestWriter::open(&path).await.unwrap();
            writer
                .append(&ManifestRecord::new("https://x.example.com/a.pdf", status, "r"))
                .await
                .unwrap();
        }

        let rows = read_manifest(&path).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].status, ManifestStatus::Rejected);
        assert_eq!(rows[1].status, ManifestStatus::Error);
    }
}
