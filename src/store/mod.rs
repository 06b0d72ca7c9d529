//! Dedup & persistence: fingerprint index, atomic file placement, manifest.
//!
//! # Example
//!
//! ```no_run
//! use harvester_core::store::{CommitOutcome, DocumentStore};
//! # use harvester_core::FetchedDocument;
//!
//! # async fn example(document: FetchedDocument) -> Result<(), Box<dyn std::error::Error>> {
//! let store = DocumentStore::open(std::path::Path::new("harvest"), None).await?;
//! match store.commit(&document, "cooling towers").await? {
//!     CommitOutcome::Stored(stored) => println!("saved {}", stored.path.display()),
//!     CommitOutcome::Duplicate { existing, .. } => println!("already have {}", existing.display()),
//! }
//! # Ok(())
//! # }
//! ```

mod filename;
mod index;
mod manifest;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};
use url::Url;

pub use filename::{HASH_PREFIX_LEN, parse_content_disposition, sanitize_filename, stored_filename};
pub use index::{FingerprintIndex, IndexEntry, IndexError, MemoryIndex, SqliteIndex};
pub use manifest::{
    MANIFEST_FILE_NAME, ManifestRecord, ManifestStatus, ManifestWriter, read_manifest,
};

use crate::fetch::FetchedDocument;

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem failure.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path being accessed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Fingerprint index failure.
    #[error(transparent)]
    Index(#[from] IndexError),

    /// Manifest row (de)serialization failure.
    #[error("manifest serialization failed: {0}")]
    Serialize(#[source] serde_json::Error),
}

impl StoreError {
    /// I/O error with path context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// A document placed in the output directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredDocument {
    /// Content fingerprint.
    pub sha256: String,
    /// Final path.
    pub path: PathBuf,
    /// Size in bytes.
    pub size: u64,
    /// URL it was fetched from.
    pub source_url: Url,
}

/// Result of [`DocumentStore::commit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Newly written.
    Stored(StoredDocument),
    /// Same content already stored.
    Duplicate {
        /// Shared fingerprint.
        sha256: String,
        /// Where the earlier copy lives.
        existing: PathBuf,
    },
}

/// Content-addressed document store rooted at the output directory.
#[derive(Debug)]
pub struct DocumentStore {
    root: PathBuf,
    index: Arc<dyn FingerprintIndex>,
    commit_lock: Mutex<()>,
}

impl DocumentStore {
    /// Opens the store, creating `root` if needed.
    ///
    /// With `fingerprint_db` the index lives in SQLite; otherwise it is kept
    /// in memory and warmed from the PDFs already in `root`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the directory cannot be created or scanned,
    /// or the database cannot be opened.
    #[instrument(skip(root, fingerprint_db), fields(root = %root.display()))]
    pub async fn open(root: &Path, fingerprint_db: Option<&Path>) -> Result<Self, StoreError> {
        tokio::fs::create_dir_all(root)
            .await
            .map_err(|source| StoreError::io(root, source))?;

        let index: Arc<dyn FingerprintIndex> = match fingerprint_db {
            Some(db_path) => Arc::new(SqliteIndex::open(db_path).await?),
            None => Arc::new(MemoryIndex::warm_from_dir(root).await?),
        };
        Ok(Self::with_index(root, index))
    }

    /// Store over an existing index. `root` must exist.
    #[must_use]
    pub fn with_index(root: &Path, index: Arc<dyn FingerprintIndex>) -> Self {
        Self {
            root: root.to_path_buf(),
            index,
            commit_lock: Mutex::new(()),
        }
    }

    /// Output directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of fingerprints known to the index.
    ///
    /// # Errors
    ///
    /// Propagates index failures.
    pub async fn fingerprint_count(&self) -> Result<usize, StoreError> {
        Ok(self.index.len().await?)
    }

    /// Stores `document` unless its fingerprint is already known.
    ///
    /// Lookup, write and insert happen under one lock, so two concurrent
    /// commits of identical bytes yield one `Stored` and one `Duplicate`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on write or index failure; no partial file is
    /// left behind.
    #[instrument(skip(self, document), fields(sha256 = %document.sha256, url = %document.source_url))]
    pub async fn commit(
        &self,
        document: &FetchedDocument,
        search_term: &str,
    ) -> Result<CommitOutcome, StoreError> {
        let _guard = self.commit_lock.lock().await;

        if let Some(existing) = self.index.lookup(&document.sha256).await? {
            debug!(existing = %existing.saved_path.display(), "duplicate content");
            return Ok(CommitOutcome::Duplicate {
                sha256: document.sha256.clone(),
                existing: existing.saved_path,
            });
        }

        let name = stored_filename(
            &document.sha256,
            &document.source_url,
            document.suggested_filename.as_deref(),
            search_term,
        );
        let path = self.root.join(&name);
        self.write_atomically(&path, &document.bytes).await?;

        self.index
            .insert(
                &document.sha256,
                IndexEntry {
                    saved_path: path.clone(),
                    source_url: document.source_url.to_string(),
                    size: document.size,
                },
            )
            .await?;

        info!(path = %path.display(), size = document.size, "stored document");
        Ok(CommitOutcome::Stored(StoredDocument {
            sha256: document.sha256.clone(),
            path,
            size: document.size,
            source_url: document.source_url.clone(),
        }))
    }

    /// Writes to a hidden temp file next to `path`, then renames it into place.
    async fn write_atomically(&self, path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp = self.root.join(format!(".{file_name}.part"));

        let result = async {
            let mut file = tokio::fs::File::create(&temp).await?;
            file.write_all(bytes).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&temp, path).await
        }
        .await;

        if let Err(source) = result {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(StoreError::io(path, source));
        }
        Ok(())
    }
}
