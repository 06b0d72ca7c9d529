//! Fingerprint index: which SHA-256 digests are already stored, and where.
//!
//! The in-memory index is the default and warms itself from the PDFs already
//! present in the output directory. The SQLite index keeps fingerprints
//! across runs and output-directory cleanups.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// SQLite busy timeout in milliseconds.
const BUSY_TIMEOUT_MS: u32 = 5000;

/// Pool size; SQLite serializes writers anyway.
const DEFAULT_MAX_CONNECTIONS: u32 = 4;

/// Fingerprint index errors.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Database query or connection failure.
    #[error("fingerprint database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migration failure.
    #[error("fingerprint database migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Reading existing files while warming the index.
    #[error("failed to scan {path}: {source}")]
    Scan {
        /// Directory or file being read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// One indexed document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    /// Where the document was stored.
    pub saved_path: PathBuf,
    /// URL it was fetched from (empty for warmed entries).
    pub source_url: String,
    /// Size in bytes.
    pub size: u64,
}

/// Lookup/insert over stored fingerprints.
///
/// Callers serialize lookup + insert themselves; implementations only need
/// to be individually atomic.
#[async_trait]
pub trait FingerprintIndex: Send + Sync + std::fmt::Debug {
    /// Existing entry for `sha256`, if any.
    async fn lookup(&self, sha256: &str) -> Result<Option<IndexEntry>, IndexError>;

    /// Records a newly stored document.
    async fn insert(&self, sha256: &str, entry: IndexEntry) -> Result<(), IndexError>;

    /// Number of fingerprints known.
    async fn len(&self) -> Result<usize, IndexError>;
}

/// Process-local index.
#[derive(Debug, Default)]
pub struct MemoryIndex {
    entries: tokio::sync::RwLock<HashMap<String, IndexEntry>>,
}

impl MemoryIndex {
    /// Empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Index seeded with every `*.pdf` file directly inside `dir`.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::Scan`] when the directory cannot be listed.
    /// Unreadable individual files are skipped with a warning.
    #[instrument(skip(dir), fields(dir = %dir.display()))]
    pub async fn warm_from_dir(dir: &Path) -> Result<Self, IndexError> {
        let mut entries = HashMap::new();
        let mut listing = tokio::fs::read_dir(dir).await.map_err(|source| IndexError::Scan {
            path: dir.to_path_buf(),
            source,
        })?;

        while let Some(item) = listing.next_entry().await.map_err(|source| IndexError::Scan {
            path: dir.to_path_buf(),
            source,
        })? {
            let path = item.path();
            let is_pdf = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"));
            if !is_pdf || !item.file_type().await.is_ok_and(|t| t.is_file()) {
                continue;
            }
            match tokio::fs::read(&path).await {
                Ok(bytes) => {
                    let sha256 = format!("{:x}", Sha256::digest(&bytes));
                    entries.entry(sha256).or_insert(IndexEntry {
                        saved_path: path,
                        source_url: String::new(),
                        size: bytes.len() as u64,
                    });
                }
                Err(error) => warn!(path = %path.display(), error = %error, "skipping unreadable file"),
            }
        }

        debug!(count = entries.len(), "warmed fingerprint index");
        Ok(Self {
            entries: tokio::sync::RwLock::new(entries),
        })
    }
}

#[async_trait]
impl FingerprintIndex for MemoryIndex {
    async fn lookup(&self, sha256: &str) -> Result<Option<IndexEntry>, IndexError> {
        Ok(self.entries.read().await.get(sha256).cloned())
    }

    async fn insert(&self, sha256: &str, entry: IndexEntry) -> Result<(), IndexError> {
        self.entries.write().await.insert(sha256.to_string(), entry);
        Ok(())
    }

    async fn len(&self) -> Result<usize, IndexError> {
        Ok(self.entries.read().await.len())
    }
}

/// SQLite-backed index (WAL mode, migrations applied on open).
#[derive(Debug, Clone)]
pub struct SqliteIndex {
    pool: SqlitePool,
}

impl SqliteIndex {
    /// Opens or creates the database at `db_path`.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::Database`] if the connection fails, or
    /// [`IndexError::Migration`] if migrations fail.
    #[instrument(skip(db_path), fields(path = %db_path.display()))]
    pub async fn open(db_path: &Path) -> Result<Self, IndexError> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(DEFAULT_MAX_CONNECTIONS)
            .connect(&db_url)
            .await?;

        sqlx::query("PRAGMA journal_mode=WAL").execute(&pool).await?;
        sqlx::query(&format!("PRAGMA busy_timeout={BUSY_TIMEOUT_MS}"))
            .execute(&pool)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// In-memory database, for tests.
    ///
    /// # Errors
    ///
    /// Same as [`SqliteIndex::open`].
    pub async fn open_in_memory() -> Result<Self, IndexError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    /// Closes the pool.
    pub async fn close(self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl FingerprintIndex for SqliteIndex {
    async fn lookup(&self, sha256: &str) -> Result<Option<IndexEntry>, IndexError> {
        let row = sqlx::query(
            "SELECT saved_path, source_url, size_bytes FROM fingerprints WHERE sha256 = ?",
        )
        .bind(sha256)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| {
            let saved_path: String = row.get("saved_path");
            let size: i64 = row.get("size_bytes");
            IndexEntry {
                saved_path: PathBuf::from(saved_path),
                source_url: row.get("source_url"),
                size: u64::try_from(size).unwrap_or_default(),
            }
        }))
    }

    async fn insert(&self, sha256: &str, entry: IndexEntry) -> Result<(), IndexError> {
        sqlx::query(
            "INSERT OR IGNORE INTO fingerprints (sha256, saved_path, source_url, size_bytes) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(sha256)
        .bind(entry.saved_path.to_string_lossy().into_owned())
        .bind(entry.source_url)
        .bind(i64::try_from(entry.size).unwrap_or(i64::MAX))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn len(&self) -> Result<usize, IndexError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM fingerprints")
            .fetch_one(&self.pool)
            .await?;
        Ok(usize::try_from(count).unwrap_or_default())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn entry(path: &str) -> IndexEntry {
        IndexEntry {
            saved_path: PathBuf::from(path),
            source_url: "https://docs.agency.gov/a.pdf".to_string(),
            size: 42,
        }
    }

    #[tokio::test]
    async fn test_memory_index_lookup_after_insert() {
        let index = MemoryIndex::new();
        assert!(index.lookup("abc").await.unwrap().is_none());
        index.insert("abc", entry("out/a.pdf")).await.unwrap();
        assert_eq!(index.lookup("abc").await.unwrap(), Some(entry("out/a.pdf")));
        assert_eq!(index.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_warm_from_dir_hashes_existing_pdfs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("one.pdf"), b"%PDF-1.4 one").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();
        std::fs::create_dir(dir.path().join("nested.pdf")).unwrap();

        let index = MemoryIndex::warm_from_dir(dir.path()).await.unwrap();
        assert_eq!(index.len().await.unwrap(), 1);
        let digest = format!("{:x}", Sha256::digest(b"%PDF-1.4 one"));
        let found = index.lookup(&digest).await.unwrap().unwrap();
        assert_eq!(found.saved_path, dir.path().join("one.pdf"));
        assert_eq!(found.size, 12);
    }

    #[tokio::test]
    async fn test_sqlite_index_round_trip() {
        let index = SqliteIndex::open_in_memory().await.unwrap();
        index.insert("abc", entry("out/a.pdf")).await.unwrap();
        index.insert("abc", entry("out/other.pdf")).await.unwrap();
        assert_eq!(index.lookup("abc").await.unwrap(), Some(entry("out/a.pdf")));
        assert_eq!(index.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_sqlite_index_persists_across_opens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fingerprints.db");
        let index = SqliteIndex::open(&path).await.unwrap();
        index.insert("feed", entry("out/f.pdf")).await.unwrap();
        index.close().await;

        let reopened = SqliteIndex::open(&path).await.unwrap();
        assert!(reopened.lookup("feed").await.unwrap().is_some());
    }
}
