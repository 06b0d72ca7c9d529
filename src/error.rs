//! Run-level errors that abort a harvest before or during setup.

use std::path::PathBuf;

use thiserror::Error;

use crate::catalog::CatalogError;
use crate::config::ConfigError;
use crate::http::HttpError;
use crate::store::StoreError;

/// Fatal harvest errors. Per-candidate failures never surface here; they end
/// up as manifest rows.
#[derive(Debug, Error)]
pub enum HarvestError {
    /// Configuration failed to load or validate.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Catalog failed to load.
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    /// Output directory could not be created.
    #[error("output directory {path} is not writable: {source}")]
    OutputDir {
        /// Output directory.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// HTTP client construction failed.
    #[error("failed to set up HTTP client: {0}")]
    Client(#[source] HttpError),

    /// Store or manifest could not be opened.
    #[error("failed to open document store: {0}")]
    Store(#[source] StoreError),

    /// A manifest row could not be written; the audit trail is incomplete.
    #[error("failed to write manifest row: {0}")]
    Manifest(#[source] StoreError),

    /// An adapter could not be configured.
    #[error("invalid source adapter setup: {reason}")]
    Adapter {
        /// What went wrong.
        reason: String,
    },
}

impl HarvestError {
    /// Whether the error stems from user-supplied settings.
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::Catalog(_) | Self::Adapter { .. }
        )
    }
}
