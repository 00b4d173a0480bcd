//! Error taxonomy for the storage engine.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::address::{AddressError, ContentAddress};

#[derive(Debug, Error)]
pub enum CasError {
    #[error("content not found: {0}")]
    NotFound(ContentAddress),

    #[error("reference not found: {0}")]
    ReferenceNotFound(String),

    /// Stored or supplied bytes do not hash to the address they claim.
    #[error("integrity violation at {address}: bytes hash to {actual}")]
    IntegrityViolation {
        address: ContentAddress,
        actual: ContentAddress,
    },

    /// The same root address was claimed by two different manifests.
    #[error("manifest conflict at {address}: an existing manifest differs")]
    ManifestConflict { address: ContentAddress },

    #[error("{0} is quarantined after a failed integrity check")]
    Quarantined(ContentAddress),

    #[error("storage I/O error ({context}): {source}")]
    StorageIo {
        context: String,
        #[source]
        source: io::Error,
    },

    /// A conditional reference update lost to another writer.
    #[error("reference {name} moved: expected {expected:?}, found {actual:?}")]
    ReferenceConflict {
        name: String,
        expected: Option<ContentAddress>,
        actual: Option<ContentAddress>,
    },

    #[error("invalid address: {0}")]
    InvalidAddress(#[from] AddressError),

    #[error("transform error: {0}")]
    Transform(String),

    #[error("encryption key not found: {0}")]
    KeyNotFound(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("CAS is in read-only mode")]
    ReadOnly,

    /// Another writable handle already owns the store directory.
    #[error("{} is locked by another open store", .0.display())]
    Locked(PathBuf),
}

impl CasError {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        CasError::StorageIo {
            context: context.into(),
            source,
        }
    }

    /// Only storage failures are worth retrying; everything else is deterministic.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CasError::StorageIo { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CasError::NotFound(_) | CasError::ReferenceNotFound(_))
    }

    /// Errors that mean stored data cannot be trusted.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self,
            CasError::IntegrityViolation { .. }
                | CasError::ManifestConflict { .. }
                | CasError::Quarantined(_)
        )
    }
}

/// Attach a context string to `std::io` results.
pub(crate) trait IoContext<T> {
    fn io_context(self, context: impl FnOnce() -> String) -> Result<T>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn io_context(self, context: impl FnOnce() -> String) -> Result<T> {
        self.map_err(|e| CasError::io(context(), e))
    }
}

pub type Result<T> = std::result::Result<T, CasError>;
