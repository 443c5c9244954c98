//! Error types for the Tessera SDK.

use tessera_store::StoreError;
use thiserror::Error;

/// Error type for SDK operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SdkError {
    /// A remote read or write failed. Passed through unchanged.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// No node with this id exists in the tree.
    #[error("Target not found: {0}")]
    TargetNotFound(String),

    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    /// The tree or one of its nodes does not have the expected shape.
    #[error("Invalid tree: {0}")]
    InvalidTree(String),

    /// The change was saved and recorded on the session history, but its
    /// audit entry could not be appended.
    #[error("Saved change to {target_id}, but the audit entry failed: {source}")]
    NotLogged {
        target_id: String,
        #[source]
        source: StoreError,
    },
}

/// Result type for SDK operations.
pub type Result<T> = std::result::Result<T, SdkError>;
