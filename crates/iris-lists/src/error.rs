use std::fmt::Display;

use thiserror::Error;

/// Failures of a persist hook. Any of these aborts the list mutation that
/// triggered it before memory or subscribers see anything.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The domain refused to let the entry go (e.g. still referenced).
    #[error("delete of {key} vetoed: {reason}")]
    Veto { key: String, reason: String },

    #[error("no stored entry {key} in {list}")]
    NotFound { list: String, key: String },

    #[error("store backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors surfaced to callers of list operations.
#[derive(Debug, Error)]
pub enum ListError {
    #[error("list {list} is empty")]
    Empty { list: String },

    #[error("no entry {key} in {list}")]
    NotFound { list: String, key: String },

    #[error("entry {key} already exists in {list}")]
    DuplicateKey { list: String, key: String },

    #[error("entry {key} in {list} cannot be deleted: {reason}")]
    NotDeletable {
        list: String,
        key: String,
        reason: String,
    },

    #[error("persist failed: {0}")]
    Store(#[from] StoreError),

    #[error("failed to spawn dispatcher for {list}: {source}")]
    WorkerSpawn {
        list: String,
        #[source]
        source: std::io::Error,
    },

    #[error("mirror of {list} needs a Tokio runtime: {source}")]
    NoRuntime {
        list: String,
        #[source]
        source: tokio::runtime::TryCurrentError,
    },
}

impl ListError {
    pub(crate) fn not_found(list: &str, key: impl Display) -> Self {
        Self::NotFound {
            list: list.to_string(),
            key: key.to_string(),
        }
    }

    /// Map a failed deletability check, turning a veto into `NotDeletable`.
    pub(crate) fn refused(list: &str, err: StoreError) -> Self {
        match err {
            StoreError::Veto { key, reason } => Self::NotDeletable {
                list: list.to_string(),
                key,
                reason,
            },
            other => Self::Store(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, ListError>;

/// Why a notification could not be handed to one subscriber.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("subscriber disconnected")]
    Disconnected,

    #[error("subscriber rejected event: {0}")]
    Rejected(String),
}
