use std::path::PathBuf;

use crate::seed::SeedError;
use crate::store::NodeId;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("node `{0}` not found")]
    NotFound(NodeId),
    #[error("node `{0}` already exists")]
    Conflict(NodeId),
    #[error("store failed sanity check: {0}")]
    Corrupt(String),
    #[error("store schema version {0} is newer than this build understands")]
    UnsupportedSchema(i64),
    #[error("batch rolled back: {0}")]
    TransactionFailure(#[source] Box<StoreError>),
    #[error("seed failed: {0}")]
    Seed(#[from] SeedError),
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Stable short name used in CLI error payloads.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Corrupt(_) => "store_corrupt",
            Self::UnsupportedSchema(_) => "unsupported_schema",
            Self::TransactionFailure(_) => "transaction_failed",
            Self::Seed(_) => "seed_error",
            Self::Sqlite(_) => "sqlite_error",
            Self::Io(_) => "io_error",
        }
    }

    /// The file itself is damaged, so discarding it and rebuilding from the
    /// seed tables is the only way forward. Every other failure leaves the
    /// file alone.
    pub fn is_damage(&self) -> bool {
        match self {
            Self::Corrupt(_) => true,
            Self::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::NotADatabase | rusqlite::ErrorCode::DatabaseCorrupt
            ),
            Self::TransactionFailure(inner) => inner.is_damage(),
            _ => false,
        }
    }
}

/// The store could not be brought to a healthy state, even after a rebuild.
#[derive(Debug, thiserror::Error)]
#[error("store at `{}` is unusable: {cause}", .path.display())]
pub struct FatalError {
    pub path: PathBuf,
    #[source]
    pub cause: StoreError,
}
