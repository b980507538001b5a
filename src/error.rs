use thiserror::Error;

use crate::buffer::BufferError;
use crate::changeset::CommitError;
use crate::index::IndexError;
use crate::marshal::MarshalError;
use crate::migrate::MigrateError;
use crate::sync::SyncError;
use crate::worker::WorkerError;

/// Whether retrying this operation may succeed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    /// Retry will never help without changing inputs/state.
    Permanent,
    /// Retry may help (transient contention/outage).
    Retryable,
}

impl Transience {
    pub fn is_retryable(self) -> bool {
        matches!(self, Transience::Retryable)
    }
}

/// Crate-level convenience error.
///
/// Not a "god error": a thin wrapper over the per-subsystem errors.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error(transparent)]
    Marshal(#[from] MarshalError),

    #[error(transparent)]
    Commit(#[from] CommitError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Migrate(#[from] MigrateError),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error("invalid input: {0}")]
    Input(String),
}

impl Error {
    pub fn transience(&self) -> Transience {
        match self {
            Error::Buffer(_) | Error::Marshal(_) | Error::Commit(_) | Error::Index(_)
            | Error::Migrate(_) | Error::Input(_) => Transience::Permanent,
            Error::Sync(e) => e.transience(),
            Error::Worker(e) => e.transience(),
        }
    }
}
