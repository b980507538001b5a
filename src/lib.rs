#![forbid(unsafe_code)]

pub mod buffer;
pub mod changeset;
pub mod cli;
pub mod config;
pub mod dataset;
pub mod error;
pub mod index;
pub mod marshal;
pub mod migrate;
pub mod paths;
pub mod sync;
pub mod telemetry;
pub mod worker;

pub use error::{Error, Transience};
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the main surface at the crate root for convenience
pub use crate::buffer::ChangeStatus;
pub use crate::changeset::{
    BufferChange, BufferValue, Changeset, CommitOptions, CommitOutcome, Conflicts, ObjectChange,
    Prior,
};
pub use crate::config::{Author, DatasetMetadata, RemoteConfig, RepoMetadata};
pub use crate::dataset::Dataset;
pub use crate::index::{IndexProgress, IndexStatus, Predicate};
pub use crate::marshal::{Object, SerDesRegistry, SerDesRule};
pub use crate::migrate::{Migration, MigrationOutcome, VersionSpec};
pub use crate::sync::{CredentialSource, RepoStatus, SettledState};
pub use crate::worker::{OpenOptions, Registry, WorkerHandle};
