//! Sync engine: remote cycles, repo status, credential boundary.

mod engine;
mod remote;
mod status;

pub use engine::{
    CLEAN_INTERVAL, CycleOutcome, CyclePlan, ERROR_INTERVAL, SyncEngine, SyncTimer, plan_cycle,
};
pub use remote::{
    Credential, CredentialSource, DEFAULT_BRANCH, NoCredentials, PullOutcome, SyncError,
    clone_repo, configure_remote, is_user_canceled, pull, push, settled_state,
};
pub use status::{
    BusyOperation, BusyState, RepoStatus, SettledState, StatusCell, TransferProgress,
};
