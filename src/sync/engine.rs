//! The sync cycle: repeated clone/pull/push against the remote.
//!
//! One cycle runs at a time per working copy, re-armed on a timer after
//! each attempt: a short interval after a clean cycle, a longer one after
//! any error. The cycle planner is pure so its decision table is testable
//! without a repository.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::Sender;
use git2::{Oid, Repository};
use tracing::{debug, info, warn};

use super::remote::{self, CredentialSource, PullOutcome, SyncError};
use super::status::{RepoStatus, SettledState, StatusCell};
use crate::config::RepoMetadata;

pub const CLEAN_INTERVAL: Duration = Duration::from_secs(5);
pub const ERROR_INTERVAL: Duration = Duration::from_secs(15);

/// What one sync cycle should do, decided before touching the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CyclePlan {
    /// Configuration is missing or unreadable: stop scheduling entirely.
    StopScheduling,
    /// A blocking operation is waiting for credentials: skip quietly.
    SkipAwaitingCredentials,
    /// The working directory is gone but a remote exists: clone fresh.
    CloneMissing,
    /// Normal cycle: pull, then push if allowed.
    PullThenPush { push: bool },
    /// No remote configured: nothing to sync.
    LocalOnly,
}

/// Decide the cycle. `meta` is `None` when the repository configuration
/// could not be read.
pub fn plan_cycle(
    meta: Option<&RepoMetadata>,
    status: &RepoStatus,
    workdir_exists: bool,
) -> CyclePlan {
    let Some(meta) = meta else {
        return CyclePlan::StopScheduling;
    };
    if !meta.author.as_ref().is_some_and(|a| a.is_valid()) {
        return CyclePlan::StopScheduling;
    }
    if status.is_awaiting_credentials() {
        return CyclePlan::SkipAwaitingCredentials;
    }
    if !workdir_exists {
        return if meta.remote.is_some() {
            CyclePlan::CloneMissing
        } else {
            // Missing working directory with no remote: fail loudly.
            CyclePlan::StopScheduling
        };
    }
    match &meta.remote {
        Some(remote) => CyclePlan::PullThenPush {
            push: remote.push_allowed,
        },
        None => CyclePlan::LocalOnly,
    }
}

/// Result of running one cycle.
pub enum CycleOutcome {
    /// Nothing left to schedule for this working copy.
    Stopped,
    /// Cycle finished; re-arm after `next`. If the pull moved HEAD the
    /// transition is carried so index maintenance can run.
    Done {
        next: Duration,
        head_moved: Option<(Option<Oid>, Oid)>,
    },
}

pub struct SyncEngine {
    workdir: PathBuf,
    branch: String,
    creds: Arc<dyn CredentialSource>,
    status: Arc<StatusCell>,
    consecutive_failures: u32,
    /// Last metadata read while the working directory still existed; the
    /// clone-after-deletion path has nothing else to go on.
    cached_meta: Option<RepoMetadata>,
}

impl SyncEngine {
    pub fn new(
        workdir: PathBuf,
        branch: String,
        creds: Arc<dyn CredentialSource>,
        status: Arc<StatusCell>,
    ) -> Self {
        SyncEngine {
            workdir,
            branch,
            creds,
            status,
            consecutive_failures: 0,
            cached_meta: None,
        }
    }

    /// Run one full cycle. `repo` is replaced when the cycle clones a
    /// missing working copy.
    pub fn run_cycle(&mut self, repo: &mut Option<Repository>) -> CycleOutcome {
        let meta = if self.workdir.exists() {
            match RepoMetadata::load(&self.workdir) {
                Ok(meta) => {
                    self.cached_meta = Some(meta.clone());
                    Some(meta)
                }
                Err(e) => {
                    warn!(error = %e, "repository configuration unreadable; sync stops");
                    None
                }
            }
        } else {
            self.cached_meta.clone()
        };
        let plan = plan_cycle(meta.as_ref(), &self.status.get(), self.workdir.exists());
        debug!(?plan, workdir = %self.workdir.display(), "sync cycle");

        match plan {
            CyclePlan::StopScheduling => CycleOutcome::Stopped,
            CyclePlan::SkipAwaitingCredentials => CycleOutcome::Done {
                next: CLEAN_INTERVAL,
                head_moved: None,
            },
            CyclePlan::LocalOnly => {
                self.consecutive_failures = 0;
                CycleOutcome::Done {
                    next: CLEAN_INTERVAL,
                    head_moved: None,
                }
            }
            CyclePlan::CloneMissing => {
                let meta = meta.expect("plan requires metadata");
                let remote = meta.remote.expect("plan requires a remote");
                match remote::clone_repo(
                    &remote.url,
                    &self.workdir,
                    Some(&self.branch),
                    Arc::clone(&self.creds),
                    Arc::clone(&self.status),
                ) {
                    Ok(cloned) => {
                        let state = remote::settled_state(&cloned, &self.branch);
                        *repo = Some(cloned);
                        self.finish_clean(state);
                        CycleOutcome::Done {
                            next: CLEAN_INTERVAL,
                            head_moved: None,
                        }
                    }
                    Err(e) => self.finish_failed(e),
                }
            }
            CyclePlan::PullThenPush { push } => {
                let meta = meta.expect("plan requires metadata");
                if meta.remote.is_none() {
                    return CycleOutcome::Done {
                        next: CLEAN_INTERVAL,
                        head_moved: None,
                    };
                }
                let Some(repo) = repo.as_ref() else {
                    warn!("working copy handle missing; skipping sync cycle");
                    return CycleOutcome::Done {
                        next: ERROR_INTERVAL,
                        head_moved: None,
                    };
                };
                if let Some(remote_cfg) = &meta.remote
                    && let Err(e) = remote::configure_remote(repo, &remote_cfg.url)
                {
                    return self.finish_failed(e);
                }

                let pulled = match remote::pull(
                    repo,
                    &self.branch,
                    Arc::clone(&self.creds),
                    Arc::clone(&self.status),
                ) {
                    Ok(outcome) => outcome,
                    Err(SyncError::AwaitingCredentials) => {
                        // Cooperative cancel: not a hard error, wait for
                        // credentials to appear.
                        return CycleOutcome::Done {
                            next: CLEAN_INTERVAL,
                            head_moved: None,
                        };
                    }
                    Err(e) => return self.finish_failed(e),
                };

                if push {
                    match remote::push(
                        repo,
                        &self.branch,
                        Arc::clone(&self.creds),
                        Arc::clone(&self.status),
                    ) {
                        // An empty push is a successful push.
                        Ok(()) | Err(SyncError::NothingToPush) => {}
                        Err(SyncError::AwaitingCredentials) => {
                            return CycleOutcome::Done {
                                next: CLEAN_INTERVAL,
                                head_moved: None,
                            };
                        }
                        Err(e) => return self.finish_failed(e),
                    }
                }

                let state = remote::settled_state(repo, &self.branch);
                self.finish_clean(state);
                let head_moved = match pulled {
                    PullOutcome::UpToDate => None,
                    PullOutcome::FastForwarded { from, to } => {
                        info!(from = ?from, %to, "pull advanced HEAD");
                        Some((from, to))
                    }
                };
                CycleOutcome::Done {
                    next: CLEAN_INTERVAL,
                    head_moved,
                }
            }
        }
    }

    fn finish_clean(&mut self, state: SettledState) {
        self.consecutive_failures = 0;
        self.status.set(RepoStatus::settled(state));
    }

    fn finish_failed(&mut self, error: SyncError) -> CycleOutcome {
        self.consecutive_failures += 1;
        warn!(
            error = %error,
            failures = self.consecutive_failures,
            retryable = error.transience().is_retryable(),
            "sync cycle failed"
        );
        let message = error.to_string();
        if !self.status.update_busy(|busy| busy.network_error = Some(message.clone())) {
            // Not mid-operation: surface the failure as a fresh busy state
            // so subscribers see the error.
            let mut busy =
                super::status::BusyState::new(super::status::BusyOperation::CheckingLocalChanges);
            busy.network_error = Some(message);
            self.status.set(RepoStatus::Busy { busy });
        }
        CycleOutcome::Done {
            next: ERROR_INTERVAL,
            head_moved: None,
        }
    }
}

/// One pending timer per working copy: arming cancels and replaces any
/// previous timer by bumping the generation; stale firings are ignored.
pub struct SyncTimer {
    tx: Sender<u64>,
    generation: u64,
    pending: Option<u64>,
}

impl SyncTimer {
    pub fn new(tx: Sender<u64>) -> Self {
        SyncTimer {
            tx,
            generation: 0,
            pending: None,
        }
    }

    pub fn arm(&mut self, delay: Duration) {
        self.generation += 1;
        let generation = self.generation;
        self.pending = Some(generation);
        let tx = self.tx.clone();
        std::thread::spawn(move || {
            std::thread::sleep(delay);
            // Receiver may be gone during shutdown.
            let _ = tx.send(generation);
        });
    }

    pub fn cancel(&mut self) {
        self.pending = None;
    }

    /// Whether a fired generation is the live one; consumes the pending
    /// slot when it is.
    pub fn accept(&mut self, generation: u64) -> bool {
        if self.pending == Some(generation) {
            self.pending = None;
            true
        } else {
            false
        }
    }
}
