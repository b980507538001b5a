//! Remote operations: clone, fast-forward pull, push.
//!
//! Credentials come from a [`CredentialSource`] through git2's callback
//! chain (ssh agent first, then stored credentials). A missing credential
//! aborts the transfer with a user-cancel error the engine can translate
//! into "awaiting credentials" instead of a hard failure.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use git2::{ErrorClass, ErrorCode, Oid, Repository};
use thiserror::Error;
use tracing::{debug, info};

use super::status::{BusyOperation, RepoStatus, SettledState, StatusCell, TransferProgress};
use crate::config::ConfigError;
use crate::error::Transience;

pub const DEFAULT_BRANCH: &str = "main";
const REMOTE_NAME: &str = "origin";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

/// External credential store boundary: lookup by remote URL with hostname
/// fallback, write-back on success.
pub trait CredentialSource: Send + Sync {
    fn get_auth(&self, remote_url: &str, username: Option<&str>) -> Option<Credential>;
    fn save_auth(&self, remote_url: &str, username: &str, password: &str);
}

/// A source with no credentials; every prompt is a cancel.
pub struct NoCredentials;

impl CredentialSource for NoCredentials {
    fn get_auth(&self, _remote_url: &str, _username: Option<&str>) -> Option<Credential> {
        None
    }

    fn save_auth(&self, _remote_url: &str, _username: &str, _password: &str) {}
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("failed to open repository at {0}: {1}")]
    OpenRepo(PathBuf, #[source] git2::Error),

    #[error("no remote configured")]
    MissingRemote,

    #[error("failed to clone {url}: {source}")]
    Clone {
        url: String,
        #[source]
        source: git2::Error,
    },

    #[error("failed to fetch from remote: {0}")]
    Fetch(#[source] git2::Error),

    #[error("local and remote histories diverged; fast-forward not possible")]
    Diverged,

    #[error("failed to push: {0}")]
    Push(#[source] git2::Error),

    #[error("push rejected: {message}")]
    PushRejected { message: String },

    #[error("nothing to push")]
    NothingToPush,

    #[error("operation awaiting credentials")]
    AwaitingCredentials,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("git operation failed: {0}")]
    Git(#[from] git2::Error),
}

impl SyncError {
    /// Whether the sync scheduler should expect a retry to help.
    pub fn transience(&self) -> Transience {
        match self {
            SyncError::Clone { .. }
            | SyncError::Fetch(_)
            | SyncError::Push(_)
            | SyncError::PushRejected { .. }
            | SyncError::NothingToPush
            | SyncError::AwaitingCredentials => Transience::Retryable,

            SyncError::OpenRepo(_, _)
            | SyncError::MissingRemote
            | SyncError::Diverged
            | SyncError::Config(_)
            | SyncError::Git(_) => Transience::Permanent,
        }
    }
}

/// Whether an underlying git error came from our credential callback
/// giving up, which is the cooperative cancellation signal.
pub fn is_user_canceled(error: &git2::Error) -> bool {
    error.code() == ErrorCode::User
}

/// Outcome of a fast-forward pull.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullOutcome {
    UpToDate,
    FastForwarded { from: Option<Oid>, to: Oid },
}

/// Tracks the credential handed to libgit2 so it can be saved on success.
struct AuthSession {
    creds: Arc<dyn CredentialSource>,
    status: Arc<StatusCell>,
    used: Arc<Mutex<Option<Credential>>>,
}

impl AuthSession {
    fn new(creds: Arc<dyn CredentialSource>, status: Arc<StatusCell>) -> Self {
        AuthSession {
            creds,
            status,
            used: Arc::new(Mutex::new(None)),
        }
    }

    fn callbacks(&self) -> git2::RemoteCallbacks<'static> {
        let creds = Arc::clone(&self.creds);
        let status = Arc::clone(&self.status);
        let used = Arc::clone(&self.used);
        let progress_status = Arc::clone(&self.status);

        let mut callbacks = git2::RemoteCallbacks::new();
        callbacks.credentials(move |url, username_from_url, allowed| {
            if allowed.is_ssh_key()
                && let Some(user) = username_from_url
            {
                return git2::Cred::ssh_key_from_agent(user);
            }
            if allowed.is_user_pass_plaintext()
                && let Some(cred) = creds.get_auth(url, username_from_url)
            {
                *used.lock().expect("auth lock poisoned") = Some(cred.clone());
                return git2::Cred::userpass_plaintext(&cred.username, &cred.password);
            }
            status.update_busy(|busy| busy.awaiting_password = Some(true));
            Err(git2::Error::new(
                ErrorCode::User,
                ErrorClass::Callback,
                "credentials unavailable",
            ))
        });
        callbacks.transfer_progress(move |stats| {
            progress_status.update_busy(|busy| {
                busy.progress = Some(TransferProgress {
                    loaded: stats.received_objects(),
                    total: stats.total_objects(),
                });
            });
            true
        });
        callbacks
    }

    /// Persist the credential that carried a successful transfer.
    fn save_on_success(&self, remote_url: &str) {
        if let Some(cred) = self.used.lock().expect("auth lock poisoned").take() {
            self.creds
                .save_auth(remote_url, &cred.username, &cred.password);
        }
    }
}

/// Clone `url` into `into`, reporting progress through the status cell.
pub fn clone_repo(
    url: &str,
    into: &Path,
    branch: Option<&str>,
    creds: Arc<dyn CredentialSource>,
    status: Arc<StatusCell>,
) -> Result<Repository, SyncError> {
    status.set(RepoStatus::busy(BusyOperation::Cloning));
    let session = AuthSession::new(creds, status);

    let mut fetch_options = git2::FetchOptions::new();
    fetch_options.remote_callbacks(session.callbacks());
    let mut builder = git2::build::RepoBuilder::new();
    builder.fetch_options(fetch_options);
    if let Some(branch) = branch {
        builder.branch(branch);
    }

    let repo = builder.clone(url, into).map_err(|e| {
        if is_user_canceled(&e) {
            SyncError::AwaitingCredentials
        } else {
            SyncError::Clone {
                url: url.to_owned(),
                source: e,
            }
        }
    })?;
    session.save_on_success(url);
    info!(url, into = %into.display(), "cloned working copy");
    Ok(repo)
}

/// Fetch and fast-forward the local branch. Never merges: a diverged
/// history is reported, not resolved.
pub fn pull(
    repo: &Repository,
    branch: &str,
    creds: Arc<dyn CredentialSource>,
    status: Arc<StatusCell>,
) -> Result<PullOutcome, SyncError> {
    status.set(RepoStatus::busy(BusyOperation::Pulling));
    let session = AuthSession::new(creds, status);

    let mut remote = repo
        .find_remote(REMOTE_NAME)
        .map_err(|_| SyncError::MissingRemote)?;
    let url = remote.url().unwrap_or_default().to_owned();

    let mut fetch_options = git2::FetchOptions::new();
    fetch_options.remote_callbacks(session.callbacks());
    let refspec = format!("refs/heads/{branch}:refs/remotes/{REMOTE_NAME}/{branch}");
    match remote.fetch(&[refspec.as_str()], Some(&mut fetch_options), None) {
        Ok(()) => {}
        Err(e) if is_user_canceled(&e) => return Err(SyncError::AwaitingCredentials),
        // The remote does not have the branch yet (first publisher):
        // nothing to pull, the subsequent push creates it.
        Err(e) if e.code() == ErrorCode::NotFound => return Ok(PullOutcome::UpToDate),
        Err(e) => return Err(SyncError::Fetch(e)),
    }
    session.save_on_success(&url);

    let remote_ref = format!("refs/remotes/{REMOTE_NAME}/{branch}");
    let remote_oid = match repo.refname_to_id(&remote_ref) {
        Ok(oid) => oid,
        // Remote has no such branch yet: nothing to pull.
        Err(e) if e.code() == ErrorCode::NotFound => return Ok(PullOutcome::UpToDate),
        Err(e) => return Err(e.into()),
    };

    let local_refname = format!("refs/heads/{branch}");
    let local_oid = repo.refname_to_id(&local_refname).ok();

    let annotated = repo.find_annotated_commit(remote_oid)?;
    let (analysis, _) = repo.merge_analysis(&[&annotated])?;

    if analysis.is_up_to_date() {
        return Ok(PullOutcome::UpToDate);
    }
    if !(analysis.is_fast_forward() || analysis.is_unborn()) {
        return Err(SyncError::Diverged);
    }

    // Advance (or create) the local branch and check it out.
    repo.reference(&local_refname, remote_oid, true, "fast-forward")?;
    repo.set_head(&local_refname)?;
    let mut checkout = git2::build::CheckoutBuilder::new();
    checkout.force();
    repo.checkout_head(Some(&mut checkout))?;

    debug!(branch, %remote_oid, "fast-forwarded");
    Ok(PullOutcome::FastForwarded {
        from: local_oid,
        to: remote_oid,
    })
}

/// Push the local branch. "Nothing to push" is an error variant the caller
/// may opt to treat as success.
pub fn push(
    repo: &Repository,
    branch: &str,
    creds: Arc<dyn CredentialSource>,
    status: Arc<StatusCell>,
) -> Result<(), SyncError> {
    status.set(RepoStatus::busy(BusyOperation::Pushing));
    let session = AuthSession::new(creds, status);

    let local_oid = repo
        .refname_to_id(&format!("refs/heads/{branch}"))
        .map_err(SyncError::Git)?;
    let remote_oid = repo
        .refname_to_id(&format!("refs/remotes/{REMOTE_NAME}/{branch}"))
        .ok();
    if remote_oid == Some(local_oid) {
        return Err(SyncError::NothingToPush);
    }

    let mut remote = repo
        .find_remote(REMOTE_NAME)
        .map_err(|_| SyncError::MissingRemote)?;
    let url = remote.url().unwrap_or_default().to_owned();

    let rejection: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let mut callbacks = session.callbacks();
    {
        let rejection = Arc::clone(&rejection);
        callbacks.push_update_reference(move |refname, server_status| {
            if let Some(message) = server_status {
                *rejection.lock().expect("push lock poisoned") =
                    Some(format!("{refname}: {message}"));
            }
            Ok(())
        });
    }

    let mut push_options = git2::PushOptions::new();
    push_options.remote_callbacks(callbacks);
    let refspec = format!("refs/heads/{branch}:refs/heads/{branch}");
    remote
        .push(&[refspec.as_str()], Some(&mut push_options))
        .map_err(|e| {
            if is_user_canceled(&e) {
                SyncError::AwaitingCredentials
            } else {
                SyncError::Push(e)
            }
        })?;

    if let Some(message) = rejection.lock().expect("push lock poisoned").take() {
        return Err(SyncError::PushRejected { message });
    }
    session.save_on_success(&url);

    // Record the new remote position so ahead/behind stays accurate.
    repo.reference(
        &format!("refs/remotes/{REMOTE_NAME}/{branch}"),
        local_oid,
        true,
        "update after push",
    )?;
    info!(branch, %local_oid, "pushed");
    Ok(())
}

/// Settled state of a working copy relative to its remote-tracking branch.
pub fn settled_state(repo: &Repository, branch: &str) -> SettledState {
    let local = repo.refname_to_id(&format!("refs/heads/{branch}")).ok();
    let remote = repo
        .refname_to_id(&format!("refs/remotes/{REMOTE_NAME}/{branch}"))
        .ok();
    match (local, remote) {
        (Some(local), Some(remote)) => match repo.graph_ahead_behind(local, remote) {
            Ok((0, 0)) => SettledState::Ready,
            Ok((_, 0)) => SettledState::Ahead,
            Ok((0, _)) => SettledState::Behind,
            Ok((_, _)) => SettledState::Diverged,
            Err(_) => SettledState::InvalidWorkingCopy,
        },
        // No remote-tracking ref (local-only repo) or unborn local branch.
        _ => SettledState::Ready,
    }
}

/// Ensure a remote named `origin` points at `url`.
pub fn configure_remote(repo: &Repository, url: &str) -> Result<(), SyncError> {
    match repo.find_remote(REMOTE_NAME) {
        Ok(existing) if existing.url() == Some(url) => Ok(()),
        Ok(_) => {
            repo.remote_set_url(REMOTE_NAME, url)?;
            Ok(())
        }
        Err(_) => {
            repo.remote(REMOTE_NAME, url)?;
            Ok(())
        }
    }
}
