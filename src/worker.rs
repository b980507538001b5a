//! Worker registry: per-working-copy reader/writer threads.
//!
//! git2 repository handles are neither `Send` nor `Sync`, so each worker
//! thread owns its own handle, following the dedicated-git-thread design.
//! The reader serves lock-free reads and stays responsive while mutations
//! run; the writer serializes every mutating operation behind a bounded
//! mailbox; the queue bound plus an enqueue timeout turn overload into a
//! distinct retryable error instead of an unbounded wait.
//!
//! The split is enforced at the type level: [`ReadOp`] carries only
//! operations that open blobs and trees, [`WriteOp`] everything that may
//! mutate the working copy.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{Receiver, SendTimeoutError, Sender, bounded, unbounded};
use git2::{Oid, Repository};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::buffer::{self, ChangeStatus};
use crate::changeset::{self, Changeset, CommitOptions, CommitOutcome, ObjectChange};
use crate::config::{Author, DatasetMetadata, RepoMetadata};
use crate::dataset::Dataset;
use crate::error::{Error, Transience};
use crate::index::{IndexStatus, Predicate, ProgressSink};
use crate::marshal::{Object, SerDesRegistry};
use crate::migrate::{Migration, MigrationOutcome, run_migrations};
use crate::sync::{
    BusyOperation, CredentialSource, CycleOutcome, DEFAULT_BRANCH, NoCredentials, RepoStatus,
    SettledState, StatusCell, SyncEngine, SyncTimer, settled_state,
};

const DEFAULT_QUEUE_CAP: usize = 32;
const DEFAULT_ENQUEUE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("mutation queue full ({pending} pending); retry later")]
    Overloaded { pending: usize },

    #[error("worker is closed")]
    Closed,

    #[error("dataset {0:?} is not loaded")]
    DatasetNotLoaded(String),

    #[error("working copy at {0} is missing")]
    WorkingCopyMissing(PathBuf),

    #[error("failed to open repository at {0}: {1}")]
    OpenRepo(PathBuf, #[source] git2::Error),
}

impl WorkerError {
    pub fn transience(&self) -> Transience {
        match self {
            WorkerError::Overloaded { .. } => Transience::Retryable,
            WorkerError::Closed
            | WorkerError::DatasetNotLoaded(_)
            | WorkerError::WorkingCopyMissing(_)
            | WorkerError::OpenRepo(_, _) => Transience::Permanent,
        }
    }
}

// =============================================================================
// Operation enums
// =============================================================================

type Respond<T> = Sender<Result<T, Error>>;

/// Read-only operations served by the reader worker.
pub enum ReadOp {
    ReadBuffer {
        path: String,
        at_commit: Option<Oid>,
        respond: Respond<Option<Vec<u8>>>,
    },
    DiffPaths {
        root: String,
        commit_a: Option<Oid>,
        commit_b: Option<Oid>,
        only_changed: bool,
        respond: Respond<Vec<(String, ChangeStatus)>>,
    },
    ListPaths {
        root: String,
        respond: Respond<Vec<String>>,
    },
    Head {
        respond: Respond<Option<Oid>>,
    },
    Shutdown,
}

/// Mutating operations serialized by the writer worker.
pub enum WriteOp {
    Commit {
        changeset: Changeset,
        opts: CommitOptions,
        respond: Respond<CommitOutcome>,
    },
    UpdateObjects {
        dataset_root: String,
        changes: Vec<ObjectChange>,
        opts: CommitOptions,
        respond: Respond<CommitOutcome>,
    },
    MoveTree {
        from: String,
        to: String,
        opts: CommitOptions,
        respond: Respond<CommitOutcome>,
    },
    DeleteTree {
        path: String,
        opts: CommitOptions,
        respond: Respond<CommitOutcome>,
    },
    LoadDataset {
        root: String,
        registry: SerDesRegistry,
        progress: ProgressSink,
        respond: Respond<IndexStatus>,
    },
    UnloadDataset {
        root: String,
        respond: Sender<bool>,
    },
    DatasetStatus {
        root: String,
        respond: Respond<IndexStatus>,
    },
    GetObject {
        root: String,
        path: String,
        respond: Respond<Option<Object>>,
    },
    EnsureFiltered {
        root: String,
        predicate: Arc<dyn Predicate>,
        respond: Respond<(String, IndexStatus)>,
    },
    FilteredPathAt {
        root: String,
        id: String,
        position: u64,
        respond: Respond<Option<String>>,
    },
    FilteredPositionOf {
        root: String,
        id: String,
        path: String,
        respond: Respond<Option<u64>>,
    },
    /// Commit a dataset-metadata file, making the subtree a dataset.
    InitDataset {
        root: String,
        meta: DatasetMetadata,
        opts: CommitOptions,
        respond: Respond<CommitOutcome>,
    },
    /// Suggest a free object path near a candidate.
    ProposePath {
        root: String,
        candidate: String,
        respond: Respond<String>,
    },
    Migrate {
        root: String,
        migrations: Vec<Box<dyn Migration>>,
        author: Author,
        respond: Respond<MigrationOutcome>,
    },
    /// Clear an awaiting-credentials status and re-arm the sync timer.
    RetrySync,
    Shutdown,
}

// =============================================================================
// Handle
// =============================================================================

/// Options for opening a working copy.
pub struct OpenOptions {
    pub credentials: Arc<dyn CredentialSource>,
    pub sync_enabled: bool,
    pub queue_cap: usize,
    pub enqueue_timeout: Duration,
}

impl Default for OpenOptions {
    fn default() -> Self {
        OpenOptions {
            credentials: Arc::new(NoCredentials),
            sync_enabled: false,
            queue_cap: DEFAULT_QUEUE_CAP,
            enqueue_timeout: DEFAULT_ENQUEUE_TIMEOUT,
        }
    }
}

/// Client handle to one open working copy's worker pair.
pub struct WorkerHandle {
    workdir: PathBuf,
    write_tx: Sender<WriteOp>,
    read_tx: Sender<ReadOp>,
    status: Arc<StatusCell>,
    queue_cap: usize,
    enqueue_timeout: Duration,
    writer: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn status(&self) -> RepoStatus {
        self.status.get()
    }

    pub fn subscribe_status(&self) -> Receiver<RepoStatus> {
        self.status.subscribe()
    }

    // -- writes --------------------------------------------------------------

    pub fn commit(
        &self,
        changeset: Changeset,
        opts: CommitOptions,
    ) -> Result<CommitOutcome, Error> {
        self.call_write(|respond| WriteOp::Commit {
            changeset,
            opts,
            respond,
        })
    }

    pub fn update_objects(
        &self,
        dataset_root: impl Into<String>,
        changes: Vec<ObjectChange>,
        opts: CommitOptions,
    ) -> Result<CommitOutcome, Error> {
        self.call_write(|respond| WriteOp::UpdateObjects {
            dataset_root: dataset_root.into(),
            changes,
            opts,
            respond,
        })
    }

    pub fn move_tree(
        &self,
        from: impl Into<String>,
        to: impl Into<String>,
        opts: CommitOptions,
    ) -> Result<CommitOutcome, Error> {
        self.call_write(|respond| WriteOp::MoveTree {
            from: from.into(),
            to: to.into(),
            opts,
            respond,
        })
    }

    pub fn delete_tree(
        &self,
        path: impl Into<String>,
        opts: CommitOptions,
    ) -> Result<CommitOutcome, Error> {
        self.call_write(|respond| WriteOp::DeleteTree {
            path: path.into(),
            opts,
            respond,
        })
    }

    pub fn load_dataset(
        &self,
        root: impl Into<String>,
        registry: SerDesRegistry,
        progress: ProgressSink,
    ) -> Result<IndexStatus, Error> {
        self.call_write(|respond| WriteOp::LoadDataset {
            root: root.into(),
            registry,
            progress,
            respond,
        })
    }

    pub fn unload_dataset(&self, root: impl Into<String>) -> Result<bool, Error> {
        let (tx, rx) = bounded(1);
        self.send_write(WriteOp::UnloadDataset {
            root: root.into(),
            respond: tx,
        })?;
        rx.recv().map_err(|_| WorkerError::Closed.into())
    }

    pub fn dataset_status(&self, root: impl Into<String>) -> Result<IndexStatus, Error> {
        self.call_write(|respond| WriteOp::DatasetStatus {
            root: root.into(),
            respond,
        })
    }

    pub fn get_object(
        &self,
        root: impl Into<String>,
        path: impl Into<String>,
    ) -> Result<Option<Object>, Error> {
        self.call_write(|respond| WriteOp::GetObject {
            root: root.into(),
            path: path.into(),
            respond,
        })
    }

    pub fn ensure_filtered_index(
        &self,
        root: impl Into<String>,
        predicate: Arc<dyn Predicate>,
    ) -> Result<(String, IndexStatus), Error> {
        self.call_write(|respond| WriteOp::EnsureFiltered {
            root: root.into(),
            predicate,
            respond,
        })
    }

    pub fn filtered_path_at(
        &self,
        root: impl Into<String>,
        id: impl Into<String>,
        position: u64,
    ) -> Result<Option<String>, Error> {
        self.call_write(|respond| WriteOp::FilteredPathAt {
            root: root.into(),
            id: id.into(),
            position,
            respond,
        })
    }

    pub fn filtered_position_of(
        &self,
        root: impl Into<String>,
        id: impl Into<String>,
        path: impl Into<String>,
    ) -> Result<Option<u64>, Error> {
        self.call_write(|respond| WriteOp::FilteredPositionOf {
            root: root.into(),
            id: id.into(),
            path: path.into(),
            respond,
        })
    }

    pub fn init_dataset(
        &self,
        root: impl Into<String>,
        meta: DatasetMetadata,
        opts: CommitOptions,
    ) -> Result<CommitOutcome, Error> {
        self.call_write(|respond| WriteOp::InitDataset {
            root: root.into(),
            meta,
            opts,
            respond,
        })
    }

    pub fn propose_path(
        &self,
        root: impl Into<String>,
        candidate: impl Into<String>,
    ) -> Result<String, Error> {
        self.call_write(|respond| WriteOp::ProposePath {
            root: root.into(),
            candidate: candidate.into(),
            respond,
        })
    }

    pub fn migrate(
        &self,
        root: impl Into<String>,
        migrations: Vec<Box<dyn Migration>>,
        author: Author,
    ) -> Result<MigrationOutcome, Error> {
        self.call_write(|respond| WriteOp::Migrate {
            root: root.into(),
            migrations,
            author,
            respond,
        })
    }

    pub fn retry_sync(&self) -> Result<(), Error> {
        self.send_write(WriteOp::RetrySync)
    }

    // -- reads ---------------------------------------------------------------

    pub fn read_buffer(
        &self,
        path: impl Into<String>,
        at_commit: Option<Oid>,
    ) -> Result<Option<Vec<u8>>, Error> {
        self.call_read(|respond| ReadOp::ReadBuffer {
            path: path.into(),
            at_commit,
            respond,
        })
    }

    pub fn diff_paths(
        &self,
        root: impl Into<String>,
        commit_a: Option<Oid>,
        commit_b: Option<Oid>,
        only_changed: bool,
    ) -> Result<Vec<(String, ChangeStatus)>, Error> {
        self.call_read(|respond| ReadOp::DiffPaths {
            root: root.into(),
            commit_a,
            commit_b,
            only_changed,
            respond,
        })
    }

    pub fn list_paths(&self, root: impl Into<String>) -> Result<Vec<String>, Error> {
        self.call_read(|respond| ReadOp::ListPaths {
            root: root.into(),
            respond,
        })
    }

    pub fn head(&self) -> Result<Option<Oid>, Error> {
        self.call_read(|respond| ReadOp::Head { respond })
    }

    // -- plumbing ------------------------------------------------------------

    fn call_write<T>(&self, make: impl FnOnce(Respond<T>) -> WriteOp) -> Result<T, Error> {
        let (tx, rx) = bounded(1);
        self.send_write(make(tx))?;
        rx.recv().map_err(|_| Error::from(WorkerError::Closed))?
    }

    fn call_read<T>(&self, make: impl FnOnce(Respond<T>) -> ReadOp) -> Result<T, Error> {
        let (tx, rx) = bounded(1);
        self.read_tx
            .send(make(tx))
            .map_err(|_| Error::from(WorkerError::Closed))?;
        rx.recv().map_err(|_| Error::from(WorkerError::Closed))?
    }

    /// Admission control for mutations: a full queue that stays full past
    /// the timeout fails the caller instead of hanging.
    fn send_write(&self, op: WriteOp) -> Result<(), Error> {
        match self.write_tx.send_timeout(op, self.enqueue_timeout) {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(WorkerError::Overloaded {
                pending: self.queue_cap,
            }
            .into()),
            Err(SendTimeoutError::Disconnected(_)) => Err(WorkerError::Closed.into()),
        }
    }

    /// Tear down both workers, unloading datasets and joining the threads.
    fn close(mut self) {
        let _ = self.write_tx.send(WriteOp::Shutdown);
        let _ = self.read_tx.send(ReadOp::Shutdown);
        if let Some(writer) = self.writer.take() {
            let _ = writer.join();
        }
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        info!(workdir = %self.workdir.display(), "working copy closed");
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Process-wide registry of open working copies.
///
/// All lookups go through this struct explicitly; there is no ambient
/// global state. The cap bounds memory and file handles, not correctness:
/// opening a working copy beyond it evicts the oldest one first.
pub struct Registry {
    cap: usize,
    open: Vec<WorkerHandle>,
}

impl Registry {
    /// The reference policy: one open working copy at a time.
    pub fn new() -> Self {
        Self::with_capacity(1)
    }

    pub fn with_capacity(cap: usize) -> Self {
        Registry {
            cap: cap.max(1),
            open: Vec::new(),
        }
    }

    /// Create a fresh working copy on disk with its repository metadata.
    pub fn init(workdir: &Path, meta: &RepoMetadata) -> Result<(), Error> {
        Repository::init(workdir)
            .map_err(|e| WorkerError::OpenRepo(workdir.to_owned(), e))?;
        meta.save(workdir).map_err(crate::sync::SyncError::from)?;
        info!(workdir = %workdir.display(), "initialized working copy");
        Ok(())
    }

    /// Open a working copy, spawning its worker pair. Re-opening an
    /// already open path just refreshes its eviction rank.
    pub fn open(
        &mut self,
        workdir: &Path,
        options: OpenOptions,
    ) -> Result<&WorkerHandle, Error> {
        if let Some(i) = self.open.iter().position(|h| h.workdir == workdir) {
            let handle = self.open.remove(i);
            self.open.push(handle);
            return Ok(self.open.last().expect("just pushed"));
        }

        while self.open.len() >= self.cap {
            let evicted = self.open.remove(0);
            debug!(workdir = %evicted.workdir.display(), "evicting oldest working copy");
            evicted.close();
        }

        let handle = spawn_workers(workdir.to_owned(), options)?;
        self.open.push(handle);
        Ok(self.open.last().expect("just pushed"))
    }

    pub fn get(&self, workdir: &Path) -> Option<&WorkerHandle> {
        self.open.iter().find(|h| h.workdir == workdir)
    }

    /// Close one working copy; returns whether it was open.
    pub fn close(&mut self, workdir: &Path) -> bool {
        if let Some(i) = self.open.iter().position(|h| h.workdir == workdir) {
            self.open.remove(i).close();
            true
        } else {
            false
        }
    }

    pub fn close_all(&mut self) {
        for handle in self.open.drain(..) {
            handle.close();
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.close_all();
    }
}

// =============================================================================
// Worker threads
// =============================================================================

fn spawn_workers(workdir: PathBuf, options: OpenOptions) -> Result<WorkerHandle, Error> {
    let status = Arc::new(StatusCell::new(RepoStatus::busy(BusyOperation::Initializing)));
    let (write_tx, write_rx) = bounded(options.queue_cap);
    let (read_tx, read_rx) = unbounded();

    let (writer_ready_tx, writer_ready_rx) = bounded::<Result<(), Error>>(1);
    let writer = {
        let workdir = workdir.clone();
        let status = Arc::clone(&status);
        let credentials = Arc::clone(&options.credentials);
        let sync_enabled = options.sync_enabled;
        std::thread::spawn(move || {
            let repo = match Repository::open(&workdir) {
                Ok(repo) => repo,
                Err(e) => {
                    status.set(RepoStatus::settled(SettledState::InvalidWorkingCopy));
                    let _ = writer_ready_tx
                        .send(Err(WorkerError::OpenRepo(workdir.clone(), e).into()));
                    return;
                }
            };
            let _ = writer_ready_tx.send(Ok(()));
            let branch = branch_of(&repo, &workdir);
            status.set(RepoStatus::settled(settled_state(&repo, &branch)));

            let (timer_tx, timer_rx) = unbounded();
            let engine = SyncEngine::new(
                workdir.clone(),
                branch.clone(),
                credentials,
                Arc::clone(&status),
            );
            let mut state = WriterState {
                workdir,
                repo: Some(repo),
                branch,
                datasets: HashMap::new(),
                status,
                engine,
                timer: SyncTimer::new(timer_tx),
                sync_enabled,
            };
            if state.sync_enabled {
                state.timer.arm(Duration::from_millis(100));
            }
            writer_loop(&mut state, &write_rx, &timer_rx);
        })
    };
    writer_ready_rx
        .recv()
        .map_err(|_| Error::from(WorkerError::Closed))??;

    let (reader_ready_tx, reader_ready_rx) = bounded::<Result<(), Error>>(1);
    let reader = {
        let workdir = workdir.clone();
        std::thread::spawn(move || {
            // The reader's own handle only ever opens blobs and trees.
            let repo = match Repository::open(&workdir) {
                Ok(repo) => repo,
                Err(e) => {
                    let _ = reader_ready_tx
                        .send(Err(WorkerError::OpenRepo(workdir.clone(), e).into()));
                    return;
                }
            };
            let _ = reader_ready_tx.send(Ok(()));
            reader_loop(&repo, &read_rx);
        })
    };
    reader_ready_rx
        .recv()
        .map_err(|_| Error::from(WorkerError::Closed))??;

    Ok(WorkerHandle {
        workdir,
        write_tx,
        read_tx,
        status,
        queue_cap: options.queue_cap,
        enqueue_timeout: options.enqueue_timeout,
        writer: Some(writer),
        reader: Some(reader),
    })
}

fn branch_of(repo: &Repository, workdir: &Path) -> String {
    if let Ok(meta) = RepoMetadata::load(workdir)
        && let Some(branch) = meta.branch
        && !branch.is_empty()
    {
        return branch;
    }
    repo.head()
        .ok()
        .and_then(|head| head.shorthand().map(str::to_owned))
        .unwrap_or_else(|| DEFAULT_BRANCH.to_owned())
}

fn head_oid(repo: &Repository) -> Oid {
    buffer::head_commit(repo)
        .ok()
        .flatten()
        .map(|commit| commit.id())
        .unwrap_or_else(Oid::zero)
}

struct WriterState {
    workdir: PathBuf,
    repo: Option<Repository>,
    branch: String,
    datasets: HashMap<String, Dataset>,
    status: Arc<StatusCell>,
    engine: SyncEngine,
    timer: SyncTimer,
    sync_enabled: bool,
}

fn writer_loop(state: &mut WriterState, write_rx: &Receiver<WriteOp>, timer_rx: &Receiver<u64>) {
    loop {
        crossbeam::select! {
            recv(write_rx) -> msg => match msg {
                Ok(op) => {
                    if !state.handle_op(op) {
                        break;
                    }
                }
                Err(_) => break,
            },
            recv(timer_rx) -> msg => {
                if let Ok(generation) = msg {
                    state.handle_timer(generation);
                }
            },
        }
    }
    // Unloading every dataset closes its index handles.
    state.datasets.clear();
}

fn reader_loop(repo: &Repository, read_rx: &Receiver<ReadOp>) {
    for op in read_rx {
        match op {
            ReadOp::ReadBuffer {
                path,
                at_commit,
                respond,
            } => {
                let result = buffer::read_buffer(repo, &path, at_commit).map_err(Error::from);
                let _ = respond.send(result);
            }
            ReadOp::DiffPaths {
                root,
                commit_a,
                commit_b,
                only_changed,
                respond,
            } => {
                let result =
                    buffer::diff_paths(repo, &root, commit_a, commit_b, only_changed)
                        .map_err(Error::from);
                let _ = respond.send(result);
            }
            ReadOp::ListPaths { root, respond } => {
                let result = repo
                    .workdir()
                    .ok_or_else(|| {
                        crate::buffer::BufferError::InvalidPath("bare repository".into())
                    })
                    .and_then(|workdir| buffer::list_descendant_paths(workdir, &root))
                    .map_err(Error::from);
                let _ = respond.send(result);
            }
            ReadOp::Head { respond } => {
                let result = buffer::head_commit(repo)
                    .map(|commit| commit.map(|c| c.id()))
                    .map_err(Error::from);
                let _ = respond.send(result);
            }
            ReadOp::Shutdown => break,
        }
    }
}

impl WriterState {
    fn handle_op(&mut self, op: WriteOp) -> bool {
        match op {
            WriteOp::Commit {
                changeset,
                opts,
                respond,
            } => {
                let result = self.mutate(|repo| {
                    changeset::apply_changeset(repo, &changeset, &opts).map_err(Error::from)
                });
                let _ = respond.send(result);
            }

            WriteOp::UpdateObjects {
                dataset_root,
                changes,
                opts,
                respond,
            } => {
                let result = self.update_objects(&dataset_root, &changes, &opts);
                let _ = respond.send(result);
            }

            WriteOp::MoveTree {
                from,
                to,
                opts,
                respond,
            } => {
                let result = self.mutate(|repo| {
                    changeset::move_tree(repo, &from, &to, &opts).map_err(Error::from)
                });
                let _ = respond.send(result);
            }

            WriteOp::DeleteTree {
                path,
                opts,
                respond,
            } => {
                let result = self.mutate(|repo| {
                    changeset::delete_tree(repo, &path, &opts).map_err(Error::from)
                });
                let _ = respond.send(result);
            }

            WriteOp::LoadDataset {
                root,
                registry,
                progress,
                respond,
            } => {
                let result = self.load_dataset(&root, registry, progress);
                let _ = respond.send(result);
            }

            WriteOp::UnloadDataset { root, respond } => {
                let root = buffer::normalize_path(&root).to_owned();
                let unloaded = self.datasets.remove(&root).is_some();
                debug!(root = %root, unloaded, "dataset unload");
                let _ = respond.send(unloaded);
            }

            WriteOp::DatasetStatus { root, respond } => {
                let result = self.with_dataset(&root, |ds| Ok(ds.status()));
                let _ = respond.send(result);
            }

            WriteOp::GetObject { root, path, respond } => {
                let result =
                    self.with_dataset(&root, |ds| ds.object(&path).map_err(Error::from));
                let _ = respond.send(result);
            }

            WriteOp::EnsureFiltered {
                root,
                predicate,
                respond,
            } => {
                let result = self.with_dataset_mut(&root, |ds| {
                    ds.ensure_filtered(predicate).map_err(Error::from)
                });
                let _ = respond.send(result);
            }

            WriteOp::FilteredPathAt {
                root,
                id,
                position,
                respond,
            } => {
                let result = self.with_dataset(&root, |ds| {
                    ds.filtered_path_at(&id, position).map_err(Error::from)
                });
                let _ = respond.send(result);
            }

            WriteOp::FilteredPositionOf {
                root,
                id,
                path,
                respond,
            } => {
                let result = self.with_dataset(&root, |ds| {
                    ds.filtered_position_of(&id, &path).map_err(Error::from)
                });
                let _ = respond.send(result);
            }

            WriteOp::InitDataset {
                root,
                meta,
                opts,
                respond,
            } => {
                let result = self.init_dataset(&root, &meta, &opts);
                let _ = respond.send(result);
            }

            WriteOp::ProposePath {
                root,
                candidate,
                respond,
            } => {
                let result = self.with_dataset(&root, |ds| {
                    ds.propose_path(&candidate).map_err(Error::from)
                });
                let _ = respond.send(result);
            }

            WriteOp::Migrate {
                root,
                migrations,
                author,
                respond,
            } => {
                let result = self.mutate(|repo| {
                    Ok(run_migrations(
                        repo,
                        &root,
                        &migrations,
                        &author,
                        &mut |step| debug!(step, "migration progress"),
                    ))
                });
                let _ = respond.send(result);
            }

            WriteOp::RetrySync => {
                if self.sync_enabled {
                    if let Some(repo) = self.repo.as_ref() {
                        self.status
                            .set(RepoStatus::settled(settled_state(repo, &self.branch)));
                    }
                    self.timer.arm(Duration::from_millis(100));
                }
            }

            WriteOp::Shutdown => return false,
        }
        true
    }

    fn handle_timer(&mut self, generation: u64) {
        if !self.timer.accept(generation) || !self.sync_enabled {
            return;
        }
        let before = self.repo.as_ref().map(head_oid);
        match self.engine.run_cycle(&mut self.repo) {
            CycleOutcome::Stopped => {
                debug!(workdir = %self.workdir.display(), "sync scheduling stopped");
            }
            CycleOutcome::Done { next, head_moved } => {
                if let Some((from, to)) = head_moved {
                    let from = from.or(before).unwrap_or_else(Oid::zero);
                    self.refresh_datasets(from, to);
                }
                self.timer.arm(next);
            }
        }
    }

    /// Run one mutating operation: busy status around it, index updates
    /// after any commit it produced.
    fn mutate<T>(
        &mut self,
        f: impl FnOnce(&Repository) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let Some(repo) = self.repo.as_ref() else {
            return Err(WorkerError::WorkingCopyMissing(self.workdir.clone()).into());
        };
        self.status.set(RepoStatus::busy(BusyOperation::Committing));
        let before = head_oid(repo);
        let result = f(repo);
        let after = head_oid(repo);

        if after != before && !after.is_zero() {
            self.refresh_datasets(before, after);
        }
        if let Some(repo) = self.repo.as_ref() {
            self.status
                .set(RepoStatus::settled(settled_state(repo, &self.branch)));
        }
        result
    }

    fn refresh_datasets(&mut self, before: Oid, after: Oid) {
        let Some(repo) = self.repo.as_ref() else {
            return;
        };
        for dataset in self.datasets.values_mut() {
            if let Err(e) = dataset.apply_commit(repo, before, after) {
                warn!(root = %dataset.root(), error = %e, "index update failed");
            }
        }
    }

    fn init_dataset(
        &mut self,
        root: &str,
        meta: &DatasetMetadata,
        opts: &CommitOptions,
    ) -> Result<CommitOutcome, Error> {
        let root = buffer::normalize_path(root).to_owned();
        let mut body =
            serde_json::to_string_pretty(meta).expect("metadata serializes");
        body.push('\n');
        let mut changeset = Changeset::new();
        changeset.insert(
            crate::migrate::metadata_path(&root),
            crate::changeset::BufferChange {
                prior: crate::changeset::Prior::Absent,
                next: Some(crate::changeset::BufferValue::Text(body)),
            },
        );
        self.mutate(|repo| {
            changeset::apply_changeset(repo, &changeset, opts).map_err(Error::from)
        })
    }

    fn update_objects(
        &mut self,
        dataset_root: &str,
        changes: &[ObjectChange],
        opts: &CommitOptions,
    ) -> Result<CommitOutcome, Error> {
        let root = buffer::normalize_path(dataset_root).to_owned();
        let changeset = {
            let dataset = self
                .datasets
                .get(&root)
                .ok_or(WorkerError::DatasetNotLoaded(root.clone()))?;
            changeset::object_changes_to_changeset(dataset.registry(), changes)
                .map_err(Error::from)?
        };
        self.mutate(|repo| {
            changeset::apply_changeset(repo, &changeset, opts).map_err(Error::from)
        })
    }

    fn load_dataset(
        &mut self,
        root: &str,
        registry: SerDesRegistry,
        progress: ProgressSink,
    ) -> Result<IndexStatus, Error> {
        let root = buffer::normalize_path(root).to_owned();
        if let Some(existing) = self.datasets.get(&root) {
            return Ok(existing.status());
        }
        let Some(repo) = self.repo.as_ref() else {
            return Err(WorkerError::WorkingCopyMissing(self.workdir.clone()).into());
        };
        let dataset = Dataset::load(repo, &root, registry, progress)?;
        let status = dataset.status();
        self.datasets.insert(root, dataset);
        Ok(status)
    }

    fn with_dataset<T>(
        &self,
        root: &str,
        f: impl FnOnce(&Dataset) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let root = buffer::normalize_path(root);
        let dataset = self
            .datasets
            .get(root)
            .ok_or_else(|| WorkerError::DatasetNotLoaded(root.to_owned()))?;
        f(dataset)
    }

    fn with_dataset_mut<T>(
        &mut self,
        root: &str,
        f: impl FnOnce(&mut Dataset) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let root = buffer::normalize_path(root);
        let dataset = self
            .datasets
            .get_mut(root)
            .ok_or_else(|| WorkerError::DatasetNotLoaded(root.to_owned()))?;
        f(dataset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overloaded_is_retryable() {
        assert!(WorkerError::Overloaded { pending: 32 }.transience().is_retryable());
        assert!(!WorkerError::Closed.transience().is_retryable());
    }

    #[test]
    fn registry_capacity_floor_is_one() {
        let registry = Registry::with_capacity(0);
        assert_eq!(registry.cap, 1);
    }
}
