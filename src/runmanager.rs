// src/runmanager.rs
//
// =============================================================================
// JOBTREE: RUN MANAGER
// =============================================================================
//
// The Scheduler.
//
// Responsibilities:
// 1. Own the queue of enqueued job trees (the only writer once enqueued).
// 2. Dispatch runnable jobs into a bounded pool (local and remote slots).
// 3. Drive the per-job lifecycle: resolve tools -> run driver -> record.
// 4. Pause/resume, priorities, wait-for-finished, out-of-date restarts,
//    statistics.
// 5. Checkpoint trees to the store on enqueue and after every state change.
//
// Locking: queue state sits behind a std Mutex that is never held across
// an await, and no file or database I/O happens while it is held.
// Checkpoints are snapshots handed to a writer thread in lock order;
// out-of-date checks hash inputs on snapshots taken under the lock.

use crate::checkpoint::CheckpointStore;
use crate::config::RunConfig;
use crate::core::{ErrorLevel, FileSpec, JobErrors, JobStatus, JobType, TreeStatus};
use crate::drivers::slurm::SlurmBackend;
use crate::drivers::{DriverRegistry, JobContext, JobDriver, JobOutput};
use crate::error::StoreError;
use crate::provenance::{self, TrackedInput};
use crate::tools::{ToolInfo, ToolRegistry};
use crate::tree::{JobId, JobTree};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify, OwnedSemaphorePermit, Semaphore};
use uuid::Uuid;

/// Identifies one enqueued tree.
pub type TreeHandle = Uuid;

// ============================================================================
// 1. PUBLIC VIEW TYPES
// ============================================================================

/// Read-only view of one queued job, as returned by `get_jobs`.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub tree: TreeHandle,
    #[serde(skip)]
    pub id: JobId,
    pub uuid: Uuid,
    pub job_type: JobType,
    pub index: usize,
    pub status: JobStatus,
    pub is_finished_job: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
    pub output_dir: PathBuf,
    pub output_files: Vec<FileSpec>,
    pub ran_remotely: bool,
    pub errors: JobErrors,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Statistics {
    pub errors: usize,
    pub warnings: usize,
    pub jobs: usize,
    pub workflows: usize,
    pub running: usize,
    pub running_workflows: usize,
    /// Mean wall time of completed jobs, in seconds.
    pub average_completion_secs: f64,
    pub completed: usize,
    pub failed: usize,
    pub succeeded: usize,
    pub running_local: usize,
    pub running_remote: usize,
}

impl std::fmt::Display for Statistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "jobs {} | running {} (local {}, remote {}) | succeeded {} | failed {} | \
             errors {} | warnings {} | avg {:.2}s",
            self.jobs,
            self.running,
            self.running_local,
            self.running_remote,
            self.succeeded,
            self.failed,
            self.errors,
            self.warnings,
            self.average_completion_secs
        )
    }
}

// ============================================================================
// 2. INTERNAL STATE
// ============================================================================

struct QueuedTree {
    handle: TreeHandle,
    tree: JobTree,
}

#[derive(Default)]
struct State {
    trees: Vec<QueuedTree>,
    next_index: usize,
    paused: bool,
}

impl State {
    fn find_mut(&mut self, handle: TreeHandle) -> Option<&mut QueuedTree> {
        self.trees.iter_mut().find(|q| q.handle == handle)
    }
}

struct Remote {
    driver: Arc<dyn JobDriver>,
    slots: Arc<Semaphore>,
    host: String,
}

struct Inner {
    state: Mutex<State>,
    local_slots: Arc<Semaphore>,
    remote: Option<Remote>,
    drivers: DriverRegistry,
    tools: ToolRegistry,
    store: Option<CheckpointStore>,
    writer: Option<mpsc::UnboundedSender<StoreOp>>,
    changed: Notify,
    hostname: String,
}

/// Work for the checkpoint writer thread, applied in send order.
enum StoreOp {
    Save(TreeHandle, Box<JobTree>),
    Delete(TreeHandle),
    Clear,
    Sync(oneshot::Sender<()>),
}

/// Owns the store on a plain thread, so SQLite writes never run on
/// the async workers. Exits once every sender is gone.
fn spawn_checkpoint_writer(store: CheckpointStore) -> mpsc::UnboundedSender<StoreOp> {
    let (tx, mut rx) = mpsc::unbounded_channel::<StoreOp>();
    std::thread::spawn(move || {
        while let Some(op) = rx.blocking_recv() {
            match op {
                StoreOp::Save(handle, tree) => {
                    if let Err(e) = store.save_tree(handle, &tree) {
                        log::warn!("Failed to checkpoint tree {}: {}", handle, e);
                    }
                }
                StoreOp::Delete(handle) => {
                    if let Err(e) = store.delete_tree(handle) {
                        log::warn!("Failed to drop checkpoint of tree {}: {}", handle, e);
                    }
                }
                StoreOp::Clear => {
                    if let Err(e) = store.clear_trees() {
                        log::warn!("Failed to clear checkpoints: {}", e);
                    }
                }
                StoreOp::Sync(done) => {
                    let _ = done.send(());
                }
            }
        }
        log::debug!("Checkpoint writer for {:?} stopped", store.path());
    });
    tx
}

/// One job picked by `process_queue`, ready to be spawned.
struct Launch {
    handle: TreeHandle,
    id: JobId,
    ctx: JobContext,
    tools: anyhow::Result<Vec<ToolInfo>>,
    remote: bool,
    permit: OwnedSemaphorePermit,
}

// ============================================================================
// 3. CONSTRUCTION
// ============================================================================

pub struct RunManagerBuilder {
    cfg: RunConfig,
    drivers: DriverRegistry,
    tools: Option<ToolRegistry>,
    store: Option<CheckpointStore>,
    remote: Option<(Arc<dyn JobDriver>, usize, String)>,
    paused: bool,
}

impl RunManagerBuilder {
    pub fn drivers(mut self, drivers: DriverRegistry) -> Self {
        self.drivers = drivers;
        self
    }

    pub fn tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn store(mut self, store: CheckpointStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Delegates remote-runnable jobs to `driver`, at most `max_jobs` at a time.
    pub fn remote_backend(
        mut self,
        driver: impl JobDriver + 'static,
        max_jobs: usize,
        host: impl Into<String>,
    ) -> Self {
        self.remote = Some((Arc::new(driver), max_jobs, host.into()));
        self
    }

    /// Start in the paused state.
    pub fn paused(mut self, paused: bool) -> Self {
        self.paused = paused;
        self
    }

    pub fn build(self) -> RunManager {
        let tools = self.tools.unwrap_or_else(|| self.cfg.tool_registry());

        let remote = match (self.remote, &self.cfg.slurm) {
            (Some((driver, max, host)), _) => Some((driver, max, host)),
            (None, Some(slurm)) if !slurm.host.is_empty() => {
                let driver: Arc<dyn JobDriver> = Arc::new(SlurmBackend::over_ssh(slurm.clone()));
                Some((driver, slurm.max_jobs, slurm.host.clone()))
            }
            _ => None,
        }
        .map(|(driver, max, host)| Remote {
            driver,
            slots: Arc::new(Semaphore::new(max.max(1))),
            host,
        });

        let local = self.cfg.max_local_jobs.max(1);
        log::info!(
            "RunManager ready. Local slots: {}, remote: {}",
            local,
            remote.as_ref().map_or("none", |r| r.host.as_str())
        );

        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "localhost".to_string());

        RunManager {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    paused: self.paused,
                    ..State::default()
                }),
                local_slots: Arc::new(Semaphore::new(local)),
                remote,
                drivers: self.drivers,
                tools,
                writer: self.store.clone().map(spawn_checkpoint_writer),
                store: self.store,
                changed: Notify::new(),
                hostname,
            }),
        }
    }
}

/// Handle to a scheduler. Cheap to clone; all clones share one queue.
#[derive(Clone)]
pub struct RunManager {
    inner: Arc<Inner>,
}

impl RunManager {
    pub fn builder(cfg: RunConfig) -> RunManagerBuilder {
        RunManagerBuilder {
            cfg,
            drivers: DriverRegistry::default(),
            tools: None,
            store: None,
            remote: None,
            paused: false,
        }
    }

    pub fn new(cfg: RunConfig) -> Self {
        Self::builder(cfg).build()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // A panic while holding the lock leaves the queue consistent
        // (every mutation is a single tree call), so poisoning is ignored.
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queues a snapshot of `tree` for the writer. Call with the queue lock
    /// held, so snapshots of one tree reach the store in order.
    fn checkpoint(&self, handle: TreeHandle, tree: &JobTree) {
        self.send_store(StoreOp::Save(handle, Box::new(tree.clone())));
    }

    fn send_store(&self, op: StoreOp) {
        if let Some(writer) = &self.inner.writer {
            if writer.send(op).is_err() {
                log::warn!("Checkpoint writer is gone; store not updated");
            }
        }
    }

    /// Resolves once every checkpoint queued so far is in the store.
    pub async fn sync_checkpoints(&self) {
        let Some(writer) = &self.inner.writer else {
            return;
        };
        let (done, written) = oneshot::channel();
        if writer.send(StoreOp::Sync(done)).is_ok() {
            let _ = written.await;
        }
    }
}

// ============================================================================
// 4. QUEUE OPERATIONS
// ============================================================================

impl RunManager {
    /// Takes ownership of `tree` and schedules it. With `force`, the root
    /// (and so everything below it) is treated as out of date.
    /// Completed, up-to-date jobs of a re-enqueued tree are not run again.
    ///
    /// If a tree with the same `workflowkey` is already queued, `tree` is
    /// dropped and the queued one is restarted instead; its handle is returned.
    pub fn enqueue(&self, mut tree: JobTree, force: bool) -> TreeHandle {
        let key = tree.workflow_key().map(str::to_string);
        if let Some(existing) = key.as_deref().and_then(|k| self.handle_for_key(k)) {
            log::info!(
                "A tree with workflow key {:?} is already queued; restarting {} instead",
                key,
                existing
            );
            self.restart_trees(Some(existing), force);
            return existing;
        }

        let handle = Uuid::new_v4();
        if force {
            let root = tree.root();
            tree.set_forced(root, true);
        }
        // Hashes inputs, so it runs before the queue lock is taken.
        let restarted = tree.restart_out_of_date();
        if !restarted.is_empty() {
            log::info!("Tree {}: {} out-of-date jobs will re-run", handle, restarted.len());
        }

        {
            let mut state = self.state();
            if let Some(k) = key.as_deref() {
                // Lost a race with another enqueue of the same key.
                if let Some(q) = state.trees.iter().find(|q| q.tree.workflow_key() == Some(k)) {
                    return q.handle;
                }
            }
            state.next_index = tree.reindex(state.next_index);

            log::info!(
                "Enqueued tree {} ({} jobs, root {}) -> {:?}",
                handle,
                tree.len(),
                tree.root_job().descriptor.job_type,
                tree.output_dir(tree.root())
            );
            self.checkpoint(handle, &tree);
            state.trees.push(QueuedTree { handle, tree });
        }
        self.process_queue();
        handle
    }

    pub fn set_paused(&self, paused: bool) {
        {
            let mut state = self.state();
            if state.paused == paused {
                return;
            }
            state.paused = paused;
        }
        log::info!("RunManager {}", if paused { "paused" } else { "resumed" });
        if !paused {
            self.process_queue();
        }
        self.inner.changed.notify_waiters();
    }

    pub fn paused(&self) -> bool {
        self.state().paused
    }

    /// Moves a tree one place toward the front of the queue. Earlier trees
    /// are offered free slots first. Returns false if it is already first.
    pub fn raise_priority(&self, handle: TreeHandle) -> bool {
        let mut state = self.state();
        match state.trees.iter().position(|q| q.handle == handle) {
            Some(pos) if pos > 0 => {
                state.trees.swap(pos, pos - 1);
                log::info!("Tree {} raised to queue position {}", handle, pos - 1);
                true
            }
            _ => false,
        }
    }

    /// Moves a tree one place toward the back of the queue.
    /// Returns false if it is already last.
    pub fn lower_priority(&self, handle: TreeHandle) -> bool {
        let mut state = self.state();
        let len = state.trees.len();
        match state.trees.iter().position(|q| q.handle == handle) {
            Some(pos) if pos + 1 < len => {
                state.trees.swap(pos, pos + 1);
                log::info!("Tree {} lowered to queue position {}", handle, pos + 1);
                true
            }
            _ => false,
        }
    }

    fn handle_for_key(&self, key: &str) -> Option<TreeHandle> {
        self.state()
            .trees
            .iter()
            .find(|q| q.tree.workflow_key() == Some(key))
            .map(|q| q.handle)
    }

    /// Handles of all queued trees, in enqueue order.
    pub fn trees(&self) -> Vec<TreeHandle> {
        self.state().trees.iter().map(|q| q.handle).collect()
    }

    /// Snapshot of a queued tree.
    pub fn tree(&self, handle: TreeHandle) -> Option<JobTree> {
        self.state()
            .trees
            .iter()
            .find(|q| q.handle == handle)
            .map(|q| q.tree.clone())
    }

    pub fn tree_status(&self, handle: TreeHandle) -> Option<TreeStatus> {
        self.state()
            .trees
            .iter()
            .find(|q| q.handle == handle)
            .map(|q| q.tree.tree_status())
    }

    /// Drops a tree from the queue. Jobs of it that are still running
    /// finish, but their results are discarded.
    pub fn remove(&self, handle: TreeHandle) -> Option<JobTree> {
        let removed = {
            let mut state = self.state();
            let pos = state.trees.iter().position(|q| q.handle == handle)?;
            self.send_store(StoreOp::Delete(handle));
            state.trees.remove(pos).tree
        };
        self.inner.changed.notify_waiters();
        Some(removed)
    }

    /// Empties the queue.
    pub fn clear_jobs(&self) {
        let n = {
            let mut state = self.state();
            let n = state.trees.len();
            state.trees.clear();
            state.next_index = 0;
            self.send_store(StoreOp::Clear);
            n
        };
        log::info!("Cleared {} trees from the queue", n);
        self.inner.changed.notify_waiters();
    }

    /// Resets every completed job that is out of date, across all trees,
    /// and dispatches again. Returns the number of jobs reset.
    pub fn restart_out_of_date(&self) -> usize {
        self.restart_trees(None, false)
    }

    /// Restarts the out-of-date jobs of one tree (or all). With `force`,
    /// the root is marked forced first. Staleness is judged on snapshots
    /// outside the lock; jobs that ran again meanwhile are left alone.
    fn restart_trees(&self, only: Option<TreeHandle>, force: bool) -> usize {
        let snapshots: Vec<(TreeHandle, JobTree)> = {
            let mut state = self.state();
            state
                .trees
                .iter_mut()
                .filter(|q| only.map_or(true, |h| h == q.handle))
                .map(|q| {
                    if force {
                        let root = q.tree.root();
                        q.tree.set_forced(root, true);
                    }
                    (q.handle, q.tree.clone())
                })
                .collect()
        };

        let mut observed = Vec::new();
        for (handle, tree) in &snapshots {
            let stale: Vec<(JobId, Option<DateTime<Utc>>)> = tree
                .stale_jobs()
                .into_iter()
                .map(|id| (id, tree[id].last_run))
                .collect();
            if !stale.is_empty() {
                observed.push((*handle, stale));
            }
        }

        let mut total = 0;
        {
            let mut state = self.state();
            for (handle, stale) in observed {
                if let Some(q) = state.find_mut(handle) {
                    let reset = q.tree.reset_unchanged(&stale);
                    if !reset.is_empty() {
                        log::info!("Tree {}: restarting {} out-of-date jobs", handle, reset.len());
                        total += reset.len();
                        self.checkpoint(handle, &q.tree);
                    }
                }
            }
        }
        if total > 0 || force {
            self.process_queue();
        }
        total
    }

    /// Restores checkpointed trees from the store. Jobs that were running
    /// when the previous process stopped are reset and run again.
    pub fn load_jobs(&self) -> Result<usize, StoreError> {
        let store = match &self.inner.store {
            Some(s) => s,
            None => return Ok(0),
        };
        let restored = store.restore_trees()?;
        let count = restored.len();
        {
            let mut state = self.state();
            for (handle, mut tree) in restored {
                if state.trees.iter().any(|q| q.handle == handle) {
                    continue;
                }
                let interrupted = tree.reset_interrupted();
                if interrupted > 0 {
                    log::warn!("Tree {}: {} interrupted jobs reset", handle, interrupted);
                }
                let max_index = tree.pre_order().iter().map(|id| tree[*id].index).max();
                if let Some(m) = max_index {
                    state.next_index = state.next_index.max(m + 1);
                }
                state.trees.push(QueuedTree { handle, tree });
            }
        }
        log::info!("Restored {} trees from {:?}", count, store.path());
        self.process_queue();
        Ok(count)
    }
}

// ============================================================================
// 5. OBSERVATION
// ============================================================================

impl RunManager {
    /// Every job of every queued tree, in queue order then pre-order.
    pub fn get_jobs(&self) -> Vec<JobSnapshot> {
        let state = self.state();
        let mut out = Vec::new();
        for q in &state.trees {
            for id in q.tree.pre_order() {
                let job = &q.tree[id];
                out.push(JobSnapshot {
                    tree: q.handle,
                    id,
                    uuid: job.uuid,
                    job_type: job.descriptor.job_type,
                    index: job.index,
                    status: job.status,
                    is_finished_job: q.tree.is_finished_job(id),
                    started_at: job.started_at,
                    last_run: job.last_run,
                    output_dir: q.tree.output_dir(id),
                    output_files: job.output_files.clone(),
                    ran_remotely: job.ran_remotely,
                    errors: job.errors.clone(),
                });
            }
        }
        out
    }

    pub fn statistics(&self) -> Statistics {
        let state = self.state();
        let mut stats = Statistics {
            workflows: state.trees.len(),
            ..Statistics::default()
        };
        let mut total_secs = 0.0;
        let mut timed = 0usize;

        for q in &state.trees {
            let mut tree_running = false;
            for id in q.tree.pre_order() {
                let job = &q.tree[id];
                stats.jobs += 1;
                stats.errors += job.errors.errors().count();
                stats.warnings += job.errors.warnings().count();
                match job.status {
                    JobStatus::Running => {
                        stats.running += 1;
                        tree_running = true;
                        if job.ran_remotely {
                            stats.running_remote += 1;
                        } else {
                            stats.running_local += 1;
                        }
                    }
                    JobStatus::Succeeded => stats.succeeded += 1,
                    JobStatus::Failed => stats.failed += 1,
                    JobStatus::NotStarted => {}
                }
                if job.status.is_terminal() {
                    if let (Some(start), Some(end)) = (job.started_at, job.last_run) {
                        total_secs += (end - start).num_milliseconds() as f64 / 1000.0;
                        timed += 1;
                    }
                }
            }
            if tree_running {
                stats.running_workflows += 1;
            }
        }

        stats.completed = stats.succeeded + stats.failed;
        if timed > 0 {
            stats.average_completion_secs = total_secs / timed as f64;
        }
        stats
    }

    /// True when no queued tree can make further progress.
    pub fn finished(&self) -> bool {
        self.state().trees.iter().all(|q| q.tree.tree_settled())
    }

    /// Resolves once every queued tree has settled (every job that can run
    /// has run) and its final state is checkpointed. While paused, this
    /// waits for a resume.
    pub async fn wait_for_finished(&self) {
        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.finished() {
                break;
            }
            notified.await;
        }
        self.sync_checkpoints().await;
    }

    /// Like `wait_for_finished`, giving up after `limit`. Returns true if finished.
    pub async fn wait_for_finished_timeout(&self, limit: Duration) -> bool {
        tokio::time::timeout(limit, self.wait_for_finished())
            .await
            .is_ok()
    }
}

// ============================================================================
// 6. DISPATCH & EXECUTION LIFECYCLE
// ============================================================================

impl RunManager {
    /// Starts every runnable job a free slot can be found for.
    fn process_queue(&self) {
        let mut launches = Vec::new();
        {
            let mut state = self.state();
            if state.paused {
                return;
            }

            for q in state.trees.iter_mut() {
                let mut dispatched = false;
                for id in q.tree.ready_jobs() {
                    let item = &q.tree[id].descriptor;

                    let remote_permit = self
                        .inner
                        .remote
                        .as_ref()
                        .filter(|_| self.inner.tools.remote_runnable(item))
                        .and_then(|r| r.slots.clone().try_acquire_owned().ok());

                    let (permit, remote) = match remote_permit {
                        Some(p) => (p, true),
                        None => match self.inner.local_slots.clone().try_acquire_owned() {
                            Ok(p) => (p, false),
                            Err(_) => continue,
                        },
                    };

                    let tools = self.inner.tools.resolve(item);
                    let ctx = JobContext {
                        uuid: q.tree[id].uuid,
                        index: q.tree[id].index,
                        descriptor: item.clone(),
                        params: q.tree.all_params(id),
                        output_dir: q.tree.output_dir(id),
                        input_files: q.tree.input_files(id),
                        tools: tools.as_ref().map(Clone::clone).unwrap_or_default(),
                    };

                    q.tree.mark_running(id, remote);
                    dispatched = true;
                    log::info!(
                        "Dispatching job {} ({}) {}",
                        ctx.index,
                        ctx.job_type(),
                        if remote { "remotely" } else { "locally" }
                    );

                    launches.push(Launch {
                        handle: q.handle,
                        id,
                        ctx,
                        tools,
                        remote,
                        permit,
                    });
                }
                if dispatched {
                    self.checkpoint(q.handle, &q.tree);
                }
            }
        }

        for launch in launches {
            let manager = self.clone();
            tokio::spawn(async move {
                manager.execute_lifecycle(launch).await;
            });
        }
    }

    async fn execute_lifecycle(&self, launch: Launch) {
        let Launch {
            handle,
            id,
            ctx,
            tools,
            remote,
            permit,
        } = launch;

        // Fingerprint before running, so inputs edited mid-run read as changed.
        let tracked = Self::fingerprint(&ctx).await;
        let result = self.run_driver(&ctx, tools, remote).await;
        drop(permit);

        let (errors, output_files) = match result {
            Ok(out) => {
                let mut errors = JobErrors::success();
                for w in out.warnings {
                    errors.push(ErrorLevel::Warning, w);
                }
                for i in out.info {
                    errors.push(ErrorLevel::Info, i);
                }
                (errors, out.output_files)
            }
            Err(e) => {
                log::error!("Job {} ({}) failed: {:#}", ctx.index, ctx.job_type(), e);
                (JobErrors::failure(format!("{:#}", e)), Vec::new())
            }
        };

        let executed_on = if remote {
            self.inner.remote.as_ref().map(|r| r.host.clone())
        } else {
            Some(self.inner.hostname.clone())
        };

        {
            let mut state = self.state();
            match state.find_mut(handle) {
                Some(q) if q.tree.contains(id) => {
                    q.tree
                        .record_completion(id, errors, output_files, tracked, executed_on);
                    let job = &q.tree[id];
                    log::info!(
                        "Job {} ({}) {:?} in {:?}",
                        job.index,
                        job.descriptor.job_type,
                        job.status,
                        ctx.output_dir
                    );
                    self.checkpoint(q.handle, &q.tree);
                }
                _ => log::debug!("Tree {} left the queue; dropping result of job {}", handle, ctx.index),
            }
        }

        self.process_queue();
        self.inner.changed.notify_waiters();
    }

    async fn run_driver(
        &self,
        ctx: &JobContext,
        tools: anyhow::Result<Vec<ToolInfo>>,
        remote: bool,
    ) -> anyhow::Result<JobOutput> {
        tools?;

        tokio::fs::create_dir_all(&ctx.output_dir).await.map_err(|e| {
            anyhow::anyhow!("Failed to create output directory {:?}: {}", ctx.output_dir, e)
        })?;

        let missing: Vec<&FileSpec> = ctx
            .input_files
            .iter()
            .filter(|f| f.required && !f.path.exists())
            .collect();
        if let Some(f) = missing.first() {
            anyhow::bail!("Required input file '{}' not found at {:?}", f.name, f.path);
        }

        let driver = match (&self.inner.remote, remote) {
            (Some(r), true) => r.driver.clone(),
            _ => self.inner.drivers.get(ctx.job_type()),
        };

        // Run in its own task so a panicking driver fails the job
        // instead of leaving it Running forever.
        let task_ctx = ctx.clone();
        match tokio::spawn(async move { driver.execute(&task_ctx).await }).await {
            Ok(result) => result,
            Err(join) => Err(anyhow::anyhow!("Driver task aborted: {}", join)),
        }
    }

    /// Fingerprints the job's inputs and tool binaries off the async threads.
    async fn fingerprint(ctx: &JobContext) -> Vec<TrackedInput> {
        let mut paths: Vec<PathBuf> = ctx.input_files.iter().map(|f| f.path.clone()).collect();
        paths.extend(ctx.tools.iter().filter_map(|t| t.local_path.clone()));

        tokio::task::spawn_blocking(move || {
            provenance::capture_all(paths.iter().map(|p| p.as_path()))
        })
        .await
        .unwrap_or_default()
    }
}
