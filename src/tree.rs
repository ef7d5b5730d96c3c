// src/tree.rs
//
// =============================================================================
// JOBTREE: EXECUTION TREE
// =============================================================================
//
// The Job arena.
//
// Responsibilities:
// 1. Own every Job node of one tree (petgraph arena, integer ids).
// 2. Keep two distinct successor relations: ordered children, and at most
//    one "finished" continuation per node.
// 3. Answer readiness, aggregate status, and out-of-date questions.
// 4. Derive output directories from position and type.
//
// Edges only ever point downward, and every non-root node has exactly one
// incoming edge, so the structure stays a tree by construction.

use crate::core::{FileSpec, JobErrors, JobParams, JobStatus, TreeStatus, WorkItem};
use crate::error::WorkflowError;
use crate::provenance::{self, TrackedInput};

use chrono::{DateTime, Utc};
use petgraph::algo::has_path_connecting;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::{Index, IndexMut};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Param that switches a tree to flat output directories.
pub const FLAT_OUTPUT_PARAM: &str = "flatoutdir";

/// Root param naming the run a tree belongs to. A RunManager keeps at
/// most one queued tree per key.
pub const WORKFLOW_KEY_PARAM: &str = "workflowkey";

pub type JobId = NodeIndex;

// ============================================================================
// 1. NODE & EDGE TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Link {
    Child { order: usize },
    Finished,
}

/// One node of the execution tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub uuid: Uuid,
    pub descriptor: WorkItem,

    /// Position in the RunManager queue (pre-order). Used by flat output names.
    pub index: usize,

    pub status: JobStatus,
    /// Forced jobs are always considered out of date.
    pub forced: bool,

    pub started_at: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
    pub errors: JobErrors,

    pub output_files: Vec<FileSpec>,
    pub ran_remotely: bool,
    pub executed_on: Option<String>,

    /// Inputs fingerprinted when the last run started.
    #[serde(default)]
    pub tracked: Vec<TrackedInput>,
    #[serde(default)]
    pub history: Vec<(DateTime<Utc>, JobStatus)>,
}

impl Job {
    pub fn new(descriptor: WorkItem) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            descriptor,
            index: 0,
            status: JobStatus::NotStarted,
            forced: false,
            started_at: None,
            last_run: None,
            errors: JobErrors::default(),
            output_files: Vec::new(),
            ran_remotely: false,
            executed_on: None,
            tracked: Vec::new(),
            history: Vec::new(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == JobStatus::Succeeded && self.errors.succeeded()
    }

    /// Causal ordering check. Equal timestamps count as "before" in both
    /// directions, since fast parallel jobs can finish within one tick.
    pub fn ran_before(&self, other: &Job) -> bool {
        match (self.last_run, other.last_run) {
            (Some(a), Some(b)) => a <= b,
            _ => false,
        }
    }

    fn set_status(&mut self, status: JobStatus) {
        self.status = status;
        self.history.push((Utc::now(), status));
    }
}

// ============================================================================
// 2. THE TREE
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobTree {
    graph: DiGraph<Job, Link>,
    root: JobId,
    output_root: PathBuf,
}

impl JobTree {
    pub fn new(root: WorkItem, output_root: impl Into<PathBuf>) -> Self {
        let mut graph = DiGraph::new();
        let root = graph.add_node(Job::new(root));
        Self {
            graph,
            root,
            output_root: output_root.into(),
        }
    }

    pub fn root(&self) -> JobId {
        self.root
    }

    pub fn root_job(&self) -> &Job {
        &self.graph[self.root]
    }

    /// The root's non-empty `workflowkey` param, if any.
    pub fn workflow_key(&self) -> Option<&str> {
        self.root_job()
            .descriptor
            .params
            .get(WORKFLOW_KEY_PARAM)
            .filter(|k| !k.is_empty())
    }

    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    pub fn set_output_root(&mut self, root: impl Into<PathBuf>) {
        self.output_root = root.into();
    }

    pub fn get(&self, id: JobId) -> Option<&Job> {
        self.graph.node_weight(id)
    }

    pub fn contains(&self, id: JobId) -> bool {
        self.graph.node_weight(id).is_some()
    }

    /// Adds a detached node. Attach it with `add_child` or `set_finished_job`.
    pub fn add_job(&mut self, item: WorkItem) -> JobId {
        self.graph.add_node(Job::new(item))
    }

    /// Appends `child` to `parent`'s ordered children.
    pub fn add_child(&mut self, parent: JobId, child: JobId) -> Result<(), WorkflowError> {
        self.check_attach(parent, child)?;
        let order = self.children(parent).len();
        self.graph.add_edge(parent, child, Link::Child { order });
        Ok(())
    }

    /// Sets (or replaces) `parent`'s finished continuation.
    /// A replaced continuation becomes detached.
    pub fn set_finished_job(&mut self, parent: JobId, job: JobId) -> Result<(), WorkflowError> {
        self.check_attach(parent, job)?;
        let existing = self
            .graph
            .edges_directed(parent, Direction::Outgoing)
            .find(|e| *e.weight() == Link::Finished)
            .map(|e| e.id());
        if let Some(edge) = existing {
            self.graph.remove_edge(edge);
        }
        self.graph.add_edge(parent, job, Link::Finished);
        Ok(())
    }

    fn check_attach(&self, parent: JobId, child: JobId) -> Result<(), WorkflowError> {
        for id in [parent, child] {
            if !self.contains(id) {
                return Err(WorkflowError::UnknownJob(id.index()));
            }
        }

        // Rejects self-loops, the root, and any ancestor of `parent`.
        if child == self.root || has_path_connecting(&self.graph, child, parent, None) {
            return Err(WorkflowError::CycleDetected {
                parent: parent.index(),
                child: child.index(),
            });
        }

        if self.parent(child).is_some() {
            return Err(WorkflowError::AlreadyOwned(child.index()));
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Read accessors
    // ------------------------------------------------------------------------

    pub fn children(&self, id: JobId) -> Vec<JobId> {
        let mut kids: Vec<(usize, JobId)> = self
            .graph
            .edges_directed(id, Direction::Outgoing)
            .filter_map(|e| match e.weight() {
                Link::Child { order } => Some((*order, e.target())),
                Link::Finished => None,
            })
            .collect();
        kids.sort_by_key(|(order, _)| *order);
        kids.into_iter().map(|(_, id)| id).collect()
    }

    pub fn finished_job(&self, id: JobId) -> Option<JobId> {
        self.graph
            .edges_directed(id, Direction::Outgoing)
            .find(|e| *e.weight() == Link::Finished)
            .map(|e| e.target())
    }

    pub fn parent(&self, id: JobId) -> Option<JobId> {
        self.graph
            .edges_directed(id, Direction::Incoming)
            .next()
            .map(|e| e.source())
    }

    pub fn is_finished_job(&self, id: JobId) -> bool {
        self.graph
            .edges_directed(id, Direction::Incoming)
            .any(|e| *e.weight() == Link::Finished)
    }

    /// Position among the parent's children (None for roots and finished jobs).
    pub fn child_position(&self, id: JobId) -> Option<usize> {
        let parent = self.parent(id)?;
        self.children(parent).iter().position(|c| *c == id)
    }

    /// Stable pre-order from the root: node, children in order, then finished job.
    pub fn pre_order(&self) -> Vec<JobId> {
        self.pre_order_from(self.root)
    }

    pub fn pre_order_from(&self, start: JobId) -> Vec<JobId> {
        let mut out = Vec::new();
        let mut stack = vec![start];
        while let Some(id) = stack.pop() {
            out.push(id);
            if let Some(f) = self.finished_job(id) {
                stack.push(f);
            }
            for c in self.children(id).into_iter().rev() {
                stack.push(c);
            }
        }
        out
    }

    /// Number of nodes reachable from the root.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.pre_order().len()
    }
}

impl Index<JobId> for JobTree {
    type Output = Job;

    fn index(&self, id: JobId) -> &Job {
        &self.graph[id]
    }
}

impl IndexMut<JobId> for JobTree {
    fn index_mut(&mut self, id: JobId) -> &mut Job {
        &mut self.graph[id]
    }
}

// ============================================================================
// 3. STATUS PROPAGATION
// ============================================================================

impl JobTree {
    pub fn tree_status(&self) -> TreeStatus {
        self.tree_status_of(self.root)
    }

    /// Failed on the first failed node (depth-first); Finished iff every
    /// reachable node, finished jobs included, succeeded.
    pub fn tree_status_of(&self, id: JobId) -> TreeStatus {
        let mut all_succeeded = true;
        let mut all_waiting = true;

        for n in self.pre_order_from(id) {
            let job = &self.graph[n];
            match job.status {
                JobStatus::Failed => return TreeStatus::Failed,
                JobStatus::Succeeded if !job.errors.succeeded() => return TreeStatus::Failed,
                JobStatus::Succeeded => all_waiting = false,
                JobStatus::Running => {
                    all_succeeded = false;
                    all_waiting = false;
                }
                JobStatus::NotStarted => all_succeeded = false,
            }
        }

        if all_succeeded {
            TreeStatus::Finished
        } else if all_waiting {
            TreeStatus::NotStarted
        } else {
            TreeStatus::Running
        }
    }

    /// Completion time of the last node to finish, or None if any node
    /// in the tree has not completed.
    pub fn tree_last_run(&self) -> Option<DateTime<Utc>> {
        self.tree_last_run_of(self.root)
    }

    pub fn tree_last_run_of(&self, id: JobId) -> Option<DateTime<Utc>> {
        let mut last: Option<DateTime<Utc>> = None;
        for n in self.pre_order_from(id) {
            let t = self.graph[n].last_run?;
            last = Some(last.map_or(t, |l| l.max(t)));
        }
        last
    }

    pub fn ran_before(&self, a: JobId, b: JobId) -> bool {
        self.graph[a].ran_before(&self.graph[b])
    }

    /// All error records in pre-order, merged.
    pub fn tree_errors(&self) -> JobErrors {
        let mut out = JobErrors::success();
        for n in self.pre_order() {
            out.merge(&self.graph[n].errors);
        }
        out
    }

    /// True once no further work can happen below (and including) `id`.
    /// A failed node's children never start, but its finished job still does.
    pub fn settled(&self, id: JobId) -> bool {
        let job = &self.graph[id];
        let finished_settled = self.finished_job(id).map_or(true, |f| self.settled(f));
        match job.status {
            JobStatus::NotStarted | JobStatus::Running => false,
            JobStatus::Failed => finished_settled,
            JobStatus::Succeeded => {
                self.children(id).into_iter().all(|c| self.settled(c)) && finished_settled
            }
        }
    }

    pub fn tree_settled(&self) -> bool {
        self.settled(self.root)
    }

    /// A job may start when:
    /// - it has not started yet, and
    /// - it is the root, or
    /// - it is a child and its parent succeeded, or
    /// - it is a finished job, its parent is terminal and every sibling
    ///   child subtree has settled.
    pub fn runnable(&self, id: JobId) -> bool {
        if self.graph[id].status != JobStatus::NotStarted {
            return false;
        }

        let parent = match self.parent(id) {
            None => return true,
            Some(p) => p,
        };
        let pjob = &self.graph[parent];

        if self.is_finished_job(id) {
            pjob.status.is_terminal()
                && self.children(parent).into_iter().all(|c| self.settled(c))
        } else {
            pjob.status == JobStatus::Succeeded && pjob.errors.succeeded()
        }
    }

    pub fn ready_jobs(&self) -> Vec<JobId> {
        self.pre_order()
            .into_iter()
            .filter(|id| self.runnable(*id))
            .collect()
    }

    pub fn running_jobs(&self) -> Vec<JobId> {
        self.pre_order()
            .into_iter()
            .filter(|id| self.graph[*id].status == JobStatus::Running)
            .collect()
    }

    // ------------------------------------------------------------------------
    // Mutation (RunManager only, once enqueued)
    // ------------------------------------------------------------------------

    pub fn mark_running(&mut self, id: JobId, remote: bool) {
        let job = &mut self.graph[id];
        job.started_at = Some(Utc::now());
        job.ran_remotely = remote;
        job.set_status(JobStatus::Running);
    }

    pub fn record_completion(
        &mut self,
        id: JobId,
        errors: JobErrors,
        output_files: Vec<FileSpec>,
        tracked: Vec<TrackedInput>,
        executed_on: Option<String>,
    ) {
        let job = &mut self.graph[id];
        let status = if errors.succeeded() {
            JobStatus::Succeeded
        } else {
            JobStatus::Failed
        };
        job.errors = errors;
        job.output_files = output_files;
        job.tracked = tracked;
        job.executed_on = executed_on;
        job.forced = false;
        job.last_run = Some(Utc::now());
        job.set_status(status);
    }

    pub fn set_forced(&mut self, id: JobId, forced: bool) {
        self.graph[id].forced = forced;
    }

    /// Clears the results of one node so it will be dispatched again.
    pub fn reset(&mut self, id: JobId) {
        let job = &mut self.graph[id];
        job.started_at = None;
        job.last_run = None;
        job.errors = JobErrors::default();
        job.output_files.clear();
        job.tracked.clear();
        job.ran_remotely = false;
        job.executed_on = None;
        job.set_status(JobStatus::NotStarted);
    }

    /// After a restore, jobs that were mid-flight must run again.
    pub fn reset_interrupted(&mut self) -> usize {
        let running = self.running_jobs();
        for id in &running {
            self.reset(*id);
        }
        running.len()
    }

    /// Assigns pre-order queue indices starting at `start`. Returns the next free index.
    pub fn reindex(&mut self, start: usize) -> usize {
        let mut next = start;
        for id in self.pre_order() {
            self.graph[id].index = next;
            next += 1;
        }
        next
    }
}

// ============================================================================
// 4. PARAMS, FILES & OUTPUT DIRECTORIES
// ============================================================================

impl JobTree {
    /// Own params, with ancestors' params filling in anything unset.
    pub fn all_params(&self, id: JobId) -> JobParams {
        let mut params = self.graph[id].descriptor.params.clone();
        let mut cursor = self.parent(id);
        while let Some(p) = cursor {
            params.merge_missing(&self.graph[p].descriptor.params);
            cursor = self.parent(p);
        }
        params
    }

    pub fn flat_output(&self, id: JobId) -> bool {
        self.all_params(id).has(FLAT_OUTPUT_PARAM)
    }

    /// Root:      <output_root>/[<index>-]<Type>
    /// Child:     <parent_dir>/[<index>-]<Type>-<position>
    /// Finished:  <parent_dir>/[<index>-]<Type>-finishedjob
    /// In flat mode every node lands directly under the root's parent directory.
    pub fn output_dir(&self, id: JobId) -> PathBuf {
        let job = &self.graph[id];
        let flat = self.flat_output(id);
        let prefix = if flat {
            format!("{}-", job.index)
        } else {
            String::new()
        };

        let (parent_path, suffix) = match self.parent(id) {
            None => (self.output_root.clone(), String::new()),
            Some(p) => {
                let suffix = if self.is_finished_job(id) {
                    "-finishedjob".to_string()
                } else {
                    format!("-{}", self.child_position(id).unwrap_or(0))
                };
                let pdir = self.output_dir(p);
                let base = if flat {
                    pdir.parent().map(Path::to_path_buf).unwrap_or(pdir)
                } else {
                    pdir
                };
                (base, suffix)
            }
        };

        parent_path.join(format!("{}{}{}", prefix, job.descriptor.job_type.name(), suffix))
    }

    /// Files a job consumes: its own descriptor files, the parent's outputs,
    /// and for a finished job the outputs of every sibling subtree.
    pub fn input_files(&self, id: JobId) -> Vec<FileSpec> {
        let mut files = self.graph[id].descriptor.files.clone();
        if let Some(p) = self.parent(id) {
            files.extend(self.graph[p].output_files.iter().cloned());
            if self.is_finished_job(id) {
                for c in self.children(p) {
                    for n in self.pre_order_from(c) {
                        files.extend(self.graph[n].output_files.iter().cloned());
                    }
                }
            }
        }
        files
    }
}

// ============================================================================
// 5. OUT-OF-DATE DETECTION
// ============================================================================

impl JobTree {
    /// A job is out of date if it never ran, was forced, one of its tracked
    /// inputs changed, or something it depends on is newer or out of date.
    /// Detached nodes are judged on their own state only.
    pub fn out_of_date(&self, id: JobId) -> bool {
        let known = self.out_of_date_map();
        known
            .get(&id)
            .copied()
            .unwrap_or_else(|| self.judge_out_of_date(id, &known))
    }

    /// Out-of-date flag of every reachable node, in one pre-order pass.
    /// Pre-order visits a parent before its children, and a node's child
    /// subtrees before its finished job, so every dependency is decided first.
    pub fn out_of_date_map(&self) -> HashMap<JobId, bool> {
        let order = self.pre_order();
        let mut known = HashMap::with_capacity(order.len());
        for id in order {
            let stale = self.judge_out_of_date(id, &known);
            known.insert(id, stale);
        }
        known
    }

    fn judge_out_of_date(&self, id: JobId, known: &HashMap<JobId, bool>) -> bool {
        let job = &self.graph[id];
        let last = match job.last_run {
            None => return true,
            Some(t) => t,
        };
        if job.forced {
            return true;
        }

        if let Some(parent) = self.parent(id) {
            let pjob = &self.graph[parent];
            if known.get(&parent).copied().unwrap_or(true)
                || pjob.last_run.map_or(true, |pl| pl > last)
            {
                return true;
            }

            // The finished job depends on every node its sibling subtrees ran.
            if self.is_finished_job(id) {
                for c in self.children(parent) {
                    for n in self.pre_order_from(c) {
                        if let Some(t) = self.graph[n].last_run {
                            if t > last || known.get(&n).copied().unwrap_or(false) {
                                return true;
                            }
                        }
                    }
                }
            }
        }

        // Inputs were fingerprinted when the job started, so an edit made
        // while it ran still counts.
        let since = job.started_at.unwrap_or(last);
        provenance::any_changed(&job.tracked, since)
    }

    pub fn tree_out_of_date(&self) -> bool {
        self.out_of_date_map().values().any(|stale| *stale)
    }

    /// Completed jobs that are out of date, in pre-order.
    pub fn stale_jobs(&self) -> Vec<JobId> {
        let known = self.out_of_date_map();
        self.pre_order()
            .into_iter()
            .filter(|id| self.graph[*id].status.is_terminal() && known[id])
            .collect()
    }

    /// Resets every completed job that is out of date, along with anything
    /// depending on it. Returns the ids that were reset.
    pub fn restart_out_of_date(&mut self) -> Vec<JobId> {
        let stale = self.stale_jobs();
        for id in &stale {
            self.reset(*id);
        }
        stale
    }

    /// Resets the given jobs, skipping any that ran again (or stopped
    /// being complete) since `last_run` was observed.
    pub fn reset_unchanged(&mut self, observed: &[(JobId, Option<DateTime<Utc>>)]) -> Vec<JobId> {
        let mut reset = Vec::new();
        for (id, last_run) in observed {
            let current = match self.get(*id) {
                Some(job) => job,
                None => continue,
            };
            if current.status.is_terminal() && current.last_run == *last_run {
                self.reset(*id);
                reset.push(*id);
            }
        }
        reset
    }
}
