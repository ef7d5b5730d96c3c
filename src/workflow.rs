// src/workflow.rs
//
// =============================================================================
// JOBTREE: WORKFLOW BUILDER
// =============================================================================
//
// The Template.
//
// Responsibilities:
// 1. Build step trees from chain text ("A->B->C"), WorkItems, or a JobTree.
// 2. Splice sub-workflows into tagged placeholder steps.
// 3. Encode/decode a canonical JSON form.
// 4. Materialize fresh JobTrees (new node identity on every call).

use crate::core::{FileSpec, JobParams, JobType, WorkItem};
use crate::error::WorkflowError;
use crate::provenance::sha256_bytes;
use crate::tree::{JobId, JobTree, FLAT_OUTPUT_PARAM, WORKFLOW_KEY_PARAM};

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

const CHAIN_SEPARATOR: &str = "->";

// ============================================================================
// 1. STEP TREE
// ============================================================================

/// One step of a workflow template, with its own successors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowStep {
    #[serde(flatten)]
    pub item: WorkItem,
    #[serde(default)]
    pub children: Vec<WorkflowStep>,
    #[serde(rename = "finishedjob", default)]
    pub finished: Option<Box<WorkflowStep>>,
}

impl WorkflowStep {
    pub fn new(item: WorkItem) -> Self {
        Self {
            item,
            children: Vec::new(),
            finished: None,
        }
    }

    /// Follows the last child down to a leaf.
    fn tail_mut(&mut self) -> &mut WorkflowStep {
        let mut cursor = self;
        while !cursor.children.is_empty() {
            let last = cursor.children.len() - 1;
            cursor = &mut cursor.children[last];
        }
        cursor
    }

    fn is_linear(&self) -> bool {
        self.finished.is_none()
            && self.children.len() <= 1
            && self.children.iter().all(WorkflowStep::is_linear)
    }

    fn pre_order<'a>(&'a self, out: &mut Vec<&'a WorkflowStep>) {
        out.push(self);
        for c in &self.children {
            c.pre_order(out);
        }
        if let Some(f) = &self.finished {
            f.pre_order(out);
        }
    }

    /// Rebuilds this subtree with every placeholder for `key` replaced.
    /// Original children hang under the tail of the inserted steps.
    fn splice(self, key: &str, replacement: &WorkflowStep, count: &mut usize) -> WorkflowStep {
        let children: Vec<WorkflowStep> = self
            .children
            .into_iter()
            .map(|c| c.splice(key, replacement, count))
            .collect();
        let finished = self
            .finished
            .map(|f| Box::new(f.splice(key, replacement, count)));

        if !self.item.is_placeholder_for(key) {
            return WorkflowStep {
                item: self.item,
                children,
                finished,
            };
        }

        *count += 1;
        let mut inserted = replacement.clone();
        inserted.tail_mut().children.extend(children);

        if let Some(f) = finished {
            inserted.append_finished(f);
        }
        inserted
    }

    /// Chains `f` onto the first free continuation slot.
    fn append_finished(&mut self, f: Box<WorkflowStep>) {
        match self.finished.as_mut() {
            Some(next) => next.append_finished(f),
            None => self.finished = Some(f),
        }
    }

    fn materialize(&self, tree: &mut JobTree, id: JobId) -> Result<(), WorkflowError> {
        for child in &self.children {
            let cid = tree.add_job(child.item.clone());
            tree.add_child(id, cid)?;
            child.materialize(tree, cid)?;
        }
        if let Some(f) = &self.finished {
            let fid = tree.add_job(f.item.clone());
            tree.set_finished_job(id, fid)?;
            f.materialize(tree, fid)?;
        }
        Ok(())
    }

    fn capture(tree: &JobTree, id: JobId) -> WorkflowStep {
        WorkflowStep {
            item: tree[id].descriptor.clone(),
            children: tree
                .children(id)
                .into_iter()
                .map(|c| WorkflowStep::capture(tree, c))
                .collect(),
            finished: tree
                .finished_job(id)
                .map(|f| Box::new(WorkflowStep::capture(tree, f))),
        }
    }
}

// ============================================================================
// 2. THE WORKFLOW
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workflow {
    #[serde(default)]
    pub name: Option<String>,
    /// Applied to the root job at materialization; inherited by the tree.
    #[serde(default)]
    pub params: JobParams,
    #[serde(rename = "job", default)]
    pub root: Option<WorkflowStep>,
}

impl Workflow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses "ModelToIdf->EnergyPlus->Ruby" into a straight chain.
    /// An empty string yields an empty workflow.
    pub fn from_chain(chain: &str) -> Result<Self, WorkflowError> {
        let mut wf = Workflow::new();
        if chain.trim().is_empty() {
            return Ok(wf);
        }

        for segment in chain.split(CHAIN_SEPARATOR) {
            if segment.trim().is_empty() {
                return Err(WorkflowError::InvalidChain {
                    chain: chain.to_string(),
                    reason: "empty step".into(),
                });
            }
            let job_type: JobType = segment.parse()?;
            wf.add_job(job_type);
        }
        Ok(wf)
    }

    /// Builds a straight chain from a flat list of items.
    pub fn from_work_items(items: &[WorkItem]) -> Self {
        let mut wf = Workflow::new();
        for item in items {
            wf.add_job(item.clone());
        }
        wf
    }

    /// Captures the structure and descriptors of an existing tree.
    /// Runtime state (status, timestamps) is not part of a workflow.
    pub fn from_job_tree(tree: &JobTree) -> Self {
        Self {
            name: None,
            params: JobParams::new(),
            root: Some(WorkflowStep::capture(tree, tree.root())),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = Some(name.into());
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn add_param(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.params.insert(key, value);
    }

    pub fn set_flat_output(&mut self, flat: bool) {
        if flat {
            self.params.insert(FLAT_OUTPUT_PARAM, "");
        } else {
            self.params.remove(FLAT_OUTPUT_PARAM);
        }
    }

    pub fn flat_output(&self) -> bool {
        self.params.has(FLAT_OUTPUT_PARAM)
    }

    // ------------------------------------------------------------------------
    // Construction
    // ------------------------------------------------------------------------

    /// Appends a job after the current tail.
    pub fn add_job(&mut self, item: impl Into<WorkItem>) {
        let step = WorkflowStep::new(item.into());
        match &mut self.root {
            None => self.root = Some(step),
            Some(root) => root.tail_mut().children.push(step),
        }
    }

    /// Appends a tagged Null job for `replace_jobs` to splice into later.
    pub fn add_placeholder(&mut self, key: impl Into<String>) {
        self.add_job(WorkItem::placeholder(key));
    }

    /// Appends `other`'s whole tree as a child of the current tail.
    /// Params set on `other` are kept unless already set here.
    pub fn add_workflow(&mut self, other: &Workflow) {
        self.params.merge_missing(&other.params);
        let Some(step) = other.root.clone() else {
            return;
        };
        match &mut self.root {
            None => self.root = Some(step),
            Some(root) => root.tail_mut().children.push(step),
        }
    }

    /// Makes `other` the root's finished continuation: it runs once the
    /// whole rest of the tree settles, whatever the outcome.
    pub fn set_finished_workflow(&mut self, other: &Workflow) -> Result<(), WorkflowError> {
        let root = self.root.as_mut().ok_or(WorkflowError::EmptyWorkflow)?;
        let step = other.root.clone().ok_or(WorkflowError::EmptyReplacement)?;
        root.finished = Some(Box::new(step));
        Ok(())
    }

    /// Replaces every placeholder tagged `key` with a copy of `replacement`.
    /// The placeholder's children move under the tail of the inserted steps
    /// and its finished job is preserved. Returns the number of splices.
    pub fn replace_jobs(&mut self, key: &str, replacement: &Workflow) -> Result<usize, WorkflowError> {
        let replacement = replacement
            .root
            .as_ref()
            .ok_or(WorkflowError::EmptyReplacement)?;
        let root = self
            .root
            .take()
            .ok_or_else(|| WorkflowError::PlaceholderNotFound(key.to_string()))?;

        let mut count = 0;
        self.root = Some(root.splice(key, replacement, &mut count));

        if count == 0 {
            return Err(WorkflowError::PlaceholderNotFound(key.to_string()));
        }
        log::debug!("Spliced {} placeholder(s) for key '{}'", count, key);
        Ok(count)
    }

    pub fn replace_jobs_with_type(&mut self, key: &str, job_type: JobType) -> Result<usize, WorkflowError> {
        let mut single = Workflow::new();
        single.add_job(job_type);
        self.replace_jobs(key, &single)
    }

    // ------------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------------

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    pub fn len(&self) -> usize {
        self.steps().len()
    }

    /// Steps in pre-order (children before the finished continuation).
    pub fn steps(&self) -> Vec<&WorkflowStep> {
        let mut out = Vec::new();
        if let Some(root) = &self.root {
            root.pre_order(&mut out);
        }
        out
    }

    /// Type of the step new jobs are appended after.
    pub fn tail_type(&self) -> Option<JobType> {
        let mut cursor = self.root.as_ref()?;
        while let Some(last) = cursor.children.last() {
            cursor = last;
        }
        Some(cursor.item.job_type)
    }

    pub fn job_types(&self) -> Vec<JobType> {
        self.steps().iter().map(|s| s.item.job_type).collect()
    }

    pub fn is_linear(&self) -> bool {
        self.root.as_ref().map_or(true, WorkflowStep::is_linear)
    }

    fn ensure_linear(&self) -> Result<(), WorkflowError> {
        if self.is_linear() {
            return Ok(());
        }
        Err(WorkflowError::NonLinear(format!(
            "{} steps, branching or finished job present",
            self.len()
        )))
    }

    /// Flattens a straight chain. Branching trees (or any finished
    /// continuation) are rejected, and so are workflow-level params
    /// (flat output included), which a plain item list cannot carry.
    pub fn to_work_items(&self) -> Result<Vec<WorkItem>, WorkflowError> {
        self.ensure_linear()?;
        if !self.params.is_empty() {
            let keys: Vec<&str> = self.params.iter().map(|(k, _)| k.as_str()).collect();
            return Err(WorkflowError::WorkflowParams(keys.join(", ")));
        }
        Ok(self.steps().into_iter().map(|s| s.item.clone()).collect())
    }

    /// "A->B->C" for a straight chain. Params are not part of chain text.
    pub fn to_chain(&self) -> Result<String, WorkflowError> {
        self.ensure_linear()?;
        Ok(self
            .steps()
            .iter()
            .map(|s| s.item.job_type.name())
            .collect::<Vec<_>>()
            .join(CHAIN_SEPARATOR))
    }

    // ------------------------------------------------------------------------
    // Encoding
    // ------------------------------------------------------------------------

    pub fn encode(&self) -> Result<String, WorkflowError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn decode(text: &str) -> Result<Self, WorkflowError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Content key: SHA256 over the encoded steps and params (the name is ignored).
    pub fn key(&self) -> Result<String, WorkflowError> {
        let anonymous = Workflow {
            name: None,
            ..self.clone()
        };
        Ok(sha256_bytes(anonymous.encode()?.as_bytes()))
    }

    // ------------------------------------------------------------------------
    // Materialization
    // ------------------------------------------------------------------------

    /// Builds a brand-new JobTree rooted at `out_dir`. The optional input
    /// file is attached to the root job, keyed by its extension.
    pub fn create(&self, out_dir: impl AsRef<Path>, input_file: Option<&Path>) -> Result<JobTree, WorkflowError> {
        let root = self.root.as_ref().ok_or(WorkflowError::EmptyWorkflow)?;

        let mut item = root.item.clone();
        item.params.merge_missing(&self.params);
        if let Some(file) = input_file {
            item.files.push(FileSpec::from_path(file, None));
        }

        let mut tree = JobTree::new(item, out_dir.as_ref());
        let root_id = tree.root();
        root.materialize(&mut tree, root_id)?;
        tree.reindex(0);
        Ok(tree)
    }

    /// Like `create`, and stamps the root with a `workflowkey` derived from
    /// this workflow, the output root and the input file. Enqueuing a second
    /// tree with the same key restarts the queued one instead.
    pub fn create_keyed(&self, out_dir: impl AsRef<Path>, input_file: Option<&Path>) -> Result<JobTree, WorkflowError> {
        let out_dir = out_dir.as_ref();
        let input = input_file.map(|p| p.display().to_string()).unwrap_or_default();
        let run_key = sha256_bytes(format!("{}\n{}\n{}", self.key()?, out_dir.display(), input).as_bytes());

        let mut tree = self.create(out_dir, input_file)?;
        let root = tree.root();
        tree[root].descriptor.params.insert(WORKFLOW_KEY_PARAM, run_key);
        Ok(tree)
    }
}

impl FromStr for Workflow {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Workflow::from_chain(s)
    }
}
