// src/error.rs
//
// =============================================================================
// JOBTREE: ERROR TAXONOMY
// =============================================================================
//
// Two families are surfaced to callers:
// - WorkflowError: structural mistakes, reported at the offending call.
// - StoreError: persistence failures, with "not found" kept distinct.
//
// Execution failures never appear here. They are recorded on the failing
// job as `JobErrors` by the RunManager.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("unknown job type: '{0}'")]
    UnknownJobType(String),

    #[error("invalid tool version: '{0}'")]
    InvalidVersion(String),

    #[error("invalid workflow chain '{chain}': {reason}")]
    InvalidChain { chain: String, reason: String },

    /// Attaching the node would make it its own ancestor.
    #[error("adding job {child} under {parent} would create a cycle")]
    CycleDetected { parent: usize, child: usize },

    #[error("job {0} already has an owner")]
    AlreadyOwned(usize),

    #[error("no job with id {0} in this tree")]
    UnknownJob(usize),

    #[error("workflow is not a linear chain: {0}")]
    NonLinear(String),

    /// Workflow-level params would be lost by flattening to work items.
    #[error("workflow params ({0}) cannot be expressed as work items")]
    WorkflowParams(String),

    #[error("no placeholder job with key '{0}'")]
    PlaceholderNotFound(String),

    #[error("replacement workflow is empty")]
    EmptyReplacement,

    #[error("workflow has no jobs")]
    EmptyWorkflow,

    #[error("workflow encoding failed: {0}")]
    Codec(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no stored entry named '{0}'")]
    NotFound(String),

    #[error("workflow must have a name to be persisted")]
    Unnamed,

    #[error("store database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("stored record could not be decoded: {0}")]
    Codec(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}
