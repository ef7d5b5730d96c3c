// src/lib.rs
//
// =============================================================================
// JOBTREE: LIBRARY ROOT
// =============================================================================
//
// This file declares the module tree and exports public types.

// 1. Declare Modules
pub mod checkpoint;
pub mod config;
pub mod core;
pub mod drivers;
pub mod error;
pub mod provenance;
pub mod runmanager;
pub mod tools;
pub mod tree;
pub mod workflow;

// 2. Re-exports (The Public API)

pub use crate::core::{JobDescriptor, JobErrors, JobStatus, JobType, TreeStatus, WorkItem};
pub use checkpoint::CheckpointStore;
pub use config::RunConfig;
pub use error::{StoreError, WorkflowError};
pub use runmanager::{RunManager, Statistics, TreeHandle};
pub use tree::{Job, JobId, JobTree};
pub use workflow::Workflow;
