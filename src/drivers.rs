// src/drivers.rs
//
// =============================================================================
// JOBTREE: EXECUTION BACKENDS
// =============================================================================
//
// The boundary between scheduling and doing.
//
// Responsibilities:
// 1. Define the `JobDriver` trait (one call per job execution).
// 2. Map each `JobType` to the driver that runs it.
// 3. Shared helpers for process output and output-file collection.
//
// A driver never touches the tree. It gets a `JobContext` snapshot and
// returns a `JobOutput`; an `Err` becomes the job's failure record.

use crate::core::{FileSpec, JobParams, JobType, WorkItem};
use crate::tools::ToolInfo;

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

pub mod external;
pub mod slurm;

// ============================================================================
// 1. THE DRIVER TRAIT
// ============================================================================

/// Everything a driver may know about the job it runs.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub uuid: Uuid,
    pub index: usize,
    pub descriptor: WorkItem,
    /// Own params with inherited ones filled in.
    pub params: JobParams,
    pub output_dir: PathBuf,
    pub input_files: Vec<FileSpec>,
    pub tools: Vec<ToolInfo>,
}

impl JobContext {
    pub fn job_type(&self) -> JobType {
        self.descriptor.job_type
    }

    /// First input file with the given role key.
    pub fn input(&self, key: &str) -> Option<&FileSpec> {
        self.input_files.iter().find(|f| f.key == key)
    }

    pub fn tool(&self, name: &str) -> Option<&ToolInfo> {
        self.tools.iter().find(|t| t.name == name)
    }
}

#[derive(Debug, Clone, Default)]
pub struct JobOutput {
    pub output_files: Vec<FileSpec>,
    pub warnings: Vec<String>,
    pub info: Vec<String>,
}

#[async_trait]
pub trait JobDriver: Send + Sync {
    /// Runs one job to completion. `ctx.output_dir` exists when this is called.
    async fn execute(&self, ctx: &JobContext) -> Result<JobOutput>;
}

/// Completes immediately. Used for `Null` jobs, splice points and
/// job types with no external tool.
pub struct NullDriver;

#[async_trait]
impl JobDriver for NullDriver {
    async fn execute(&self, _ctx: &JobContext) -> Result<JobOutput> {
        Ok(JobOutput::default())
    }
}

// ============================================================================
// 2. THE REGISTRY
// ============================================================================

/// Per-type driver lookup. Unregistered types use the fallback,
/// which by default runs the job's tool as a child process.
/// Types that need no external tool complete in-process by default.
#[derive(Clone)]
pub struct DriverRegistry {
    drivers: HashMap<JobType, Arc<dyn JobDriver>>,
    fallback: Arc<dyn JobDriver>,
}

impl Default for DriverRegistry {
    fn default() -> Self {
        let mut registry = Self {
            drivers: HashMap::new(),
            fallback: Arc::new(external::ProcessDriver::new()),
        };
        for job_type in JobType::all().filter(|t| t.required_tools().is_empty()) {
            registry.register(job_type, NullDriver);
        }
        registry
    }
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, job_type: JobType, driver: impl JobDriver + 'static) {
        self.drivers.insert(job_type, Arc::new(driver));
    }

    /// Same driver for every job type, Null included.
    pub fn uniform(driver: impl JobDriver + 'static) -> Self {
        Self {
            drivers: HashMap::new(),
            fallback: Arc::new(driver),
        }
    }

    pub fn set_fallback(&mut self, driver: impl JobDriver + 'static) {
        self.fallback = Arc::new(driver);
    }

    pub fn get(&self, job_type: JobType) -> Arc<dyn JobDriver> {
        self.drivers
            .get(&job_type)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

// ============================================================================
// 3. HELPERS
// ============================================================================

pub mod utils {
    use super::*;

    /// Lists regular files directly inside `dir` as output FileSpecs.
    /// Scheduler bookkeeping files are skipped.
    pub fn collect_outputs(dir: &Path) -> Result<Vec<FileSpec>> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let path = entry.path();
            if path.file_name().map_or(false, |n| n == "runjob.sh") {
                continue;
            }
            let mut spec = FileSpec::from_path(&path, None);
            spec.required = false;
            out.push(spec);
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    /// Last `n` lines of a process stream, for log messages.
    pub fn tail(bytes: &[u8], n: usize) -> String {
        let text = String::from_utf8_lossy(bytes);
        let mut lines: Vec<&str> = text.lines().rev().take(n).collect();
        lines.reverse();
        lines.join("\n")
    }
}
