// src/drivers/external.rs
//
// =============================================================================
// JOBTREE: PROCESS DRIVER
// =============================================================================
//
// Runs a job's tool as a local child process.
//
// Responsibilities:
// 1. Resolve the binary (first resolved tool, absolute path).
// 2. Build the command line: optional script, extra args, input files.
// 3. Run inside the job's output directory, logging stdout/stderr to files.
// 4. Report every file left in the output directory as an output.
//
// Params read from the job (own or inherited):
// - "script": script passed before everything else (Ruby / UserScript).
// - "args":   whitespace separated extra arguments.

use crate::drivers::utils::{collect_outputs, tail};
use crate::drivers::{JobContext, JobDriver, JobOutput};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

pub const SCRIPT_PARAM: &str = "script";
pub const ARGS_PARAM: &str = "args";

#[derive(Debug, Clone, Default)]
pub struct ProcessDriver;

impl ProcessDriver {
    pub fn new() -> Self {
        Self
    }

    fn binary(ctx: &JobContext) -> Result<PathBuf> {
        let tool = ctx
            .tools
            .first()
            .ok_or_else(|| anyhow!("{} job has no tool to run", ctx.job_type()))?;
        let path = tool
            .local_path
            .as_ref()
            .ok_or_else(|| anyhow!("Tool '{}' has no local path", tool.name))?;
        Ok(absolute(path))
    }

    fn arguments(ctx: &JobContext) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(script) = ctx.params.get(SCRIPT_PARAM) {
            args.push(absolute(Path::new(script)).to_string_lossy().to_string());
        }
        if let Some(extra) = ctx.params.get(ARGS_PARAM) {
            args.extend(extra.split_whitespace().map(str::to_string));
        }
        for f in &ctx.input_files {
            if f.path.exists() {
                args.push(absolute(&f.path).to_string_lossy().to_string());
            }
        }
        args
    }
}

#[async_trait]
impl JobDriver for ProcessDriver {
    async fn execute(&self, ctx: &JobContext) -> Result<JobOutput> {
        let binary = Self::binary(ctx)?;
        let args = Self::arguments(ctx);

        log::debug!("Job {} exec: {:?} {:?}", ctx.index, binary, args);

        let mut cmd = Command::new(&binary);
        cmd.args(&args);
        cmd.current_dir(&ctx.output_dir);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn {:?} in {:?}", binary, ctx.output_dir))?;
        let output = child.wait_with_output().await?;

        tokio::fs::write(ctx.output_dir.join("stdout.log"), &output.stdout).await?;
        tokio::fs::write(ctx.output_dir.join("stderr.log"), &output.stderr).await?;

        if !output.status.success() {
            let stderr = tail(&output.stderr, 10);
            log::error!(
                "Job {} ({}) exited with {:?}\nSTDERR tail:\n{}",
                ctx.index,
                ctx.job_type(),
                output.status.code(),
                stderr
            );
            return Err(anyhow!(
                "{:?} exited with code {:?}: {}",
                binary,
                output.status.code(),
                stderr
            ));
        }

        let mut result = JobOutput {
            output_files: collect_outputs(&ctx.output_dir)?,
            ..JobOutput::default()
        };
        if !output.stderr.is_empty() {
            result.warnings.push(tail(&output.stderr, 3));
        }
        Ok(result)
    }
}

/// Relative paths are taken against the launch directory, since the child
/// runs with a different working directory. Bare command names are left for PATH lookup.
fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() || path.components().count() == 1 {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}
