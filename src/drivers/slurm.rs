// src/drivers/slurm.rs
//
// =============================================================================
// JOBTREE: SLURM BACKEND
// =============================================================================
//
// Delegates a job to a SLURM cluster reached through a remote shell.
//
// Lifecycle of one remote job:
// 1. mkdir <remote_root>/<uuid>, upload existing input files.
// 2. Render runjob.sh locally (kept in the output dir), upload it.
// 3. `sbatch --parsable runjob.sh` -> batch id.
// 4. Poll `squeue -h -j <id>` until the id leaves the queue.
// 5. Read the exit code file, download every produced file.
//
// Shell access is behind `RemoteShell` so it can be swapped out in tests.

use crate::config::SlurmConfig;
use crate::core::FileSpec;
use crate::drivers::utils::tail;
use crate::drivers::{JobContext, JobDriver, JobOutput};
use crate::drivers::external::{ARGS_PARAM, SCRIPT_PARAM};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

const BATCH_SCRIPT: &str = "runjob.sh";
const EXIT_CODE_FILE: &str = "exitcode";

// ============================================================================
// 1. REMOTE SHELL
// ============================================================================

#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Runs `command` through the remote login shell and returns stdout.
    async fn run(&self, command: &str) -> Result<String>;
    async fn put(&self, local: &Path, remote: &str) -> Result<()>;
    async fn get(&self, remote: &str, local: &Path) -> Result<()>;
}

/// `ssh` / `scp` in batch mode. Key-based auth must already be set up.
pub struct SshShell {
    target: String,
}

impl SshShell {
    pub fn new(cfg: &SlurmConfig) -> Self {
        Self {
            target: cfg.target(),
        }
    }

    async fn checked(mut cmd: Command, what: &str) -> Result<String> {
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        let output = cmd
            .output()
            .await
            .with_context(|| format!("Failed to spawn {}", what))?;
        if !output.status.success() {
            bail!(
                "{} failed ({:?}): {}",
                what,
                output.status.code(),
                tail(&output.stderr, 5)
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl RemoteShell for SshShell {
    async fn run(&self, command: &str) -> Result<String> {
        let mut cmd = Command::new("ssh");
        cmd.args(["-o", "BatchMode=yes", self.target.as_str(), command]);
        Self::checked(cmd, "ssh").await
    }

    async fn put(&self, local: &Path, remote: &str) -> Result<()> {
        let mut cmd = Command::new("scp");
        cmd.args(["-q", "-B"])
            .arg(local)
            .arg(format!("{}:{}", self.target, remote));
        Self::checked(cmd, "scp upload").await.map(|_| ())
    }

    async fn get(&self, remote: &str, local: &Path) -> Result<()> {
        let mut cmd = Command::new("scp");
        cmd.args(["-q", "-B"])
            .arg(format!("{}:{}", self.target, remote))
            .arg(local);
        Self::checked(cmd, "scp download").await.map(|_| ())
    }
}

// ============================================================================
// 2. THE BACKEND
// ============================================================================

pub struct SlurmBackend<S: RemoteShell> {
    shell: S,
    cfg: SlurmConfig,
}

impl SlurmBackend<SshShell> {
    pub fn over_ssh(cfg: SlurmConfig) -> Self {
        Self::new(SshShell::new(&cfg), cfg)
    }
}

impl<S: RemoteShell> SlurmBackend<S> {
    pub fn new(shell: S, cfg: SlurmConfig) -> Self {
        Self { shell, cfg }
    }

    pub fn config(&self) -> &SlurmConfig {
        &self.cfg
    }

    fn remote_dir(&self, ctx: &JobContext) -> String {
        format!("{}/{}", self.cfg.remote_root.trim_end_matches('/'), ctx.uuid)
    }

    /// The sbatch script for `ctx`. Inputs are referenced by file name,
    /// since they are uploaded next to the script.
    pub fn render_script(&self, ctx: &JobContext, remote_dir: &str) -> Result<String> {
        let tool = ctx
            .tools
            .first()
            .ok_or_else(|| anyhow!("{} job has no tool to run", ctx.job_type()))?;
        let binary = tool
            .remote_path
            .as_ref()
            .ok_or_else(|| anyhow!("Tool '{}' has no remote path", tool.name))?;

        let mut s = String::from("#!/bin/bash\n");
        s.push_str(&format!("#SBATCH --job-name=jobtree-{}\n", ctx.index));
        s.push_str("#SBATCH --output=stdout.log\n#SBATCH --error=stderr.log\n");
        if let Some(p) = &self.cfg.partition {
            s.push_str(&format!("#SBATCH --partition={}\n", p));
        }
        if let Some(a) = &self.cfg.account {
            s.push_str(&format!("#SBATCH --account={}\n", a));
        }
        if let Some(t) = self.cfg.max_time_min {
            s.push_str(&format!("#SBATCH --time={}\n", t));
        }
        s.push('\n');
        s.push_str(&format!("cd {}\n", quote(remote_dir)));

        let mut line = vec![quote(&binary.to_string_lossy())];
        if let Some(script) = ctx.params.get(SCRIPT_PARAM) {
            let name = Path::new(script)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| script.to_string());
            line.push(quote(&name));
        }
        if let Some(extra) = ctx.params.get(ARGS_PARAM) {
            line.extend(extra.split_whitespace().map(quote));
        }
        for f in uploads(ctx) {
            line.push(quote(&f.name));
        }
        s.push_str(&line.join(" "));
        s.push('\n');
        s.push_str(&format!("echo $? > {}\n", EXIT_CODE_FILE));
        Ok(s)
    }

    async fn submit(&self, remote_dir: &str) -> Result<String> {
        let out = self
            .shell
            .run(&format!("cd {} && sbatch --parsable {}", quote(remote_dir), BATCH_SCRIPT))
            .await?;
        // --parsable prints "<id>" or "<id>;<cluster>"
        let id = out.trim().split(';').next().unwrap_or_default().to_string();
        if id.is_empty() {
            bail!("sbatch returned no job id");
        }
        Ok(id)
    }

    async fn wait(&self, batch_id: &str) -> Result<()> {
        let interval = Duration::from_millis(self.cfg.poll_interval_ms.max(1));
        loop {
            let state = self
                .shell
                .run(&format!("squeue -h -j {} -o %T", batch_id))
                .await?;
            let state = state.trim();
            if state.is_empty() {
                return Ok(());
            }
            log::debug!("Batch job {} is {}", batch_id, state);
            tokio::time::sleep(interval).await;
        }
    }

    /// Fetches every file in `remote_dir` except the script, the exit code
    /// and the names in `skip` (the uploaded inputs).
    async fn download(
        &self,
        remote_dir: &str,
        local_dir: &Path,
        skip: &[String],
    ) -> Result<Vec<FileSpec>> {
        let listing = self.shell.run(&format!("ls -1 {}", quote(remote_dir))).await?;
        let mut files = Vec::new();
        for name in listing.lines().map(str::trim).filter(|n| !n.is_empty()) {
            if name == BATCH_SCRIPT || name == EXIT_CODE_FILE || skip.iter().any(|s| s == name) {
                continue;
            }
            let local = local_dir.join(name);
            self.shell
                .get(&format!("{}/{}", remote_dir, name), &local)
                .await?;
            let mut spec = FileSpec::from_path(&local, None);
            spec.required = false;
            files.push(spec);
        }
        Ok(files)
    }
}

#[async_trait]
impl<S: RemoteShell> JobDriver for SlurmBackend<S> {
    async fn execute(&self, ctx: &JobContext) -> Result<JobOutput> {
        let remote_dir = self.remote_dir(ctx);

        self.shell
            .run(&format!("mkdir -p {}", quote(&remote_dir)))
            .await
            .context("Failed to create remote job directory")?;

        let mut uploaded = Vec::new();
        for f in uploads(ctx) {
            self.shell
                .put(&f.path, &format!("{}/{}", remote_dir, f.name))
                .await?;
            uploaded.push(f.name.clone());
        }
        if let Some(script) = ctx.params.get(SCRIPT_PARAM) {
            let path = Path::new(script);
            if let Some(name) = path.file_name() {
                let name = name.to_string_lossy().to_string();
                self.shell
                    .put(path, &format!("{}/{}", remote_dir, name))
                    .await?;
                uploaded.push(name);
            }
        }

        let script = self.render_script(ctx, &remote_dir)?;
        let local_script = ctx.output_dir.join(BATCH_SCRIPT);
        tokio::fs::write(&local_script, script).await?;
        self.shell
            .put(&local_script, &format!("{}/{}", remote_dir, BATCH_SCRIPT))
            .await?;

        let batch_id = self.submit(&remote_dir).await?;
        log::info!(
            "Job {} ({}) submitted to {} as batch job {}",
            ctx.index,
            ctx.job_type(),
            self.cfg.host,
            batch_id
        );

        self.wait(&batch_id).await?;

        let code = self
            .shell
            .run(&format!("cat {}/{}", quote(&remote_dir), EXIT_CODE_FILE))
            .await
            .ok()
            .and_then(|s| s.trim().parse::<i32>().ok());

        let output_files = self
            .download(&remote_dir, &ctx.output_dir, &uploaded)
            .await?;

        match code {
            Some(0) => Ok(JobOutput {
                output_files,
                info: vec![format!("batch job {} on {}", batch_id, self.cfg.host)],
                ..JobOutput::default()
            }),
            Some(c) => Err(anyhow!("Batch job {} exited with code {}", batch_id, c)),
            None => Err(anyhow!(
                "Batch job {} left no exit code (cancelled or timed out?)",
                batch_id
            )),
        }
    }
}

/// Input files that exist locally and therefore get uploaded.
fn uploads(ctx: &JobContext) -> Vec<&FileSpec> {
    ctx.input_files.iter().filter(|f| f.path.is_file()).collect()
}

/// Single-quotes `s` for a POSIX shell.
fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
