// src/main.rs
//
// =============================================================================
// JOBTREE: COMMAND LINE RUNNER
// =============================================================================
//
// Builds one workflow, runs it to completion and reports.
//
// Flow:
// 1. Config: YAML file (optional) + CLI overrides (tools, remote host).
// 2. Workflow: chain text, a stored workflow, or a default for the input type.
// 3. Materialize into a JobTree under --outdir and enqueue it.
// 4. Wait (optionally logging progress), then exit 0 iff the tree Finished.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::signal;

use jobtree::checkpoint::CheckpointStore;
use jobtree::config::{RunConfig, SlurmConfig};
use jobtree::core::{FileSpec, JobType, TreeStatus};
use jobtree::runmanager::RunManager;
use jobtree::workflow::Workflow;

// ============================================================================
// 1. CLI DEFINITION
// ============================================================================

#[derive(Parser)]
#[command(name = "jobtree", version, about = "Runs simulation job workflows")]
struct Cli {
    /// Model or input file the first job consumes (.osm, .idf, ...).
    #[arg(long)]
    input: Option<PathBuf>,

    /// Weather file handed to the root job.
    #[arg(long)]
    weather: Option<PathBuf>,

    /// Explicit chain, e.g. "ModelToIdf->ExpandObjects->EnergyPlus".
    #[arg(long, conflicts_with = "workflow_name")]
    workflow: Option<String>,

    /// Load a workflow previously stored under this name.
    #[arg(long)]
    workflow_name: Option<String>,

    /// Tool location per job type, e.g. --tool EnergyPlus=/usr/bin/energyplus
    #[arg(long = "tool", value_name = "TYPE=PATH")]
    tools: Vec<String>,

    #[arg(long, default_value = "jobtree-out")]
    outdir: PathBuf,

    /// Put every job directly under the output root, prefixed by index.
    #[arg(long)]
    flat: bool,

    /// YAML run configuration.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Workflow / checkpoint database.
    #[arg(long)]
    db: Option<PathBuf>,

    /// Continue the trees checkpointed in --db instead of starting a new one.
    #[arg(long, requires = "db")]
    resume: bool,

    #[arg(long)]
    remote_host: Option<String>,

    #[arg(long, requires = "remote_host")]
    remote_user: Option<String>,

    /// Log a status line every second while running.
    #[arg(long)]
    show_ui: bool,

    /// Store the workflow under this name before running it.
    #[arg(long)]
    save_as: Option<String>,
}

const DEFAULT_DB: &str = "jobtree.db";

// ============================================================================
// 2. ENTRY POINT
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let finished = run(cli).await?;
    if !finished {
        std::process::exit(1);
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<bool> {
    // A. CONFIGURATION
    let mut cfg = match &cli.config {
        Some(path) => RunConfig::load(path)?,
        None => RunConfig::default(),
    };
    if let Some(host) = &cli.remote_host {
        let mut slurm = cfg.slurm.take().unwrap_or_else(|| SlurmConfig::new(host.clone()));
        slurm.host = host.clone();
        if cli.remote_user.is_some() {
            slurm.user = cli.remote_user.clone();
        }
        cfg.slurm = Some(slurm);
    }

    let mut tools = cfg.tool_registry();
    for spec in &cli.tools {
        let (job_type, path) = parse_tool_flag(spec)?;
        if !tools.set_path_for_type(job_type, path) {
            log::warn!("{} jobs need no tool; ignoring --tool {}", job_type, spec);
        }
    }

    let wants_store = cli.db.is_some() || cli.workflow_name.is_some() || cli.save_as.is_some();
    let store = if wants_store {
        let path = cli.db.clone().unwrap_or_else(|| PathBuf::from(DEFAULT_DB));
        Some(CheckpointStore::open(&path).context("Failed to open workflow store")?)
    } else {
        None
    };

    // B. WORKFLOW
    let workflow = if cli.resume {
        None
    } else {
        Some(build_workflow(&cli, store.as_ref())?)
    };

    if let (Some(wf), Some(name), Some(store)) = (&workflow, &cli.save_as, &store) {
        let mut named = wf.clone();
        named.set_name(name.clone());
        store.persist_workflow(&named)?;
    }

    // C. SCHEDULER
    let mut builder = RunManager::builder(cfg).tools(tools);
    // Trees are only checkpointed when the user asked for a database.
    if cli.db.is_some() {
        if let Some(s) = store {
            builder = builder.store(s);
        }
    }
    let manager = builder.build();

    let handles = match workflow {
        Some(wf) => {
            let mut tree = wf.create(&cli.outdir, cli.input.as_deref())?;
            if let Some(weather) = &cli.weather {
                let root = tree.root();
                tree[root]
                    .descriptor
                    .files
                    .push(FileSpec::from_path(weather, Some("epw")));
            }
            vec![manager.enqueue(tree, false)]
        }
        None => {
            let n = manager.load_jobs()?;
            if n == 0 {
                return Err(anyhow!("Nothing to resume in the checkpoint database"));
            }
            manager.trees()
        }
    };

    // D. WAIT
    if cli.show_ui {
        let ui = manager.clone();
        tokio::spawn(async move {
            while !ui.finished() {
                log::info!("{}", ui.statistics());
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        });
    }

    tokio::select! {
        _ = manager.wait_for_finished() => {}
        _ = signal::ctrl_c() => {
            log::warn!("Interrupt received. No new jobs will start.");
            manager.set_paused(true);
            manager.sync_checkpoints().await;
            return Ok(false);
        }
    }

    // E. REPORT
    for job in manager.get_jobs() {
        for msg in job.errors.errors() {
            log::error!("Job {} ({}): {}", job.index, job.job_type, msg);
        }
    }
    log::info!("{}", manager.statistics());

    let mut all_finished = true;
    for h in handles {
        let status = manager.tree_status(h).unwrap_or(TreeStatus::Failed);
        log::info!("Tree {} finished with status {:?}", h, status);
        all_finished &= status == TreeStatus::Finished;
    }
    Ok(all_finished)
}

// ============================================================================
// 3. HELPERS
// ============================================================================

fn build_workflow(cli: &Cli, store: Option<&CheckpointStore>) -> Result<Workflow> {
    let mut wf = match (&cli.workflow, &cli.workflow_name) {
        (Some(chain), _) => Workflow::from_chain(chain)?,
        (None, Some(name)) => store
            .ok_or_else(|| anyhow!("--workflow-name needs a database"))?
            .load_workflow_by_name(name)
            .with_context(|| format!("Failed to load workflow '{}'", name))?,
        (None, None) => {
            let input = cli
                .input
                .as_deref()
                .ok_or_else(|| anyhow!("Give --input, --workflow or --workflow-name"))?;
            Workflow::from_chain(default_chain(input)?)?
        }
    };
    if cli.flat {
        wf.set_flat_output(true);
    }
    if wf.is_empty() {
        return Err(jobtree::error::WorkflowError::EmptyWorkflow.into());
    }
    Ok(wf)
}

/// Standard simulation chain for a given input file type.
fn default_chain(input: &Path) -> Result<&'static str> {
    let ext = input
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "osm" => Ok("ModelToIdf->ExpandObjects->EnergyPlus->EnergyPlusPostProcess"),
        "idf" => Ok("ExpandObjects->EnergyPlus->EnergyPlusPostProcess"),
        "rb" => Ok("UserScript"),
        _ => Err(anyhow!(
            "No default workflow for {:?}; pass --workflow",
            input
        )),
    }
}

fn parse_tool_flag(spec: &str) -> Result<(JobType, PathBuf)> {
    let (t, p) = spec
        .split_once('=')
        .ok_or_else(|| anyhow!("--tool expects TYPE=PATH, got '{}'", spec))?;
    Ok((t.parse::<JobType>()?, PathBuf::from(p)))
}
