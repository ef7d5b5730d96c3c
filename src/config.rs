// src/config.rs
//
// =============================================================================
// JOBTREE: RUN CONFIGURATION
// =============================================================================
//
// One YAML file describes the machine a RunManager drives:
//
//   max_local_jobs: 4
//   tools:
//     - name: energyplus
//       version: "8.1.0"
//       local_path: /usr/local/EnergyPlus-8-1-0/energyplus
//       remote_path: /opt/EnergyPlus-8-1-0/energyplus
//   slurm:
//     host: cluster.example.org
//     user: alice
//     max_jobs: 16
//
// Every field is optional; CLI flags are layered on top by the binary.

use crate::tools::{ToolInfo, ToolRegistry};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Upper bound on concurrently running local jobs.
    pub max_local_jobs: usize,
    pub tools: Vec<ToolInfo>,
    pub slurm: Option<SlurmConfig>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_local_jobs: num_cpus::get().max(1),
            tools: Vec::new(),
            slurm: None,
        }
    }
}

impl RunConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {:?}", path))?;
        let cfg: RunConfig = serde_yaml::from_str(&text)
            .with_context(|| format!("Invalid config file {:?}", path))?;
        log::info!(
            "Loaded config {:?}: {} local slots, {} tools, remote: {}",
            path,
            cfg.max_local_jobs,
            cfg.tools.len(),
            cfg.slurm.as_ref().map_or("none", |s| s.host.as_str())
        );
        Ok(cfg)
    }

    pub fn tool_registry(&self) -> ToolRegistry {
        ToolRegistry::from(self.tools.clone())
    }
}

/// Connection and submission settings for a SLURM cluster reached over ssh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlurmConfig {
    pub host: String,
    pub user: Option<String>,
    /// Upper bound on concurrently submitted remote jobs.
    pub max_jobs: usize,
    pub partition: Option<String>,
    pub account: Option<String>,
    pub max_time_min: Option<u32>,
    pub poll_interval_ms: u64,
    /// Per-job directories are created under this path on the cluster.
    pub remote_root: String,
}

impl Default for SlurmConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            user: None,
            max_jobs: 8,
            partition: None,
            account: None,
            max_time_min: None,
            poll_interval_ms: 5000,
            remote_root: "jobtree".to_string(),
        }
    }
}

impl SlurmConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Self::default()
        }
    }

    /// `user@host`, or just `host` when no user is set.
    pub fn target(&self) -> String {
        match &self.user {
            Some(u) => format!("{}@{}", u, self.host),
            None => self.host.clone(),
        }
    }
}
