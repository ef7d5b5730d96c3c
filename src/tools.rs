// src/tools.rs
//
// =============================================================================
// JOBTREE: TOOL REGISTRY
// =============================================================================
//
// Maps a job to the external binaries it needs.
//
// Lookup order for each tool a job type requires:
// 1. An explicit ToolRequirement with a path on the WorkItem.
// 2. The newest registered ToolInfo whose version matches the constraint.

use crate::core::{JobType, ToolVersion, WorkItem};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A concrete, installed tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    #[serde(default)]
    pub version: ToolVersion,
    #[serde(default)]
    pub local_path: Option<PathBuf>,
    /// Location of the tool on the batch cluster, if it can run there.
    #[serde(default)]
    pub remote_path: Option<PathBuf>,
}

impl ToolInfo {
    pub fn local(name: impl Into<String>, version: ToolVersion, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            version,
            local_path: Some(path.into()),
            remote_path: None,
        }
    }

    pub fn with_remote_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.remote_path = Some(path.into());
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<ToolInfo>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: ToolInfo) {
        log::debug!("Registered tool {} {} at {:?}", tool.name, tool.version, tool.local_path);
        self.tools.push(tool);
    }

    /// Registers `path` as the binary for the first tool `job_type` needs.
    /// Returns false for job types that need no tool.
    pub fn set_path_for_type(&mut self, job_type: JobType, path: impl Into<PathBuf>) -> bool {
        match job_type.required_tools().first() {
            Some(name) => {
                self.register(ToolInfo::local(*name, ToolVersion::any(), path));
                true
            }
            None => false,
        }
    }

    pub fn tools(&self) -> &[ToolInfo] {
        &self.tools
    }

    /// Newest registered tool called `name` that satisfies `version`.
    pub fn find(&self, name: &str, version: &ToolVersion) -> Option<&ToolInfo> {
        self.tools
            .iter()
            .filter(|t| t.name == name && version.matches(&t.version))
            .max_by_key(|t| t.version.ordinal())
    }

    /// Every tool `item` needs, resolved to a concrete ToolInfo.
    pub fn resolve(&self, item: &WorkItem) -> Result<Vec<ToolInfo>> {
        let mut names: Vec<&str> = item.job_type.required_tools().to_vec();
        for req in &item.tools {
            if !names.contains(&req.name.as_str()) {
                names.push(req.name.as_str());
            }
        }

        let mut resolved = Vec::with_capacity(names.len());
        for name in names {
            let explicit = item.tools.iter().find(|t| t.name == name);
            let constraint = explicit.map(|t| t.version).unwrap_or_default();

            let tool = match explicit.and_then(|t| t.path.clone()) {
                Some(path) => {
                    let registered = self.find(name, &constraint);
                    ToolInfo {
                        name: name.to_string(),
                        version: constraint,
                        local_path: Some(path),
                        remote_path: registered.and_then(|r| r.remote_path.clone()),
                    }
                }
                None => self.find(name, &constraint).cloned().ok_or_else(|| {
                    anyhow!(
                        "No tool '{}' matching version '{}' registered for {} job",
                        name,
                        constraint,
                        item.job_type
                    )
                })?,
            };
            resolved.push(tool);
        }
        Ok(resolved)
    }

    /// True if `item` can be delegated to a batch backend.
    pub fn remote_runnable(&self, item: &WorkItem) -> bool {
        if !item.job_type.remote_capable() {
            return false;
        }
        match self.resolve(item) {
            Ok(tools) => !tools.is_empty() && tools.iter().all(|t| t.remote_path.is_some()),
            Err(_) => false,
        }
    }
}

impl From<Vec<ToolInfo>> for ToolRegistry {
    fn from(tools: Vec<ToolInfo>) -> Self {
        Self { tools }
    }
}
