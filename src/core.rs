// src/core.rs
//
// =============================================================================
// JOBTREE: CORE SCHEMA AUTHORITY
// =============================================================================
//
// The value types shared by every other module.
// Nothing in here knows about trees, scheduling or storage.
//
// Design Principles:
// 1. Closed Job Kinds: `JobType` is an enum plus a static requirements table.
// 2. Canonical Encoding: params are a sorted map so JSON output is stable.
// 3. Plain Data: a `WorkItem` is the whole description of one step.

use crate::error::WorkflowError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

// ============================================================================
// 1. JOB TYPES (The Closed Vocabulary)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum JobType {
    /// Does nothing. Used as a splice point and in tests.
    Null,
    ExpandObjects,
    EnergyPlus,
    EnergyPlusPostProcess,
    Ruby,
    UserScript,
    ModelToIdf,
    IdfToModel,
    ModelToRad,
    /// Radiance preprocessor (accepted as "RadiancePreprocessor" in chain text).
    ModelToRadPreProcess,
    ParallelEnergyPlusSplit,
    ParallelEnergyPlusJoin,
    Basement,
    Slab,
}

/// One row of the JobType lookup table.
struct JobTypeSpec {
    job_type: JobType,
    name: &'static str,
    tools: &'static [&'static str],
    remote: bool,
}

const JOB_TYPES: &[JobTypeSpec] = &[
    JobTypeSpec { job_type: JobType::Null, name: "Null", tools: &[], remote: false },
    JobTypeSpec { job_type: JobType::ExpandObjects, name: "ExpandObjects", tools: &["expandobjects"], remote: true },
    JobTypeSpec { job_type: JobType::EnergyPlus, name: "EnergyPlus", tools: &["energyplus"], remote: true },
    JobTypeSpec { job_type: JobType::EnergyPlusPostProcess, name: "EnergyPlusPostProcess", tools: &[], remote: false },
    JobTypeSpec { job_type: JobType::Ruby, name: "Ruby", tools: &["ruby"], remote: true },
    JobTypeSpec { job_type: JobType::UserScript, name: "UserScript", tools: &["ruby"], remote: false },
    JobTypeSpec { job_type: JobType::ModelToIdf, name: "ModelToIdf", tools: &[], remote: false },
    JobTypeSpec { job_type: JobType::IdfToModel, name: "IdfToModel", tools: &[], remote: false },
    JobTypeSpec { job_type: JobType::ModelToRad, name: "ModelToRad", tools: &[], remote: false },
    JobTypeSpec { job_type: JobType::ModelToRadPreProcess, name: "ModelToRadPreProcess", tools: &["radiance"], remote: true },
    JobTypeSpec { job_type: JobType::ParallelEnergyPlusSplit, name: "ParallelEnergyPlusSplit", tools: &[], remote: false },
    JobTypeSpec { job_type: JobType::ParallelEnergyPlusJoin, name: "ParallelEnergyPlusJoin", tools: &[], remote: false },
    JobTypeSpec { job_type: JobType::Basement, name: "Basement", tools: &["basement"], remote: true },
    JobTypeSpec { job_type: JobType::Slab, name: "Slab", tools: &["slab"], remote: true },
];

impl JobType {
    fn spec(self) -> &'static JobTypeSpec {
        // The table is exhaustive; indexing by discriminant keeps lookups O(1).
        &JOB_TYPES[self as usize]
    }

    pub fn all() -> impl Iterator<Item = JobType> {
        JOB_TYPES.iter().map(|s| s.job_type)
    }

    /// Canonical name, used in chain text, JSON and output directory names.
    pub fn name(self) -> &'static str {
        self.spec().name
    }

    /// Names of the external tools this kind of job needs.
    pub fn required_tools(self) -> &'static [&'static str] {
        self.spec().tools
    }

    /// Whether this job kind may be delegated to a remote batch queue.
    pub fn remote_capable(self) -> bool {
        self.spec().remote
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for JobType {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("RadiancePreprocessor") {
            return Ok(JobType::ModelToRadPreProcess);
        }
        JOB_TYPES
            .iter()
            .find(|spec| spec.name.eq_ignore_ascii_case(s))
            .map(|spec| spec.job_type)
            .ok_or_else(|| WorkflowError::UnknownJobType(s.to_string()))
    }
}

// ============================================================================
// 2. TOOLS
// ============================================================================

/// Text form of an unset component inside a version ("8.*.3").
const WILDCARD: &str = "*";

/// A version constraint. Unset components match anything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ToolVersion {
    pub major: Option<u32>,
    pub minor: Option<u32>,
    pub patch: Option<u32>,
}

impl ToolVersion {
    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major: Some(major),
            minor: Some(minor),
            patch: Some(patch),
        }
    }

    pub fn any() -> Self {
        Self::default()
    }

    /// True if `candidate` satisfies every component this constraint pins.
    pub fn matches(&self, candidate: &ToolVersion) -> bool {
        fn component(want: Option<u32>, have: Option<u32>) -> bool {
            match want {
                None => true,
                Some(w) => have == Some(w),
            }
        }
        component(self.major, candidate.major)
            && component(self.minor, candidate.minor)
            && component(self.patch, candidate.patch)
    }

    /// Sort key for picking the newest matching tool.
    pub fn ordinal(&self) -> (u32, u32, u32) {
        (
            self.major.unwrap_or(0),
            self.minor.unwrap_or(0),
            self.patch.unwrap_or(0),
        )
    }
}

impl fmt::Display for ToolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Trailing wildcards are dropped; inner ones are written as '*'.
        let components = [self.major, self.minor, self.patch];
        let len = components.iter().rposition(Option::is_some).map_or(0, |i| i + 1);
        let parts: Vec<String> = components[..len]
            .iter()
            .map(|c| c.map_or_else(|| WILDCARD.to_string(), |v| v.to_string()))
            .collect();
        f.write_str(&parts.join("."))
    }
}

impl FromStr for ToolVersion {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(Self::any());
        }

        let mut parts = Vec::new();
        for piece in s.split('.') {
            let piece = piece.trim();
            if piece == WILDCARD {
                parts.push(None);
                continue;
            }
            let v = piece
                .parse::<u32>()
                .map_err(|_| WorkflowError::InvalidVersion(s.to_string()))?;
            parts.push(Some(v));
        }
        if parts.len() > 3 {
            return Err(WorkflowError::InvalidVersion(s.to_string()));
        }

        Ok(Self {
            major: parts.first().copied().flatten(),
            minor: parts.get(1).copied().flatten(),
            patch: parts.get(2).copied().flatten(),
        })
    }
}

impl TryFrom<String> for ToolVersion {
    type Error = WorkflowError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ToolVersion> for String {
    fn from(v: ToolVersion) -> Self {
        v.to_string()
    }
}

/// A tool a job explicitly asks for (name, version constraint, optional path).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ToolRequirement {
    pub name: String,
    #[serde(default)]
    pub version: ToolVersion,
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl ToolRequirement {
    pub fn new(name: impl Into<String>, version: ToolVersion, path: Option<PathBuf>) -> Self {
        Self {
            name: name.into(),
            version,
            path,
        }
    }
}

// ============================================================================
// 3. FILES & PARAMS
// ============================================================================

/// Something that has to be fetched before the job can start.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequiredFile {
    pub source: String, // URL or absolute path
    pub target: PathBuf, // Relative to the job's output directory
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileSpec {
    pub name: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    /// Role key, e.g. "osm", "idf", "epw".
    pub key: String,
    pub path: PathBuf,
    /// A required file must exist when the job starts.
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub required_files: Vec<RequiredFile>,
}

impl FileSpec {
    /// Builds a spec for an existing (or soon to exist) file.
    /// The role key defaults to the lower-cased extension.
    pub fn from_path(path: impl AsRef<Path>, key: Option<&str>) -> Self {
        let path = path.as_ref().to_path_buf();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let key = key.map(str::to_string).unwrap_or_else(|| {
            path.extension()
                .map(|e| e.to_string_lossy().to_lowercase())
                .unwrap_or_default()
        });
        let timestamp = std::fs::metadata(&path)
            .and_then(|m| m.modified())
            .ok()
            .map(DateTime::<Utc>::from);

        Self {
            name,
            timestamp,
            key,
            path,
            required: true,
            required_files: Vec::new(),
        }
    }

    pub fn with_required_file(mut self, source: impl Into<String>, target: impl Into<PathBuf>) -> Self {
        self.required_files.push(RequiredFile {
            source: source.into(),
            target: target.into(),
        });
        self
    }
}

/// String parameters. Sorted, so encoding is canonical and
/// equality ignores insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobParams(BTreeMap<String, String>);

impl JobParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn has(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    /// Adds every entry of `other` that is not already set here.
    pub fn merge_missing(&mut self, other: &JobParams) {
        for (k, v) in &other.0 {
            self.0.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for JobParams {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

// ============================================================================
// 4. WORK ITEM (The Job Descriptor)
// ============================================================================

/// Serializable description of one job. No tree relationships.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    #[serde(rename = "type")]
    pub job_type: JobType,
    #[serde(default)]
    pub tools: Vec<ToolRequirement>,
    #[serde(default)]
    pub params: JobParams,
    #[serde(default)]
    pub files: Vec<FileSpec>,
    #[serde(rename = "jobkeyname", default)]
    pub key_name: Option<String>,
}

pub type JobDescriptor = WorkItem;

impl WorkItem {
    pub fn new(job_type: JobType) -> Self {
        Self {
            job_type,
            tools: Vec::new(),
            params: JobParams::new(),
            files: Vec::new(),
            key_name: None,
        }
    }

    /// A Null job tagged with `key`; `Workflow::replace_jobs` splices here.
    pub fn placeholder(key: impl Into<String>) -> Self {
        Self {
            key_name: Some(key.into()),
            ..Self::new(JobType::Null)
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key, value);
        self
    }

    pub fn with_file(mut self, file: FileSpec) -> Self {
        self.files.push(file);
        self
    }

    /// Tools are an ordered set: re-adding an equal requirement is a no-op.
    pub fn with_tool(mut self, tool: ToolRequirement) -> Self {
        if !self.tools.contains(&tool) {
            self.tools.push(tool);
        }
        self
    }

    pub fn is_placeholder_for(&self, key: &str) -> bool {
        self.job_type == JobType::Null && self.key_name.as_deref() == Some(key)
    }
}

impl From<JobType> for WorkItem {
    fn from(t: JobType) -> Self {
        WorkItem::new(t)
    }
}

// ============================================================================
// 5. STATE & ERRORS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    NotStarted,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

/// Aggregate over a whole tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TreeStatus {
    NotStarted,
    Running,
    Finished,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Success,
    Fail,
    NotApplicable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorLevel {
    Info,
    Warning,
    Error,
}

/// What went wrong (or right) in one execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobErrors {
    pub outcome: Outcome,
    #[serde(default)]
    pub messages: Vec<(ErrorLevel, String)>,
}

impl Default for JobErrors {
    fn default() -> Self {
        Self {
            outcome: Outcome::NotApplicable,
            messages: Vec::new(),
        }
    }
}

impl JobErrors {
    pub fn success() -> Self {
        Self {
            outcome: Outcome::Success,
            messages: Vec::new(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Fail,
            messages: vec![(ErrorLevel::Error, message.into())],
        }
    }

    pub fn push(&mut self, level: ErrorLevel, message: impl Into<String>) {
        self.messages.push((level, message.into()));
    }

    /// True iff no fatal error was recorded.
    pub fn succeeded(&self) -> bool {
        self.outcome != Outcome::Fail
    }

    pub fn errors(&self) -> impl Iterator<Item = &str> {
        self.at_level(ErrorLevel::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &str> {
        self.at_level(ErrorLevel::Warning)
    }

    fn at_level(&self, level: ErrorLevel) -> impl Iterator<Item = &str> {
        self.messages
            .iter()
            .filter(move |(l, _)| *l == level)
            .map(|(_, m)| m.as_str())
    }

    /// Combines two records; a failure on either side wins.
    pub fn merge(&mut self, other: &JobErrors) {
        self.outcome = match (self.outcome, other.outcome) {
            (Outcome::Fail, _) | (_, Outcome::Fail) => Outcome::Fail,
            (Outcome::Success, _) | (_, Outcome::Success) => Outcome::Success,
            _ => Outcome::NotApplicable,
        };
        self.messages.extend(other.messages.iter().cloned());
    }
}
