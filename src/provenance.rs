// src/provenance.rs
//
// =============================================================================
// JOBTREE: INPUT PROVENANCE
// =============================================================================
//
// Records what a job consumed, so we can tell later if it is out of date.
//
// Strategy:
// 1. When a job starts, fingerprint every input file and tool binary (SHA256).
// 2. On query, only re-hash files whose mtime is at or after that start.
// 3. A tracked file that disappeared counts as changed.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

// ============================================================================
// 1. HASHING UTILITIES
// ============================================================================

/// Calculates SHA256 of a file (streamed).
pub fn sha256_file(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    let mut file =
        File::open(path).with_context(|| format!("Failed to open for hashing: {:?}", path))?;

    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 65536];

    loop {
        let count = file.read(&mut buffer)?;
        if count == 0 {
            break;
        }
        hasher.update(&buffer[..count]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Calculates SHA256 of a byte slice (e.g. an encoded workflow).
pub fn sha256_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

// ============================================================================
// 2. TRACKED INPUTS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedInput {
    pub path: PathBuf,
    pub checksum: String,
}

impl TrackedInput {
    /// Fingerprints `path`. Returns None if the file can't be read;
    /// untracked files never make a job out of date.
    pub fn capture(path: impl AsRef<Path>) -> Option<Self> {
        let path = path.as_ref();
        match sha256_file(path) {
            Ok(checksum) => Some(Self {
                path: path.to_path_buf(),
                checksum,
            }),
            Err(e) => {
                log::debug!("Not tracking {:?}: {}", path, e);
                None
            }
        }
    }

    /// True if the file changed after `since`.
    pub fn changed_since(&self, since: DateTime<Utc>) -> bool {
        let modified = match std::fs::metadata(&self.path).and_then(|m| m.modified()) {
            Ok(m) => DateTime::<Utc>::from(m),
            Err(_) => return true,
        };

        // Cheap check first: untouched files keep their old mtime.
        if modified < since {
            return false;
        }

        match sha256_file(&self.path) {
            Ok(sum) => sum != self.checksum,
            Err(_) => true,
        }
    }
}

/// Fingerprints every readable path, skipping duplicates.
pub fn capture_all<'a>(paths: impl IntoIterator<Item = &'a Path>) -> Vec<TrackedInput> {
    let mut out: Vec<TrackedInput> = Vec::new();
    for p in paths {
        if out.iter().any(|t| t.path == p) {
            continue;
        }
        if let Some(t) = TrackedInput::capture(p) {
            out.push(t);
        }
    }
    out
}

pub fn any_changed(inputs: &[TrackedInput], since: DateTime<Utc>) -> bool {
    inputs.iter().any(|t| t.changed_since(since))
}
