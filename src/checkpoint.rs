// src/checkpoint.rs
//
// =============================================================================
// JOBTREE: PERSISTENCE STORE
// =============================================================================
//
// Named workflows and in-flight job trees, kept in one SQLite file.
//
// Architecture:
// - Lookup fields (name, key, timestamp) are columns.
// - The object itself is canonical JSON text in `full_json`.
// - DELETE journal mode and a busy timeout, so the file can live on a
//   network share and be opened by several processes.
// - A fresh connection per call; the store itself is just a path.

use crate::error::StoreError;
use crate::tree::JobTree;
use crate::workflow::Workflow;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use uuid::Uuid;

type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let store = Self {
            path: path.as_ref().to_path_buf(),
        };
        store.init()?;
        log::info!("Opened workflow store {:?}", store.path);
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn init(&self) -> Result<()> {
        let conn = self.conn()?;

        conn.execute_batch(
            "PRAGMA journal_mode=DELETE;
             PRAGMA synchronous=NORMAL;",
        )?;

        conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS workflows (
                name TEXT PRIMARY KEY,
                wf_key TEXT NOT NULL,
                updated_at_ms INTEGER,
                full_json TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS job_trees (
                id TEXT PRIMARY KEY,
                updated_at_ms INTEGER,
                full_json TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_workflows_key ON workflows(wf_key);
            COMMIT;",
        )?;

        Ok(())
    }

    fn conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(std::time::Duration::from_secs(10))?;
        Ok(conn)
    }

    // -------------------------------------------------------------------------
    // WORKFLOWS
    // -------------------------------------------------------------------------

    /// Stores `wf` under its name, replacing any previous entry with that name.
    pub fn persist_workflow(&self, wf: &Workflow) -> Result<()> {
        let name = wf.name().filter(|n| !n.is_empty()).ok_or(StoreError::Unnamed)?;
        let json = wf.encode().map_err(codec)?;
        let key = wf.key().map_err(codec)?;

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO workflows (name, wf_key, updated_at_ms, full_json)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(name) DO UPDATE SET
                wf_key=excluded.wf_key,
                updated_at_ms=excluded.updated_at_ms,
                full_json=excluded.full_json",
            params![name, key, Utc::now().timestamp_millis(), json],
        )?;
        log::info!("Persisted workflow '{}' ({} jobs)", name, wf.len());
        Ok(())
    }

    pub fn load_workflow_by_name(&self, name: &str) -> Result<Workflow> {
        let conn = self.conn()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT full_json FROM workflows WHERE name = ?1",
                params![name],
                |r| r.get(0),
            )
            .optional()?;
        let json = json.ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        Workflow::decode(&json).map_err(codec)
    }

    /// Looks a workflow up by content key (see `Workflow::key`).
    pub fn load_workflow_by_key(&self, key: &str) -> Result<Workflow> {
        let conn = self.conn()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT full_json FROM workflows WHERE wf_key = ?1
                 ORDER BY updated_at_ms DESC LIMIT 1",
                params![key],
                |r| r.get(0),
            )
            .optional()?;
        let json = json.ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        Workflow::decode(&json).map_err(codec)
    }

    /// Names of every stored workflow, sorted.
    pub fn list_workflows(&self) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT name FROM workflows ORDER BY name")?;
        let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn delete_workflow_by_name(&self, name: &str) -> Result<()> {
        let conn = self.conn()?;
        let n = conn.execute("DELETE FROM workflows WHERE name = ?1", params![name])?;
        if n == 0 {
            return Err(StoreError::NotFound(name.to_string()));
        }
        log::info!("Deleted workflow '{}'", name);
        Ok(())
    }

    /// Removes every stored workflow. Returns how many were deleted.
    pub fn delete_workflows(&self) -> Result<usize> {
        let conn = self.conn()?;
        let n = conn.execute("DELETE FROM workflows", [])?;
        Ok(n)
    }

    // -------------------------------------------------------------------------
    // JOB TREES (Checkpoints)
    // -------------------------------------------------------------------------

    pub fn save_tree(&self, id: Uuid, tree: &JobTree) -> Result<()> {
        let json = serde_json::to_string(tree)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO job_trees (id, updated_at_ms, full_json)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET
                updated_at_ms=excluded.updated_at_ms,
                full_json=excluded.full_json",
            params![id.to_string(), Utc::now().timestamp_millis(), json],
        )?;
        Ok(())
    }

    /// Every checkpointed tree, oldest first.
    /// Records that no longer decode are skipped with a warning.
    pub fn restore_trees(&self) -> Result<Vec<(Uuid, JobTree)>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT id, full_json FROM job_trees ORDER BY updated_at_ms, id")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut out = Vec::new();
        for r in rows {
            let (id, json) = r?;
            let parsed = Uuid::parse_str(&id)
                .ok()
                .zip(serde_json::from_str::<JobTree>(&json).ok());
            match parsed {
                Some(entry) => out.push(entry),
                None => log::warn!("Skipping unreadable job tree record {}", id),
            }
        }
        Ok(out)
    }

    pub fn delete_tree(&self, id: Uuid) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM job_trees WHERE id = ?1", params![id.to_string()])?;
        Ok(())
    }

    pub fn clear_trees(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM job_trees", [])?;
        Ok(())
    }
}

fn codec(e: crate::error::WorkflowError) -> StoreError {
    match e {
        crate::error::WorkflowError::Codec(inner) => StoreError::Codec(inner),
        other => StoreError::Codec(serde::de::Error::custom(other.to_string())),
    }
}
