//! Durable mirror for job and task records.
//!
//! The in-process store is the source of truth for reads; the mirror is a
//! best-effort durable copy written off the hot path. A crash between an
//! in-memory write and its mirrored upsert loses that one transition,
//! which is recovered by replaying from the last successful checkpoint.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

use crate::store::records::{Job, Task};

const STATE_DIR_NAME: &str = ".codeforge";
const JOBS_DIR_NAME: &str = "state/jobs";
const TASKS_DIR_NAME: &str = "state/tasks";

/// Errors that can occur during mirror operations.
#[derive(Error, Debug)]
pub enum MirrorError {
    /// IO error during file operations.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for mirror operations.
pub type MirrorResult<T> = Result<T, MirrorError>;

/// Durable backing store for job and task records.
///
/// Upserts are invoked fire-and-forget by the store; implementations must
/// tolerate repeated upserts of the same record.
#[async_trait]
pub trait StateMirror: Send + Sync {
    async fn upsert_job(&self, job: &Job) -> MirrorResult<()>;
    async fn upsert_task(&self, task: &Task) -> MirrorResult<()>;
}

/// Mirror that discards everything. Used when durability is not wanted
/// (tests, ephemeral runs).
#[derive(Debug, Default, Clone)]
pub struct NullStateMirror;

#[async_trait]
impl StateMirror for NullStateMirror {
    async fn upsert_job(&self, _job: &Job) -> MirrorResult<()> {
        Ok(())
    }

    async fn upsert_task(&self, _task: &Task) -> MirrorResult<()> {
        Ok(())
    }
}

/// Filesystem-backed mirror writing one JSON document per record under
/// `<base>/.codeforge/state/{jobs,tasks}/<id>.json`.
#[derive(Debug, Clone)]
pub struct FileStateMirror {
    root_dir: PathBuf,
}

impl FileStateMirror {
    /// Create a mirror rooted at the given base directory.
    pub fn new(base_dir: impl Into<PathBuf>) -> MirrorResult<Self> {
        let root_dir = base_dir.into().join(STATE_DIR_NAME);
        fs::create_dir_all(root_dir.join(JOBS_DIR_NAME))?;
        fs::create_dir_all(root_dir.join(TASKS_DIR_NAME))?;
        Ok(Self { root_dir })
    }

    /// The mirror's root directory (`<base>/.codeforge`).
    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// Read back every mirrored job, for crash recovery.
    pub fn load_jobs(&self) -> MirrorResult<Vec<Job>> {
        self.load_records(JOBS_DIR_NAME)
    }

    /// Read back every mirrored task, for crash recovery.
    pub fn load_tasks(&self) -> MirrorResult<Vec<Task>> {
        self.load_records(TASKS_DIR_NAME)
    }

    fn load_records<T: serde::de::DeserializeOwned>(&self, dir: &str) -> MirrorResult<Vec<T>> {
        let dir = self.root_dir.join(dir);
        let mut records = Vec::new();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(records),
            Err(err) => return Err(MirrorError::Io(err)),
        };
        for entry in entries {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                let content = fs::read_to_string(&path)?;
                records.push(serde_json::from_str(&content)?);
            }
        }
        Ok(records)
    }

    fn write_record<T: serde::Serialize>(&self, dir: &str, id: &str, record: &T) -> MirrorResult<()> {
        let dir = self.root_dir.join(dir);
        let json = serde_json::to_string_pretty(record)?;
        let temp_path = dir.join(format!("{}.json.tmp", id));
        let final_path = dir.join(format!("{}.json", id));

        let mut file = fs::File::create(&temp_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        fs::rename(&temp_path, &final_path)?;

        Ok(())
    }
}

#[async_trait]
impl StateMirror for FileStateMirror {
    async fn upsert_job(&self, job: &Job) -> MirrorResult<()> {
        self.write_record(JOBS_DIR_NAME, &job.id, job)
    }

    async fn upsert_task(&self, task: &Task) -> MirrorResult<()> {
        self.write_record(TASKS_DIR_NAME, &task.id, task)
    }
}
