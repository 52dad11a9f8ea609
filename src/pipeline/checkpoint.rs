//! Checkpoint persistence for pipeline runs.
//!
//! After each successful agent the pipeline writes a checkpoint document
//! capturing the artifact registry and the phases completed so far, plus
//! a rolling `latest.json` pointer. When a required phase fails a
//! recovery document is written alongside, carrying everything needed to
//! resume from the failed phase after manual intervention.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::OrchestratorResult;
use crate::pipeline::outputs::PhaseOutputs;
use crate::store::records::ValidationError;

const CHECKPOINTS_DIR_NAME: &str = ".codeforge/checkpoints";
const LATEST_FILE_NAME: &str = "latest.json";
const RECOVERY_FILE_NAME: &str = "recovery.json";

/// Snapshot written after one agent completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub phase: String,
    pub agent_id: String,
    /// The agent's own result, verbatim.
    pub output: Value,
    pub files_modified: Vec<String>,
    /// Full artifact registry as of this agent.
    pub outputs: PhaseOutputs,
    pub completed_phases: Vec<String>,
    pub saved_at: DateTime<Utc>,
}

/// Document written when a required phase fails, read back by a resumed
/// run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryRecord {
    pub failed_phase: String,
    pub errors: Vec<ValidationError>,
    pub outputs: PhaseOutputs,
    pub completed_phases: Vec<String>,
    pub resume_instruction: String,
    pub recorded_at: DateTime<Utc>,
}

/// Filesystem-backed checkpoint store rooted at
/// `<base>/.codeforge/checkpoints/`.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    root_dir: PathBuf,
}

impl CheckpointManager {
    pub fn new(base_dir: impl Into<PathBuf>) -> OrchestratorResult<Self> {
        let root_dir = base_dir.into().join(CHECKPOINTS_DIR_NAME);
        fs::create_dir_all(&root_dir)?;
        Ok(Self { root_dir })
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// Persist a checkpoint under `<phase>_<agent>.json` and refresh the
    /// `latest.json` pointer.
    pub fn save(&self, checkpoint: &Checkpoint) -> OrchestratorResult<()> {
        let name = format!(
            "{}_{}.json",
            sanitize(&checkpoint.phase),
            sanitize(&checkpoint.agent_id)
        );
        self.write_document(&name, checkpoint)?;
        self.write_document(LATEST_FILE_NAME, checkpoint)?;
        Ok(())
    }

    /// The most recently saved checkpoint, if any.
    pub fn load_latest(&self) -> OrchestratorResult<Option<Checkpoint>> {
        self.read_document(LATEST_FILE_NAME)
    }

    /// The checkpoint saved for a specific phase and agent, if any.
    pub fn load(&self, phase: &str, agent_id: &str) -> OrchestratorResult<Option<Checkpoint>> {
        let name = format!("{}_{}.json", sanitize(phase), sanitize(agent_id));
        self.read_document(&name)
    }

    pub fn save_recovery(&self, record: &RecoveryRecord) -> OrchestratorResult<()> {
        self.write_document(RECOVERY_FILE_NAME, record)
    }

    pub fn load_recovery(&self) -> OrchestratorResult<Option<RecoveryRecord>> {
        self.read_document(RECOVERY_FILE_NAME)
    }

    /// Drop a stale recovery document once a resumed run gets past the
    /// phase it recorded.
    pub fn clear_recovery(&self) -> OrchestratorResult<()> {
        match fs::remove_file(self.root_dir.join(RECOVERY_FILE_NAME)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn write_document<T: Serialize>(&self, name: &str, document: &T) -> OrchestratorResult<()> {
        let json = serde_json::to_string_pretty(document)?;
        let temp_path = self.root_dir.join(format!("{}.tmp", name));
        let final_path = self.root_dir.join(name);

        let mut file = fs::File::create(&temp_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        fs::rename(&temp_path, &final_path)?;

        Ok(())
    }

    fn read_document<T: serde::de::DeserializeOwned>(
        &self,
        name: &str,
    ) -> OrchestratorResult<Option<T>> {
        match fs::read_to_string(self.root_dir.join(name)) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn checkpoint(phase: &str, agent: &str) -> Checkpoint {
        Checkpoint {
            phase: phase.to_string(),
            agent_id: agent.to_string(),
            output: json!({"result": "done"}),
            files_modified: vec!["src/main.rs".to_string()],
            outputs: PhaseOutputs::new(),
            completed_phases: vec!["analysis".to_string()],
            saved_at: Utc::now(),
        }
    }

    #[test]
    fn test_save_and_load_latest() {
        let temp_dir = TempDir::new().expect("temp dir");
        let manager = CheckpointManager::new(temp_dir.path()).expect("manager");

        manager.save(&checkpoint("planning", "planner")).expect("save");
        manager.save(&checkpoint("design", "architect")).expect("save");

        let latest = manager.load_latest().expect("load").expect("checkpoint");
        assert_eq!(latest.phase, "design");
        assert_eq!(latest.agent_id, "architect");
    }

    #[test]
    fn test_load_specific_phase_checkpoint() {
        let temp_dir = TempDir::new().expect("temp dir");
        let manager = CheckpointManager::new(temp_dir.path()).expect("manager");

        manager.save(&checkpoint("planning", "planner")).expect("save");
        manager.save(&checkpoint("design", "architect")).expect("save");

        let loaded = manager
            .load("planning", "planner")
            .expect("load")
            .expect("checkpoint");
        assert_eq!(loaded.phase, "planning");
    }

    #[test]
    fn test_missing_checkpoint_is_none() {
        let temp_dir = TempDir::new().expect("temp dir");
        let manager = CheckpointManager::new(temp_dir.path()).expect("manager");
        assert!(manager.load_latest().expect("load").is_none());
        assert!(manager.load("qa", "qa-engineer").expect("load").is_none());
    }

    #[test]
    fn test_recovery_roundtrip_and_clear() {
        let temp_dir = TempDir::new().expect("temp dir");
        let manager = CheckpointManager::new(temp_dir.path()).expect("manager");

        let mut outputs = PhaseOutputs::new();
        outputs.insert_agent_result("prd", "the plan");
        let record = RecoveryRecord {
            failed_phase: "validation".to_string(),
            errors: vec![],
            outputs,
            completed_phases: vec!["analysis".to_string(), "planning".to_string()],
            resume_instruction: "resume from phase 'validation'".to_string(),
            recorded_at: Utc::now(),
        };
        manager.save_recovery(&record).expect("save");

        let loaded = manager.load_recovery().expect("load").expect("record");
        assert_eq!(loaded.failed_phase, "validation");
        assert!(loaded.outputs.contains("prd"));

        manager.clear_recovery().expect("clear");
        assert!(manager.load_recovery().expect("load").is_none());
        manager.clear_recovery().expect("clear is idempotent");
    }
}
