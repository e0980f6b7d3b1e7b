use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::config::RunConfig;
use crate::orchestrator::ProjectResult;

/// A finished run as persisted on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRun {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub manifesto: String,
    pub config: RunConfig,
    pub result: ProjectResult,
}

impl AuditRun {
    pub fn new(manifesto: &str, config: &RunConfig, result: &ProjectResult) -> Self {
        Self {
            run_id: result.run_id,
            started_at: result.started_at,
            ended_at: result.finished_at,
            manifesto: manifesto.to_string(),
            config: config.clone(),
            result: result.clone(),
        }
    }
}

/// Writes and reads run files under `<audit_dir>/runs/`.
pub struct AuditLogger {
    audit_dir: PathBuf,
}

impl AuditLogger {
    pub fn new(audit_dir: &Path) -> Self {
        Self {
            audit_dir: audit_dir.to_path_buf(),
        }
    }

    fn runs_dir(&self) -> PathBuf {
        self.audit_dir.join("runs")
    }

    /// Persist a run as `runs/<timestamp>_<run-id prefix>.json`.
    pub fn write_run(&self, run: &AuditRun) -> Result<PathBuf> {
        let runs_dir = self.runs_dir();
        fs::create_dir_all(&runs_dir).with_context(|| {
            format!("Failed to create audit directory: {}", runs_dir.display())
        })?;

        let filename = format!(
            "{}_{}.json",
            run.started_at.format("%Y-%m-%dT%H-%M-%S"),
            &run.run_id.simple().to_string()[..8]
        );
        let run_file = runs_dir.join(&filename);

        let json = serde_json::to_string_pretty(run).context("Failed to serialize audit run")?;
        fs::write(&run_file, json).context("Failed to write audit run file")?;
        Ok(run_file)
    }

    /// Run files, most recent first.
    pub fn list_runs(&self) -> Result<Vec<PathBuf>> {
        let runs_dir = self.runs_dir();
        if !runs_dir.exists() {
            return Ok(Vec::new());
        }

        let mut runs: Vec<PathBuf> = fs::read_dir(&runs_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map(|e| e == "json").unwrap_or(false))
            .collect();

        runs.sort();
        runs.reverse();
        Ok(runs)
    }

    pub fn load_run(&self, path: &Path) -> Result<AuditRun> {
        let content = fs::read_to_string(path).context("Failed to read audit run file")?;
        let run: AuditRun =
            serde_json::from_str(&content).context("Failed to parse audit run file")?;
        Ok(run)
    }
}
