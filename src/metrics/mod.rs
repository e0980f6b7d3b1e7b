//! Persisted-metrics sink.
//!
//! The orchestrator appends one record per measurable event. Retrieval and
//! dashboards are somebody else's job; a sink only needs to accept appends.
//! The sink handle is injected when the orchestrator is built.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::phase::{Phase, PhaseStatus, Role};

/// One append-only metrics record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MetricsRecord {
    /// Tokens consumed by one generation call.
    TokenUsage {
        run_id: Uuid,
        phase: Phase,
        role: Role,
        agent_id: Uuid,
        tokens: u64,
        timestamp: DateTime<Utc>,
    },
    /// A roster lifecycle action (hire, fire).
    AgentAction {
        run_id: Uuid,
        role: Role,
        agent_id: Uuid,
        action: String,
        timestamp: DateTime<Utc>,
    },
    /// Outcome of one phase execution.
    StageMetrics {
        run_id: Uuid,
        phase: Phase,
        status: PhaseStatus,
        duration_ms: u64,
        tokens: u64,
        attempts: u32,
        timestamp: DateTime<Utc>,
    },
    /// One peer-review rating.
    CodeQuality {
        run_id: Uuid,
        phase: Phase,
        reviewer_role: Role,
        reviewee_role: Role,
        rating: u8,
        timestamp: DateTime<Utc>,
    },
    /// Summary of a whole run.
    ProjectMetrics {
        run_id: Uuid,
        succeeded: bool,
        phases_completed: usize,
        total_tokens: u64,
        agents_fired: usize,
        tests_passed: bool,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
}

impl MetricsRecord {
    /// Record type name as serialized.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TokenUsage { .. } => "token_usage",
            Self::AgentAction { .. } => "agent_action",
            Self::StageMetrics { .. } => "stage_metrics",
            Self::CodeQuality { .. } => "code_quality",
            Self::ProjectMetrics { .. } => "project_metrics",
        }
    }
}

/// Accepts metrics records. One write-once append per record.
pub trait MetricsSink: Send + Sync {
    fn append(&self, record: &MetricsRecord) -> Result<()>;
}

/// Appends records as JSON lines to a file.
#[derive(Debug)]
pub struct JsonlMetricsSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlMetricsSink {
    /// Open (or create) `path` for appending.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create metrics directory: {}", parent.display())
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open metrics file: {}", path.display()))?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MetricsSink for JsonlMetricsSink {
    fn append(&self, record: &MetricsRecord) -> Result<()> {
        let line = serde_json::to_string(record).context("Failed to serialize metrics record")?;
        let mut file = self
            .file
            .lock()
            .map_err(|_| anyhow::anyhow!("metrics file lock poisoned"))?;
        writeln!(file, "{}", line)
            .with_context(|| format!("Failed to append to {}", self.path.display()))?;
        Ok(())
    }
}

/// Keeps records in memory.
#[derive(Debug, Default)]
pub struct MemoryMetricsSink {
    records: Mutex<Vec<MetricsRecord>>,
}

impl MemoryMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<MetricsRecord> {
        self.records
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

impl MetricsSink for MemoryMetricsSink {
    fn append(&self, record: &MetricsRecord) -> Result<()> {
        self.records
            .lock()
            .map_err(|_| anyhow::anyhow!("metrics lock poisoned"))?
            .push(record.clone());
        Ok(())
    }
}
