//! Action log and audit persistence.
//!
//! Every agent lifecycle and orchestrator action during a run is appended to
//! an [`ActionLog`]. Entries are never edited or removed. [`AuditLogger`]
//! persists finished runs as JSON under `.crewforge/audit/runs/`.

mod logger;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::phase::{Phase, Role};
use crate::roster::AgentProfile;

pub use logger::{AuditLogger, AuditRun};

/// Kind of recorded action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    PhaseStarted,
    GenerationCompleted,
    GenerationRetried,
    GenerationFailed,
    HurdleDetected,
    ReviewRecorded,
    /// Data-quality warning from peer review.
    RatingClamped,
    ReviewSkipped,
    AgentFired,
    AgentHired,
    ContextSummarized,
    BudgetExceeded,
    ApprovalRequested,
    ApprovalResolved,
    NotificationFailed,
    PrCreated,
    PrMerged,
    HostingFailed,
    MetricsFailed,
    PhaseCompleted,
    /// Another pass over the workflow began.
    IterationStarted,
    RunHalted,
}

impl ActionKind {
    /// Whether the action records a failure of some collaborator or step.
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            Self::GenerationFailed
                | Self::NotificationFailed
                | Self::HostingFailed
                | Self::MetricsFailed
                | Self::RunHalted
        )
    }
}

/// One appended action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionEntry {
    pub timestamp: DateTime<Utc>,
    pub kind: ActionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<Uuid>,
    pub detail: String,
}

impl ActionEntry {
    pub fn new(kind: ActionKind, detail: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            phase: None,
            role: None,
            agent_id: None,
            detail: detail.into(),
        }
    }

    pub fn phase(mut self, phase: Phase) -> Self {
        self.phase = Some(phase);
        self
    }

    pub fn agent(mut self, agent: &AgentProfile) -> Self {
        self.role = Some(agent.role);
        self.agent_id = Some(agent.id);
        self
    }

    pub fn role(mut self, role: Role) -> Self {
        self.role = Some(role);
        self
    }
}

/// Append-only record of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionLog {
    entries: Vec<ActionEntry>,
}

impl ActionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, entry: ActionEntry) {
        tracing::debug!(kind = ?entry.kind, phase = ?entry.phase, detail = %entry.detail, "action");
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[ActionEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries_for(&self, phase: Phase) -> impl Iterator<Item = &ActionEntry> {
        self.entries.iter().filter(move |e| e.phase == Some(phase))
    }

    pub fn entries_of(&self, kind: ActionKind) -> impl Iterator<Item = &ActionEntry> {
        self.entries.iter().filter(move |e| e.kind == kind)
    }

    pub fn failures(&self) -> impl Iterator<Item = &ActionEntry> {
        self.entries.iter().filter(|e| e.kind.is_failure())
    }
}
