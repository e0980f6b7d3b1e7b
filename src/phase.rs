//! Phase and role definitions for the crewforge workflow.
//!
//! This module provides:
//! - `Phase`, the fixed ordered enumeration of workflow stages
//! - `Role`, the agent roles that produce and review phase output
//! - `PhaseResult`, the immutable record of one phase execution
//! - `PhaseTracker`, which enforces strict forward ordering

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::OrchestratorError;
use crate::generate::Hurdle;

/// One ordered stage of the workflow.
///
/// The declaration order is the only valid execution order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Planning,
    Development,
    Review,
    Testing,
    PrCreation,
    PrMerge,
}

impl Phase {
    /// All phases in execution order.
    pub const ALL: [Phase; 6] = [
        Phase::Planning,
        Phase::Development,
        Phase::Review,
        Phase::Testing,
        Phase::PrCreation,
        Phase::PrMerge,
    ];

    /// Zero-based position in the execution order.
    pub fn index(self) -> usize {
        self as usize
    }

    /// The phase that follows this one, if any.
    pub fn next(self) -> Option<Phase> {
        Self::ALL.get(self.index() + 1).copied()
    }

    /// The role whose agent produces this phase's output.
    pub fn producer(self) -> Role {
        match self {
            Phase::Planning => Role::Planner,
            Phase::Development => Role::Developer,
            Phase::Review => Role::Reviewer,
            Phase::Testing => Role::Qa,
            Phase::PrCreation | Phase::PrMerge => Role::ReleaseManager,
        }
    }

    /// Human-readable description used in prompts and notifications.
    pub fn describe(self) -> &'static str {
        match self {
            Phase::Planning => "produce a development plan",
            Phase::Development => "implement the plan",
            Phase::Review => "review the implementation",
            Phase::Testing => "write and evaluate tests",
            Phase::PrCreation => "prepare the change request",
            Phase::PrMerge => "merge the change request",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Planning => "Planning",
            Phase::Development => "Development",
            Phase::Review => "Review",
            Phase::Testing => "Testing",
            Phase::PrCreation => "PRCreation",
            Phase::PrMerge => "PRMerge",
        };
        write!(f, "{}", s)
    }
}

/// Agent role. Exactly one agent per role is active at any time.
///
/// Declaration order is the deterministic resolution order when several
/// roles need replacement at the same phase boundary.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    Planner,
    Developer,
    Reviewer,
    Qa,
    ReleaseManager,
}

impl Role {
    pub const ALL: [Role; 5] = [
        Role::Planner,
        Role::Developer,
        Role::Reviewer,
        Role::Qa,
        Role::ReleaseManager,
    ];

    /// Short identifier used in agent names (e.g. `developer-2`).
    pub fn slug(self) -> &'static str {
        match self {
            Role::Planner => "planner",
            Role::Developer => "developer",
            Role::Reviewer => "reviewer",
            Role::Qa => "qa",
            Role::ReleaseManager => "release-manager",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Role::Planner => "Planner",
            Role::Developer => "Developer",
            Role::Reviewer => "Reviewer",
            Role::Qa => "QA",
            Role::ReleaseManager => "ReleaseManager",
        };
        write!(f, "{}", s)
    }
}

/// Outcome of a phase execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseStatus {
    Succeeded,
    Failed,
    /// Completed only after a critical hurdle or generation failure was
    /// escalated and approved.
    Escalated,
}

/// Immutable record of one phase execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseResult {
    pub phase: Phase,
    pub role: Role,
    pub agent_id: Uuid,
    /// Opaque artifact produced by the phase.
    pub output: String,
    pub status: PhaseStatus,
    pub tokens_used: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hurdle: Option<Hurdle>,
    pub timestamp: DateTime<Utc>,
}

impl PhaseResult {
    pub fn new(
        phase: Phase,
        agent_id: Uuid,
        output: String,
        status: PhaseStatus,
        tokens_used: u64,
        hurdle: Option<Hurdle>,
    ) -> Self {
        Self {
            phase,
            role: phase.producer(),
            agent_id,
            output,
            status,
            tokens_used,
            hurdle,
            timestamp: Utc::now(),
        }
    }
}

/// Enforces that phases are entered strictly in enumeration order.
///
/// A completed phase may only be re-entered through [`PhaseTracker::retry`],
/// and only while it is the most recently completed phase.
#[derive(Debug, Default)]
pub struct PhaseTracker {
    completed: Vec<Phase>,
    current: Option<Phase>,
}

impl PhaseTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// The phase that must be entered next, if any remain.
    pub fn expected(&self) -> Option<Phase> {
        match self.completed.last() {
            None => Some(Phase::Planning),
            Some(last) => last.next(),
        }
    }

    /// Enter `phase`. Fails unless it is exactly the next phase in order.
    pub fn enter(&mut self, phase: Phase) -> Result<(), OrchestratorError> {
        if self.current.is_some() || self.expected() != Some(phase) {
            return Err(self.order_error(phase));
        }
        self.current = Some(phase);
        Ok(())
    }

    /// Re-enter the most recently completed phase.
    pub fn retry(&mut self, phase: Phase) -> Result<(), OrchestratorError> {
        if self.current.is_some() || self.completed.last() != Some(&phase) {
            return Err(self.order_error(phase));
        }
        self.current = Some(phase);
        Ok(())
    }

    /// Mark the current phase complete.
    pub fn complete(&mut self, phase: Phase) -> Result<(), OrchestratorError> {
        if self.current != Some(phase) {
            return Err(self.order_error(phase));
        }
        self.current = None;
        if self.completed.last() != Some(&phase) {
            self.completed.push(phase);
        }
        Ok(())
    }

    /// Start another pass from Planning once the previous pass has ended.
    pub fn restart(&mut self) -> Result<(), OrchestratorError> {
        if self.current.is_some() || self.completed.is_empty() {
            return Err(self.order_error(Phase::Planning));
        }
        self.completed.clear();
        Ok(())
    }

    pub fn current(&self) -> Option<Phase> {
        self.current
    }

    pub fn completed(&self) -> &[Phase] {
        &self.completed
    }

    fn order_error(&self, found: Phase) -> OrchestratorError {
        let expected = match (self.current, self.expected()) {
            (Some(current), _) => format!("completion of {}", current),
            (None, Some(next)) => next.to_string(),
            (None, None) => "no further phases".to_string(),
        };
        OrchestratorError::PhaseOrder { expected, found }
    }
}
