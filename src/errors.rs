//! Typed error hierarchy for the crewforge orchestrator.
//!
//! Four enums cover the subsystems:
//! - `OrchestratorError`: run-level failures (configuration, escalation, gates)
//! - `RosterError`: agent lookup and hire/fire failures
//! - `GenerationError`: failures reported by the generation collaborator
//! - `HostingError`: failures reported by the source-hosting collaborator

use std::time::Duration;

use thiserror::Error;

use crate::phase::{Phase, Role};

/// Errors from the orchestrator.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Generation for {phase} failed after {attempts} attempt(s): {source}")]
    Generation {
        phase: Phase,
        attempts: u32,
        #[source]
        source: GenerationError,
    },

    #[error("No approval decision for {phase} within {}s", .waited.as_secs())]
    ApprovalTimeout { phase: Phase, waited: Duration },

    #[error("Phase {found} entered out of order (expected {expected})")]
    PhaseOrder { expected: String, found: Phase },

    #[error(transparent)]
    Roster(#[from] RosterError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the agent roster.
#[derive(Debug, Error)]
pub enum RosterError {
    #[error("No active agent for role {role}")]
    NoActiveAgent { role: Role },

    #[error("Agent {id} is not active in the roster")]
    UnknownAgent { id: uuid::Uuid },

    #[error("Cannot hire another {role}: {hires} hires already made")]
    Exhausted { role: Role, hires: u32 },
}

/// Errors returned by a generation collaborator.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GenerationError {
    /// The call failed in a way that may succeed on retry (I/O, rate limit).
    #[error("transient generation failure: {0}")]
    Transient(String),

    /// The reply could not be interpreted.
    #[error("malformed generation reply: {0}")]
    Malformed(String),

    /// The collaborator cannot serve requests at all; retrying will not help.
    #[error("generation service unavailable: {0}")]
    Unavailable(String),
}

impl GenerationError {
    /// Whether the retry policy should try the call again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Malformed(_))
    }
}

/// Errors returned by a source-hosting collaborator.
#[derive(Debug, Error)]
pub enum HostingError {
    #[error("Missing hosting credential: {0}")]
    MissingCredential(String),

    #[error("Invalid repository '{0}': expected owner/repo or a GitHub URL")]
    InvalidRepository(String),

    #[error("Hosting API returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Hosting transport error: {0}")]
    Transport(#[source] anyhow::Error),
}
