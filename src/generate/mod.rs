//! Generation collaborator boundary.
//!
//! The orchestrator never produces plans, code or tests itself. It hands a
//! prompt to a [`Generator`] and receives a structured [`GenerationReply`].
//!
//! This module provides:
//! - the [`Generator`] trait and its request/reply types
//! - [`Hurdle`] markers carried by replies
//! - [`generate_with_retry`], the bounded retry policy for transient failures
//! - [`CommandGenerator`], which pipes the prompt through an external command
//! - [`parse_reply`], which turns raw command output into a reply

mod command;
mod parser;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::errors::GenerationError;
use crate::phase::{Phase, Role};

pub use command::CommandGenerator;
pub use parser::{parse_reply, strip_hurdles};

/// Why a generation call is being made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Purpose {
    /// Produce the phase artifact.
    Produce,
    /// Rate another role's phase artifact.
    PeerReview,
}

/// A single request to the generation collaborator.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub role: Role,
    pub phase: Phase,
    pub agent_id: Uuid,
    pub purpose: Purpose,
    pub prompt: String,
}

/// Structured reply from the generation collaborator.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationReply {
    pub output: String,
    pub hurdle: Option<Hurdle>,
    /// Reported usage. Estimated from the output when absent.
    pub tokens_used: Option<u64>,
}

impl GenerationReply {
    pub fn text(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            ..Self::default()
        }
    }

    pub fn with_hurdle(mut self, hurdle: Hurdle) -> Self {
        self.hurdle = Some(hurdle);
        self
    }

    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens_used = Some(tokens);
        self
    }
}

/// Severity of a technical hurdle. Ordered from least to most severe.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum HurdleSeverity {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl HurdleSeverity {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

impl std::fmt::Display for HurdleSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        };
        write!(f, "{}", s)
    }
}

/// A technical obstacle reported alongside a generation reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hurdle {
    pub description: String,
    pub severity: HurdleSeverity,
}

impl Hurdle {
    pub fn new(description: impl Into<String>, severity: HurdleSeverity) -> Self {
        Self {
            description: description.into(),
            severity,
        }
    }

    pub fn critical(description: impl Into<String>) -> Self {
        Self::new(description, HurdleSeverity::Critical)
    }

    /// Critical hurdles force an approval gate before the run continues.
    pub fn is_critical(&self) -> bool {
        self.severity == HurdleSeverity::Critical
    }
}

/// The generation collaborator.
///
/// Treated as a pure function from request to reply. Implementations classify
/// their failures so the retry policy can decide what to do.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationReply, GenerationError>;
}

/// Bounded retry policy for generation calls.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub attempts: u32,
    /// Delay before the second attempt; doubles afterwards.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(500),
        }
    }
}

/// A generation call that ran out of attempts.
#[derive(Debug, Clone)]
pub struct GenerationFailure {
    pub attempts: u32,
    pub error: GenerationError,
}

/// Call `generator`, retrying retryable failures with exponential backoff.
///
/// `on_retry` is invoked with the attempt number and error before each retry.
pub async fn generate_with_retry(
    generator: &dyn Generator,
    request: &GenerationRequest,
    policy: RetryPolicy,
    mut on_retry: impl FnMut(u32, &GenerationError),
) -> Result<GenerationReply, GenerationFailure> {
    let attempts = policy.attempts.max(1);
    let mut delay = policy.backoff;
    let mut attempt = 1;

    loop {
        match generator.generate(request.clone()).await {
            Ok(reply) if reply.output.trim().is_empty() && reply.hurdle.is_none() => {
                let error = GenerationError::Malformed("empty output".into());
                if attempt >= attempts {
                    return Err(GenerationFailure { attempts: attempt, error });
                }
                on_retry(attempt, &error);
            }
            Ok(reply) => return Ok(reply),
            Err(error) if error.is_retryable() && attempt < attempts => {
                warn!(
                    phase = %request.phase,
                    role = %request.role,
                    attempt,
                    error = %error,
                    "generation failed, retrying"
                );
                on_retry(attempt, &error);
            }
            Err(error) => return Err(GenerationFailure { attempts: attempt, error }),
        }

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        delay = delay.saturating_mul(2);
        attempt += 1;
    }
}
