//! Peer review between agents.
//!
//! After a phase produces its artifact, each reviewer role applicable to that
//! phase rates it 1 to 5 through the generation service. The ratings feed the
//! roster's firing decision.
//!
//! ## Reviewer matrix
//!
//! | Phase       | Producer       | Reviewers                  |
//! |-------------|----------------|----------------------------|
//! | Planning    | Planner        | Developer                  |
//! | Development | Developer      | Planner, Reviewer, QA      |
//! | Review      | Reviewer       | Developer                  |
//! | Testing     | QA             | Developer                  |
//! | PRCreation  | ReleaseManager | Reviewer                   |
//! | PRMerge     | ReleaseManager | (none)                     |
//!
//! Bad ratings never fail a run: out-of-range values are clamped, missing
//! ratings default to a neutral 3 and a failed review call skips that reviewer.
//! Each case is reported as a [`ReviewWarning`].

mod parser;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::compaction::truncate_to_tokens;
use crate::generate::{GenerationRequest, Generator, Purpose, RetryPolicy, generate_with_retry};
use crate::phase::{Phase, Role};
use crate::roster::{AgentProfile, Rating};

pub use parser::{ParsedRating, parse_rating};

/// Rating used when a reply carries no recognizable rating.
pub const NEUTRAL_RATING: u8 = 3;

/// Maximum tokens of the reviewed artifact included in a review prompt.
const MAX_REVIEWED_TOKENS: u64 = 6_000;

/// One reviewer's rating of one phase artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewRecord {
    pub reviewer_id: Uuid,
    pub reviewer_role: Role,
    pub reviewee_id: Uuid,
    pub reviewee_role: Role,
    pub phase: Phase,
    pub rating: Rating,
    pub comment: String,
    /// The reviewer's raw value was out of range or missing.
    #[serde(default)]
    pub clamped: bool,
    pub timestamp: DateTime<Utc>,
}

/// Data-quality problem encountered while reviewing.
#[derive(Debug, Clone, PartialEq)]
pub enum ReviewWarning {
    /// Out-of-range rating clamped to the nearest bound.
    Clamped { reviewer: Role, raw: i64, rating: Rating },
    /// No rating found; the neutral rating was used.
    Defaulted { reviewer: Role },
    /// The review call failed; no record was produced for this reviewer.
    Skipped { reviewer: Role, error: String },
}

impl std::fmt::Display for ReviewWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Clamped {
                reviewer,
                raw,
                rating,
            } => write!(f, "{} rated {}, clamped to {}", reviewer, raw, rating),
            Self::Defaulted { reviewer } => write!(
                f,
                "{} gave no parseable rating, using {}",
                reviewer, NEUTRAL_RATING
            ),
            Self::Skipped { reviewer, error } => {
                write!(f, "{} review skipped: {}", reviewer, error)
            }
        }
    }
}

/// Records and warnings from reviewing one phase.
#[derive(Debug, Clone, Default)]
pub struct ReviewOutcome {
    pub records: Vec<ReviewRecord>,
    pub warnings: Vec<ReviewWarning>,
    pub tokens_used: u64,
}

/// Roles that review the artifact of `phase`.
pub fn reviewers_for(phase: Phase) -> &'static [Role] {
    match phase {
        Phase::Planning => &[Role::Developer],
        Phase::Development => &[Role::Planner, Role::Reviewer, Role::Qa],
        Phase::Review => &[Role::Developer],
        Phase::Testing => &[Role::Developer],
        Phase::PrCreation => &[Role::Reviewer],
        Phase::PrMerge => &[],
    }
}

/// What a reviewer role looks for.
fn focus(reviewer: Role) -> &'static str {
    match reviewer {
        Role::Planner => "alignment with the plan and the project goals",
        Role::Developer => "feasibility and technical correctness",
        Role::Reviewer => "code quality, clarity and maintainability",
        Role::Qa => "testability and coverage of edge cases",
        Role::ReleaseManager => "readiness for release",
    }
}

/// Elicits peer ratings through the generation service.
pub struct PeerReviewEngine {
    generator: Arc<dyn Generator>,
    retry: RetryPolicy,
}

impl PeerReviewEngine {
    pub fn new(generator: Arc<dyn Generator>, retry: RetryPolicy) -> Self {
        Self { generator, retry }
    }

    /// Build the prompt asking `reviewer` to rate `output`.
    pub fn prompt(phase: Phase, reviewer: Role, producer: Role, output: &str) -> String {
        format!(
            "You are the {reviewer} on a software team. Review the {producer}'s output \
             for the {phase} phase, focusing on {focus}.\n\n\
             ## Output under review\n\n{output}\n\n\
             ## Response format\n\n\
             Reply with a JSON object only: {{\"rating\": <integer 1-5>, \"comment\": \"<one or two sentences>\"}}\n\
             1 = unusable, 3 = acceptable, 5 = excellent.\n",
            reviewer = reviewer,
            producer = producer,
            phase = phase,
            focus = focus(reviewer),
            output = truncate_to_tokens(output, MAX_REVIEWED_TOKENS),
        )
    }

    /// Rate `output`, produced by `producer` in `phase`, once per reviewer.
    ///
    /// Reviewers are visited in the given order. A reviewer sharing the
    /// producer's identity is skipped.
    pub async fn review(
        &self,
        phase: Phase,
        producer: &AgentProfile,
        output: &str,
        reviewers: &[AgentProfile],
    ) -> ReviewOutcome {
        let mut outcome = ReviewOutcome::default();

        for reviewer in reviewers.iter().filter(|r| r.id != producer.id) {
            let request = GenerationRequest {
                role: reviewer.role,
                phase,
                agent_id: reviewer.id,
                purpose: Purpose::PeerReview,
                prompt: Self::prompt(phase, reviewer.role, producer.role, output),
            };

            let reply = match generate_with_retry(self.generator.as_ref(), &request, self.retry, |_, _| {})
                .await
            {
                Ok(reply) => reply,
                Err(failure) => {
                    let warning = ReviewWarning::Skipped {
                        reviewer: reviewer.role,
                        error: failure.error.to_string(),
                    };
                    warn!(phase = %phase, "{}", warning);
                    outcome.warnings.push(warning);
                    continue;
                }
            };
            outcome.tokens_used += reply
                .tokens_used
                .unwrap_or_else(|| crate::compaction::estimate_tokens(&reply.output));

            let parsed = parse_rating(&reply.output);
            let (rating, clamped) = match parsed.value {
                Some(raw) => {
                    let (rating, clamped) = Rating::clamped(raw);
                    if clamped {
                        let warning = ReviewWarning::Clamped {
                            reviewer: reviewer.role,
                            raw,
                            rating,
                        };
                        warn!(phase = %phase, "{}", warning);
                        outcome.warnings.push(warning);
                    }
                    (rating, clamped)
                }
                None => {
                    let warning = ReviewWarning::Defaulted {
                        reviewer: reviewer.role,
                    };
                    warn!(phase = %phase, "{}", warning);
                    outcome.warnings.push(warning);
                    let (rating, _) = Rating::clamped(NEUTRAL_RATING as i64);
                    (rating, true)
                }
            };

            outcome.records.push(ReviewRecord {
                reviewer_id: reviewer.id,
                reviewer_role: reviewer.role,
                reviewee_id: producer.id,
                reviewee_role: producer.role,
                phase,
                rating,
                comment: parsed.comment,
                clamped,
                timestamp: Utc::now(),
            });
        }

        outcome
    }
}
