//! Context Budget Management
//!
//! This module tracks the accumulated token estimate of a run's context and
//! compresses older content before it can grow past the configured limit.
//!
//! ## Features
//!
//! - **Token Accounting**: every phase output is recorded with its token estimate
//! - **Proactive Summarization**: once the running estimate reaches the threshold
//!   (80% of the limit by default) older entries are folded into one summary
//! - **Segment Markers**: each summarization leaves a marker for the audit trail
//!
//! ## Configuration
//!
//! ```toml
//! [run]
//! budget_limit = 100000
//! summarize_at = "80%"   # or an absolute token count
//! ```
//!
//! ## Usage
//!
//! ```
//! use std::sync::Arc;
//! use crewforge::compaction::{ContextBudget, DigestSummarizer};
//!
//! let mut budget = ContextBudget::new(1_000, 800, Arc::new(DigestSummarizer));
//! budget.account(400);
//! let state = budget.account(450);
//! assert_eq!(state.summarized.len(), 1);
//! assert!(state.running < 800);
//! ```

mod budget;
mod config;
mod summary;

pub use budget::{BudgetState, ContextBudget, ContextWindowState};
pub use config::resolve_threshold;
pub use summary::{ContextEntry, DigestSummarizer, SegmentMarker, Summarizer, truncate_to_tokens};

/// Approximate characters per token used when a collaborator reports no usage.
pub const CHARS_PER_TOKEN: usize = 4;

/// A summary may occupy at most `1 / SUMMARY_DIVISOR` of the tokens it replaces.
pub const SUMMARY_DIVISOR: u64 = 4;

/// Estimate the token count of `text`.
pub fn estimate_tokens(text: &str) -> u64 {
    text.chars().count().div_ceil(CHARS_PER_TOKEN) as u64
}
