//! Context budget accounting and proactive summarization.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::summary::{ContextEntry, SegmentMarker, Summarizer, truncate_to_tokens};
use super::{SUMMARY_DIVISOR, estimate_tokens};
use crate::config::RunConfig;
use crate::errors::OrchestratorError;

/// Snapshot returned by every accounting call.
#[derive(Debug, Clone, PartialEq)]
pub struct BudgetState {
    /// Running token estimate after this call.
    pub running: u64,
    pub limit: u64,
    pub threshold: u64,
    /// Summarizations triggered by this call, oldest first.
    pub summarized: Vec<SegmentMarker>,
    /// The running estimate still exceeds the hard limit after summarization.
    pub over_limit: bool,
}

/// Serializable view of the context window.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContextWindowState {
    pub running: u64,
    pub limit: u64,
    pub segments: Vec<SegmentMarker>,
}

/// Tracks accumulated context against a limit and summarizes older entries
/// once the running estimate reaches the proactive threshold.
///
/// Accounting never fails. After each call the running estimate is below the
/// threshold: summaries are folded again until it is, and each summary is cut
/// to its token allowance.
pub struct ContextBudget {
    limit: u64,
    threshold: u64,
    running: u64,
    entries: VecDeque<ContextEntry>,
    segments: Vec<SegmentMarker>,
    summarizer: Arc<dyn Summarizer>,
}

impl std::fmt::Debug for ContextBudget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextBudget")
            .field("limit", &self.limit)
            .field("threshold", &self.threshold)
            .field("running", &self.running)
            .field("entries", &self.entries.len())
            .field("segments", &self.segments.len())
            .finish()
    }
}

impl ContextBudget {
    /// Create a budget. `threshold` is clamped to `limit`.
    pub fn new(limit: u64, threshold: u64, summarizer: Arc<dyn Summarizer>) -> Self {
        Self {
            limit,
            threshold: threshold.min(limit),
            running: 0,
            entries: VecDeque::new(),
            segments: Vec::new(),
            summarizer,
        }
    }

    /// Create a budget from run options.
    pub fn from_config(
        config: &RunConfig,
        summarizer: Arc<dyn Summarizer>,
    ) -> Result<Self, OrchestratorError> {
        Ok(Self::new(
            config.budget_limit,
            config.summarize_threshold()?,
            summarizer,
        ))
    }

    /// Account `tokens_used` with no recorded content.
    pub fn account(&mut self, tokens_used: u64) -> BudgetState {
        self.push(ContextEntry::new("usage", String::new(), tokens_used))
    }

    /// Record content and account its tokens (estimated when `tokens` is `None`).
    pub fn record(
        &mut self,
        label: impl Into<String>,
        content: impl Into<String>,
        tokens: Option<u64>,
    ) -> BudgetState {
        let content = content.into();
        let tokens = tokens.unwrap_or_else(|| estimate_tokens(&content));
        self.push(ContextEntry::new(label, content, tokens))
    }

    /// Summarize until the running estimate is below the threshold.
    ///
    /// Called at phase entry so no phase starts over the limit. Stops early
    /// only when a pass cannot shrink the context any further.
    pub fn ensure_headroom(&mut self) -> Vec<SegmentMarker> {
        let mut markers = Vec::new();
        while self.running >= self.threshold {
            let before = self.running;
            let Some(marker) = self.summarize() else {
                break;
            };
            markers.push(marker);
            if self.running >= before {
                break;
            }
        }
        markers
    }

    fn push(&mut self, entry: ContextEntry) -> BudgetState {
        self.running = self.running.saturating_add(entry.tokens);
        self.entries.push_back(entry);

        let summarized = self.ensure_headroom();
        let over_limit = self.running > self.limit;
        if over_limit {
            warn!(
                running = self.running,
                limit = self.limit,
                "context budget exceeds limit after summarization"
            );
        }

        BudgetState {
            running: self.running,
            limit: self.limit,
            threshold: self.threshold,
            summarized,
            over_limit,
        }
    }

    /// Fold older entries into one summary entry.
    ///
    /// Keeps the most recent entry verbatim when the remaining total would
    /// drop below the threshold; otherwise folds everything.
    fn summarize(&mut self) -> Option<SegmentMarker> {
        if self.entries.is_empty() {
            return None;
        }

        let latest = self.entries.back().map(|e| e.tokens).unwrap_or(0);
        let rest = self.running.saturating_sub(latest);
        let keep_latest =
            self.entries.len() > 1 && summary_allowance(rest).saturating_add(latest) < self.threshold;
        let fold_count = if keep_latest {
            self.entries.len() - 1
        } else {
            self.entries.len()
        };

        let folded: Vec<ContextEntry> = self.entries.drain(..fold_count).collect();
        let original_tokens: u64 = folded.iter().map(|e| e.tokens).sum();
        let allowance = summary_allowance(original_tokens);
        let text = truncate_to_tokens(&self.summarizer.summarize(&folded, allowance), allowance);
        let summary_tokens = estimate_tokens(&text).min(allowance);

        let sequence = self.segments.len() as u32 + 1;
        let mut summary = ContextEntry::new(format!("Summary #{}", sequence), text, summary_tokens);
        summary.is_summary = true;
        self.entries.push_front(summary);
        self.running = self.entries.iter().map(|e| e.tokens).sum();

        let marker = SegmentMarker {
            sequence,
            entries_summarized: folded.len(),
            original_tokens,
            summary_tokens,
            created_at: Utc::now(),
        };
        debug!(
            sequence,
            entries = folded.len(),
            original_tokens,
            summary_tokens,
            running = self.running,
            "summarized context"
        );
        self.segments.push(marker.clone());
        Some(marker)
    }

    /// Render recorded content for prompt injection, oldest first.
    pub fn render_context(&self) -> String {
        let mut out = String::new();
        for entry in self.entries.iter().filter(|e| !e.content.is_empty()) {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(&format!("### {}\n{}\n", entry.label, entry.content.trim_end()));
        }
        out
    }

    pub fn state(&self) -> ContextWindowState {
        ContextWindowState {
            running: self.running,
            limit: self.limit,
            segments: self.segments.clone(),
        }
    }

    pub fn running(&self) -> u64 {
        self.running
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    pub fn segments(&self) -> &[SegmentMarker] {
        &self.segments
    }

    /// One-line usage report, e.g. `42.0% of 1000 tokens, 1 summarization`.
    pub fn usage_line(&self) -> String {
        let used = if self.limit == 0 {
            100.0
        } else {
            self.running as f64 * 100.0 / self.limit as f64
        };
        let n = self.segments.len();
        format!(
            "{:.1}% of {} tokens, {} summarization{}",
            used,
            self.limit,
            n,
            if n == 1 { "" } else { "s" }
        )
    }
}

/// Tokens a summary of `original` tokens may occupy.
fn summary_allowance(original: u64) -> u64 {
    (original / SUMMARY_DIVISOR).max(1).min(original)
}
