//! Context entries, summary segments and the summarization step.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{CHARS_PER_TOKEN, estimate_tokens};

/// One recorded piece of accumulated context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextEntry {
    /// Where the content came from (e.g. "Planning output", "summary #1").
    pub label: String,
    /// Recorded content. Empty when only a token count was accounted.
    pub content: String,
    /// Estimated tokens this entry contributes to the running total.
    pub tokens: u64,
    pub recorded_at: DateTime<Utc>,
    /// Whether this entry is itself a summary of earlier entries.
    #[serde(default)]
    pub is_summary: bool,
}

impl ContextEntry {
    pub fn new(label: impl Into<String>, content: impl Into<String>, tokens: u64) -> Self {
        Self {
            label: label.into(),
            content: content.into(),
            tokens,
            recorded_at: Utc::now(),
            is_summary: false,
        }
    }
}

/// Marker left behind each time older entries are folded into a summary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SegmentMarker {
    /// 1-based sequence number of the summarization event.
    pub sequence: u32,
    pub entries_summarized: usize,
    pub original_tokens: u64,
    pub summary_tokens: u64,
    pub created_at: DateTime<Utc>,
}

impl SegmentMarker {
    /// Fraction of the original tokens removed (0.0 to 1.0).
    pub fn compression_ratio(&self) -> f64 {
        if self.original_tokens == 0 {
            return 0.0;
        }
        1.0 - (self.summary_tokens as f64 / self.original_tokens as f64)
    }
}

/// Compresses older context entries into a shorter representative text.
pub trait Summarizer: Send + Sync {
    /// Produce a summary of `entries` that fits in roughly `max_tokens`.
    fn summarize(&self, entries: &[ContextEntry], max_tokens: u64) -> String;
}

/// Extractive summarizer: keeps headings, structural code lines, and
/// decision-like sentences, then truncates to the token allowance.
#[derive(Debug, Default, Clone)]
pub struct DigestSummarizer;

/// Line prefixes worth keeping from code-like content.
const STRUCTURAL_PREFIXES: &[&str] = &[
    "#", "fn ", "pub ", "struct ", "enum ", "impl ", "trait ", "mod ", "use ", "def ", "class ",
    "import ", "from ", "function ", "- ", "* ",
];

/// Words that mark a line as carrying a decision or outcome.
const KEY_WORDS: &[&str] = &[
    "decid", "must", "error", "fail", "pass", "todo", "risk", "return", "blocker",
];

impl DigestSummarizer {
    fn is_key_line(line: &str) -> bool {
        let trimmed = line.trim_start();
        if trimmed.is_empty() {
            return false;
        }
        if STRUCTURAL_PREFIXES.iter().any(|p| trimmed.starts_with(p)) {
            return true;
        }
        let lower = trimmed.to_lowercase();
        KEY_WORDS.iter().any(|w| lower.contains(w))
    }
}

impl Summarizer for DigestSummarizer {
    fn summarize(&self, entries: &[ContextEntry], max_tokens: u64) -> String {
        let mut out = String::new();
        let total: u64 = entries.iter().map(|e| e.tokens).sum();
        out.push_str(&format!(
            "## Summary of {} earlier context segment{} ({} tokens)\n",
            entries.len(),
            if entries.len() == 1 { "" } else { "s" },
            total
        ));

        for entry in entries {
            out.push_str(&format!("\n### {}\n", entry.label));
            let kept: Vec<&str> = entry
                .content
                .lines()
                .filter(|l| Self::is_key_line(l))
                .collect();
            if kept.is_empty() {
                if let Some(first) = entry.content.lines().find(|l| !l.trim().is_empty()) {
                    out.push_str(first.trim());
                    out.push('\n');
                }
            } else {
                for line in kept {
                    out.push_str(line.trim_end());
                    out.push('\n');
                }
            }
        }

        truncate_to_tokens(&out, max_tokens)
    }
}

/// Truncate `text` to approximately `max_tokens` tokens on a char boundary.
pub fn truncate_to_tokens(text: &str, max_tokens: u64) -> String {
    if estimate_tokens(text) <= max_tokens {
        return text.to_string();
    }
    let max_chars = (max_tokens as usize).saturating_mul(CHARS_PER_TOKEN);
    text.chars().take(max_chars).collect()
}
