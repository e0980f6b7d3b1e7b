//! Configuration for crewforge runs.
//!
//! Two layers:
//! - `RunConfig`, the per-run options the orchestrator consumes
//! - `CrewforgeToml`, the `.crewforge/crewforge.toml` file that also carries
//!   collaborator settings (generator command, hosting repository, webhook)
//!
//! Values are layered file → environment → CLI. The CLI layer lives in the
//! binary; this module provides the first two.
//!
//! # Configuration File Format
//!
//! ```toml
//! [run]
//! auto_approve = false
//! budget_limit = 100000
//! summarize_at = "80%"
//! firing_threshold = 2.0
//! min_review_samples = 3
//! enabled_notifications = ["plan-complete", "agent-fired", "agent-hired"]
//! create_pr = true
//! auto_merge = false
//! merge_method = "squash"
//!
//! [generator]
//! command = "claude"
//! args = ["--print"]
//!
//! [hosting]
//! repo = "owner/repo"
//!
//! [notifications]
//! webhook_url = "https://discord.com/api/webhooks/..."
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use crate::compaction::resolve_threshold;
use crate::errors::OrchestratorError;
use crate::hosting::MergeMethod;
use crate::notify::EventKind;

/// Name of the project-level configuration directory.
pub const CONFIG_DIR: &str = ".crewforge";

/// Name of the configuration file inside [`CONFIG_DIR`].
pub const CONFIG_FILE: &str = "crewforge.toml";

/// Upper bound for `max_iterations`.
pub const MAX_ITERATIONS: u32 = 10;

/// Options for a single orchestrated run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunConfig {
    /// Resolve every approval gate immediately as Approved.
    pub auto_approve: bool,
    /// Event kinds to publish. Empty means all kinds.
    pub enabled_notifications: BTreeSet<EventKind>,
    /// Context budget limit in estimated tokens.
    pub budget_limit: u64,
    /// Proactive summarization threshold: a percentage of the limit ("80%")
    /// or an absolute token count ("60000").
    pub summarize_at: String,
    /// Agents whose rolling average falls strictly below this are fired.
    pub firing_threshold: f64,
    /// Number of most recent ratings in the rolling average.
    pub min_review_samples: usize,
    pub create_pr: bool,
    pub auto_merge: bool,
    pub merge_method: MergeMethod,
    /// Branch the change request is opened from. Defaults to `crewforge/<run-id>`.
    pub head_branch: Option<String>,
    pub base_branch: String,
    pub approval_timeout_secs: u64,
    /// Total attempts for one generation call, including the first.
    pub generation_attempts: u32,
    /// Base backoff between generation attempts; doubles each retry.
    pub retry_backoff_ms: u64,
    /// Maximum hires per role over a run, including the initial hire.
    pub max_hires_per_role: Option<u32>,
    pub peer_review: bool,
    /// Explicit retries of a Testing phase whose tests failed.
    pub max_test_retries: u32,
    /// Passes over the whole workflow. Each extra pass starts again from
    /// Planning with feedback from the previous one, until a pass completes.
    pub max_iterations: u32,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            auto_approve: false,
            enabled_notifications: BTreeSet::new(),
            budget_limit: 100_000,
            summarize_at: "80%".to_string(),
            firing_threshold: 2.0,
            min_review_samples: 1,
            create_pr: false,
            auto_merge: false,
            merge_method: MergeMethod::Merge,
            head_branch: None,
            base_branch: "main".to_string(),
            approval_timeout_secs: 900,
            generation_attempts: 3,
            retry_backoff_ms: 500,
            max_hires_per_role: None,
            peer_review: true,
            max_test_retries: 0,
            max_iterations: 1,
        }
    }
}

impl RunConfig {
    /// Check every option that can be checked without running a phase.
    ///
    /// `has_host` reports whether a source-hosting collaborator is wired in.
    pub fn validate(&self, has_host: bool) -> Result<(), OrchestratorError> {
        let fail = |msg: String| Err(OrchestratorError::Configuration(msg));

        if self.budget_limit == 0 {
            return fail("budget_limit must be greater than 0".into());
        }
        let threshold = self.summarize_threshold()?;
        if threshold == 0 {
            return fail(format!(
                "summarize_at ({}) rounds to 0 tokens of budget_limit ({})",
                self.summarize_at, self.budget_limit
            ));
        }
        if threshold > self.budget_limit {
            return fail(format!(
                "summarize_at ({}) exceeds budget_limit ({})",
                threshold, self.budget_limit
            ));
        }
        if !(1.0..=5.0).contains(&self.firing_threshold) {
            return fail(format!(
                "firing_threshold must be between 1.0 and 5.0, got {}",
                self.firing_threshold
            ));
        }
        if self.min_review_samples == 0 {
            return fail("min_review_samples must be at least 1".into());
        }
        if self.generation_attempts == 0 {
            return fail("generation_attempts must be at least 1".into());
        }
        if !(1..=MAX_ITERATIONS).contains(&self.max_iterations) {
            return fail(format!(
                "max_iterations must be between 1 and {}, got {}",
                MAX_ITERATIONS, self.max_iterations
            ));
        }
        if self.max_hires_per_role == Some(0) {
            return fail("max_hires_per_role must allow at least the initial hire".into());
        }
        if self.auto_merge && !self.create_pr {
            return fail("auto_merge requires create_pr".into());
        }
        if self.create_pr && !has_host {
            return fail(
                "create_pr is set but no source-hosting client is configured \
                 (set [hosting].repo and GITHUB_TOKEN)"
                    .into(),
            );
        }
        Ok(())
    }

    /// Proactive summarization threshold in tokens.
    pub fn summarize_threshold(&self) -> Result<u64, OrchestratorError> {
        resolve_threshold(&self.summarize_at, self.budget_limit)
            .map_err(|e| OrchestratorError::Configuration(format!("summarize_at: {e:#}")))
    }

    pub fn approval_timeout(&self) -> Duration {
        Duration::from_secs(self.approval_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// Whether events of `kind` should be published.
    pub fn notification_enabled(&self, kind: EventKind) -> bool {
        self.enabled_notifications.is_empty() || self.enabled_notifications.contains(&kind)
    }

    /// Apply `CREWFORGE_*` environment overrides.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(v) = std::env::var("CREWFORGE_AUTO_APPROVE") {
            self.auto_approve = v != "false" && v != "0";
        }
        if let Ok(v) = std::env::var("CREWFORGE_BUDGET_LIMIT") {
            self.budget_limit = v
                .parse()
                .with_context(|| format!("Invalid CREWFORGE_BUDGET_LIMIT: {}", v))?;
        }
        if let Ok(v) = std::env::var("CREWFORGE_FIRING_THRESHOLD") {
            self.firing_threshold = v
                .parse()
                .with_context(|| format!("Invalid CREWFORGE_FIRING_THRESHOLD: {}", v))?;
        }
        if let Ok(v) = std::env::var("CREWFORGE_MIN_REVIEW_SAMPLES") {
            self.min_review_samples = v
                .parse()
                .with_context(|| format!("Invalid CREWFORGE_MIN_REVIEW_SAMPLES: {}", v))?;
        }
        Ok(())
    }
}

/// Generation collaborator settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GeneratorSection {
    /// Command that reads a prompt on stdin and writes the reply on stdout.
    pub command: String,
    pub args: Vec<String>,
    /// Per-call timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for GeneratorSection {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            args: vec!["--print".to_string()],
            timeout_secs: 600,
        }
    }
}

impl GeneratorSection {
    /// The configured command, with `CREWFORGE_GENERATOR_CMD` taking precedence.
    pub fn command(&self) -> String {
        std::env::var("CREWFORGE_GENERATOR_CMD").unwrap_or_else(|_| self.command.clone())
    }
}

/// Source-hosting settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HostingSection {
    /// `owner/repo` slug or repository URL.
    pub repo: Option<String>,
    /// API base, for GitHub Enterprise.
    pub api_url: Option<String>,
}

/// Notification transport settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NotificationsSection {
    pub webhook_url: Option<String>,
}

impl NotificationsSection {
    /// The webhook URL, with `CREWFORGE_WEBHOOK_URL` taking precedence.
    pub fn webhook_url(&self) -> Option<String> {
        std::env::var("CREWFORGE_WEBHOOK_URL")
            .ok()
            .or_else(|| self.webhook_url.clone())
    }
}

/// The `crewforge.toml` file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CrewforgeToml {
    pub run: RunConfig,
    pub generator: GeneratorSection,
    pub hosting: HostingSection,
    pub notifications: NotificationsSection,
}

impl CrewforgeToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse crewforge.toml")
    }

    /// Load from `<project>/.crewforge/crewforge.toml`, or defaults if absent.
    pub fn load_or_default(project_dir: &Path) -> Result<Self> {
        let path = config_path(project_dir);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize crewforge.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }
}

/// Path of the configuration file for a project directory.
pub fn config_path(project_dir: &Path) -> std::path::PathBuf {
    project_dir.join(CONFIG_DIR).join(CONFIG_FILE)
}
