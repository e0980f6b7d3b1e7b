//! The phase orchestrator.
//!
//! [`Orchestrator::run`] drives one project through Planning, Development,
//! Review, Testing, PRCreation and (optionally) PRMerge. Each run owns its
//! roster, context budget, approval gate and action log; the orchestrator
//! itself only holds the injected collaborators, so independent runs can
//! execute concurrently on the same instance.
//!
//! ```no_run
//! use std::sync::Arc;
//! use crewforge::config::RunConfig;
//! use crewforge::generate::CommandGenerator;
//! use crewforge::orchestrator::Orchestrator;
//!
//! # async fn demo() -> Result<(), crewforge::errors::OrchestratorError> {
//! let generator = CommandGenerator::new("claude", vec!["--print".into()], std::time::Duration::from_secs(600));
//! let orchestrator = Orchestrator::builder(Arc::new(generator)).build();
//! let config = RunConfig { auto_approve: true, ..RunConfig::default() };
//! let result = orchestrator.run("build a CRUD API", &config).await?;
//! println!("{:?}", result.status);
//! # Ok(())
//! # }
//! ```

pub mod prompts;
mod runner;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::audit::ActionLog;
use crate::compaction::{ContextWindowState, DigestSummarizer, Summarizer};
use crate::config::RunConfig;
use crate::errors::OrchestratorError;
use crate::gates::{ApprovalRequest, PendingApproval};
use crate::generate::Generator;
use crate::hosting::{PrHandle, SourceHost};
use crate::metrics::MetricsSink;
use crate::notify::{NotificationDispatcher, NotificationSink};
use crate::phase::{Phase, PhaseResult};
use crate::roster::AgentEvent;

pub use runner::tests_passed;

/// Final status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Succeeded,
    Failed,
}

/// Why a run stopped early.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Halt {
    pub phase: Phase,
    pub reason: String,
}

/// Token usage aggregated per agent and per phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenTotals {
    pub per_agent: BTreeMap<Uuid, u64>,
    pub per_stage: BTreeMap<Phase, u64>,
}

impl TokenTotals {
    pub fn add(&mut self, phase: Phase, agent: Option<Uuid>, tokens: u64) {
        *self.per_stage.entry(phase).or_insert(0) += tokens;
        if let Some(agent) = agent {
            *self.per_agent.entry(agent).or_insert(0) += tokens;
        }
    }

    pub fn total(&self) -> u64 {
        self.per_stage.values().sum()
    }
}

fn one() -> u32 {
    1
}

/// Everything a run produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectResult {
    pub run_id: Uuid,
    pub status: RunStatus,
    /// One entry per phase execution, in order.
    pub phase_results: Vec<PhaseResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_handle: Option<PrHandle>,
    pub tests_passed: bool,
    pub token_totals: TokenTotals,
    /// Roster lifecycle events, in order.
    pub agent_events: Vec<AgentEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub halt: Option<Halt>,
    pub context: ContextWindowState,
    pub approvals: Vec<ApprovalRequest>,
    pub action_log: ActionLog,
    /// Passes over the workflow, at least 1.
    #[serde(default = "one")]
    pub iterations: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ProjectResult {
    /// A result with nothing recorded yet.
    pub fn new(run_id: Uuid, budget_limit: u64) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            status: RunStatus::Succeeded,
            phase_results: Vec::new(),
            pr_handle: None,
            tests_passed: false,
            token_totals: TokenTotals::default(),
            agent_events: Vec::new(),
            halt: None,
            context: ContextWindowState {
                running: 0,
                limit: budget_limit,
                segments: Vec::new(),
            },
            approvals: Vec::new(),
            action_log: ActionLog::new(),
            iterations: 1,
            started_at: now,
            finished_at: now,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    /// Phases in the order they produced results.
    pub fn phases(&self) -> Vec<Phase> {
        self.phase_results.iter().map(|r| r.phase).collect()
    }

    pub fn result_for(&self, phase: Phase) -> Option<&PhaseResult> {
        self.phase_results.iter().rev().find(|r| r.phase == phase)
    }
}

/// Sequences phases for a project, delegating work to the injected collaborators.
pub struct Orchestrator {
    generator: Arc<dyn Generator>,
    host: Option<Arc<dyn SourceHost>>,
    dispatcher: NotificationDispatcher,
    metrics: Option<Arc<dyn MetricsSink>>,
    approver: Option<mpsc::Sender<PendingApproval>>,
    summarizer: Arc<dyn Summarizer>,
}

impl Orchestrator {
    pub fn builder(generator: Arc<dyn Generator>) -> OrchestratorBuilder {
        OrchestratorBuilder {
            generator,
            host: None,
            dispatcher: NotificationDispatcher::new(),
            metrics: None,
            approver: None,
            summarizer: Arc::new(DigestSummarizer),
        }
    }

    /// Run the workflow for `manifesto`.
    ///
    /// Returns `Err` only for configuration problems detected before any phase
    /// runs. Every later failure yields a result with status
    /// [`RunStatus::Failed`] and a [`Halt`] describing where and why.
    pub async fn run(
        &self,
        manifesto: &str,
        config: &RunConfig,
    ) -> Result<ProjectResult, OrchestratorError> {
        if manifesto.trim().is_empty() {
            return Err(OrchestratorError::Configuration(
                "manifesto is empty".into(),
            ));
        }
        config.validate(self.host.is_some())?;

        let run = runner::RunState::new(self, manifesto, config)?;
        Ok(run.execute().await)
    }

    pub fn has_host(&self) -> bool {
        self.host.is_some()
    }
}

/// Builder for [`Orchestrator`].
pub struct OrchestratorBuilder {
    generator: Arc<dyn Generator>,
    host: Option<Arc<dyn SourceHost>>,
    dispatcher: NotificationDispatcher,
    metrics: Option<Arc<dyn MetricsSink>>,
    approver: Option<mpsc::Sender<PendingApproval>>,
    summarizer: Arc<dyn Summarizer>,
}

impl OrchestratorBuilder {
    /// Source-hosting collaborator used for PRCreation and PRMerge.
    pub fn host(mut self, host: Arc<dyn SourceHost>) -> Self {
        self.host = Some(host);
        self
    }

    /// Register a notification sink. May be called repeatedly.
    pub fn sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.dispatcher.register(sink);
        self
    }

    /// Longest a sink may take to accept one event before it counts as failed.
    pub fn notification_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.dispatcher.set_delivery_timeout(timeout);
        self
    }

    pub fn metrics(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(sink);
        self
    }

    /// Channel receiving checkpoints that need an external decision.
    pub fn approvals(mut self, approver: mpsc::Sender<PendingApproval>) -> Self {
        self.approver = Some(approver);
        self
    }

    pub fn summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = summarizer;
        self
    }

    pub fn build(self) -> Orchestrator {
        Orchestrator {
            generator: self.generator,
            host: self.host,
            dispatcher: self.dispatcher,
            metrics: self.metrics,
            approver: self.approver,
            summarizer: self.summarizer,
        }
    }
}
