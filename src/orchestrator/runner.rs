//! Per-run state and the phase loop.

use std::time::Instant;

use chrono::Utc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{Halt, Orchestrator, ProjectResult, RunStatus, prompts};
use crate::audit::{ActionEntry, ActionKind};
use crate::compaction::{BudgetState, ContextBudget, SegmentMarker, estimate_tokens};
use crate::config::RunConfig;
use crate::errors::{OrchestratorError, RosterError};
use crate::gates::{ApprovalGate, Decision};
use crate::generate::{GenerationRequest, Hurdle, Purpose, RetryPolicy, generate_with_retry};
use crate::metrics::MetricsRecord;
use crate::notify::{EventKind, NotificationEvent};
use crate::phase::{Phase, PhaseResult, PhaseStatus, PhaseTracker};
use crate::review::{PeerReviewEngine, ReviewWarning, reviewers_for};
use crate::roster::{AgentEvent, AgentProfile, AgentRoster};

const FEEDBACK_EXCERPT_CHARS: usize = 300;

const PASS_MARKERS: &[&str] = &[
    "all tests passed",
    "tests passed",
    "test result: ok",
    "passed:",
    "✓",
    "✅",
];

const FAIL_MARKERS: &[&str] = &[
    "tests failed",
    "test failed",
    "failed:",
    "error:",
    "failure",
    "✗",
    "❌",
];

/// Whether a QA report says the tests passed.
///
/// A report counts as failing only when it carries a failure marker and no
/// pass marker. An empty report is never a pass.
pub fn tests_passed(report: &str) -> bool {
    let report = report.trim().to_lowercase();
    if report.is_empty() {
        return false;
    }
    let passed = PASS_MARKERS.iter().any(|m| report.contains(m));
    let failed = FAIL_MARKERS.iter().any(|m| report.contains(m));
    passed || !failed
}

/// Reason the current phase stopped the run.
struct Halted(String);

impl From<OrchestratorError> for Halted {
    fn from(err: OrchestratorError) -> Self {
        Halted(err.to_string())
    }
}

impl From<RosterError> for Halted {
    fn from(err: RosterError) -> Self {
        Halted(err.to_string())
    }
}

/// A phase artifact while the phase is in progress.
struct Draft {
    agent: AgentProfile,
    output: String,
    tokens: u64,
    hurdle: Option<Hurdle>,
    status: PhaseStatus,
    attempts: u32,
}

impl Draft {
    fn new(agent: AgentProfile) -> Self {
        Self {
            agent,
            output: String::new(),
            tokens: 0,
            hurdle: None,
            status: PhaseStatus::Succeeded,
            attempts: 0,
        }
    }
}

pub(super) struct RunState<'a> {
    orch: &'a Orchestrator,
    config: &'a RunConfig,
    manifesto: &'a str,
    /// The manifesto plus feedback from earlier passes.
    brief: String,
    run_id: Uuid,
    tracker: PhaseTracker,
    roster: AgentRoster,
    budget: ContextBudget,
    gate: ApprovalGate,
    reviews: PeerReviewEngine,
    retry: RetryPolicy,
    head_branch: String,
    /// Roster events already forwarded.
    forwarded: usize,
    merged: bool,
    result: ProjectResult,
    started: Instant,
}

impl<'a> RunState<'a> {
    pub(super) fn new(
        orch: &'a Orchestrator,
        manifesto: &'a str,
        config: &'a RunConfig,
    ) -> Result<Self, OrchestratorError> {
        let run_id = Uuid::new_v4();
        let budget = ContextBudget::from_config(config, orch.summarizer.clone())?;
        let retry = RetryPolicy {
            attempts: config.generation_attempts,
            backoff: config.retry_backoff(),
        };
        let head_branch = config
            .head_branch
            .clone()
            .unwrap_or_else(|| format!("crewforge/{}", &run_id.simple().to_string()[..8]));

        Ok(Self {
            orch,
            config,
            manifesto,
            brief: manifesto.to_string(),
            run_id,
            tracker: PhaseTracker::new(),
            roster: AgentRoster::from_config(config),
            budget,
            gate: ApprovalGate::new(
                run_id,
                config.auto_approve,
                config.approval_timeout(),
                orch.approver.clone(),
            ),
            reviews: PeerReviewEngine::new(orch.generator.clone(), retry),
            retry,
            head_branch,
            forwarded: 0,
            merged: false,
            result: ProjectResult::new(run_id, config.budget_limit),
            started: Instant::now(),
        })
    }

    pub(super) async fn execute(mut self) -> ProjectResult {
        info!(run_id = %self.run_id, max_iterations = self.config.max_iterations, "run started");

        for iteration in 1..=self.config.max_iterations {
            if iteration > 1
                && let Err(e) = self.tracker.restart()
            {
                self.halt(Phase::Planning, e.to_string());
                break;
            }
            self.result.iterations = iteration;
            let pass_start = self.result.phase_results.len();

            if !self.run_pass().await {
                break;
            }

            let gaps = self.outstanding(pass_start);
            if gaps.is_empty() {
                break;
            }
            if iteration == self.config.max_iterations {
                if self.config.max_iterations > 1 {
                    warn!(iterations = iteration, outstanding = gaps.len(), "iteration limit reached");
                }
                break;
            }

            info!(iteration = iteration + 1, outstanding = gaps.len(), "pass incomplete, starting another");
            self.log(ActionEntry::new(
                ActionKind::IterationStarted,
                format!("iteration {}: {}", iteration + 1, gaps.join("; ")),
            ));
            self.brief.push_str(&prompts::iteration_feedback(iteration, &gaps));
            self.result.tests_passed = false;
        }

        self.finish()
    }

    /// Run every phase once. Returns `false` if the run halted.
    async fn run_pass(&mut self) -> bool {
        for phase in Phase::ALL {
            if phase == Phase::PrMerge
                && !(self.config.auto_merge && self.result.pr_handle.is_some())
            {
                debug!("no change request to merge, stopping before PRMerge");
                break;
            }

            if let Err(Halted(reason)) = self.run_phase(phase).await {
                self.halt(phase, reason);
                return false;
            }
        }
        true
    }

    fn halt(&mut self, phase: Phase, reason: String) {
        error!(phase = %phase, reason = %reason, "run halted");
        self.log(ActionEntry::new(ActionKind::RunHalted, reason.as_str()).phase(phase));
        self.result.status = RunStatus::Failed;
        self.result.halt = Some(Halt { phase, reason });
    }

    /// What the pass starting at `pass_start` left undone.
    fn outstanding(&self, pass_start: usize) -> Vec<String> {
        let pass = &self.result.phase_results[pass_start..];
        let mut gaps = Vec::new();

        if !self.result.tests_passed {
            let report = pass
                .iter()
                .rev()
                .find(|r| r.phase == Phase::Testing)
                .map(|r| prompts::excerpt(&r.output, FEEDBACK_EXCERPT_CHARS))
                .unwrap_or_default();
            gaps.push(format!("Tests did not pass: {}", report));
        }
        for result in pass {
            if let Some(hurdle) = result.hurdle.as_ref().filter(|h| h.is_critical()) {
                gaps.push(format!(
                    "Critical hurdle in {}: {}",
                    result.phase,
                    prompts::excerpt(&hurdle.description, FEEDBACK_EXCERPT_CHARS)
                ));
            } else if result.status == PhaseStatus::Escalated {
                gaps.push(format!("{} only completed after escalation", result.phase));
            }
        }
        if self.config.create_pr && self.orch.host.is_some() {
            match &self.result.pr_handle {
                None => gaps.push("The change request could not be opened".to_string()),
                Some(pr) if self.config.auto_merge && !self.merged => {
                    gaps.push(format!("Change request #{} was not merged", pr.number))
                }
                Some(_) => {}
            }
        }
        gaps
    }

    async fn run_phase(&mut self, phase: Phase) -> Result<(), Halted> {
        self.tracker.enter(phase)?;
        let mut test_retries = 0;

        loop {
            self.run_attempt(phase).await?;

            if phase == Phase::Testing
                && !self.result.tests_passed
                && test_retries < self.config.max_test_retries
            {
                test_retries += 1;
                warn!(attempt = test_retries, "tests failed, re-running Testing");
                self.tracker.retry(phase)?;
                continue;
            }
            return Ok(());
        }
    }

    async fn run_attempt(&mut self, phase: Phase) -> Result<(), Halted> {
        let started = Instant::now();
        info!(phase = %phase, "phase started");
        self.log(ActionEntry::new(ActionKind::PhaseStarted, phase.describe()).phase(phase));

        for marker in self.budget.ensure_headroom() {
            self.log_summarized(phase, &marker);
        }
        debug!(phase = %phase, context = %self.budget.usage_line(), "context at phase entry");

        let agent = self.roster.get_or_hire(phase.producer());
        self.forward_roster_events(phase).await;
        let mut draft = Draft::new(agent?);

        let outcome = self.produce(phase, &mut draft).await;
        let status = if outcome.is_err() {
            PhaseStatus::Failed
        } else {
            draft.status
        };

        self.emit_metrics(MetricsRecord::StageMetrics {
            run_id: self.run_id,
            phase,
            status,
            duration_ms: started.elapsed().as_millis() as u64,
            tokens: draft.tokens,
            attempts: draft.attempts,
            timestamp: Utc::now(),
        });
        self.result.phase_results.push(PhaseResult::new(
            phase,
            draft.agent.id,
            draft.output,
            status,
            draft.tokens,
            draft.hurdle,
        ));
        outcome?;

        self.announce_completion(phase).await;
        self.log(
            ActionEntry::new(ActionKind::PhaseCompleted, format!("{:?}", status).to_lowercase())
                .phase(phase),
        );
        self.tracker.complete(phase)?;
        Ok(())
    }

    /// Generate, account, review and gate one phase artifact.
    async fn produce(&mut self, phase: Phase, draft: &mut Draft) -> Result<(), Halted> {
        self.generate(phase, draft).await?;

        if draft.tokens > 0 {
            let state = self.budget.record(
                format!("{} output", phase),
                draft.output.clone(),
                Some(draft.tokens),
            );
            self.after_accounting(phase, state).await;
        }

        if self.config.peer_review && !draft.output.trim().is_empty() {
            self.peer_review(phase, draft).await?;
        }

        match phase {
            Phase::Planning => {
                let snapshot = prompts::snapshot("Plan ready for approval", &draft.output);
                self.checkpoint(phase, snapshot).await
            }
            Phase::Development => {
                let snapshot = prompts::snapshot("Implementation ready for approval", &draft.output);
                self.checkpoint(phase, snapshot).await
            }
            Phase::Review => Ok(()),
            Phase::Testing => {
                self.result.tests_passed = tests_passed(&draft.output);
                info!(passed = self.result.tests_passed, "test verdict");
                Ok(())
            }
            Phase::PrCreation => self.open_change_request(phase, &draft.output).await,
            Phase::PrMerge => {
                self.merge_change_request(phase).await;
                Ok(())
            }
        }
    }

    async fn generate(&mut self, phase: Phase, draft: &mut Draft) -> Result<(), Halted> {
        let request = GenerationRequest {
            role: draft.agent.role,
            phase,
            agent_id: draft.agent.id,
            purpose: Purpose::Produce,
            prompt: prompts::phase_prompt(phase, &self.brief, &self.budget.render_context()),
        };

        let mut retried = Vec::new();
        let reply = generate_with_retry(
            self.orch.generator.as_ref(),
            &request,
            self.retry,
            |attempt, err| retried.push(format!("attempt {} failed: {}", attempt, err)),
        )
        .await;
        draft.attempts = retried.len() as u32 + 1;
        for detail in retried {
            self.log(
                ActionEntry::new(ActionKind::GenerationRetried, detail)
                    .phase(phase)
                    .agent(&draft.agent),
            );
        }

        match reply {
            Ok(reply) => {
                draft.tokens = reply
                    .tokens_used
                    .unwrap_or_else(|| estimate_tokens(&reply.output));
                draft.output = reply.output;
                draft.hurdle = reply.hurdle;
                self.log(
                    ActionEntry::new(
                        ActionKind::GenerationCompleted,
                        format!("{} tokens", draft.tokens),
                    )
                    .phase(phase)
                    .agent(&draft.agent),
                );
                self.emit_metrics(MetricsRecord::TokenUsage {
                    run_id: self.run_id,
                    phase,
                    role: draft.agent.role,
                    agent_id: draft.agent.id,
                    tokens: draft.tokens,
                    timestamp: Utc::now(),
                });
                self.result
                    .token_totals
                    .add(phase, Some(draft.agent.id), draft.tokens);

                if let Some(hurdle) = draft.hurdle.clone() {
                    self.raise_hurdle(phase, &draft.agent, &hurdle).await?;
                    if hurdle.is_critical() {
                        draft.status = PhaseStatus::Escalated;
                    }
                }
                Ok(())
            }
            Err(failure) => {
                draft.attempts = failure.attempts;
                let err = OrchestratorError::Generation {
                    phase,
                    attempts: failure.attempts,
                    source: failure.error,
                };
                error!(error = %err, "generation exhausted");
                self.log(
                    ActionEntry::new(ActionKind::GenerationFailed, err.to_string())
                        .phase(phase)
                        .agent(&draft.agent),
                );

                let hurdle = Hurdle::critical(err.to_string());
                draft.hurdle = Some(hurdle.clone());
                draft.status = PhaseStatus::Escalated;
                self.raise_hurdle(phase, &draft.agent, &hurdle)
                    .await
                    .map_err(|Halted(reason)| Halted(format!("{}; {}", err, reason)))
            }
        }
    }

    /// Record and announce a hurdle. Critical hurdles need approval to continue.
    async fn raise_hurdle(
        &mut self,
        phase: Phase,
        agent: &AgentProfile,
        hurdle: &Hurdle,
    ) -> Result<(), Halted> {
        warn!(
            phase = %phase,
            severity = %hurdle.severity,
            description = %hurdle.description,
            "hurdle reported"
        );
        self.log(
            ActionEntry::new(
                ActionKind::HurdleDetected,
                format!("{}: {}", hurdle.severity, hurdle.description),
            )
            .phase(phase)
            .agent(agent),
        );
        self.publish(
            phase,
            NotificationEvent::new(EventKind::HurdleDetected)
                .with("phase", phase.to_string())
                .with("role", agent.role.to_string())
                .with("severity", hurdle.severity.to_string())
                .with("description", hurdle.description.as_str()),
        )
        .await;

        if hurdle.is_critical() {
            let snapshot = prompts::snapshot(
                &format!("Critical hurdle during {}", phase),
                &hurdle.description,
            );
            self.checkpoint(phase, snapshot).await?;
        }
        Ok(())
    }

    async fn peer_review(&mut self, phase: Phase, draft: &Draft) -> Result<(), Halted> {
        let reviewers: Vec<AgentProfile> = reviewers_for(phase)
            .iter()
            .filter_map(|role| self.roster.get(*role).ok().cloned())
            .collect();
        if reviewers.is_empty() {
            return Ok(());
        }

        let outcome = self
            .reviews
            .review(phase, &draft.agent, &draft.output, &reviewers)
            .await;
        self.result.token_totals.add(phase, None, outcome.tokens_used);

        for warning in &outcome.warnings {
            let kind = match warning {
                ReviewWarning::Skipped { .. } => ActionKind::ReviewSkipped,
                ReviewWarning::Clamped { .. } | ReviewWarning::Defaulted { .. } => {
                    ActionKind::RatingClamped
                }
            };
            self.log(ActionEntry::new(kind, warning.to_string()).phase(phase));
        }
        for record in &outcome.records {
            self.log(
                ActionEntry::new(
                    ActionKind::ReviewRecorded,
                    format!(
                        "{} rated {} {}/5",
                        record.reviewer_role,
                        record.reviewee_role,
                        record.rating.value()
                    ),
                )
                .phase(phase)
                .role(record.reviewee_role),
            );
            self.emit_metrics(MetricsRecord::CodeQuality {
                run_id: self.run_id,
                phase,
                reviewer_role: record.reviewer_role,
                reviewee_role: record.reviewee_role,
                rating: record.rating.value(),
                timestamp: Utc::now(),
            });
        }

        let applied = self.roster.apply_reviews(&outcome.records);
        self.forward_roster_events(phase).await;
        applied?;
        Ok(())
    }

    /// Ask the gate to let the run continue past `phase`.
    async fn checkpoint(&mut self, phase: Phase, snapshot: String) -> Result<(), Halted> {
        self.log(
            ActionEntry::new(
                ActionKind::ApprovalRequested,
                snapshot.lines().next().unwrap_or_default(),
            )
            .phase(phase),
        );
        if self.gate.is_blocking() {
            self.publish(
                phase,
                NotificationEvent::new(EventKind::ApprovalRequired)
                    .with("phase", phase.to_string())
                    .with("snapshot", snapshot.as_str()),
            )
            .await;
        }

        let decision = self.gate.request(phase, snapshot).await?;
        let detail = match &decision {
            Decision::Approved => "approved".to_string(),
            Decision::Rejected { reason } => format!("rejected: {}", reason),
        };
        self.log(ActionEntry::new(ActionKind::ApprovalResolved, detail).phase(phase));

        match decision {
            Decision::Approved => Ok(()),
            Decision::Rejected { reason } => Err(Halted(format!(
                "approval rejected during {}: {}",
                phase, reason
            ))),
        }
    }

    async fn open_change_request(&mut self, phase: Phase, description: &str) -> Result<(), Halted> {
        if !self.config.create_pr {
            debug!("change request creation disabled");
            return Ok(());
        }
        let Some(host) = self.orch.host.clone() else {
            return Ok(());
        };
        if let Some(pr) = &self.result.pr_handle {
            debug!(number = pr.number, "change request already open");
            return Ok(());
        }

        let title = prompts::pr_title(self.manifesto);
        let body = prompts::pr_body(description, self.result.tests_passed);
        let label = format!(
            "Open change request \"{}\" ({} -> {})",
            title, self.head_branch, self.config.base_branch
        );
        self.checkpoint(phase, prompts::snapshot(&label, &body)).await?;

        match host
            .create_request(&title, &body, &self.head_branch, &self.config.base_branch)
            .await
        {
            Ok(handle) => {
                info!(number = handle.number, url = %handle.url, "change request opened");
                self.log(
                    ActionEntry::new(
                        ActionKind::PrCreated,
                        format!("#{} {}", handle.number, handle.url),
                    )
                    .phase(phase),
                );
                self.result.pr_handle = Some(handle);
            }
            Err(e) => {
                warn!(error = %e, "failed to open change request");
                self.log(ActionEntry::new(ActionKind::HostingFailed, e.to_string()).phase(phase));
            }
        }
        Ok(())
    }

    async fn merge_change_request(&mut self, phase: Phase) {
        let (Some(host), Some(handle)) = (self.orch.host.clone(), self.result.pr_handle.clone())
        else {
            return;
        };

        match host.merge(handle.number, self.config.merge_method).await {
            Ok(true) => {
                info!(number = handle.number, method = %self.config.merge_method, "change request merged");
                self.merged = true;
                self.log(
                    ActionEntry::new(ActionKind::PrMerged, format!("#{}", handle.number))
                        .phase(phase),
                );
            }
            Ok(false) => {
                warn!(number = handle.number, "host declined the merge");
                self.log(
                    ActionEntry::new(
                        ActionKind::HostingFailed,
                        format!("#{} was not merged", handle.number),
                    )
                    .phase(phase),
                );
            }
            Err(e) => {
                warn!(number = handle.number, error = %e, "merge failed");
                self.log(ActionEntry::new(ActionKind::HostingFailed, e.to_string()).phase(phase));
            }
        }
    }

    async fn announce_completion(&mut self, phase: Phase) {
        let event = match phase {
            Phase::Planning => Some(NotificationEvent::new(EventKind::PlanComplete)),
            Phase::Development => Some(NotificationEvent::new(EventKind::ImplementationComplete)),
            Phase::Review => None,
            Phase::Testing if self.result.tests_passed => {
                Some(NotificationEvent::new(EventKind::TestsPassed))
            }
            Phase::Testing => Some(NotificationEvent::new(EventKind::TestsFailed)),
            Phase::PrCreation => self.result.pr_handle.as_ref().map(|pr| {
                NotificationEvent::new(EventKind::PrCreated)
                    .with("number", pr.number)
                    .with("url", pr.url.as_str())
            }),
            Phase::PrMerge => self.result.pr_handle.as_ref().filter(|_| self.merged).map(|pr| {
                NotificationEvent::new(EventKind::PrMerged)
                    .with("number", pr.number)
                    .with("url", pr.url.as_str())
            }),
        };

        if let Some(event) = event {
            let event = event
                .with("phase", phase.to_string())
                .with("run_id", self.run_id.to_string());
            self.publish(phase, event).await;
        }
    }

    async fn after_accounting(&mut self, phase: Phase, state: BudgetState) {
        for marker in &state.summarized {
            self.log_summarized(phase, marker);
        }
        if state.over_limit {
            warn!(running = state.running, limit = state.limit, "context over budget");
            self.log(
                ActionEntry::new(
                    ActionKind::BudgetExceeded,
                    format!("{} of {} tokens", state.running, state.limit),
                )
                .phase(phase),
            );
            self.publish(
                phase,
                NotificationEvent::new(EventKind::BudgetWarning)
                    .with("phase", phase.to_string())
                    .with("running", state.running)
                    .with("limit", state.limit)
                    .with("usage", self.budget.usage_line()),
            )
            .await;
        }
    }

    fn log_summarized(&mut self, phase: Phase, marker: &SegmentMarker) {
        info!(
            sequence = marker.sequence,
            entries = marker.entries_summarized,
            original = marker.original_tokens,
            summary = marker.summary_tokens,
            ratio = marker.compression_ratio(),
            "context summarized"
        );
        self.log(
            ActionEntry::new(
                ActionKind::ContextSummarized,
                format!(
                    "segment {}: {} entries, {} -> {} tokens",
                    marker.sequence,
                    marker.entries_summarized,
                    marker.original_tokens,
                    marker.summary_tokens
                ),
            )
            .phase(phase),
        );
    }

    /// Log, announce and persist roster events not yet forwarded.
    async fn forward_roster_events(&mut self, phase: Phase) {
        let fresh: Vec<AgentEvent> = self.roster.events()[self.forwarded..].to_vec();
        self.forwarded = self.roster.events().len();

        for event in fresh {
            let (kind, action, notification) = match &event {
                AgentEvent::Fired {
                    role,
                    name,
                    average,
                    ..
                } => (
                    ActionKind::AgentFired,
                    "fired",
                    NotificationEvent::new(EventKind::AgentFired)
                        .with("role", role.to_string())
                        .with("agent", name.as_str())
                        .with("average", *average),
                ),
                AgentEvent::Hired { role, name, .. } => (
                    ActionKind::AgentHired,
                    "hired",
                    NotificationEvent::new(EventKind::AgentHired)
                        .with("role", role.to_string())
                        .with("agent", name.as_str()),
                ),
            };
            info!(role = %event.role(), agent_id = %event.agent_id(), action, "roster changed");

            self.log(
                ActionEntry::new(kind, notification.summary())
                    .phase(phase)
                    .role(event.role()),
            );
            self.publish(phase, notification).await;
            self.emit_metrics(MetricsRecord::AgentAction {
                run_id: self.run_id,
                role: event.role(),
                agent_id: event.agent_id(),
                action: action.to_string(),
                timestamp: Utc::now(),
            });
            self.result.agent_events.push(event);
        }
    }

    async fn publish(&mut self, phase: Phase, event: NotificationEvent) {
        if !self.config.notification_enabled(event.kind) {
            debug!(kind = %event.kind, "notification disabled");
            return;
        }
        let report = self.orch.dispatcher.publish(&event).await;
        for failure in report.failures {
            self.log(
                ActionEntry::new(
                    ActionKind::NotificationFailed,
                    format!("{} could not deliver {}: {}", failure.sink, event.kind, failure.error),
                )
                .phase(phase),
            );
        }
    }

    fn emit_metrics(&mut self, record: MetricsRecord) {
        let orch = self.orch;
        let Some(sink) = &orch.metrics else {
            return;
        };
        if let Err(e) = sink.append(&record) {
            warn!(kind = record.kind(), error = %e, "failed to persist metrics");
            self.log(ActionEntry::new(
                ActionKind::MetricsFailed,
                format!("{}: {:#}", record.kind(), e),
            ));
        }
    }

    fn log(&mut self, entry: ActionEntry) {
        self.result.action_log.append(entry);
    }

    fn finish(mut self) -> ProjectResult {
        self.result.context = self.budget.state();
        self.result.approvals = self.gate.history();
        self.result.finished_at = Utc::now();

        let fired = self
            .result
            .agent_events
            .iter()
            .filter(|e| matches!(e, AgentEvent::Fired { .. }))
            .count();
        self.emit_metrics(MetricsRecord::ProjectMetrics {
            run_id: self.run_id,
            succeeded: self.result.succeeded(),
            phases_completed: self.tracker.completed().len(),
            total_tokens: self.result.token_totals.total(),
            agents_fired: fired,
            tests_passed: self.result.tests_passed,
            duration_ms: self.started.elapsed().as_millis() as u64,
            timestamp: Utc::now(),
        });

        info!(
            run_id = %self.run_id,
            status = ?self.result.status,
            iterations = self.result.iterations,
            phases = self.result.phase_results.len(),
            tokens = self.result.token_totals.total(),
            "run finished"
        );
        self.result
    }
}
