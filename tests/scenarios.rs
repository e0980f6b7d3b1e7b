//! End-to-end orchestrator scenarios with scripted collaborators.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use crewforge::audit::ActionKind;
use crewforge::compaction::{ContextBudget, DigestSummarizer, estimate_tokens};
use crewforge::config::RunConfig;
use crewforge::errors::{GenerationError, HostingError, OrchestratorError};
use crewforge::gates::{Decision, DecisionState, PendingApproval};
use crewforge::generate::{GenerationReply, GenerationRequest, Generator, Hurdle, Purpose};
use crewforge::hosting::{MergeMethod, PrHandle, PrState, SourceHost};
use crewforge::metrics::{MemoryMetricsSink, MetricsRecord};
use crewforge::notify::{CallbackSink, EventKind, NotificationEvent, NotificationSink};
use crewforge::orchestrator::prompts::phase_prompt;
use crewforge::orchestrator::{Orchestrator, RunStatus};
use crewforge::phase::{Phase, PhaseStatus, Role};
use crewforge::roster::AgentEvent;

// =============================================================================
// Scripted collaborators
// =============================================================================

#[derive(Debug, Clone)]
struct Call {
    phase: Phase,
    role: Role,
    agent_id: Uuid,
    purpose: Purpose,
}

type Script =
    dyn Fn(&GenerationRequest, usize) -> Result<GenerationReply, GenerationError> + Send + Sync;

/// Replies according to a script. The script also receives how many earlier
/// calls were made for the same phase, role and purpose.
struct ScriptedGenerator {
    script: Box<Script>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedGenerator {
    fn new(
        script: impl Fn(&GenerationRequest, usize) -> Result<GenerationReply, GenerationError>
        + Send
        + Sync
        + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            script: Box::new(script),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn happy() -> Arc<Self> {
        Self::new(|request, _| default_reply(request))
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationReply, GenerationError> {
        let previous = {
            let mut calls = self.calls.lock().unwrap();
            let previous = calls
                .iter()
                .filter(|c| {
                    c.phase == request.phase && c.role == request.role && c.purpose == request.purpose
                })
                .count();
            calls.push(Call {
                phase: request.phase,
                role: request.role,
                agent_id: request.agent_id,
                purpose: request.purpose,
            });
            previous
        };
        (self.script)(&request, previous)
    }
}

fn default_reply(request: &GenerationRequest) -> Result<GenerationReply, GenerationError> {
    let text = match (request.purpose, request.phase) {
        (Purpose::PeerReview, _) => "Rating: 5\nSolid work.".to_string(),
        (Purpose::Produce, Phase::Testing) => "12 passed\nALL TESTS PASSED".to_string(),
        (Purpose::Produce, Phase::PrCreation) => "## Summary\nAdds the API.".to_string(),
        (Purpose::Produce, phase) => format!("{} artifact", phase),
    };
    Ok(GenerationReply::text(text))
}

/// Records requests and hands out sequential numbers.
#[derive(Default)]
struct MemoryHost {
    created: Mutex<Vec<(String, String, String)>>,
    merged: Mutex<Vec<(u64, MergeMethod)>>,
}

#[async_trait]
impl SourceHost for MemoryHost {
    async fn create_request(
        &self,
        title: &str,
        _body: &str,
        head: &str,
        base: &str,
    ) -> Result<PrHandle, HostingError> {
        let mut created = self.created.lock().unwrap();
        created.push((title.to_string(), head.to_string(), base.to_string()));
        let number = created.len() as u64;
        Ok(PrHandle {
            number,
            url: format!("https://example.test/pulls/{}", number),
            title: title.to_string(),
            state: "open".to_string(),
            head: head.to_string(),
            base: base.to_string(),
        })
    }

    async fn merge(&self, number: u64, method: MergeMethod) -> Result<bool, HostingError> {
        self.merged.lock().unwrap().push((number, method));
        Ok(true)
    }

    async fn list(&self, _state: PrState) -> Result<Vec<PrHandle>, HostingError> {
        Ok(Vec::new())
    }
}

/// Every call fails with a gateway error.
struct FailingHost;

#[async_trait]
impl SourceHost for FailingHost {
    async fn create_request(
        &self,
        _title: &str,
        _body: &str,
        _head: &str,
        _base: &str,
    ) -> Result<PrHandle, HostingError> {
        Err(HostingError::Api {
            status: 502,
            message: "Bad Gateway".into(),
        })
    }

    async fn merge(&self, _number: u64, _method: MergeMethod) -> Result<bool, HostingError> {
        Err(HostingError::Api {
            status: 502,
            message: "Bad Gateway".into(),
        })
    }

    async fn list(&self, _state: PrState) -> Result<Vec<PrHandle>, HostingError> {
        Ok(Vec::new())
    }
}

type Collected = Arc<Mutex<Vec<NotificationEvent>>>;

fn collector() -> (Arc<CallbackSink>, Collected) {
    let events: Collected = Arc::new(Mutex::new(Vec::new()));
    let sink_events = events.clone();
    let sink = CallbackSink::new("collector", move |event| {
        sink_events.lock().unwrap().push(event.clone());
        Ok(())
    });
    (Arc::new(sink), events)
}

fn kinds(events: &Collected) -> Vec<EventKind> {
    events.lock().unwrap().iter().map(|e| e.kind).collect()
}

fn approver(
    decide: impl Fn(&PendingApproval) -> Decision + Send + 'static,
) -> mpsc::Sender<PendingApproval> {
    let (tx, mut rx) = mpsc::channel::<PendingApproval>(4);
    tokio::spawn(async move {
        while let Some(pending) = rx.recv().await {
            let decision = decide(&pending);
            pending.decide(decision);
        }
    });
    tx
}

fn auto_config() -> RunConfig {
    RunConfig {
        auto_approve: true,
        retry_backoff_ms: 1,
        ..RunConfig::default()
    }
}

fn developer_ratings(request: &GenerationRequest) -> Result<GenerationReply, GenerationError> {
    if request.purpose == Purpose::PeerReview && request.phase == Phase::Development {
        let rating = match request.role {
            Role::Planner => 1,
            Role::Reviewer => 2,
            Role::Qa => 1,
            _ => 5,
        };
        return Ok(GenerationReply::text(format!("Rating: {}", rating)));
    }
    default_reply(request)
}

// =============================================================================
// Core workflow
// =============================================================================

mod workflow {
    use super::*;

    #[tokio::test]
    async fn test_full_run_without_change_request() {
        let generator = ScriptedGenerator::happy();
        let orchestrator = Orchestrator::builder(generator.clone()).build();
        let config = RunConfig {
            create_pr: false,
            ..auto_config()
        };

        let result = orchestrator.run("build a CRUD API", &config).await.unwrap();

        assert_eq!(result.status, RunStatus::Succeeded);
        assert_eq!(
            result.phases(),
            vec![
                Phase::Planning,
                Phase::Development,
                Phase::Review,
                Phase::Testing,
                Phase::PrCreation
            ]
        );
        assert!(result.pr_handle.is_none());
        assert!(result.halt.is_none());
        assert!(result.tests_passed);
        assert!(
            result
                .phase_results
                .iter()
                .all(|r| r.status == PhaseStatus::Succeeded && r.role == r.phase.producer())
        );

        let calls = generator.calls();
        assert_eq!(calls.iter().filter(|c| c.purpose == Purpose::Produce).count(), 5);
        assert_eq!(calls.iter().filter(|c| c.purpose == Purpose::PeerReview).count(), 7);

        assert_eq!(result.approvals.len(), 2);
        assert!(result.approvals.iter().all(|a| a.state == DecisionState::Approved));
        assert!(result.token_totals.total() > 0);
        assert_eq!(result.action_log.failures().count(), 0);
    }

    #[tokio::test]
    async fn test_phase_tokens_are_counted_per_agent_and_stage() {
        let generator = ScriptedGenerator::new(|request, _| match request.purpose {
            Purpose::Produce => Ok(GenerationReply::text("ALL TESTS PASSED").with_tokens(100)),
            Purpose::PeerReview => Ok(GenerationReply::text("Rating: 4").with_tokens(10)),
        });
        let orchestrator = Orchestrator::builder(generator).build();

        let result = orchestrator.run("x", &auto_config()).await.unwrap();

        assert_eq!(result.token_totals.per_stage[&Phase::Planning], 110);
        assert_eq!(result.token_totals.per_stage[&Phase::Development], 130);
        let planning = result.result_for(Phase::Planning).unwrap();
        assert_eq!(planning.tokens_used, 100);
        assert_eq!(result.token_totals.per_agent[&planning.agent_id], 100);
        assert_eq!(result.token_totals.total(), 5 * 100 + 7 * 10);
    }

    #[tokio::test]
    async fn test_empty_manifesto_is_rejected_before_any_phase() {
        let generator = ScriptedGenerator::happy();
        let orchestrator = Orchestrator::builder(generator.clone()).build();

        let err = orchestrator.run("  \n", &auto_config()).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Configuration(_)));
        assert!(generator.calls().is_empty());
    }

    #[tokio::test]
    async fn test_change_request_without_host_is_a_configuration_error() {
        let generator = ScriptedGenerator::happy();
        let orchestrator = Orchestrator::builder(generator.clone()).build();
        let config = RunConfig {
            create_pr: true,
            ..auto_config()
        };

        let err = orchestrator.run("build it", &config).await.unwrap_err();
        assert!(err.to_string().contains("create_pr"));
        assert!(generator.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failed_tests_are_retried() {
        let generator = ScriptedGenerator::new(|request, previous| {
            if request.purpose == Purpose::Produce && request.phase == Phase::Testing {
                let text = if previous == 0 {
                    "TESTS FAILED: test_delete_missing"
                } else {
                    "ALL TESTS PASSED"
                };
                return Ok(GenerationReply::text(text));
            }
            default_reply(request)
        });
        let (sink, events) = collector();
        let orchestrator = Orchestrator::builder(generator).sink(sink).build();
        let config = RunConfig {
            max_test_retries: 1,
            ..auto_config()
        };

        let result = orchestrator.run("x", &config).await.unwrap();

        assert!(result.succeeded());
        assert!(result.tests_passed);
        assert_eq!(
            result.phases(),
            vec![
                Phase::Planning,
                Phase::Development,
                Phase::Review,
                Phase::Testing,
                Phase::Testing,
                Phase::PrCreation
            ]
        );
        let kinds = kinds(&events);
        let failed = kinds.iter().position(|k| *k == EventKind::TestsFailed).unwrap();
        let passed = kinds.iter().position(|k| *k == EventKind::TestsPassed).unwrap();
        assert!(failed < passed);
    }

    #[tokio::test]
    async fn test_failed_tests_without_retries_still_complete() {
        let generator = ScriptedGenerator::new(|request, _| {
            if request.purpose == Purpose::Produce && request.phase == Phase::Testing {
                return Ok(GenerationReply::text("TESTS FAILED"));
            }
            default_reply(request)
        });
        let orchestrator = Orchestrator::builder(generator).build();

        let result = orchestrator.run("x", &auto_config()).await.unwrap();
        assert!(result.succeeded());
        assert!(!result.tests_passed);
        assert_eq!(result.phase_results.len(), 5);
        assert_eq!(result.iterations, 1);
        assert_eq!(result.action_log.entries_of(ActionKind::IterationStarted).count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_runs_are_independent() {
        let orchestrator = Orchestrator::builder(ScriptedGenerator::happy()).build();
        let config = auto_config();

        let (a, b) = tokio::join!(
            orchestrator.run("first project", &config),
            orchestrator.run("second project", &config)
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(a.succeeded() && b.succeeded());
        assert_ne!(a.run_id, b.run_id);
        assert_eq!(a.phase_results.len(), 5);
        assert_eq!(b.phase_results.len(), 5);
    }
}

// =============================================================================
// Iteration
// =============================================================================

mod iteration {
    use super::*;

    fn fail_first_testing_pass(
        prompts: Arc<Mutex<Vec<(Phase, String)>>>,
    ) -> Arc<ScriptedGenerator> {
        ScriptedGenerator::new(move |request, previous| {
            if request.purpose == Purpose::Produce {
                prompts
                    .lock()
                    .unwrap()
                    .push((request.phase, request.prompt.clone()));
            }
            if request.purpose == Purpose::Produce && request.phase == Phase::Testing {
                let text = if previous == 0 {
                    "TESTS FAILED: test_delete_missing"
                } else {
                    "ALL TESTS PASSED"
                };
                return Ok(GenerationReply::text(text));
            }
            default_reply(request)
        })
    }

    #[tokio::test]
    async fn test_failing_pass_is_followed_by_another() {
        let prompts = Arc::new(Mutex::new(Vec::new()));
        let orchestrator = Orchestrator::builder(fail_first_testing_pass(prompts.clone())).build();
        let config = RunConfig {
            max_iterations: 3,
            ..auto_config()
        };

        let result = orchestrator.run("Build a todo CLI", &config).await.unwrap();

        assert!(result.succeeded());
        assert!(result.tests_passed);
        assert_eq!(result.iterations, 2);
        assert_eq!(result.phase_results.len(), 10);
        assert_eq!(result.phases()[5], Phase::Planning);

        let started: Vec<_> = result
            .action_log
            .entries_of(ActionKind::IterationStarted)
            .collect();
        assert_eq!(started.len(), 1);
        assert!(started[0].detail.contains("test_delete_missing"));

        let prompts = prompts.lock().unwrap();
        let planning: Vec<_> = prompts.iter().filter(|(p, _)| *p == Phase::Planning).collect();
        assert_eq!(planning.len(), 2);
        assert!(!planning[0].1.contains("Feedback from iteration"));
        assert!(planning[1].1.contains("## Feedback from iteration 1"));
        assert!(planning[1].1.contains("TESTS FAILED: test_delete_missing"));
        assert!(planning[1].1.contains("Build a todo CLI"));
    }

    #[tokio::test]
    async fn test_iteration_limit_stops_with_work_outstanding() {
        let generator = ScriptedGenerator::new(|request, _| {
            if request.purpose == Purpose::Produce && request.phase == Phase::Testing {
                return Ok(GenerationReply::text("TESTS FAILED"));
            }
            default_reply(request)
        });
        let orchestrator = Orchestrator::builder(generator.clone()).build();
        let config = RunConfig {
            max_iterations: 2,
            ..auto_config()
        };

        let result = orchestrator.run("x", &config).await.unwrap();

        assert!(result.succeeded());
        assert!(!result.tests_passed);
        assert_eq!(result.iterations, 2);
        assert_eq!(result.phase_results.len(), 10);
        assert_eq!(result.action_log.entries_of(ActionKind::IterationStarted).count(), 1);
        let planning_calls = generator
            .calls()
            .iter()
            .filter(|c| c.purpose == Purpose::Produce && c.phase == Phase::Planning)
            .count();
        assert_eq!(planning_calls, 2);
    }

    #[tokio::test]
    async fn test_complete_pass_does_not_iterate() {
        let orchestrator = Orchestrator::builder(ScriptedGenerator::happy()).build();
        let config = RunConfig {
            max_iterations: 3,
            ..auto_config()
        };

        let result = orchestrator.run("x", &config).await.unwrap();

        assert_eq!(result.iterations, 1);
        assert_eq!(result.phase_results.len(), 5);
    }

    #[tokio::test]
    async fn test_open_change_request_is_kept_across_passes() {
        let host = Arc::new(MemoryHost::default());
        let prompts = Arc::new(Mutex::new(Vec::new()));
        let orchestrator = Orchestrator::builder(fail_first_testing_pass(prompts))
            .host(host.clone())
            .build();
        let config = RunConfig {
            create_pr: true,
            max_iterations: 2,
            ..auto_config()
        };

        let result = orchestrator.run("# Todo API", &config).await.unwrap();

        assert!(result.succeeded());
        assert_eq!(result.iterations, 2);
        assert_eq!(host.created.lock().unwrap().len(), 1);
        assert_eq!(result.pr_handle.as_ref().map(|pr| pr.number), Some(1));
        assert_eq!(result.action_log.entries_of(ActionKind::PrCreated).count(), 1);
    }

    #[tokio::test]
    async fn test_rejected_gate_in_a_later_pass_halts() {
        let prompts = Arc::new(Mutex::new(Vec::new()));
        let plans = Arc::new(Mutex::new(0usize));
        let plans_seen = plans.clone();
        let orchestrator = Orchestrator::builder(fail_first_testing_pass(prompts))
            .approvals(approver(move |pending| {
                if pending.phase != Phase::Planning {
                    return Decision::Approved;
                }
                let mut plans = plans_seen.lock().unwrap();
                *plans += 1;
                if *plans > 1 {
                    Decision::rejected("second plan not needed")
                } else {
                    Decision::Approved
                }
            }))
            .build();
        let config = RunConfig {
            auto_approve: false,
            max_iterations: 2,
            ..auto_config()
        };

        let result = orchestrator.run("x", &config).await.unwrap();

        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.iterations, 2);
        let halt = result.halt.as_ref().unwrap();
        assert_eq!(halt.phase, Phase::Planning);
        assert!(halt.reason.contains("second plan not needed"));
        assert_eq!(result.phase_results.len(), 6);
        assert_eq!(*plans.lock().unwrap(), 2);
    }
}

// =============================================================================
// Roster
// =============================================================================

mod roster {
    use super::*;

    #[tokio::test]
    async fn test_low_rated_developer_is_fired_and_replaced() {
        let generator = ScriptedGenerator::new(|request, _| developer_ratings(request));
        let (sink, events) = collector();
        let orchestrator = Orchestrator::builder(generator.clone()).sink(sink).build();
        let config = RunConfig {
            min_review_samples: 3,
            firing_threshold: 2.0,
            ..auto_config()
        };

        let result = orchestrator.run("build a CRUD API", &config).await.unwrap();
        assert!(result.succeeded());

        assert_eq!(result.agent_events.len(), 2);
        let fired_id = match &result.agent_events[0] {
            AgentEvent::Fired { role, average, agent_id, .. } => {
                assert_eq!(*role, Role::Developer);
                assert!(*average < 2.0);
                *agent_id
            }
            other => panic!("expected a firing, got {:?}", other),
        };
        let hired_id = match &result.agent_events[1] {
            AgentEvent::Hired { role, replaces, agent_id, .. } => {
                assert_eq!(*role, Role::Developer);
                assert_eq!(*replaces, Some(fired_id));
                *agent_id
            }
            other => panic!("expected a hire, got {:?}", other),
        };
        assert_ne!(fired_id, hired_id);

        let development = result.result_for(Phase::Development).unwrap();
        assert_eq!(development.agent_id, fired_id);

        // The replacement reviews later phases with a clean record.
        let later_review = generator
            .calls()
            .into_iter()
            .find(|c| c.purpose == Purpose::PeerReview && c.phase == Phase::Review)
            .unwrap();
        assert_eq!(later_review.role, Role::Developer);
        assert_eq!(later_review.agent_id, hired_id);

        let kinds = kinds(&events);
        let fired = kinds.iter().position(|k| *k == EventKind::AgentFired).unwrap();
        assert_eq!(kinds[fired + 1], EventKind::AgentHired);

        assert_eq!(result.action_log.entries_of(ActionKind::AgentFired).count(), 1);
        assert_eq!(result.action_log.entries_of(ActionKind::AgentHired).count(), 1);
    }

    #[tokio::test]
    async fn test_too_few_samples_keep_the_agent() {
        let generator = ScriptedGenerator::new(|request, _| developer_ratings(request));
        let orchestrator = Orchestrator::builder(generator).build();
        let config = RunConfig {
            min_review_samples: 4,
            ..auto_config()
        };

        let result = orchestrator.run("x", &config).await.unwrap();
        assert!(result.agent_events.is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_hiring_halts_the_run() {
        let generator = ScriptedGenerator::new(|request, _| developer_ratings(request));
        let orchestrator = Orchestrator::builder(generator).build();
        let config = RunConfig {
            min_review_samples: 3,
            max_hires_per_role: Some(1),
            ..auto_config()
        };

        let result = orchestrator.run("x", &config).await.unwrap();

        assert_eq!(result.status, RunStatus::Failed);
        let halt = result.halt.as_ref().unwrap();
        assert_eq!(halt.phase, Phase::Development);
        assert!(halt.reason.contains("Cannot hire another Developer"));
        assert_eq!(result.agent_events.len(), 1);
        assert!(matches!(result.agent_events[0], AgentEvent::Fired { .. }));
        assert_eq!(
            result.result_for(Phase::Development).unwrap().status,
            PhaseStatus::Failed
        );
        assert_eq!(result.action_log.entries_of(ActionKind::RunHalted).count(), 1);
    }
}

// =============================================================================
// Source hosting
// =============================================================================

mod hosting {
    use super::*;

    #[tokio::test]
    async fn test_hosting_failure_is_not_fatal() {
        let (sink, events) = collector();
        let orchestrator = Orchestrator::builder(ScriptedGenerator::happy())
            .host(Arc::new(FailingHost))
            .sink(sink)
            .build();
        let config = RunConfig {
            create_pr: true,
            ..auto_config()
        };

        let result = orchestrator.run("build a CRUD API", &config).await.unwrap();

        assert_eq!(result.status, RunStatus::Succeeded);
        assert!(result.pr_handle.is_none());
        assert!(!kinds(&events).contains(&EventKind::PrCreated));

        let failures: Vec<_> = result
            .action_log
            .failures()
            .filter(|e| e.phase == Some(Phase::PrCreation))
            .collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].kind, ActionKind::HostingFailed);
        assert!(failures[0].detail.contains("502"));
    }

    #[tokio::test]
    async fn test_change_request_opened_and_merged() {
        let host = Arc::new(MemoryHost::default());
        let (sink, events) = collector();
        let orchestrator = Orchestrator::builder(ScriptedGenerator::happy())
            .host(host.clone())
            .sink(sink)
            .build();
        let config = RunConfig {
            create_pr: true,
            auto_merge: true,
            merge_method: MergeMethod::Squash,
            ..auto_config()
        };

        let result = orchestrator.run("# Todo API\nwith auth", &config).await.unwrap();

        assert!(result.succeeded());
        assert_eq!(result.phase_results.len(), 6);
        assert_eq!(result.phases().last(), Some(&Phase::PrMerge));

        let pr = result.pr_handle.as_ref().unwrap();
        assert_eq!(pr.number, 1);
        assert_eq!(pr.title, "Todo API");
        assert!(pr.head.starts_with("crewforge/"));
        assert_eq!(pr.base, "main");
        assert_eq!(*host.merged.lock().unwrap(), vec![(1, MergeMethod::Squash)]);

        let kinds = kinds(&events);
        assert!(kinds.contains(&EventKind::PrCreated));
        assert!(kinds.contains(&EventKind::PrMerged));
        let created = events
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.kind == EventKind::PrCreated)
            .cloned()
            .unwrap();
        assert_eq!(created.field("url"), Some("https://example.test/pulls/1"));
    }

    #[tokio::test]
    async fn test_configured_head_branch_is_used() {
        let host = Arc::new(MemoryHost::default());
        let orchestrator = Orchestrator::builder(ScriptedGenerator::happy())
            .host(host.clone())
            .build();
        let config = RunConfig {
            create_pr: true,
            head_branch: Some("feature/todo".into()),
            base_branch: "develop".into(),
            ..auto_config()
        };

        let result = orchestrator.run("x", &config).await.unwrap();

        assert!(result.pr_handle.is_some());
        // Without auto_merge the run stops after PRCreation.
        assert_eq!(result.phase_results.len(), 5);
        let created = host.created.lock().unwrap();
        assert_eq!(created[0].1, "feature/todo");
        assert_eq!(created[0].2, "develop");
    }
}

// =============================================================================
// Approvals and hurdles
// =============================================================================

mod approvals {
    use super::*;

    #[tokio::test]
    async fn test_undecided_approval_times_out() {
        let (sink, events) = collector();
        let orchestrator = Orchestrator::builder(ScriptedGenerator::happy())
            .sink(sink)
            .build();
        let config = RunConfig {
            auto_approve: false,
            approval_timeout_secs: 0,
            ..auto_config()
        };

        let result = orchestrator.run("x", &config).await.unwrap();

        assert_eq!(result.status, RunStatus::Failed);
        let halt = result.halt.as_ref().unwrap();
        assert_eq!(halt.phase, Phase::Planning);
        assert!(halt.reason.contains("No approval decision"));
        assert_eq!(result.phase_results.len(), 1);
        assert_eq!(result.phase_results[0].status, PhaseStatus::Failed);
        assert_eq!(result.approvals.len(), 1);
        assert_eq!(result.approvals[0].state, DecisionState::Pending);
        assert!(kinds(&events).contains(&EventKind::ApprovalRequired));
        assert!(!kinds(&events).contains(&EventKind::PlanComplete));
    }

    #[tokio::test]
    async fn test_rejected_plan_halts_the_run() {
        let orchestrator = Orchestrator::builder(ScriptedGenerator::happy())
            .approvals(approver(|_| Decision::rejected("scope too large")))
            .build();
        let config = RunConfig {
            auto_approve: false,
            ..auto_config()
        };

        let result = orchestrator.run("x", &config).await.unwrap();

        assert_eq!(result.status, RunStatus::Failed);
        let halt = result.halt.as_ref().unwrap();
        assert_eq!(halt.phase, Phase::Planning);
        assert!(halt.reason.contains("scope too large"));
        assert_eq!(result.approvals[0].state, DecisionState::Rejected);
    }

    #[tokio::test]
    async fn test_approver_sees_each_checkpoint() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_by_approver = seen.clone();
        let (sink, events) = collector();
        let orchestrator = Orchestrator::builder(ScriptedGenerator::happy())
            .approvals(approver(move |pending| {
                seen_by_approver.lock().unwrap().push(pending.phase);
                Decision::Approved
            }))
            .sink(sink)
            .build();
        let config = RunConfig {
            auto_approve: false,
            ..auto_config()
        };

        let result = orchestrator.run("x", &config).await.unwrap();

        assert!(result.succeeded());
        assert_eq!(*seen.lock().unwrap(), vec![Phase::Planning, Phase::Development]);
        let required = kinds(&events)
            .into_iter()
            .filter(|k| *k == EventKind::ApprovalRequired)
            .count();
        assert_eq!(required, 2);
    }

    #[tokio::test]
    async fn test_shared_approver_can_tell_runs_apart() {
        let seen: Arc<Mutex<Vec<(Uuid, Phase)>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_by_approver = seen.clone();
        let orchestrator = Orchestrator::builder(ScriptedGenerator::happy())
            .approvals(approver(move |pending| {
                seen_by_approver
                    .lock()
                    .unwrap()
                    .push((pending.run_id, pending.phase));
                Decision::Approved
            }))
            .build();
        let config = RunConfig {
            auto_approve: false,
            ..auto_config()
        };

        let (a, b) = tokio::join!(
            orchestrator.run("first project", &config),
            orchestrator.run("second project", &config)
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(a.succeeded() && b.succeeded());

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 4);
        for run in [a.run_id, b.run_id] {
            let phases: Vec<Phase> = seen
                .iter()
                .filter(|(id, _)| *id == run)
                .map(|(_, phase)| *phase)
                .collect();
            assert_eq!(phases, vec![Phase::Planning, Phase::Development]);
        }
    }

    #[tokio::test]
    async fn test_critical_hurdle_escalates_when_approved() {
        let generator = ScriptedGenerator::new(|request, _| {
            if request.purpose == Purpose::Produce && request.phase == Phase::Development {
                return Ok(GenerationReply::text("partial implementation")
                    .with_hurdle(Hurdle::critical("database credentials missing")));
            }
            default_reply(request)
        });
        let (sink, events) = collector();
        let orchestrator = Orchestrator::builder(generator).sink(sink).build();

        let result = orchestrator.run("x", &auto_config()).await.unwrap();

        assert!(result.succeeded());
        let development = result.result_for(Phase::Development).unwrap();
        assert_eq!(development.status, PhaseStatus::Escalated);
        assert_eq!(development.output, "partial implementation");
        assert!(development.hurdle.as_ref().unwrap().is_critical());

        let hurdle = events
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.kind == EventKind::HurdleDetected)
            .cloned()
            .unwrap();
        assert_eq!(hurdle.field("phase"), Some("Development"));
        assert_eq!(hurdle.field("severity"), Some("critical"));
        // Development gate plus the hurdle gate.
        assert_eq!(
            result
                .approvals
                .iter()
                .filter(|a| a.phase == Phase::Development)
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn test_critical_hurdle_rejection_halts() {
        let generator = ScriptedGenerator::new(|request, _| {
            if request.purpose == Purpose::Produce && request.phase == Phase::Development {
                return Ok(GenerationReply::text("stuck")
                    .with_hurdle(Hurdle::critical("cannot reach the package registry")));
            }
            default_reply(request)
        });
        let orchestrator = Orchestrator::builder(generator)
            .approvals(approver(|pending| {
                if pending.snapshot.contains("Critical hurdle") {
                    Decision::rejected("stop here")
                } else {
                    Decision::Approved
                }
            }))
            .build();
        let config = RunConfig {
            auto_approve: false,
            ..auto_config()
        };

        let result = orchestrator.run("x", &config).await.unwrap();

        assert_eq!(result.status, RunStatus::Failed);
        let halt = result.halt.as_ref().unwrap();
        assert_eq!(halt.phase, Phase::Development);
        assert!(halt.reason.contains("stop here"));
        assert_eq!(
            result.result_for(Phase::Development).unwrap().status,
            PhaseStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_minor_hurdle_is_logged_without_a_gate() {
        let generator = ScriptedGenerator::new(|request, _| {
            if request.purpose == Purpose::Produce && request.phase == Phase::Review {
                return Ok(GenerationReply::text("looks fine").with_hurdle(Hurdle::new(
                    "flaky lint rule",
                    crewforge::generate::HurdleSeverity::Low,
                )));
            }
            default_reply(request)
        });
        let orchestrator = Orchestrator::builder(generator).build();

        let result = orchestrator.run("x", &auto_config()).await.unwrap();

        assert!(result.succeeded());
        assert_eq!(
            result.result_for(Phase::Review).unwrap().status,
            PhaseStatus::Succeeded
        );
        assert_eq!(result.action_log.entries_of(ActionKind::HurdleDetected).count(), 1);
        assert!(result.approvals.iter().all(|a| a.phase != Phase::Review));
    }
}

// =============================================================================
// Generation failures
// =============================================================================

mod generation {
    use super::*;

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let generator = ScriptedGenerator::new(|request, previous| {
            if request.purpose == Purpose::Produce
                && request.phase == Phase::Development
                && previous == 0
            {
                return Err(GenerationError::Transient("rate limited".into()));
            }
            default_reply(request)
        });
        let orchestrator = Orchestrator::builder(generator).build();

        let result = orchestrator.run("x", &auto_config()).await.unwrap();

        assert!(result.succeeded());
        assert_eq!(
            result.result_for(Phase::Development).unwrap().status,
            PhaseStatus::Succeeded
        );
        let retried: Vec<_> = result
            .action_log
            .entries_of(ActionKind::GenerationRetried)
            .collect();
        assert_eq!(retried.len(), 1);
        assert_eq!(retried[0].phase, Some(Phase::Development));
    }

    #[tokio::test]
    async fn test_exhausted_generation_escalates_with_empty_output() {
        let generator = ScriptedGenerator::new(|request, _| {
            if request.purpose == Purpose::Produce && request.phase == Phase::Development {
                return Err(GenerationError::Unavailable("model offline".into()));
            }
            default_reply(request)
        });
        let (sink, events) = collector();
        let orchestrator = Orchestrator::builder(generator.clone()).sink(sink).build();

        let result = orchestrator.run("x", &auto_config()).await.unwrap();

        assert!(result.succeeded());
        let development = result.result_for(Phase::Development).unwrap();
        assert_eq!(development.status, PhaseStatus::Escalated);
        assert!(development.output.is_empty());
        assert!(development.hurdle.as_ref().unwrap().is_critical());

        // Unavailable is not retried.
        let attempts = generator
            .calls()
            .iter()
            .filter(|c| c.purpose == Purpose::Produce && c.phase == Phase::Development)
            .count();
        assert_eq!(attempts, 1);
        // Nothing to review.
        assert!(
            !generator
                .calls()
                .iter()
                .any(|c| c.purpose == Purpose::PeerReview && c.phase == Phase::Development)
        );

        assert!(kinds(&events).contains(&EventKind::HurdleDetected));
        let failures: Vec<_> = result.action_log.failures().collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].kind, ActionKind::GenerationFailed);
    }

    #[tokio::test]
    async fn test_malformed_replies_exhaust_the_retry_bound() {
        let generator = ScriptedGenerator::new(|request, _| {
            if request.purpose == Purpose::Produce && request.phase == Phase::Planning {
                return Ok(GenerationReply::text("   "));
            }
            default_reply(request)
        });
        let orchestrator = Orchestrator::builder(generator.clone()).build();
        let config = RunConfig {
            generation_attempts: 2,
            ..auto_config()
        };

        let result = orchestrator.run("x", &config).await.unwrap();

        let planning = result.result_for(Phase::Planning).unwrap();
        assert_eq!(planning.status, PhaseStatus::Escalated);
        let attempts = generator
            .calls()
            .iter()
            .filter(|c| c.purpose == Purpose::Produce && c.phase == Phase::Planning)
            .count();
        assert_eq!(attempts, 2);
    }

    #[tokio::test]
    async fn test_unparseable_review_defaults_to_neutral() {
        let generator = ScriptedGenerator::new(|request, _| {
            if request.purpose == Purpose::PeerReview {
                return Ok(GenerationReply::text("I have no opinion."));
            }
            default_reply(request)
        });
        let orchestrator = Orchestrator::builder(generator).build();

        let result = orchestrator.run("x", &auto_config()).await.unwrap();

        assert!(result.succeeded());
        assert!(result.agent_events.is_empty());
        assert_eq!(result.action_log.entries_of(ActionKind::RatingClamped).count(), 7);
    }
}

// =============================================================================
// Notifications, metrics and context
// =============================================================================

mod observability {
    use super::*;

    #[tokio::test]
    async fn test_failing_sink_does_not_stop_the_run() {
        let broken = Arc::new(CallbackSink::new("broken", |_| anyhow::bail!("connection refused")));
        let (sink, events) = collector();
        let orchestrator = Orchestrator::builder(ScriptedGenerator::happy())
            .sink(broken)
            .sink(sink)
            .build();

        let result = orchestrator.run("x", &auto_config()).await.unwrap();

        assert!(result.succeeded());
        let delivered = kinds(&events);
        assert_eq!(
            delivered,
            vec![
                EventKind::PlanComplete,
                EventKind::ImplementationComplete,
                EventKind::TestsPassed
            ]
        );
        let failed: Vec<_> = result
            .action_log
            .entries_of(ActionKind::NotificationFailed)
            .collect();
        assert_eq!(failed.len(), delivered.len());
        assert!(failed[0].detail.contains("broken"));
        assert!(failed[0].detail.contains("connection refused"));
    }

    /// Takes every event and never answers.
    struct SilentSink;

    #[async_trait]
    impl NotificationSink for SilentSink {
        fn name(&self) -> &str {
            "silent"
        }

        async fn notify(&self, _event: &NotificationEvent) -> anyhow::Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_silent_sink_does_not_stall_the_run() {
        let (sink, events) = collector();
        let orchestrator = Orchestrator::builder(ScriptedGenerator::happy())
            .sink(Arc::new(SilentSink))
            .sink(sink)
            .notification_timeout(Duration::from_millis(20))
            .build();

        let result = tokio::time::timeout(
            Duration::from_secs(10),
            orchestrator.run("x", &auto_config()),
        )
        .await
        .expect("run must finish while a sink hangs")
        .unwrap();

        assert!(result.succeeded());
        assert_eq!(kinds(&events).len(), 3);
        let failed: Vec<_> = result
            .action_log
            .entries_of(ActionKind::NotificationFailed)
            .collect();
        assert_eq!(failed.len(), 3);
        assert!(failed.iter().all(|e| e.detail.contains("silent") && e.detail.contains("timed out")));
    }

    #[tokio::test]
    async fn test_only_enabled_notifications_are_published() {
        let (sink, events) = collector();
        let orchestrator = Orchestrator::builder(ScriptedGenerator::happy())
            .sink(sink)
            .build();
        let config = RunConfig {
            enabled_notifications: [EventKind::TestsPassed].into_iter().collect(),
            ..auto_config()
        };

        orchestrator.run("x", &config).await.unwrap();
        assert_eq!(kinds(&events), vec![EventKind::TestsPassed]);
    }

    #[tokio::test]
    async fn test_metrics_are_appended_per_phase_and_run() {
        let metrics = Arc::new(MemoryMetricsSink::new());
        let orchestrator = Orchestrator::builder(ScriptedGenerator::happy())
            .metrics(metrics.clone())
            .build();

        let result = orchestrator.run("x", &auto_config()).await.unwrap();
        let records = metrics.records();

        let stages = records.iter().filter(|r| r.kind() == "stage_metrics").count();
        assert_eq!(stages, result.phase_results.len());
        let usage = records.iter().filter(|r| r.kind() == "token_usage").count();
        assert_eq!(usage, 5);
        let quality = records.iter().filter(|r| r.kind() == "code_quality").count();
        assert_eq!(quality, 7);

        match records.last().unwrap() {
            MetricsRecord::ProjectMetrics {
                run_id,
                succeeded,
                phases_completed,
                total_tokens,
                ..
            } => {
                assert_eq!(*run_id, result.run_id);
                assert!(*succeeded);
                assert_eq!(*phases_completed, 5);
                assert_eq!(*total_tokens, result.token_totals.total());
            }
            other => panic!("expected project metrics last, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_small_budget_summarizes_context() {
        let generator = ScriptedGenerator::new(|request, _| match request.purpose {
            Purpose::Produce if request.phase == Phase::Testing => {
                Ok(GenerationReply::text(format!("ALL TESTS PASSED\n{}", "t".repeat(400))))
            }
            Purpose::Produce => Ok(GenerationReply::text("x".repeat(400))),
            Purpose::PeerReview => Ok(GenerationReply::text("Rating: 4")),
        });
        let orchestrator = Orchestrator::builder(generator).build();
        let config = RunConfig {
            budget_limit: 200,
            summarize_at: "80%".into(),
            ..auto_config()
        };

        let result = orchestrator.run("x", &config).await.unwrap();

        assert!(result.succeeded());
        assert!(!result.context.segments.is_empty());
        assert_eq!(result.context.limit, 200);
        assert!(
            result
                .action_log
                .entries_of(ActionKind::ContextSummarized)
                .count()
                >= 1
        );
        let sequences: Vec<u32> = result.context.segments.iter().map(|s| s.sequence).collect();
        let expected: Vec<u32> = (1..=sequences.len() as u32).collect();
        assert_eq!(sequences, expected);
    }

    #[tokio::test]
    async fn test_phase_prompts_stay_within_budget_after_oversized_output() {
        let prompts: Arc<Mutex<Vec<(Phase, String)>>> = Arc::new(Mutex::new(Vec::new()));
        let seen = prompts.clone();
        let generator = ScriptedGenerator::new(move |request, _| {
            if request.purpose == Purpose::Produce {
                seen.lock().unwrap().push((request.phase, request.prompt.clone()));
            }
            match (request.purpose, request.phase) {
                (Purpose::Produce, Phase::Development) => {
                    Ok(GenerationReply::text("fn a() {}\n".repeat(40_000)))
                }
                _ => default_reply(request),
            }
        });
        let orchestrator = Orchestrator::builder(generator).build();
        let config = RunConfig {
            budget_limit: 1_000,
            summarize_at: "80%".into(),
            ..auto_config()
        };

        let result = orchestrator.run("build a CRUD API", &config).await.unwrap();

        assert!(result.succeeded());
        assert!(result.context.running <= 1_000);
        let prompts = prompts.lock().unwrap();
        let after: Vec<_> = prompts
            .iter()
            .filter(|(phase, _)| *phase > Phase::Development)
            .collect();
        assert_eq!(after.len(), 3);
        for (phase, prompt) in after {
            let bare = phase_prompt(*phase, "build a CRUD API", "");
            let context_tokens = estimate_tokens(prompt) - estimate_tokens(&bare);
            assert!(
                context_tokens <= config.budget_limit,
                "{} prompt carries {} context tokens",
                phase,
                context_tokens
            );
        }
    }

    #[test]
    fn test_budget_summarizes_once_after_crossing_threshold() {
        let mut budget = ContextBudget::new(1000, 800, Arc::new(DigestSummarizer));
        assert!(budget.account(400).summarized.is_empty());
        let crossed = budget.account(450);
        assert_eq!(crossed.summarized.len(), 1);
        assert!(crossed.running < 800);
        assert_eq!(budget.segments().len(), 1);

        assert!(budget.account(10).summarized.is_empty());
        assert_eq!(budget.segments().len(), 1);
    }
}
