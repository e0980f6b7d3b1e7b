//! Approval gates.
//!
//! A gate blocks the run until an external decision arrives. Decisions are
//! delivered through a channel of [`PendingApproval`]s: the approver (a
//! terminal prompt, a web hook, a test) receives one per blocking checkpoint
//! and resolves it exactly once. Each checkpoint names its run, so one
//! approver can serve several concurrent runs.
//!
//! With `auto_approve` every request resolves Approved immediately and no
//! approver is consulted. Otherwise the wait is bounded by the configured
//! timeout and fails with [`OrchestratorError::ApprovalTimeout`].

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};
use uuid::Uuid;

use crate::errors::OrchestratorError;
use crate::phase::Phase;

/// Reason recorded when the approver disappears without deciding.
pub const APPROVER_GONE: &str = "approver went away";

/// Final decision for a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "lowercase")]
pub enum Decision {
    Approved,
    Rejected { reason: String },
}

impl Decision {
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }

    pub fn is_approved(&self) -> bool {
        matches!(self, Self::Approved)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionState {
    Pending,
    Approved,
    Rejected,
}

/// Record of one blocking checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: Uuid,
    pub phase: Phase,
    /// Summary of what is being approved.
    pub snapshot: String,
    pub state: DecisionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub requested_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ApprovalRequest {
    pub fn new(phase: Phase, snapshot: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            phase,
            snapshot: snapshot.into(),
            state: DecisionState::Pending,
            reason: None,
            requested_at: Utc::now(),
            resolved_at: None,
        }
    }

    /// Apply a decision. A request resolves exactly once.
    pub fn resolve(&mut self, decision: &Decision) -> anyhow::Result<()> {
        if self.state != DecisionState::Pending {
            anyhow::bail!("approval request {} already resolved", self.id);
        }
        match decision {
            Decision::Approved => self.state = DecisionState::Approved,
            Decision::Rejected { reason } => {
                self.state = DecisionState::Rejected;
                self.reason = Some(reason.clone());
            }
        }
        self.resolved_at = Some(Utc::now());
        Ok(())
    }
}

/// A checkpoint handed to the approver, resolved by consuming it.
///
/// Dropping it without a decision resolves the checkpoint as Rejected.
#[derive(Debug)]
pub struct PendingApproval {
    pub id: Uuid,
    /// Run that raised the checkpoint.
    pub run_id: Uuid,
    pub phase: Phase,
    pub snapshot: String,
    responder: oneshot::Sender<Decision>,
}

impl PendingApproval {
    pub fn approve(self) {
        self.decide(Decision::Approved);
    }

    pub fn reject(self, reason: impl Into<String>) {
        self.decide(Decision::rejected(reason));
    }

    pub fn decide(self, decision: Decision) {
        // The gate may already have timed out; nothing is waiting then.
        let _ = self.responder.send(decision);
    }
}

/// Blocks workflow progression pending an external decision.
#[derive(Debug)]
pub struct ApprovalGate {
    run_id: Uuid,
    auto_approve: bool,
    timeout: Duration,
    approver: Option<mpsc::Sender<PendingApproval>>,
    history: Mutex<Vec<ApprovalRequest>>,
}

impl ApprovalGate {
    pub fn new(
        run_id: Uuid,
        auto_approve: bool,
        timeout: Duration,
        approver: Option<mpsc::Sender<PendingApproval>>,
    ) -> Self {
        Self {
            run_id,
            auto_approve,
            timeout,
            approver,
            history: Mutex::new(Vec::new()),
        }
    }

    /// Whether a request will wait for an external decision.
    pub fn is_blocking(&self) -> bool {
        !self.auto_approve
    }

    /// Request a decision for `phase`.
    pub async fn request(
        &self,
        phase: Phase,
        snapshot: impl Into<String>,
    ) -> Result<Decision, OrchestratorError> {
        let mut request = ApprovalRequest::new(phase, snapshot);

        let decision = if self.auto_approve {
            debug!(phase = %phase, "auto-approved");
            Decision::Approved
        } else {
            info!(phase = %phase, timeout_secs = self.timeout.as_secs(), "waiting for approval");
            match tokio::time::timeout(self.timeout, self.wait_for_decision(&request)).await {
                Ok(decision) => decision,
                Err(_) => {
                    self.record(request);
                    return Err(OrchestratorError::ApprovalTimeout {
                        phase,
                        waited: self.timeout,
                    });
                }
            }
        };

        request.resolve(&decision)?;
        info!(phase = %phase, approved = decision.is_approved(), "approval resolved");
        self.record(request);
        Ok(decision)
    }

    async fn wait_for_decision(&self, request: &ApprovalRequest) -> Decision {
        let Some(approver) = &self.approver else {
            // No decision source: only the deadline can end the wait.
            return std::future::pending().await;
        };

        let (tx, rx) = oneshot::channel();
        let pending = PendingApproval {
            id: request.id,
            run_id: self.run_id,
            phase: request.phase,
            snapshot: request.snapshot.clone(),
            responder: tx,
        };
        if approver.send(pending).await.is_err() {
            return Decision::rejected(APPROVER_GONE);
        }
        rx.await.unwrap_or_else(|_| Decision::rejected(APPROVER_GONE))
    }

    fn record(&self, request: ApprovalRequest) {
        if let Ok(mut history) = self.history.lock() {
            history.push(request);
        }
    }

    /// Every request made through this gate, in order.
    pub fn history(&self) -> Vec<ApprovalRequest> {
        self.history
            .lock()
            .map(|h| h.clone())
            .unwrap_or_default()
    }
}
