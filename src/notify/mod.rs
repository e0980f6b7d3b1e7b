//! Typed notification fan-out.
//!
//! Events are published to every registered [`NotificationSink`]. Sinks are
//! independent: delivery runs concurrently and a failing sink neither blocks
//! the others nor aborts the run. A sink that does not answer within the
//! delivery timeout counts as failed. Failures are returned in a
//! [`DeliveryReport`] so the caller can record them.

mod sinks;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

pub use sinks::{CallbackSink, ConsoleSink, WebhookSink};

/// Kind of notification event.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    PlanComplete,
    ImplementationComplete,
    TestsPassed,
    TestsFailed,
    PrCreated,
    PrMerged,
    HurdleDetected,
    AgentFired,
    AgentHired,
    /// A gate is waiting for an external decision.
    ApprovalRequired,
    /// Context is over the hard limit after summarization.
    BudgetWarning,
}

impl EventKind {
    pub const ALL: [EventKind; 11] = [
        EventKind::PlanComplete,
        EventKind::ImplementationComplete,
        EventKind::TestsPassed,
        EventKind::TestsFailed,
        EventKind::PrCreated,
        EventKind::PrMerged,
        EventKind::HurdleDetected,
        EventKind::AgentFired,
        EventKind::AgentHired,
        EventKind::ApprovalRequired,
        EventKind::BudgetWarning,
    ];
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventKind::PlanComplete => "PlanComplete",
            EventKind::ImplementationComplete => "ImplementationComplete",
            EventKind::TestsPassed => "TestsPassed",
            EventKind::TestsFailed => "TestsFailed",
            EventKind::PrCreated => "PRCreated",
            EventKind::PrMerged => "PRMerged",
            EventKind::HurdleDetected => "HurdleDetected",
            EventKind::AgentFired => "AgentFired",
            EventKind::AgentHired => "AgentHired",
            EventKind::ApprovalRequired => "ApprovalRequired",
            EventKind::BudgetWarning => "BudgetWarning",
        };
        write!(f, "{}", s)
    }
}

/// An immutable notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub kind: EventKind,
    pub payload: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl NotificationEvent {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            payload: Map::new(),
            timestamp: Utc::now(),
        }
    }

    /// Add a payload field.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.payload.insert(key.to_string(), value.into());
        self
    }

    /// A payload field as a string, if present.
    pub fn field(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    /// One-line human readable rendering.
    pub fn summary(&self) -> String {
        let fields: Vec<String> = self
            .payload
            .iter()
            .map(|(k, v)| match v {
                Value::String(s) => format!("{}={}", k, s),
                other => format!("{}={}", k, other),
            })
            .collect();
        if fields.is_empty() {
            self.kind.to_string()
        } else {
            format!("{}: {}", self.kind, fields.join(", "))
        }
    }
}

/// Receives published events.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Name used when reporting delivery failures.
    fn name(&self) -> &str;

    async fn notify(&self, event: &NotificationEvent) -> anyhow::Result<()>;
}

/// A sink that failed to accept an event.
#[derive(Debug, Clone, PartialEq)]
pub struct SinkFailure {
    pub sink: String,
    pub error: String,
}

/// Outcome of one publish.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub failures: Vec<SinkFailure>,
}

/// How long one sink may take to accept an event.
pub const DEFAULT_DELIVERY_TIMEOUT: Duration = Duration::from_secs(15);

/// Fans events out to registered sinks.
#[derive(Clone)]
pub struct NotificationDispatcher {
    sinks: Vec<Arc<dyn NotificationSink>>,
    delivery_timeout: Duration,
}

impl Default for NotificationDispatcher {
    fn default() -> Self {
        Self {
            sinks: Vec::new(),
            delivery_timeout: DEFAULT_DELIVERY_TIMEOUT,
        }
    }
}

impl std::fmt::Debug for NotificationDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.sinks.iter().map(|s| s.name()).collect();
        f.debug_struct("NotificationDispatcher")
            .field("sinks", &names)
            .field("delivery_timeout", &self.delivery_timeout)
            .finish()
    }
}

impl NotificationDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, sink: Arc<dyn NotificationSink>) {
        self.sinks.push(sink);
    }

    pub fn set_delivery_timeout(&mut self, timeout: Duration) {
        self.delivery_timeout = timeout;
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Deliver `event` to every sink concurrently.
    ///
    /// Returns once every sink has answered or timed out.
    pub async fn publish(&self, event: &NotificationEvent) -> DeliveryReport {
        let limit = self.delivery_timeout;
        let deliveries = self.sinks.iter().map(|sink| async move {
            let result = match tokio::time::timeout(limit, sink.notify(event)).await {
                Ok(result) => result,
                Err(_) => Err(anyhow::anyhow!("timed out after {:?}", limit)),
            };
            (sink.name().to_string(), result)
        });

        let mut report = DeliveryReport::default();
        for (sink, result) in join_all(deliveries).await {
            match result {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!(sink = %sink, kind = %event.kind, error = %e, "notification sink failed");
                    report.failures.push(SinkFailure {
                        sink,
                        error: format!("{:#}", e),
                    });
                }
            }
        }
        report
    }
}
