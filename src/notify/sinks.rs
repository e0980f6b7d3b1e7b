//! Notification sink implementations.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use console::style;
use serde::Serialize;

use super::{EventKind, NotificationEvent, NotificationSink};

type Callback = dyn Fn(&NotificationEvent) -> anyhow::Result<()> + Send + Sync;

/// Invokes a caller-supplied closure for every event.
pub struct CallbackSink {
    name: String,
    callback: Box<Callback>,
}

impl CallbackSink {
    pub fn new(
        name: impl Into<String>,
        callback: impl Fn(&NotificationEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            callback: Box::new(callback),
        }
    }
}

#[async_trait]
impl NotificationSink for CallbackSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn notify(&self, event: &NotificationEvent) -> anyhow::Result<()> {
        (self.callback)(event)
    }
}

/// Discord rejects messages with a longer `content`.
const MAX_CONTENT_CHARS: usize = 2000;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize)]
struct WebhookMessage {
    content: String,
}

/// Posts events to a chat webhook as `{"content": "..."}` (Discord-compatible).
#[derive(Debug, Clone)]
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            timeout: WEBHOOK_TIMEOUT,
        }
    }

    /// Per-request timeout, covering connect and response.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn message(event: &NotificationEvent) -> WebhookMessage {
        let content = format!("{} {}", emoji(event.kind), event.summary());
        if content.chars().count() <= MAX_CONTENT_CHARS {
            return WebhookMessage { content };
        }
        let mut cut: String = content.chars().take(MAX_CONTENT_CHARS - 1).collect();
        cut.push('…');
        WebhookMessage { content: cut }
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn notify(&self, event: &NotificationEvent) -> anyhow::Result<()> {
        self.client
            .post(&self.url)
            .timeout(self.timeout)
            .json(&Self::message(event))
            .send()
            .await
            .context("Failed to send webhook notification")?
            .error_for_status()
            .context("Webhook returned error status")?;
        Ok(())
    }
}

/// Prints events to stderr.
#[derive(Debug, Default, Clone)]
pub struct ConsoleSink;

#[async_trait]
impl NotificationSink for ConsoleSink {
    fn name(&self) -> &str {
        "console"
    }

    async fn notify(&self, event: &NotificationEvent) -> anyhow::Result<()> {
        let label = format!("[{}]", event.kind);
        let label = match event.kind {
            EventKind::TestsFailed | EventKind::AgentFired | EventKind::BudgetWarning => {
                style(label).red().bold()
            }
            EventKind::HurdleDetected | EventKind::ApprovalRequired => style(label).yellow().bold(),
            _ => style(label).green().bold(),
        };
        let fields: Vec<String> = event
            .payload
            .iter()
            .map(|(k, v)| match v.as_str() {
                Some(s) => format!("{}={}", k, s),
                None => format!("{}={}", k, v),
            })
            .collect();
        eprintln!("{} {} {}", emoji(event.kind), label, style(fields.join(" ")).dim());
        Ok(())
    }
}

fn emoji(kind: EventKind) -> &'static str {
    match kind {
        EventKind::PlanComplete => "📋",
        EventKind::ImplementationComplete => "🔨",
        EventKind::TestsPassed => "✅",
        EventKind::TestsFailed => "❌",
        EventKind::PrCreated => "🔀",
        EventKind::PrMerged => "🎉",
        EventKind::HurdleDetected => "⚠️",
        EventKind::AgentFired => "🔥",
        EventKind::AgentHired => "🆕",
        EventKind::ApprovalRequired => "⏸️",
        EventKind::BudgetWarning => "📈",
    }
}
