use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ActivityEvent {
    pub action: String,
    pub user_id: Option<String>,
    pub details: serde_json::Map<String, serde_json::Value>,
    pub at: DateTime<Utc>,
}

impl ActivityEvent {
    pub fn new(action: &str, user_id: Option<&str>) -> Self {
        Self {
            action: action.to_string(),
            user_id: user_id.map(str::to_string),
            details: serde_json::Map::new(),
            at: Utc::now(),
        }
    }

    pub fn detail(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorEvent {
    pub message: String,
    pub severity: Severity,
    pub user_id: Option<String>,
    /// Short token shown to the user so support can find this entry
    pub reference: Option<String>,
    pub context: serde_json::Map<String, serde_json::Value>,
    pub at: DateTime<Utc>,
}

impl ErrorEvent {
    pub fn new(message: impl Into<String>, severity: Severity, user_id: Option<&str>) -> Self {
        Self {
            message: message.into(),
            severity,
            user_id: user_id.map(str::to_string),
            reference: None,
            context: serde_json::Map::new(),
            at: Utc::now(),
        }
    }

    pub fn reference(mut self, reference: &str) -> Self {
        self.reference = Some(reference.to_string());
        self
    }

    pub fn context(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.context.insert(key.to_string(), value.into());
        self
    }
}

/// Fire-and-forget activity and error sink. Implementations must not block
/// the caller or panic.
pub trait TelemetrySink: Send + Sync {
    fn log_activity(&self, event: ActivityEvent);
    fn log_error(&self, event: ErrorEvent);
}

/// Writes events to the tracing subscriber.
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn log_activity(&self, event: ActivityEvent) {
        let details = serde_json::Value::Object(event.details);
        tracing::info!(
            target: "credmeter::activity",
            action = %event.action,
            user_id = event.user_id.as_deref().unwrap_or("anonymous"),
            details = %details,
            "activity"
        );
    }

    fn log_error(&self, event: ErrorEvent) {
        let context = serde_json::Value::Object(event.context);
        let user_id = event.user_id.as_deref().unwrap_or("anonymous");
        let reference = event.reference.as_deref().unwrap_or("-");
        match event.severity {
            Severity::Low => tracing::info!(target: "credmeter::error", severity = %event.severity, user_id, reference, context = %context, "{}", event.message),
            Severity::Medium => tracing::warn!(target: "credmeter::error", severity = %event.severity, user_id, reference, context = %context, "{}", event.message),
            Severity::High | Severity::Critical => tracing::error!(target: "credmeter::error", severity = %event.severity, user_id, reference, context = %context, "{}", event.message),
        }
    }
}

/// Logs locally and posts each event to a collector without waiting for it.
pub struct HttpSink {
    client: reqwest::Client,
    endpoint: String,
    local: TracingSink,
}

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Envelope {
    Activity(ActivityEvent),
    Error(ErrorEvent),
}

impl HttpSink {
    pub fn new(endpoint: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {}", e))?;
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            local: TracingSink,
        })
    }

    fn post(&self, envelope: Envelope) {
        // Without a runtime there is nothing to drive the request; the local log still has it.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let client = self.client.clone();
        let endpoint = self.endpoint.clone();
        handle.spawn(async move {
            match client.post(&endpoint).json(&envelope).send().await {
                Ok(resp) if !resp.status().is_success() => {
                    tracing::debug!(status = resp.status().as_u16(), "Telemetry collector rejected event");
                }
                Err(e) => tracing::debug!(error = %e, "Telemetry delivery failed"),
                _ => {}
            }
        });
    }
}

impl TelemetrySink for HttpSink {
    fn log_activity(&self, event: ActivityEvent) {
        self.local.log_activity(event.clone());
        self.post(Envelope::Activity(event));
    }

    fn log_error(&self, event: ErrorEvent) {
        self.local.log_error(event.clone());
        self.post(Envelope::Error(event));
    }
}
