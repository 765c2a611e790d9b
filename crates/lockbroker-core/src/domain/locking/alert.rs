//! Operator alerts
//!
//! Alerts are raised for conditions a human has to look at: a lock held far
//! longer than expected, or an internal broker failure. Delivery is
//! best-effort; a failed notification is logged and otherwise ignored.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, warn};
use uuid::Uuid;

use crate::config::AlertConfig;
use crate::error::Result;

/// Upper bound on a single alert delivery, whatever the sink does.
pub const ALERT_DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Type of alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// The longest-held lock exceeded the configured hold time
    StaleLock,
    /// The broker hit an internal error and is stopping
    InternalError,
}

impl AlertKind {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StaleLock => "stale_lock",
            Self::InternalError => "internal_error",
        }
    }
}

impl std::fmt::Display for AlertKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An alert sent to operators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorAlert {
    /// Unique alert identifier
    pub id: Uuid,
    /// Type of alert
    pub kind: AlertKind,
    /// Short subject line
    pub subject: String,
    /// Full diagnostic message
    pub message: String,
    /// Alert details
    pub data: Option<serde_json::Value>,
    /// When the alert was raised
    pub created_at: DateTime<Utc>,
}

impl OperatorAlert {
    /// Create a new alert
    pub fn new(
        kind: AlertKind,
        subject: impl Into<String>,
        message: impl Into<String>,
        data: Option<serde_json::Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            subject: subject.into(),
            message: message.into(),
            data,
            created_at: Utc::now(),
        }
    }

    /// Create a stale lock alert
    pub fn stale_lock(lock: &str, acquired_at: DateTime<Utc>, held_secs: u64) -> Self {
        let message = format!(
            "Lockbroker lock {} has been held since {} ({}s)",
            lock, acquired_at, held_secs
        );
        let data = serde_json::json!({
            "lock": lock,
            "acquired_at": acquired_at,
            "held_secs": held_secs,
        });
        Self::new(
            AlertKind::StaleLock,
            "Lockbroker lock held too long",
            message,
            Some(data),
        )
    }

    /// Create an internal error alert
    pub fn internal_error(details: &str) -> Self {
        Self::new(
            AlertKind::InternalError,
            "Critical lockbroker error",
            format!("The lockbroker had an internal error and is exiting: {}", details),
            None,
        )
    }
}

/// Destination for operator alerts
#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Deliver an alert. Must not fail; delivery problems are logged.
    async fn notify(&self, alert: &OperatorAlert);
}

/// Writes alerts to the log only
#[derive(Debug, Default, Clone)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn notify(&self, alert: &OperatorAlert) {
        error!(
            alert_id = %alert.id,
            kind = %alert.kind,
            subject = %alert.subject,
            "{}",
            alert.message
        );
    }
}

/// Logs alerts and POSTs them as JSON to a webhook
#[derive(Debug, Clone)]
pub struct WebhookAlertSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookAlertSink {
    /// Default per-request timeout for webhook calls
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

    pub fn new(url: impl Into<String>) -> Result<Self> {
        Self::with_timeout(url, Self::DEFAULT_TIMEOUT)
    }

    /// Webhook sink whose HTTP requests give up after `timeout`.
    pub fn with_timeout(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl AlertSink for WebhookAlertSink {
    async fn notify(&self, alert: &OperatorAlert) {
        LogAlertSink.notify(alert).await;

        let result = self
            .client
            .post(&self.url)
            .json(alert)
            .send()
            .await
            .and_then(|response| response.error_for_status());

        if let Err(e) = result {
            warn!(alert_id = %alert.id, url = %self.url, error = %e, "Failed to deliver operator alert");
        }
    }
}

/// Keeps alerts in memory, for tests and embedding
#[derive(Debug, Default, Clone)]
pub struct MemoryAlertSink {
    alerts: Arc<Mutex<Vec<OperatorAlert>>>,
}

impl MemoryAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Alerts received so far
    pub fn alerts(&self) -> Vec<OperatorAlert> {
        self.alerts
            .lock()
            .map(|alerts| alerts.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl AlertSink for MemoryAlertSink {
    async fn notify(&self, alert: &OperatorAlert) {
        if let Ok(mut alerts) = self.alerts.lock() {
            alerts.push(alert.clone());
        }
    }
}

/// Build the alert sink described by the configuration.
///
/// With alerts disabled, alerts are still logged but nobody is notified.
pub fn sink_from_config(config: &AlertConfig) -> Result<Arc<dyn AlertSink>> {
    match (&config.webhook_url, config.enabled) {
        (Some(url), true) => Ok(Arc::new(WebhookAlertSink::with_timeout(
            url.clone(),
            config.timeout(),
        )?)),
        _ => Ok(Arc::new(LogAlertSink)),
    }
}

/// Deliver `alert`, giving up after [`ALERT_DELIVERY_TIMEOUT`].
///
/// Returns false when the sink did not finish in time.
pub async fn deliver(sink: &dyn AlertSink, alert: &OperatorAlert) -> bool {
    match tokio::time::timeout(ALERT_DELIVERY_TIMEOUT, sink.notify(alert)).await {
        Ok(()) => true,
        Err(_) => {
            warn!(
                alert_id = %alert.id,
                kind = %alert.kind,
                timeout_secs = ALERT_DELIVERY_TIMEOUT.as_secs(),
                "Operator alert delivery timed out"
            );
            false
        }
    }
}
