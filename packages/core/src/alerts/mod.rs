//! Best-effort, multi-channel alert delivery.
//!
//! [`AlertDispatcher::send`] filters by a severity threshold, then attempts
//! every configured [`AlertChannel`] exactly once. Each delivery is bounded by
//! the dispatcher's timeout; a slow channel counts as failed. A channel
//! failure is logged and counted but never stops the remaining channels; the
//! call reports `true` when at least one channel accepted the alert.
//!
//! Callers (the job scheduler, the health monitor, ad-hoc code) own any
//! re-alerting policy: there is no retry or backoff in here.

pub mod email;
pub mod webhook;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::metrics::AppMetrics;

pub use email::{EmailChannel, SmtpSettings};
pub use webhook::SlackWebhookChannel;

/// Alert severity, ordered from least to most urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Debug => "DEBUG",
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
            Severity::Critical => "CRITICAL",
        }
    }

    /// Accent colour used by the chat and mail renderings.
    pub fn color(&self) -> &'static str {
        match self {
            Severity::Debug => "#6C757D",
            Severity::Info => "#0D6EFD",
            Severity::Warning => "#FFC107",
            Severity::Error => "#DC3545",
            Severity::Critical => "#7F00FF",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DEBUG" => Ok(Severity::Debug),
            "INFO" => Ok(Severity::Info),
            "WARNING" | "WARN" => Ok(Severity::Warning),
            "ERROR" => Ok(Severity::Error),
            "CRITICAL" => Ok(Severity::Critical),
            other => Err(format!("Invalid alert level: {}", other)),
        }
    }
}

/// Structured payload attached to an alert. Sorted so renderings are stable.
pub type AlertData = BTreeMap<String, Value>;

/// A single alert. Ephemeral: dispatched, never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub title: String,
    pub message: String,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
    pub data: AlertData,
}

impl Alert {
    pub fn new(
        title: impl Into<String>,
        message: impl Into<String>,
        severity: Severity,
        data: AlertData,
    ) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
            severity,
            timestamp: Utc::now(),
            data,
        }
    }
}

/// Errors raised by a single alert channel.
#[derive(Error, Debug)]
pub enum AlertError {
    #[error("Channel not configured: {message}")]
    NotConfigured { message: String },

    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("Rejected by receiver (HTTP {status}): {body}")]
    Rejected { status: u16, body: String },
}

impl AlertError {
    pub fn not_configured(message: impl Into<String>) -> Self {
        Self::NotConfigured { message: message.into() }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport { message: message.into() }
    }
}

/// A destination alerts can be delivered to.
#[async_trait]
pub trait AlertChannel: Send + Sync {
    /// Short name used in logs and metric labels.
    fn name(&self) -> &str;

    /// Attempt delivery once.
    async fn deliver(&self, alert: &Alert) -> Result<(), AlertError>;
}

/// Default upper bound on one channel delivery.
pub const DEFAULT_DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Fans an alert out to every configured channel.
pub struct AlertDispatcher {
    enabled: bool,
    threshold: Severity,
    timeout: Duration,
    channels: Vec<Arc<dyn AlertChannel>>,
    metrics: Option<Arc<AppMetrics>>,
}

impl AlertDispatcher {
    /// Dispatcher with no channels; alerts below `threshold` are dropped.
    pub fn new(threshold: Severity) -> Self {
        Self {
            enabled: true,
            threshold,
            timeout: DEFAULT_DELIVERY_TIMEOUT,
            channels: Vec::new(),
            metrics: None,
        }
    }

    pub fn with_channel(mut self, channel: Arc<dyn AlertChannel>) -> Self {
        self.channels.push(channel);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<AppMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Globally switch alerting on or off.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn threshold(&self) -> Severity {
        self.threshold
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.channels.iter().map(|c| c.name().to_string()).collect()
    }

    /// `true` when an alert of `severity` would be attempted.
    pub fn should_alert(&self, severity: Severity) -> bool {
        self.enabled && severity >= self.threshold
    }

    /// Build and dispatch an alert. Returns `true` iff at least one channel
    /// accepted it.
    pub async fn send(
        &self,
        title: &str,
        message: &str,
        severity: Severity,
        data: AlertData,
    ) -> bool {
        self.dispatch(Alert::new(title, message, severity, data)).await
    }

    /// Dispatch a pre-built alert.
    pub async fn dispatch(&self, alert: Alert) -> bool {
        if !self.should_alert(alert.severity) {
            tracing::debug!(
                "Alert not sent due to level threshold: {} ({})",
                alert.title,
                alert.severity
            );
            return false;
        }

        tracing::info!("Sending {} alert: {}", alert.severity, alert.title);

        let mut delivered = false;
        for channel in &self.channels {
            let outcome = match tokio::time::timeout(self.timeout, channel.deliver(&alert)).await {
                Ok(Ok(())) => {
                    tracing::info!("{} alert sent: {}", channel.name(), alert.title);
                    delivered = true;
                    "success"
                }
                Ok(Err(err)) => {
                    tracing::error!("Failed to send {} alert: {}", channel.name(), err);
                    "failure"
                }
                Err(_) => {
                    tracing::error!(
                        "Timed out after {:?} sending {} alert: {}",
                        self.timeout,
                        channel.name(),
                        alert.title
                    );
                    "failure"
                }
            };

            if let Some(metrics) = &self.metrics {
                metrics
                    .alerts_total
                    .with_label_values(&[channel.name(), outcome])
                    .inc();
            }
        }

        if self.channels.is_empty() {
            tracing::warn!("No alert channels configured; dropping: {}", alert.title);
        }

        delivered
    }
}
