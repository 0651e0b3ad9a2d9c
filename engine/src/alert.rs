//! # Operator Alerts
//!
//! Fire-and-forget notifications for conditions a human should look at:
//! deep reorgs, balances that no longer match their history. Delivery
//! never fails an engine operation. [`raise`] logs a failed delivery and
//! moves on.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

/// How urgently an alert needs attention.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    Major,
    Medium,
    Minor,
    Warning,
    Info,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Critical => "critical",
            Self::Major => "major",
            Self::Medium => "medium",
            Self::Minor => "minor",
            Self::Warning => "warning",
            Self::Info => "info",
        };
        f.write_str(label)
    }
}

/// A single operator alert.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub title: String,
    pub message: String,
    pub severity: Severity,
    /// Free-form context, e.g. heights or the offending addresses.
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Alert {
    pub fn new(
        title: impl Into<String>,
        message: impl Into<String>,
        severity: Severity,
        metadata: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            message: message.into(),
            severity,
            metadata,
            created_at: Utc::now(),
        }
    }
}

/// Delivery failure reported by an [`AlertSink`].
#[derive(Debug, Error)]
pub enum AlertError {
    #[error("alert delivery failed: {0}")]
    Delivery(String),
}

/// Destination for operator alerts.
pub trait AlertSink {
    fn add_alert(&self, alert: &Alert) -> Result<(), AlertError>;
}

/// Delivers `alert`, logging instead of propagating a failure.
pub fn raise<A: AlertSink + ?Sized>(sink: &A, alert: Alert) {
    if let Err(e) = sink.add_alert(&alert) {
        warn!(alert_id = %alert.id, title = %alert.title, error = %e, "failed to deliver alert");
    }
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

/// Writes alerts to the log. Critical and major alerts log at `error`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn add_alert(&self, alert: &Alert) -> Result<(), AlertError> {
        match alert.severity {
            Severity::Critical | Severity::Major => error!(
                alert_id = %alert.id,
                severity = %alert.severity,
                metadata = %alert.metadata,
                "{}: {}",
                alert.title,
                alert.message
            ),
            _ => info!(
                alert_id = %alert.id,
                severity = %alert.severity,
                metadata = %alert.metadata,
                "{}: {}",
                alert.title,
                alert.message
            ),
        }
        Ok(())
    }
}

/// Keeps every alert in memory.
#[derive(Debug, Default)]
pub struct RecordingAlertSink {
    alerts: Mutex<Vec<Alert>>,
}

impl RecordingAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the alerts recorded so far.
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().clone()
    }
}

impl AlertSink for RecordingAlertSink {
    fn add_alert(&self, alert: &Alert) -> Result<(), AlertError> {
        self.alerts.lock().push(alert.clone());
        Ok(())
    }
}

impl<T: AlertSink + ?Sized> AlertSink for std::sync::Arc<T> {
    fn add_alert(&self, alert: &Alert) -> Result<(), AlertError> {
        (**self).add_alert(alert)
    }
}
