//! Structured alert sink.
//!
//! Long-running components (monitor, liquidator, reconciler, integrity
//! checker) raise alerts through an injected sink instead of logging
//! ad hoc. The default sink forwards to `tracing`; tests use the channel
//! sink to assert on raised alerts.

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone)]
pub struct Alert {
    pub severity: AlertSeverity,
    /// Stable machine-readable code, e.g. `reconciler.position_missing`
    pub code: &'static str,
    pub message: String,
    pub fields: Value,
    pub raised_at: DateTime<Utc>,
}

impl Alert {
    pub fn new(severity: AlertSeverity, code: &'static str, message: impl Into<String>) -> Self {
        Alert {
            severity,
            code,
            message: message.into(),
            fields: Value::Null,
            raised_at: Utc::now(),
        }
    }

    pub fn with_fields(mut self, fields: Value) -> Self {
        self.fields = fields;
        self
    }
}

pub trait AlertSink: Send + Sync {
    fn raise(&self, alert: Alert);
}

/// Default sink: alerts become tracing events at a matching level
#[derive(Debug, Clone, Default)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn raise(&self, alert: Alert) {
        match alert.severity {
            AlertSeverity::Info => {
                tracing::info!(code = alert.code, fields = %alert.fields, "{}", alert.message)
            }
            AlertSeverity::Warning => {
                tracing::warn!(code = alert.code, fields = %alert.fields, "{}", alert.message)
            }
            AlertSeverity::Critical => {
                tracing::error!(code = alert.code, fields = %alert.fields, "{}", alert.message)
            }
        }
    }
}

/// Channel-backed sink for tests: captures every alert for assertion
#[derive(Debug, Clone)]
pub struct ChannelAlertSink {
    tx: mpsc::UnboundedSender<Alert>,
}

impl ChannelAlertSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Alert>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl AlertSink for ChannelAlertSink {
    fn raise(&self, alert: Alert) {
        // Receiver may be gone in a shutting-down test; nothing to do then.
        let _ = self.tx.send(alert);
    }
}
