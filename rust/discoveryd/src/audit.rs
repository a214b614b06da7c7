//! Audit log sink.

use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Debug,
    Info,
    Notice,
    Warning,
    Error,
}

/// Consumer of audit events. The engine reports every decision point here;
/// this trace is the primary operator-facing diagnostic.
pub trait EventSink: Send + Sync {
    fn log_event(&self, message: &str, device_id: Option<i64>, severity: Severity);
}

/// Default sink: structured log output.
#[derive(Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn log_event(&self, message: &str, device_id: Option<i64>, severity: Severity) {
        match severity {
            Severity::Error => error!(device_id, "{message}"),
            Severity::Warning => warn!(device_id, "{message}"),
            _ => info!(device_id, "{message}"),
        }
    }
}
