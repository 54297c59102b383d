//! Append-only audit log for gated operations.
//!
//! Every terminal outcome of a gated tool call (`executed`, `blocked`,
//! `rate_limited`, `auth_denied`, `preflight_failed`, `dry_run`,
//! `confirmed`, `escalated`) is recorded here. Entries are immutable
//! once appended. Mirroring to a persistence sink is best-effort: a
//! failing sink never affects the operation that produced the entry.

use std::sync::{Arc, Mutex};

use chrono::Duration;
use kiln_store::{AuditRow, AuditSink};
use kiln_types::Metadata;
use serde::{Deserialize, Serialize};

use crate::classification::safety_level_for;

/// Aggregate view over a recent window of the log.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditSummary {
    pub total_entries: usize,
    pub executed: usize,
    pub blocked: usize,
    pub rate_limited: usize,
    /// Most recent blocked/escalated entries inside the window.
    pub recent_blocked: Vec<AuditRow>,
}

/// In-memory append-only audit log with an optional persistence mirror.
pub struct AuditLog {
    entries: Mutex<Vec<AuditRow>>,
    sink: Option<Arc<dyn AuditSink>>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            sink: None,
        }
    }

    pub fn with_sink(sink: Arc<dyn AuditSink>) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            sink: Some(sink),
        }
    }

    /// Appends one entry. Never fails; sink errors are logged and
    /// swallowed.
    pub fn record(
        &self,
        tool_name: &str,
        action: &str,
        printer_name: Option<&str>,
        details: Metadata,
    ) {
        let row = AuditRow {
            timestamp: kiln_types::now(),
            tool_name: tool_name.to_string(),
            safety_level: safety_level_for(tool_name),
            action: action.to_string(),
            printer_name: printer_name.map(ToString::to_string),
            details,
        };

        if let Some(sink) = &self.sink {
            if let Err(e) = sink.append_audit(&row) {
                tracing::debug!(tool = tool_name, error = %e, "audit sink write failed");
            }
        }
        self.entries
            .lock()
            .expect("audit log lock poisoned")
            .push(row);
    }

    /// Entries newest-first, optionally filtered by action and tool.
    pub fn query(
        &self,
        action: Option<&str>,
        tool_name: Option<&str>,
        limit: usize,
    ) -> Vec<AuditRow> {
        let entries = self.entries.lock().expect("audit log lock poisoned");
        entries
            .iter()
            .rev()
            .filter(|row| action.is_none_or(|a| row.action == a))
            .filter(|row| tool_name.is_none_or(|t| row.tool_name == t))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Counts by outcome over the trailing window.
    pub fn summary(&self, window_seconds: i64) -> AuditSummary {
        let cutoff = kiln_types::now() - Duration::seconds(window_seconds);
        let entries = self.entries.lock().expect("audit log lock poisoned");

        let mut summary = AuditSummary::default();
        for row in entries.iter().filter(|row| row.timestamp >= cutoff) {
            summary.total_entries += 1;
            match row.action.as_str() {
                "executed" => summary.executed += 1,
                "blocked" | "escalated" => {
                    summary.blocked += 1;
                    summary.recent_blocked.push(row.clone());
                }
                "rate_limited" => summary.rate_limited += 1,
                _ => {}
            }
        }
        // Newest first, capped.
        summary.recent_blocked.reverse();
        summary.recent_blocked.truncate(10);
        summary
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("audit log lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use kiln_store::MemoryStore;
    use kiln_types::SafetyLevel;

    use super::*;

    #[test]
    fn entries_carry_classification() {
        let log = AuditLog::new();
        log.record("send_gcode", "executed", Some("P1"), Metadata::new());
        let rows = log.query(None, None, 10);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].safety_level, SafetyLevel::Confirm);
        assert_eq!(rows[0].printer_name.as_deref(), Some("P1"));
    }

    #[test]
    fn query_filters_and_orders_newest_first() {
        let log = AuditLog::new();
        log.record("send_gcode", "executed", None, Metadata::new());
        log.record("send_gcode", "blocked", None, Metadata::new());
        log.record("start_print", "executed", None, Metadata::new());

        let blocked = log.query(Some("blocked"), None, 10);
        assert_eq!(blocked.len(), 1);

        let gcode = log.query(None, Some("send_gcode"), 10);
        assert_eq!(gcode.len(), 2);
        assert_eq!(gcode[0].action, "blocked");

        assert_eq!(log.query(None, None, 2).len(), 2);
    }

    #[test]
    fn summary_counts_by_outcome() {
        let log = AuditLog::new();
        log.record("send_gcode", "executed", None, Metadata::new());
        log.record("send_gcode", "blocked", None, Metadata::new());
        log.record("send_gcode", "escalated", None, Metadata::new());
        log.record("set_temperature", "rate_limited", None, Metadata::new());

        let summary = log.summary(3600);
        assert_eq!(summary.total_entries, 4);
        assert_eq!(summary.executed, 1);
        assert_eq!(summary.blocked, 2);
        assert_eq!(summary.rate_limited, 1);
        assert_eq!(summary.recent_blocked.len(), 2);
        assert_eq!(summary.recent_blocked[0].action, "escalated");
    }

    #[test]
    fn sink_mirrors_entries() {
        let store = Arc::new(MemoryStore::new());
        let log = AuditLog::with_sink(store.clone());
        log.record("upload_file", "executed", None, Metadata::new());
        assert_eq!(store.audits().len(), 1);
        assert_eq!(store.audits()[0].tool_name, "upload_file");
    }
}
