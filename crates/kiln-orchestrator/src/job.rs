//! The orchestrated job record and its lifecycle invariants.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use kiln_types::{JobId, JobStatus, Metadata};
use serde::{Deserialize, Serialize};

/// One print job tracked through the fleet orchestration lifecycle.
///
/// Invariants maintained by the orchestrator:
/// - exactly one printer is bound while the job is assigned or printing
/// - `attempt` never decreases
/// - `failed_printers` only grows
/// - a terminal status is never left
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub file_path: String,
    pub printer_name: Option<String>,
    pub status: JobStatus,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub submitted_by: String,
    /// Larger is more urgent.
    pub priority: i64,
    pub error: Option<String>,
    pub attempt: u32,
    pub max_attempts: u32,
    pub preferred_printer: Option<String>,
    /// Sorted so serialized output is stable.
    pub failed_printers: BTreeSet<String>,
    pub metadata: Metadata,
}

impl Job {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Seconds since printing started, up to completion when finished.
    pub fn elapsed_seconds(&self) -> Option<f64> {
        let started = self.started_at?;
        let end = self.completed_at.unwrap_or_else(kiln_types::now);
        Some((end - started).num_milliseconds() as f64 / 1000.0)
    }

    /// Seconds spent waiting between submission and print start.
    pub fn wait_seconds(&self) -> f64 {
        let start = self.started_at.unwrap_or_else(kiln_types::now);
        (start - self.submitted_at).num_milliseconds() as f64 / 1000.0
    }
}

/// Parameters accepted by `submit`.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub file_path: String,
    pub submitted_by: String,
    pub priority: i64,
    pub preferred_printer: Option<String>,
    pub max_attempts: u32,
    pub metadata: Metadata,
}

impl SubmitRequest {
    pub fn new(file_path: impl Into<String>) -> Self {
        Self {
            file_path: file_path.into(),
            submitted_by: "unknown".into(),
            priority: 0,
            preferred_printer: None,
            max_attempts: 3,
            metadata: Metadata::new(),
        }
    }

    pub fn submitted_by(mut self, who: impl Into<String>) -> Self {
        self.submitted_by = who.into();
        self
    }

    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn preferred_printer(mut self, printer: impl Into<String>) -> Self {
        self.preferred_printer = Some(printer.into());
        self
    }

    pub fn max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = max;
        self
    }
}

/// Result of attempting to assign a job to a printer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentResult {
    pub success: bool,
    pub printer_name: Option<String>,
    pub message: String,
}

impl AssignmentResult {
    pub fn assigned(printer: impl Into<String>) -> Self {
        let printer = printer.into();
        Self {
            success: true,
            message: format!("Assigned to {printer}"),
            printer_name: Some(printer),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            success: false,
            printer_name: None,
            message: message.into(),
        }
    }
}

/// Snapshot of fleet-wide utilization metrics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetUtilization {
    pub total_printers: usize,
    pub idle_printers: usize,
    pub busy_printers: usize,
    pub offline_printers: usize,
    pub error_printers: usize,
    pub queued_jobs: usize,
    pub active_jobs: usize,
    pub completed_jobs: usize,
    pub failed_jobs: usize,
    pub cancelled_jobs: usize,
    /// Busy share of operable (non-offline) printers, one decimal.
    pub utilization_pct: f64,
}
