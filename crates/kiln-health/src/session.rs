//! Monitoring session records.

use chrono::{DateTime, Utc};
use kiln_types::{Metadata, MonitorStatus, PrintPhase, SessionId};
use serde::{Deserialize, Serialize};

use crate::policy::MonitorPolicy;
use crate::report::HealthReport;

/// A point-in-time capture of printer state during monitoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorSnapshot {
    pub timestamp: DateTime<Utc>,
    pub printer_name: String,
    pub phase: PrintPhase,
    pub completion_pct: f64,
    pub hotend_temp: Option<f64>,
    pub hotend_target: Option<f64>,
    pub bed_temp: Option<f64>,
    pub bed_target: Option<f64>,
    /// Base64-encoded webcam frame, when captured.
    pub image_b64: Option<String>,
    pub metadata: Metadata,
}

/// An issue reported against a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueRecord {
    pub issue_type: String,
    /// Reporter confidence, `0.0..=1.0`.
    pub confidence: f64,
    pub detail: Option<String>,
    /// Whether the session policy flagged the printer for pause.
    pub auto_pause_triggered: bool,
    pub reported_at: DateTime<Utc>,
    pub snapshot_count: usize,
}

/// One monitoring window for one printer.
///
/// Snapshots, reports, and issues are append-only; `status` leaves
/// `Monitoring` exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorSession {
    pub session_id: SessionId,
    pub printer_name: String,
    /// Job label this session watches; auto-generated when monitoring
    /// was started without one.
    pub job_id: String,
    pub policy: MonitorPolicy,
    pub snapshots: Vec<MonitorSnapshot>,
    pub health_reports: Vec<HealthReport>,
    pub issues: Vec<IssueRecord>,
    pub status: MonitorStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl MonitorSession {
    pub fn new(printer_name: impl Into<String>, job_id: Option<String>, policy: MonitorPolicy) -> Self {
        let session_id = SessionId::generate();
        let job_id = job_id.unwrap_or_else(|| {
            let id = session_id.to_string();
            format!("auto-{}", &id[..8])
        });
        Self {
            session_id,
            printer_name: printer_name.into(),
            job_id,
            policy,
            snapshots: Vec::new(),
            health_reports: Vec::new(),
            issues: Vec::new(),
            status: MonitorStatus::Monitoring,
            started_at: kiln_types::now(),
            ended_at: None,
        }
    }

    /// Moves to a final status. A session that already left
    /// `Monitoring` keeps its first outcome.
    pub fn finish(&mut self, status: MonitorStatus) {
        if self.status == MonitorStatus::Monitoring {
            self.status = status;
            self.ended_at = Some(kiln_types::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_job_id_derived_from_session() {
        let session = MonitorSession::new("P1", None, MonitorPolicy::default());
        assert!(session.job_id.starts_with("auto-"));
        assert_eq!(session.job_id.len(), "auto-".len() + 8);

        let named = MonitorSession::new("P1", Some("job-42".into()), MonitorPolicy::default());
        assert_eq!(named.job_id, "job-42");
    }

    #[test]
    fn finish_latches_first_outcome() {
        let mut session = MonitorSession::new("P1", None, MonitorPolicy::default());
        assert_eq!(session.status, MonitorStatus::Monitoring);

        session.finish(MonitorStatus::Stalled);
        assert_eq!(session.status, MonitorStatus::Stalled);
        let ended = session.ended_at;
        assert!(ended.is_some());

        session.finish(MonitorStatus::Completed);
        assert_eq!(session.status, MonitorStatus::Stalled);
        assert_eq!(session.ended_at, ended);
    }
}
