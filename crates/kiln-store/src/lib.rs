//! # kiln-store: Persistence seams for `Kiln`
//!
//! Durable storage is an injected collaborator: this crate defines the
//! row shapes and traits the rest of the system writes through
//! ([`JobStore`], [`EventSink`], [`AuditSink`]) plus an in-memory
//! implementation used in tests and in deployments that do not attach a
//! database.
//!
//! Writes through these traits are best-effort from the caller's point
//! of view: a failing sink is logged, never allowed to abort the
//! operation that produced the record.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use kiln_types::{Event, JobId, JobStatus, Metadata, SafetyLevel};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors from a persistence backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend unavailable: {0}")]
    Unavailable(String),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Persisted job record.
///
/// `priority` and `attempt` are first-class columns; every save writes
/// them and every query returns them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRow {
    pub id: JobId,
    pub file_path: String,
    pub printer_name: Option<String>,
    pub status: JobStatus,
    pub priority: i64,
    pub attempt: u32,
    pub max_attempts: u32,
    pub submitted_by: String,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Persisted audit entry. Immutable once appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRow {
    pub timestamp: DateTime<Utc>,
    pub tool_name: String,
    pub safety_level: SafetyLevel,
    pub action: String,
    pub printer_name: Option<String>,
    pub details: Metadata,
}

/// Upsert-style storage for job records.
pub trait JobStore: Send + Sync {
    fn save_job(&self, row: &JobRow) -> StoreResult<()>;

    fn get_job(&self, id: JobId) -> StoreResult<Option<JobRow>>;

    /// Jobs newest-first, optionally filtered by status.
    fn list_jobs(&self, status: Option<JobStatus>, limit: usize) -> StoreResult<Vec<JobRow>>;
}

/// Append-only storage for published events.
pub trait EventSink: Send + Sync {
    fn append_event(&self, event: &Event) -> StoreResult<()>;
}

/// Append-only storage for audit entries.
pub trait AuditSink: Send + Sync {
    fn append_audit(&self, row: &AuditRow) -> StoreResult<()>;
}

/// In-memory store backing all three traits.
///
/// Suitable for tests and database-less deployments; contents vanish
/// with the process.
#[derive(Default)]
pub struct MemoryStore {
    jobs: Mutex<HashMap<JobId, JobRow>>,
    events: Mutex<Vec<Event>>,
    audits: Mutex<Vec<AuditRow>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Events appended so far, oldest first.
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().expect("store lock poisoned").clone()
    }

    /// Audit rows appended so far, oldest first.
    pub fn audits(&self) -> Vec<AuditRow> {
        self.audits.lock().expect("store lock poisoned").clone()
    }
}

impl JobStore for MemoryStore {
    fn save_job(&self, row: &JobRow) -> StoreResult<()> {
        self.jobs
            .lock()
            .expect("store lock poisoned")
            .insert(row.id, row.clone());
        Ok(())
    }

    fn get_job(&self, id: JobId) -> StoreResult<Option<JobRow>> {
        Ok(self.jobs.lock().expect("store lock poisoned").get(&id).cloned())
    }

    fn list_jobs(&self, status: Option<JobStatus>, limit: usize) -> StoreResult<Vec<JobRow>> {
        let jobs = self.jobs.lock().expect("store lock poisoned");
        let mut rows: Vec<JobRow> = jobs
            .values()
            .filter(|row| status.is_none_or(|s| row.status == s))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at));
        rows.truncate(limit);
        Ok(rows)
    }
}

impl EventSink for MemoryStore {
    fn append_event(&self, event: &Event) -> StoreResult<()> {
        self.events
            .lock()
            .expect("store lock poisoned")
            .push(event.clone());
        Ok(())
    }
}

impl AuditSink for MemoryStore {
    fn append_audit(&self, row: &AuditRow) -> StoreResult<()> {
        self.audits
            .lock()
            .expect("store lock poisoned")
            .push(row.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use kiln_types::EventType;

    use super::*;

    fn row(status: JobStatus, submitted_at: DateTime<Utc>) -> JobRow {
        JobRow {
            id: JobId::generate(),
            file_path: "benchy.gcode".into(),
            printer_name: None,
            status,
            priority: 0,
            attempt: 0,
            max_attempts: 3,
            submitted_by: "test".into(),
            submitted_at,
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    #[test]
    fn save_is_upsert() {
        let store = MemoryStore::new();
        let mut job = row(JobStatus::Queued, Utc::now());
        store.save_job(&job).unwrap();

        job.status = JobStatus::Completed;
        job.attempt = 2;
        store.save_job(&job).unwrap();

        let loaded = store.get_job(job.id).unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Completed);
        assert_eq!(loaded.attempt, 2);
    }

    #[test]
    fn list_is_newest_first_and_filtered() {
        let store = MemoryStore::new();
        let base = Utc::now();
        let old = row(JobStatus::Completed, base - chrono::Duration::hours(2));
        let mid = row(JobStatus::Failed, base - chrono::Duration::hours(1));
        let new = row(JobStatus::Completed, base);
        for job in [&old, &mid, &new] {
            store.save_job(job).unwrap();
        }

        let all = store.list_jobs(None, 10).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].id, new.id);
        assert_eq!(all[2].id, old.id);

        let completed = store.list_jobs(Some(JobStatus::Completed), 10).unwrap();
        assert_eq!(completed.len(), 2);

        let limited = store.list_jobs(None, 1).unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].id, new.id);
    }

    #[test]
    fn event_and_audit_append_preserve_order() {
        let store = MemoryStore::new();
        store
            .append_event(&Event::new(EventType::JobSubmitted, Metadata::new(), "t"))
            .unwrap();
        store
            .append_event(&Event::new(EventType::JobCompleted, Metadata::new(), "t"))
            .unwrap();
        let events = store.events();
        assert_eq!(events[0].event_type, EventType::JobSubmitted);
        assert_eq!(events[1].event_type, EventType::JobCompleted);

        store
            .append_audit(&AuditRow {
                timestamp: Utc::now(),
                tool_name: "send_gcode".into(),
                safety_level: SafetyLevel::Confirm,
                action: "executed".into(),
                printer_name: None,
                details: Metadata::new(),
            })
            .unwrap();
        assert_eq!(store.audits().len(), 1);
    }
}
