//! # kiln-orchestrator: Fleet orchestration for `Kiln`
//!
//! The orchestrator sits above the printer registry. It accepts print
//! jobs, pairs them with idle printers via a pluggable [`Selector`],
//! tracks every status transition, and handles per-printer failure with
//! retry-to-alternative-printer semantics.
//!
//! It never talks to printers directly: the registry supplies a cached
//! fleet view, and actual hardware control is the dispatcher's concern.
//! All public operations serialise on one mutex, held only across
//! in-memory mutations — events are published after the lock is
//! released, and the registry's idle query reads cached state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use kiln_adapters::PrinterRegistry;
use kiln_events::EventBus;
use kiln_types::{Event, EventType, JobId, JobStatus, Metadata};
use thiserror::Error;

mod job;
mod selector;

pub use job::{AssignmentResult, FleetUtilization, Job, SubmitRequest};
pub use selector::{DefaultSelector, Selector};

/// Result type for orchestrator operations.
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Errors from fleet orchestration.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("orchestrated job not found: {0}")]
    JobNotFound(JobId),

    #[error("job {job_id} is {actual}, expected {expected}")]
    InvalidTransition {
        job_id: JobId,
        actual: JobStatus,
        expected: JobStatus,
    },

    #[error("job {job_id} is already {status} and cannot change")]
    AlreadyTerminal { job_id: JobId, status: JobStatus },

    #[error("file_path must not be empty")]
    EmptyFilePath,
}

const NO_PRINTER_AVAILABLE: &str = "No suitable idle printer available";
const SOURCE: &str = "fleet_orchestrator";

struct State {
    jobs: HashMap<JobId, Job>,
    /// At most one active job per printer.
    printer_jobs: HashMap<String, JobId>,
}

/// Coordinates print job assignment across the printer fleet.
pub struct FleetOrchestrator {
    registry: Arc<PrinterRegistry>,
    bus: EventBus,
    selector: Box<dyn Selector>,
    state: Mutex<State>,
}

impl FleetOrchestrator {
    pub fn new(registry: Arc<PrinterRegistry>, bus: EventBus) -> Self {
        Self::with_selector(registry, bus, Box::new(DefaultSelector))
    }

    pub fn with_selector(
        registry: Arc<PrinterRegistry>,
        bus: EventBus,
        selector: Box<dyn Selector>,
    ) -> Self {
        Self {
            registry,
            bus,
            selector,
            state: Mutex::new(State {
                jobs: HashMap::new(),
                printer_jobs: HashMap::new(),
            }),
        }
    }

    fn publish(&self, event_type: EventType, data: Metadata) {
        self.bus.publish(Event::new(event_type, data, SOURCE));
    }

    // -- submission ------------------------------------------------------

    /// Creates a `Queued` job and publishes `job_submitted`.
    pub fn submit(&self, request: SubmitRequest) -> OrchestratorResult<JobId> {
        let file_path = request.file_path.trim().to_string();
        if file_path.is_empty() {
            return Err(OrchestratorError::EmptyFilePath);
        }

        let job = Job {
            id: JobId::generate(),
            file_path: file_path.clone(),
            printer_name: None,
            status: JobStatus::Queued,
            submitted_at: kiln_types::now(),
            started_at: None,
            completed_at: None,
            submitted_by: request.submitted_by.clone(),
            priority: request.priority,
            error: None,
            attempt: 0,
            max_attempts: request.max_attempts,
            preferred_printer: request.preferred_printer,
            failed_printers: Default::default(),
            metadata: request.metadata,
        };
        let job_id = job.id;

        self.state
            .lock()
            .expect("orchestrator lock poisoned")
            .jobs
            .insert(job_id, job);

        tracing::info!(
            job = %job_id,
            file = %file_path,
            submitted_by = %request.submitted_by,
            priority = request.priority,
            "job submitted"
        );
        let mut data = Metadata::new();
        data.insert("job_id".into(), serde_json::json!(job_id.to_string()));
        data.insert("file_path".into(), serde_json::json!(file_path));
        data.insert(
            "submitted_by".into(),
            serde_json::json!(request.submitted_by),
        );
        self.publish(EventType::JobSubmitted, data);
        Ok(job_id)
    }

    /// Submits and immediately attempts assignment. The job stays
    /// `Queued` when no printer is available.
    pub fn submit_and_assign(
        &self,
        request: SubmitRequest,
    ) -> OrchestratorResult<(JobId, AssignmentResult)> {
        let job_id = self.submit(request)?;
        let result = self.assign(job_id)?;
        Ok((job_id, result))
    }

    // -- assignment ------------------------------------------------------

    /// Attempts to bind a queued job to an idle printer.
    pub fn assign(&self, job_id: JobId) -> OrchestratorResult<AssignmentResult> {
        // Cached snapshot; never triggers backend I/O.
        let idle = self.registry.get_idle_printers();

        let (result, event) = {
            let mut state = self.state.lock().expect("orchestrator lock poisoned");

            // A printer whose cache entry is stale may still hold a job.
            let idle: Vec<String> = idle
                .into_iter()
                .filter(|p| !state.printer_jobs.contains_key(p))
                .collect();

            let job = state
                .jobs
                .get(&job_id)
                .ok_or(OrchestratorError::JobNotFound(job_id))?;
            if job.status != JobStatus::Queued {
                return Ok(AssignmentResult::rejected(format!(
                    "Job {job_id} is {}, only queued jobs can be assigned",
                    job.status
                )));
            }

            let Some(printer) = self.selector.select(job, &idle) else {
                return Ok(AssignmentResult::rejected(NO_PRINTER_AVAILABLE));
            };

            let job = state.jobs.get_mut(&job_id).expect("present above");
            job.printer_name = Some(printer.clone());
            job.status = JobStatus::Assigned;
            job.attempt += 1;
            let attempt = job.attempt;
            let max_attempts = job.max_attempts;
            let file_path = job.file_path.clone();
            state.printer_jobs.insert(printer.clone(), job_id);

            tracing::info!(
                job = %job_id,
                printer = %printer,
                attempt,
                max_attempts,
                "job assigned"
            );
            let mut data = Metadata::new();
            data.insert("job_id".into(), serde_json::json!(job_id.to_string()));
            data.insert("printer_name".into(), serde_json::json!(&printer));
            data.insert("file_path".into(), serde_json::json!(file_path));
            (AssignmentResult::assigned(printer), data)
        };

        self.publish(EventType::JobStarted, event);
        Ok(result)
    }

    /// Assigns all queued jobs in `(-priority, submitted_at)` order.
    ///
    /// Once the selector reports no suitable idle printer, the remaining
    /// jobs short-circuit with the same reason.
    pub fn assign_all(&self) -> Vec<AssignmentResult> {
        let mut queued: Vec<(JobId, i64, chrono::DateTime<chrono::Utc>)> = {
            let state = self.state.lock().expect("orchestrator lock poisoned");
            state
                .jobs
                .values()
                .filter(|j| j.status == JobStatus::Queued)
                .map(|j| (j.id, j.priority, j.submitted_at))
                .collect()
        };
        queued.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));

        let mut results = Vec::with_capacity(queued.len());
        let mut exhausted = false;
        for (job_id, _, _) in queued {
            if exhausted {
                results.push(AssignmentResult::rejected("No idle printers remaining"));
                continue;
            }
            match self.assign(job_id) {
                Ok(result) => {
                    if !result.success && result.message == NO_PRINTER_AVAILABLE {
                        exhausted = true;
                    }
                    results.push(result);
                }
                Err(e) => results.push(AssignmentResult::rejected(e.to_string())),
            }
        }
        results
    }

    // -- lifecycle transitions -------------------------------------------

    /// `Assigned` → `Printing`; stamps `started_at`.
    pub fn mark_printing(&self, job_id: JobId) -> OrchestratorResult<()> {
        let event = {
            let mut state = self.state.lock().expect("orchestrator lock poisoned");
            let job = state
                .jobs
                .get_mut(&job_id)
                .ok_or(OrchestratorError::JobNotFound(job_id))?;
            if job.status != JobStatus::Assigned {
                return Err(OrchestratorError::InvalidTransition {
                    job_id,
                    actual: job.status,
                    expected: JobStatus::Assigned,
                });
            }
            job.status = JobStatus::Printing;
            job.started_at = Some(kiln_types::now());

            let mut data = Metadata::new();
            data.insert("job_id".into(), serde_json::json!(job_id.to_string()));
            data.insert("printer_name".into(), serde_json::json!(&job.printer_name));
            data.insert("file_path".into(), serde_json::json!(&job.file_path));
            data
        };
        tracing::info!(job = %job_id, "job printing");
        self.publish(EventType::PrintStarted, event);
        Ok(())
    }

    /// Transitions to `Completed` and releases the printer.
    pub fn mark_completed(&self, job_id: JobId) -> OrchestratorResult<()> {
        let event = {
            let mut state = self.state.lock().expect("orchestrator lock poisoned");
            let job = state
                .jobs
                .get_mut(&job_id)
                .ok_or(OrchestratorError::JobNotFound(job_id))?;
            if job.is_terminal() {
                return Err(OrchestratorError::AlreadyTerminal {
                    job_id,
                    status: job.status,
                });
            }
            job.status = JobStatus::Completed;
            job.completed_at = Some(kiln_types::now());
            let elapsed = job.elapsed_seconds();
            let printer = job.printer_name.clone();
            let file_path = job.file_path.clone();
            Self::release_printer(&mut state, job_id);

            let mut data = Metadata::new();
            data.insert("job_id".into(), serde_json::json!(job_id.to_string()));
            data.insert("printer_name".into(), serde_json::json!(printer));
            data.insert("file_path".into(), serde_json::json!(file_path));
            data.insert("elapsed_seconds".into(), serde_json::json!(elapsed));
            data
        };
        tracing::info!(job = %job_id, "job completed");
        self.publish(EventType::JobCompleted, event);
        Ok(())
    }

    /// Records a failure. With attempts remaining the job returns to
    /// `Queued` for reassignment (the failed printer is excluded from
    /// future selection); otherwise it fails terminally.
    pub fn mark_failed(&self, job_id: JobId, reason: &str) -> OrchestratorResult<()> {
        let (event, will_retry) = {
            let mut state = self.state.lock().expect("orchestrator lock poisoned");
            let job = state
                .jobs
                .get_mut(&job_id)
                .ok_or(OrchestratorError::JobNotFound(job_id))?;
            if job.is_terminal() {
                return Err(OrchestratorError::AlreadyTerminal {
                    job_id,
                    status: job.status,
                });
            }

            let failed_printer = job.printer_name.clone();
            if let Some(printer) = &failed_printer {
                job.failed_printers.insert(printer.clone());
            }

            let will_retry = job.attempt < job.max_attempts;
            let attempt = job.attempt;
            let max_attempts = job.max_attempts;
            if will_retry {
                job.status = JobStatus::Queued;
                job.printer_name = None;
                job.error = None;
            } else {
                job.status = JobStatus::Failed;
                job.error = Some(reason.to_string());
                job.completed_at = Some(kiln_types::now());
            }
            Self::release_printer(&mut state, job_id);

            let mut data = Metadata::new();
            data.insert("job_id".into(), serde_json::json!(job_id.to_string()));
            data.insert("printer_name".into(), serde_json::json!(failed_printer));
            data.insert("error".into(), serde_json::json!(reason));
            data.insert("will_retry".into(), serde_json::json!(will_retry));
            data.insert("attempt".into(), serde_json::json!(attempt));
            data.insert("max_attempts".into(), serde_json::json!(max_attempts));
            (data, will_retry)
        };

        if will_retry {
            tracing::warn!(job = %job_id, reason, "job failed; requeued for another printer");
        } else {
            tracing::error!(job = %job_id, reason, "job permanently failed");
        }
        self.publish(EventType::JobFailed, event);
        Ok(())
    }

    /// Cancels a non-terminal job. Returns `false` when the job is
    /// already terminal (idempotent), and errors only for unknown jobs.
    ///
    /// Cancelling a `Printing` job does not halt hardware; the caller
    /// must also stop the printer.
    pub fn cancel(&self, job_id: JobId, reason: &str) -> OrchestratorResult<bool> {
        let event = {
            let mut state = self.state.lock().expect("orchestrator lock poisoned");
            let job = state
                .jobs
                .get_mut(&job_id)
                .ok_or(OrchestratorError::JobNotFound(job_id))?;
            if job.is_terminal() {
                return Ok(false);
            }
            if job.status == JobStatus::Printing {
                tracing::warn!(
                    job = %job_id,
                    printer = ?job.printer_name,
                    "cancelling a printing job; caller must also stop the printer"
                );
            }
            job.status = JobStatus::Cancelled;
            job.error = Some(format!("Cancelled: {reason}"));
            job.completed_at = Some(kiln_types::now());
            let printer = job.printer_name.clone();
            Self::release_printer(&mut state, job_id);

            let mut data = Metadata::new();
            data.insert("job_id".into(), serde_json::json!(job_id.to_string()));
            data.insert("printer_name".into(), serde_json::json!(printer));
            data.insert("reason".into(), serde_json::json!(reason));
            data
        };
        tracing::info!(job = %job_id, reason, "job cancelled");
        self.publish(EventType::JobCancelled, event);
        Ok(true)
    }

    // -- queries ---------------------------------------------------------

    pub fn get_job(&self, job_id: JobId) -> Option<Job> {
        self.state
            .lock()
            .expect("orchestrator lock poisoned")
            .jobs
            .get(&job_id)
            .cloned()
    }

    /// Jobs newest-first, optionally filtered by status and printer.
    pub fn list_jobs(
        &self,
        status: Option<JobStatus>,
        printer_name: Option<&str>,
        limit: usize,
    ) -> Vec<Job> {
        let state = self.state.lock().expect("orchestrator lock poisoned");
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| status.is_none_or(|s| j.status == s))
            .filter(|j| printer_name.is_none_or(|p| j.printer_name.as_deref() == Some(p)))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at));
        jobs.truncate(limit);
        jobs
    }

    /// Jobs currently assigned or printing.
    pub fn active_jobs(&self) -> Vec<Job> {
        let state = self.state.lock().expect("orchestrator lock poisoned");
        state
            .jobs
            .values()
            .filter(|j| j.status.is_active())
            .cloned()
            .collect()
    }

    /// The active job bound to a printer, if any.
    pub fn printer_job(&self, printer_name: &str) -> Option<Job> {
        let state = self.state.lock().expect("orchestrator lock poisoned");
        let job_id = state.printer_jobs.get(printer_name)?;
        state
            .jobs
            .get(job_id)
            .filter(|j| !j.is_terminal())
            .cloned()
    }

    pub fn job_count(&self) -> usize {
        self.state.lock().expect("orchestrator lock poisoned").jobs.len()
    }

    pub fn queued_count(&self) -> usize {
        let state = self.state.lock().expect("orchestrator lock poisoned");
        state
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Queued)
            .count()
    }

    pub fn active_count(&self) -> usize {
        let state = self.state.lock().expect("orchestrator lock poisoned");
        state.jobs.values().filter(|j| j.status.is_active()).count()
    }

    // -- fleet metrics ---------------------------------------------------

    /// Aggregates printer counts (from the registry's cache) and job
    /// counts into one utilization snapshot.
    pub fn utilization(&self) -> FleetUtilization {
        let mut util = FleetUtilization::default();

        for printer in self.registry.get_fleet_status() {
            util.total_printers += 1;
            use kiln_types::PrinterStatus as P;
            match printer.status {
                P::Idle => util.idle_printers += 1,
                P::Offline => util.offline_printers += 1,
                P::Error => util.error_printers += 1,
                // Paused, cancelling, busy, unknown: occupied for
                // utilization purposes.
                _ => util.busy_printers += 1,
            }
        }

        {
            let state = self.state.lock().expect("orchestrator lock poisoned");
            for job in state.jobs.values() {
                match job.status {
                    JobStatus::Queued => util.queued_jobs += 1,
                    JobStatus::Assigned | JobStatus::Printing => util.active_jobs += 1,
                    JobStatus::Completed => util.completed_jobs += 1,
                    JobStatus::Failed => util.failed_jobs += 1,
                    JobStatus::Cancelled => util.cancelled_jobs += 1,
                }
            }
        }

        let operable = util.total_printers.saturating_sub(util.offline_printers);
        if operable > 0 {
            util.utilization_pct =
                (util.busy_printers as f64 / operable as f64 * 1000.0).round() / 10.0;
        }
        util
    }

    // -- maintenance -----------------------------------------------------

    /// Cancels every queued job. Returns the number cancelled.
    pub fn cancel_all_queued(&self, reason: &str) -> usize {
        let queued: Vec<JobId> = {
            let state = self.state.lock().expect("orchestrator lock poisoned");
            state
                .jobs
                .values()
                .filter(|j| j.status == JobStatus::Queued)
                .map(|j| j.id)
                .collect()
        };
        let mut count = 0;
        for job_id in queued {
            if matches!(self.cancel(job_id, reason), Ok(true)) {
                count += 1;
            }
        }
        count
    }

    /// Drops terminal jobs older than `older_than_seconds` from memory.
    /// Zero purges every terminal job.
    pub fn purge_completed(&self, older_than_seconds: f64) -> usize {
        let cutoff = kiln_types::now()
            - chrono::Duration::milliseconds((older_than_seconds * 1000.0) as i64);
        let mut state = self.state.lock().expect("orchestrator lock poisoned");
        let before = state.jobs.len();
        state.jobs.retain(|_, job| {
            !(job.is_terminal() && job.completed_at.is_none_or(|t| t <= cutoff))
        });
        before - state.jobs.len()
    }

    fn release_printer(state: &mut State, job_id: JobId) {
        state.printer_jobs.retain(|_, bound| *bound != job_id);
    }
}

impl std::fmt::Debug for FleetOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FleetOrchestrator")
            .field("jobs", &self.job_count())
            .finish_non_exhaustive()
    }
}
