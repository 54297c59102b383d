//! The monitor manager: one-shot checks, background sessions, stall
//! detection, and bounded per-printer history.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use chrono::Duration as ChronoDuration;
use kiln_adapters::PrinterRegistry;
use kiln_events::EventBus;
use kiln_types::{
    detect_print_phase, Event, EventType, HealthSeverity, Metadata, MonitorStatus, SessionId,
};
use thiserror::Error;

use crate::policy::MonitorPolicy;
use crate::report::{evaluate_health, HealthReport};
use crate::session::{IssueRecord, MonitorSession, MonitorSnapshot};

/// Progress must move by more than this to count as advancing.
const STALL_EPSILON_PCT: f64 = 0.1;
/// Extra join allowance past one interval when stopping a session.
const JOIN_GRACE: Duration = Duration::from_secs(5);

/// Result type for health-monitor operations.
pub type HealthResult<T> = Result<T, HealthError>;

/// Errors from the health monitor.
#[derive(Debug, Error)]
pub enum HealthError {
    #[error("printer not found: {0:?}")]
    PrinterNotFound(String),

    #[error("printer {0:?} already has an active monitoring session")]
    AlreadyMonitoring(String),

    #[error("no monitoring session found for {0:?}")]
    SessionNotFound(String),

    #[error("session {session_id} is not actively monitoring (status: {status})")]
    SessionNotActive {
        session_id: SessionId,
        status: MonitorStatus,
    },

    #[error("confidence must be within 0.0..=1.0, got {0}")]
    InvalidConfidence(f64),
}

/// Callback invoked with each report produced by a session.
pub type ReportCallback = Arc<dyn Fn(&HealthReport) + Send + Sync>;

#[derive(Debug)]
struct StallTracker {
    last_progress: Option<f64>,
    /// Seconds on the monitor's monotonic clock when progress last moved.
    last_change_s: f64,
    stalled: bool,
}

type StopSignal = Arc<(Mutex<bool>, Condvar)>;

struct ActiveMonitor {
    session_id: SessionId,
    stop: StopSignal,
    handle: Option<std::thread::JoinHandle<()>>,
    interval: Duration,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<SessionId, MonitorSession>,
    monitors: HashMap<String, ActiveMonitor>,
    history: HashMap<String, Vec<HealthReport>>,
    stall: HashMap<SessionId, StallTracker>,
    last_session_by_printer: HashMap<String, SessionId>,
}

/// Manages health checks and monitoring sessions for the fleet.
///
/// Cheap to clone; clones share state. At most one session per printer
/// at any time, enforced under the manager's mutex.
#[derive(Clone)]
pub struct HealthMonitor {
    registry: Arc<PrinterRegistry>,
    bus: EventBus,
    defaults: MonitorPolicy,
    epoch: Instant,
    inner: Arc<Mutex<Inner>>,
}

impl HealthMonitor {
    pub fn new(registry: Arc<PrinterRegistry>, bus: EventBus, defaults: MonitorPolicy) -> Self {
        Self {
            registry,
            bus,
            defaults,
            epoch: Instant::now(),
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    fn now_s(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    // -- one-shot check --------------------------------------------------

    /// Samples one printer and evaluates every applicable metric.
    ///
    /// The report is appended to the printer's bounded history.
    pub fn check_health(&self, printer_name: &str) -> HealthResult<HealthReport> {
        let adapter = self
            .registry
            .get(printer_name)
            .ok_or_else(|| HealthError::PrinterNotFound(printer_name.to_string()))?;

        // Adapter I/O with no monitor lock held.
        let state = adapter.get_state();
        let progress = adapter.get_job().ok();
        let snapshot_ok = if adapter.capabilities().can_snapshot {
            Some(matches!(adapter.get_snapshot(), Ok(Some(_))))
        } else {
            None
        };

        let report = evaluate_health(
            printer_name,
            &state,
            progress.as_ref(),
            snapshot_ok,
            &self.defaults,
        );
        self.append_history(printer_name, report.clone());
        Ok(report)
    }

    fn append_history(&self, printer_name: &str, report: HealthReport) {
        let cutoff = kiln_types::now()
            - ChronoDuration::hours(self.defaults.history_max_hours as i64);
        let mut inner = self.inner.lock().expect("health monitor lock poisoned");
        let history = inner.history.entry(printer_name.to_string()).or_default();
        history.push(report);
        history.retain(|r| r.checked_at >= cutoff);
    }

    /// Reports for a printer within the trailing window, oldest first.
    pub fn health_history(&self, printer_name: &str, hours: f64) -> Vec<HealthReport> {
        let cutoff = kiln_types::now()
            - ChronoDuration::milliseconds((hours * 3_600_000.0) as i64);
        let inner = self.inner.lock().expect("health monitor lock poisoned");
        inner
            .history
            .get(printer_name)
            .map(|reports| {
                reports
                    .iter()
                    .filter(|r| r.checked_at >= cutoff)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    // -- sessions --------------------------------------------------------

    /// Starts background monitoring for a printer.
    ///
    /// After the policy's initial delay the session runs `check_count`
    /// checks, one per `interval`, unless stopped earlier.
    pub fn start_monitoring(
        &self,
        printer_name: &str,
        interval: Duration,
        job_id: Option<String>,
        policy: Option<MonitorPolicy>,
        callback: Option<ReportCallback>,
    ) -> HealthResult<SessionId> {
        if !self.registry.contains(printer_name) {
            return Err(HealthError::PrinterNotFound(printer_name.to_string()));
        }

        let session = MonitorSession::new(
            printer_name,
            job_id,
            policy.unwrap_or_else(|| self.defaults.clone()),
        );
        let session_id = session.session_id;
        let stop: StopSignal = Arc::new((Mutex::new(false), Condvar::new()));

        {
            let mut inner = self.inner.lock().expect("health monitor lock poisoned");
            if inner.monitors.contains_key(printer_name) {
                return Err(HealthError::AlreadyMonitoring(printer_name.to_string()));
            }
            inner.sessions.insert(session_id, session);
            inner.stall.insert(
                session_id,
                StallTracker {
                    last_progress: None,
                    last_change_s: self.now_s(),
                    stalled: false,
                },
            );
            inner
                .last_session_by_printer
                .insert(printer_name.to_string(), session_id);

            let monitor = self.clone();
            let printer = printer_name.to_string();
            let thread_stop = Arc::clone(&stop);
            let handle = std::thread::Builder::new()
                .name(format!("kiln-health-{printer_name}"))
                .spawn(move || {
                    monitor.monitor_loop(session_id, &printer, interval, &thread_stop, callback);
                })
                .expect("failed to spawn health monitor thread");

            inner.monitors.insert(
                printer_name.to_string(),
                ActiveMonitor {
                    session_id,
                    stop,
                    handle: Some(handle),
                    interval,
                },
            );
        }

        tracing::info!(
            printer = printer_name,
            session = %session_id,
            interval_s = interval.as_secs_f64(),
            "health monitoring started"
        );
        Ok(session_id)
    }

    /// Stops monitoring for a printer and returns the final session.
    ///
    /// Idempotent: a printer whose session already ended returns that
    /// session's final snapshot; a printer never monitored is an error.
    pub fn stop_monitoring(&self, printer_name: &str) -> HealthResult<MonitorSession> {
        let monitor = {
            let mut inner = self.inner.lock().expect("health monitor lock poisoned");
            inner.monitors.remove(printer_name)
        };

        let Some(mut monitor) = monitor else {
            // Already stopped (or never started).
            let inner = self.inner.lock().expect("health monitor lock poisoned");
            let session_id = inner
                .last_session_by_printer
                .get(printer_name)
                .copied()
                .ok_or_else(|| HealthError::SessionNotFound(printer_name.to_string()))?;
            return Ok(inner.sessions[&session_id].clone());
        };

        // Signal, then wait out the loop's current sleep plus grace.
        {
            let (lock, cvar) = &*monitor.stop;
            *lock.lock().expect("stop flag lock poisoned") = true;
            cvar.notify_all();
        }
        if let Some(handle) = monitor.handle.take() {
            let deadline = Instant::now() + monitor.interval + JOIN_GRACE;
            while !handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(5));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                tracing::warn!(
                    printer = printer_name,
                    "monitor thread did not stop within the join window; detaching"
                );
            }
        }

        let mut inner = self.inner.lock().expect("health monitor lock poisoned");
        inner.stall.remove(&monitor.session_id);
        let session = inner
            .sessions
            .get_mut(&monitor.session_id)
            .expect("session exists for active monitor");
        session.finish(MonitorStatus::Completed);
        tracing::info!(printer = printer_name, session = %monitor.session_id, "health monitoring stopped");
        Ok(session.clone())
    }

    pub fn get_session(&self, session_id: SessionId) -> HealthResult<MonitorSession> {
        let inner = self.inner.lock().expect("health monitor lock poisoned");
        inner
            .sessions
            .get(&session_id)
            .cloned()
            .ok_or_else(|| HealthError::SessionNotFound(session_id.to_string()))
    }

    pub fn list_sessions(
        &self,
        printer_name: Option<&str>,
        status: Option<MonitorStatus>,
    ) -> Vec<MonitorSession> {
        let inner = self.inner.lock().expect("health monitor lock poisoned");
        let mut sessions: Vec<MonitorSession> = inner
            .sessions
            .values()
            .filter(|s| printer_name.is_none_or(|p| s.printer_name == p))
            .filter(|s| status.is_none_or(|st| s.status == st))
            .cloned()
            .collect();
        sessions.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        sessions
    }

    /// Appends a caller-supplied snapshot to an active session and runs
    /// stall detection on its completion value.
    pub fn capture_snapshot(
        &self,
        session_id: SessionId,
        completion_pct: Option<f64>,
        hotend: (Option<f64>, Option<f64>),
        bed: (Option<f64>, Option<f64>),
        image_b64: Option<String>,
        metadata: Metadata,
    ) -> HealthResult<MonitorSnapshot> {
        let pct = completion_pct.unwrap_or(0.0);
        let is_heating = matches!(
            (hotend.0, hotend.1),
            (Some(actual), Some(target)) if actual < target - 10.0
        );

        let mut snapshot = MonitorSnapshot {
            timestamp: kiln_types::now(),
            printer_name: String::new(),
            phase: detect_print_phase(Some(pct), is_heating),
            completion_pct: pct,
            hotend_temp: hotend.0,
            hotend_target: hotend.1,
            bed_temp: bed.0,
            bed_target: bed.1,
            image_b64,
            metadata,
        };

        {
            let mut inner = self.inner.lock().expect("health monitor lock poisoned");
            let session = inner
                .sessions
                .get_mut(&session_id)
                .ok_or_else(|| HealthError::SessionNotFound(session_id.to_string()))?;
            if session.status != MonitorStatus::Monitoring {
                return Err(HealthError::SessionNotActive {
                    session_id,
                    status: session.status,
                });
            }
            snapshot.printer_name = session.printer_name.clone();
            session.snapshots.push(snapshot.clone());
        }

        let now_s = self.now_s();
        if let Some(alert) = self.check_stall_at(session_id, pct, now_s) {
            let mut inner = self.inner.lock().expect("health monitor lock poisoned");
            if let Some(session) = inner.sessions.get_mut(&session_id) {
                if let Some(last) = session.snapshots.last_mut() {
                    last.metadata
                        .insert("stall_alert".into(), serde_json::json!(alert));
                }
            }
        }

        Ok(snapshot)
    }

    /// Records a detected issue. Auto-pause triggers when the session
    /// policy allows it and the confidence clears the threshold.
    pub fn report_issue(
        &self,
        session_id: SessionId,
        issue_type: &str,
        confidence: f64,
        detail: Option<String>,
    ) -> HealthResult<IssueRecord> {
        if !(0.0..=1.0).contains(&confidence) {
            return Err(HealthError::InvalidConfidence(confidence));
        }

        let mut inner = self.inner.lock().expect("health monitor lock poisoned");
        let session = inner
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| HealthError::SessionNotFound(session_id.to_string()))?;
        if session.status != MonitorStatus::Monitoring {
            return Err(HealthError::SessionNotActive {
                session_id,
                status: session.status,
            });
        }

        let auto_pause = session.policy.auto_pause_on_failure
            && confidence >= session.policy.failure_confidence_threshold;
        let issue = IssueRecord {
            issue_type: issue_type.to_string(),
            confidence,
            detail,
            auto_pause_triggered: auto_pause,
            reported_at: kiln_types::now(),
            snapshot_count: session.snapshots.len(),
        };
        session.issues.push(issue.clone());

        if auto_pause {
            tracing::warn!(
                session = %session_id,
                issue = issue_type,
                confidence,
                "auto-pause flagged"
            );
        }
        Ok(issue)
    }

    // -- background loop -------------------------------------------------

    fn monitor_loop(
        &self,
        session_id: SessionId,
        printer_name: &str,
        interval: Duration,
        stop: &StopSignal,
        callback: Option<ReportCallback>,
    ) {
        let (delay, check_count, auto_pause) = {
            let inner = self.inner.lock().expect("health monitor lock poisoned");
            let Some(session) = inner.sessions.get(&session_id) else {
                return;
            };
            (
                Duration::from_secs(session.policy.check_delay_seconds),
                session.policy.check_count,
                session.policy.auto_pause_on_failure,
            )
        };

        if wait_stop(stop, delay) {
            self.finalize_session(session_id, printer_name, MonitorStatus::Completed);
            return;
        }

        for check in 0..check_count {
            if stopped(stop) {
                break;
            }

            match self.check_health(printer_name) {
                Ok(mut report) => {
                    report.session_id = Some(session_id);
                    let progress = report
                        .metric("print_progress")
                        .map(|m| m.current);
                    let critical = report.overall_status == HealthSeverity::Critical;
                    let critical_metrics: Vec<String> = report
                        .metrics
                        .iter()
                        .filter(|m| m.severity == HealthSeverity::Critical)
                        .map(|m| m.name.clone())
                        .collect();

                    {
                        let mut inner =
                            self.inner.lock().expect("health monitor lock poisoned");
                        let Some(session) = inner.sessions.get_mut(&session_id) else {
                            return;
                        };
                        if session.status != MonitorStatus::Monitoring {
                            return;
                        }
                        session.health_reports.push(report.clone());
                    }

                    if let Some(cb) = &callback {
                        // Callback failures are the callback's problem.
                        let result = std::panic::catch_unwind(
                            std::panic::AssertUnwindSafe(|| cb(&report)),
                        );
                        if result.is_err() {
                            tracing::warn!(
                                printer = printer_name,
                                "health monitor callback panicked"
                            );
                        }
                    }

                    if let Some(pct) = progress {
                        let now_s = self.now_s();
                        if self.check_stall_at(session_id, pct, now_s).is_some() {
                            // Session finished as stalled inside the check.
                            self.cleanup_monitor_entry(session_id, printer_name);
                            return;
                        }
                    }

                    if critical && auto_pause {
                        let detail = format!(
                            "Critical health status on {printer_name}: {}",
                            critical_metrics.join(", ")
                        );
                        let _ = self.report_issue(
                            session_id,
                            "health_critical",
                            1.0,
                            Some(detail),
                        );
                    }
                }
                Err(HealthError::PrinterNotFound(_)) => {
                    tracing::error!(
                        printer = printer_name,
                        "printer disappeared from registry; stopping monitor"
                    );
                    self.finalize_session(session_id, printer_name, MonitorStatus::Failed);
                    return;
                }
                Err(e) => {
                    tracing::error!(printer = printer_name, error = %e, "health check failed");
                }
            }

            if check + 1 < check_count && wait_stop(stop, interval) {
                break;
            }
        }

        self.finalize_session(session_id, printer_name, MonitorStatus::Completed);
    }

    fn finalize_session(&self, session_id: SessionId, printer_name: &str, status: MonitorStatus) {
        let mut inner = self.inner.lock().expect("health monitor lock poisoned");
        if let Some(session) = inner.sessions.get_mut(&session_id) {
            session.finish(status);
        }
        if inner
            .monitors
            .get(printer_name)
            .is_some_and(|m| m.session_id == session_id)
        {
            inner.monitors.remove(printer_name);
        }
        inner.stall.remove(&session_id);
    }

    fn cleanup_monitor_entry(&self, session_id: SessionId, printer_name: &str) {
        let mut inner = self.inner.lock().expect("health monitor lock poisoned");
        if inner
            .monitors
            .get(printer_name)
            .is_some_and(|m| m.session_id == session_id)
        {
            inner.monitors.remove(printer_name);
        }
        inner.stall.remove(&session_id);
    }

    // -- stall detection -------------------------------------------------

    /// Updates the session's stall tracker with a progress sample.
    ///
    /// Movement beyond [`STALL_EPSILON_PCT`] resets the tracker; once
    /// unchanged progress outlasts the policy timeout, the session is
    /// marked stalled, an alert event is published, and the alert data
    /// is returned. A zero timeout disables detection entirely.
    fn check_stall_at(
        &self,
        session_id: SessionId,
        completion_pct: f64,
        now_s: f64,
    ) -> Option<Metadata> {
        let alert = {
            let mut inner = self.inner.lock().expect("health monitor lock poisoned");
            let inner = &mut *inner;
            let tracker = inner.stall.get_mut(&session_id)?;
            if tracker.stalled {
                return None;
            }
            let session = inner.sessions.get_mut(&session_id)?;
            let timeout_s = session.policy.stall_timeout_seconds;
            if timeout_s == 0 {
                return None;
            }

            let moved = tracker
                .last_progress
                .is_none_or(|last| (completion_pct - last).abs() > STALL_EPSILON_PCT);
            if moved {
                tracker.last_progress = Some(completion_pct);
                tracker.last_change_s = now_s;
                return None;
            }

            let stall_duration = now_s - tracker.last_change_s;
            if stall_duration <= timeout_s as f64 {
                return None;
            }

            tracker.stalled = true;
            session.finish(MonitorStatus::Stalled);

            let mut alert = Metadata::new();
            alert.insert("alert_type".into(), serde_json::json!("stall"));
            alert.insert(
                "printer_name".into(),
                serde_json::json!(session.printer_name),
            );
            alert.insert(
                "session_id".into(),
                serde_json::json!(session_id.to_string()),
            );
            alert.insert("completion_pct".into(), serde_json::json!(completion_pct));
            alert.insert(
                "stall_duration_seconds".into(),
                serde_json::json!((stall_duration * 10.0).round() / 10.0),
            );
            alert.insert("stall_timeout".into(), serde_json::json!(timeout_s));
            alert.insert(
                "message".into(),
                serde_json::json!(format!(
                    "Print appears stalled at {completion_pct:.1}% for {stall_duration:.0}s \
                     on printer {:?}. Check the printer or cancel the job.",
                    session.printer_name
                )),
            );

            session.issues.push(IssueRecord {
                issue_type: "stall_detected".into(),
                confidence: 1.0,
                detail: alert
                    .get("message")
                    .and_then(|v| v.as_str())
                    .map(ToString::to_string),
                auto_pause_triggered: session.policy.auto_pause_on_failure,
                reported_at: kiln_types::now(),
                snapshot_count: session.snapshots.len(),
            });

            tracing::warn!(
                session = %session_id,
                printer = %session.printer_name,
                completion = completion_pct,
                "stall detected"
            );
            alert
        };

        self.bus.publish(Event::new(
            EventType::PrinterError,
            alert.clone(),
            "health_monitor",
        ));
        Some(alert)
    }
}

fn stopped(stop: &StopSignal) -> bool {
    *stop.0.lock().expect("stop flag lock poisoned")
}

/// Sleeps up to `timeout`, returning early (true) if stopped.
fn wait_stop(stop: &StopSignal, timeout: Duration) -> bool {
    let (lock, cvar) = &**stop;
    let guard = lock.lock().expect("stop flag lock poisoned");
    if *guard {
        return true;
    }
    let (guard, _) = cvar
        .wait_timeout_while(guard, timeout, |stopped| !*stopped)
        .expect("stop flag lock poisoned");
    *guard
}
