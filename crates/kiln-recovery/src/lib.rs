//! # kiln-recovery: Failure → strategy planning for `Kiln`
//!
//! Pure-policy module: given a classified [`FailureType`] and whatever
//! checkpoints exist for the job, [`RecoveryPlanner`] recommends a
//! primary [`RecoveryStrategy`], lists viable alternatives, estimates
//! wasted material, and enforces a per-job retry budget. It performs no
//! hardware I/O; executing a strategy against a printer is the caller's
//! concern.
//!
//! Checkpoints are append-only per job: a durable waypoint sufficient to
//! resume a print from a known Z height and layer.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use kiln_types::{CheckpointId, FailureType, JobId, Metadata, RecoveryStrategy};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for recovery operations.
pub type RecoveryResult<T> = Result<T, RecoveryError>;

/// Errors from the recovery planner.
#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("job {job_id} exceeded max retries ({max_retries})")]
    RetriesExceeded { job_id: JobId, max_retries: u32 },
}

/// Failures that endanger hardware or surroundings, not just the part.
pub const SAFETY_CRITICAL_FAILURES: [FailureType; 2] = [
    FailureType::ThermalRunaway,
    FailureType::BedAdhesionFailure,
];

/// Failures after which the part on the bed can no longer be saved.
pub const PRINT_COMPROMISED_FAILURES: [FailureType; 3] = [
    FailureType::LayerShift,
    FailureType::BedAdhesionFailure,
    FailureType::FirstLayerFailure,
];

/// Structured machine state captured with a checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointData {
    pub z_height_mm: f64,
    pub layer_number: u32,
    pub hotend_temp_c: f64,
    pub bed_temp_c: f64,
    pub filament_used_mm: f64,
    pub fan_speed_pct: f64,
    pub flow_rate_pct: f64,
    /// Anything else the caller wants carried along; passed through,
    /// never inspected.
    pub extra: Metadata,
}

impl Default for CheckpointData {
    fn default() -> Self {
        Self {
            z_height_mm: 0.0,
            layer_number: 0,
            hotend_temp_c: 0.0,
            bed_temp_c: 0.0,
            filament_used_mm: 0.0,
            fan_speed_pct: 0.0,
            flow_rate_pct: 100.0,
            extra: Metadata::new(),
        }
    }
}

/// A durable waypoint for one job on one printer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: CheckpointId,
    pub job_id: JobId,
    pub printer_name: String,
    pub phase: String,
    pub progress_percent: f64,
    pub data: CheckpointData,
    pub created_at: DateTime<Utc>,
}

/// Planner output for one failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendation {
    pub failure_type: FailureType,
    pub recommended_strategy: RecoveryStrategy,
    pub alternative_strategies: Vec<RecoveryStrategy>,
    pub safety_critical: bool,
    pub auto_recoverable: bool,
    /// Material assumed lost if the recommendation is followed.
    pub estimated_waste_pct: f64,
    pub risk_assessment: String,
    /// Latest checkpoint for the job, when one exists.
    pub checkpoint: Option<Checkpoint>,
}

/// Outcome of executing a strategy (bookkeeping only; no hardware here).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub job_id: JobId,
    pub strategy_used: RecoveryStrategy,
    pub resumed_from_checkpoint: bool,
    /// Progress percentage preserved by a checkpoint resume, as a proxy
    /// for print time saved. Zero for every other strategy.
    pub time_saved_pct: f64,
    pub retry_count: u32,
}

struct PlannerState {
    /// Append-only checkpoint lists, with stable job insertion order.
    checkpoints: HashMap<JobId, Vec<Checkpoint>>,
    job_order: Vec<JobId>,
    retries: HashMap<JobId, u32>,
}

/// Checkpoint registry and failure → strategy policy.
pub struct RecoveryPlanner {
    max_retries: u32,
    state: Mutex<PlannerState>,
}

impl RecoveryPlanner {
    /// Default per-job retry budget.
    pub const DEFAULT_MAX_RETRIES: u32 = 3;

    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            state: Mutex::new(PlannerState {
                checkpoints: HashMap::new(),
                job_order: Vec::new(),
                retries: HashMap::new(),
            }),
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    // -- checkpoints -----------------------------------------------------

    pub fn save_checkpoint(
        &self,
        job_id: JobId,
        printer_name: impl Into<String>,
        phase: impl Into<String>,
        progress_percent: f64,
        data: CheckpointData,
    ) -> Checkpoint {
        let checkpoint = Checkpoint {
            id: CheckpointId::generate(),
            job_id,
            printer_name: printer_name.into(),
            phase: phase.into(),
            progress_percent,
            data,
            created_at: kiln_types::now(),
        };
        let mut guard = self.state.lock().expect("recovery lock poisoned");
        let state = &mut *guard;
        let entry = state.checkpoints.entry(job_id).or_default();
        if entry.is_empty() {
            state.job_order.push(job_id);
        }
        entry.push(checkpoint.clone());
        tracing::debug!(job = %job_id, progress = progress_percent, "checkpoint saved");
        checkpoint
    }

    pub fn latest_checkpoint(&self, job_id: JobId) -> Option<Checkpoint> {
        let state = self.state.lock().expect("recovery lock poisoned");
        state.checkpoints.get(&job_id).and_then(|c| c.last().cloned())
    }

    /// All checkpoints for a job, oldest first.
    pub fn all_checkpoints(&self, job_id: JobId) -> Vec<Checkpoint> {
        let state = self.state.lock().expect("recovery lock poisoned");
        state.checkpoints.get(&job_id).cloned().unwrap_or_default()
    }

    /// Removes a job's checkpoints. Returns how many were dropped.
    pub fn clear_checkpoints(&self, job_id: JobId) -> usize {
        let mut state = self.state.lock().expect("recovery lock poisoned");
        state.job_order.retain(|id| *id != job_id);
        state.checkpoints.remove(&job_id).map_or(0, |c| c.len())
    }

    // -- planning --------------------------------------------------------

    /// Looks up the failure → strategy policy for a job.
    ///
    /// Checkpoint-dependent strategies are only listed when a checkpoint
    /// exists for the job.
    pub fn plan_recovery(&self, job_id: JobId, failure: FailureType) -> Recommendation {
        let checkpoint = self.latest_checkpoint(job_id);
        let has_cp = checkpoint.is_some();
        let cp_progress = checkpoint.as_ref().map_or(0.0, |c| c.progress_percent);

        use FailureType as F;
        use RecoveryStrategy as S;

        let (recommended, alternatives, waste, auto, risk): (
            S,
            Vec<S>,
            f64,
            bool,
            String,
        ) = match failure {
            F::UserCancelled => (
                S::Abort,
                vec![],
                cp_progress,
                false,
                "User requested cancellation; no machine risk.".into(),
            ),
            F::ThermalRunaway => (
                S::EmergencyStop,
                vec![S::Abort],
                100.0,
                false,
                "Thermal runaway: heater or thermistor fault. Cut power \
                 immediately and inspect thermistors before reuse."
                    .into(),
            ),
            F::BedAdhesionFailure => (
                S::Abort,
                vec![S::CancelAndRetry],
                100.0,
                false,
                "Part detached from the bed; continuing risks nozzle \
                 collisions and molten plastic around the hotend."
                    .into(),
            ),
            F::LayerShift => (
                S::Abort,
                vec![S::CancelAndRetry],
                100.0,
                false,
                "Layers no longer aligned; the part cannot be saved.".into(),
            ),
            F::FirstLayerFailure => (
                S::CancelAndRetry,
                vec![S::Abort],
                100.0,
                true,
                "First layer failed early; cheap to cancel and retry after \
                 releveling."
                    .into(),
            ),
            F::FilamentRunout => (
                S::PauseAndIntervene,
                Self::with_checkpoint_alts(has_cp, vec![]),
                0.0,
                false,
                "Filament exhausted; reload and resume in place.".into(),
            ),
            F::NozzleClog => (
                S::PauseAndIntervene,
                Self::with_checkpoint_alts(has_cp, vec![]),
                0.0,
                false,
                "Nozzle blocked; clear the clog before resuming.".into(),
            ),
            F::PowerLoss => {
                if let Some(cp) = &checkpoint {
                    (
                        S::ResumeFromCheckpoint,
                        vec![S::RestartFromBeginning, S::ManualIntervention],
                        100.0 - cp.progress_percent,
                        false,
                        format!(
                            "Power was lost at Z={:.2}mm (layer {}). Resuming \
                             requires the part still adhered and the nozzle \
                             clear of the surface.",
                            cp.data.z_height_mm, cp.data.layer_number
                        ),
                    )
                } else {
                    (
                        S::RestartFromBeginning,
                        vec![S::ManualIntervention],
                        100.0,
                        false,
                        "Power was lost with no checkpoint; position unknown, \
                         restart from the beginning."
                            .into(),
                    )
                }
            }
            F::NetworkDisconnect => (
                S::RetryCurrentStep,
                Self::with_checkpoint_alts(has_cp, vec![]),
                0.0,
                true,
                "Transient connectivity loss; the printer may still be \
                 printing unattended."
                    .into(),
            ),
            F::Timeout => (
                S::RetryCurrentStep,
                Self::with_checkpoint_alts(has_cp, vec![]),
                0.0,
                true,
                "Operation timed out; usually transient.".into(),
            ),
            F::PrinterError => {
                if has_cp && cp_progress > 10.0 {
                    (
                        S::ResumeFromCheckpoint,
                        vec![S::RetryCurrentStep, S::RestartFromBeginning],
                        100.0 - cp_progress,
                        false,
                        format!(
                            "Printer reported an error at {cp_progress:.1}% — enough \
                             progress to prefer resuming over restarting."
                        ),
                    )
                } else {
                    (
                        S::RetryCurrentStep,
                        vec![S::RestartFromBeginning],
                        cp_progress,
                        true,
                        "Printer reported an error early in the job; retry the \
                         failed step."
                            .into(),
                    )
                }
            }
            F::SoftwareCrash => {
                if has_cp {
                    (
                        S::ResumeFromCheckpoint,
                        vec![S::RestartFromBeginning],
                        100.0 - cp_progress,
                        true,
                        "Coordinator crashed mid-print; the printer state is \
                         recoverable from the checkpoint."
                            .into(),
                    )
                } else {
                    (
                        S::RestartFromBeginning,
                        vec![S::RetryCurrentStep],
                        100.0,
                        true,
                        "Coordinator crashed with no checkpoint recorded.".into(),
                    )
                }
            }
        };

        Recommendation {
            failure_type: failure,
            recommended_strategy: recommended,
            alternative_strategies: alternatives,
            safety_critical: Self::is_safety_critical(failure),
            auto_recoverable: auto,
            estimated_waste_pct: waste,
            risk_assessment: risk,
            checkpoint,
        }
    }

    fn with_checkpoint_alts(has_cp: bool, mut alts: Vec<RecoveryStrategy>) -> Vec<RecoveryStrategy> {
        if has_cp {
            alts.push(RecoveryStrategy::ResumeFromCheckpoint);
        }
        alts.push(RecoveryStrategy::RestartFromBeginning);
        alts
    }

    // -- execution bookkeeping ------------------------------------------

    /// Consumes one retry slot and records the outcome.
    ///
    /// Fails once the per-job counter reaches the configured maximum;
    /// [`Self::reset_retries`] reopens the budget.
    pub fn execute_recovery(
        &self,
        job_id: JobId,
        strategy: RecoveryStrategy,
    ) -> RecoveryResult<ExecutionOutcome> {
        let mut state = self.state.lock().expect("recovery lock poisoned");
        let count = state.retries.entry(job_id).or_insert(0);
        if *count >= self.max_retries {
            return Err(RecoveryError::RetriesExceeded {
                job_id,
                max_retries: self.max_retries,
            });
        }
        *count += 1;
        let retry_count = *count;
        drop(state);

        let checkpoint = self.latest_checkpoint(job_id);
        let resumed = strategy == RecoveryStrategy::ResumeFromCheckpoint && checkpoint.is_some();
        let time_saved_pct = if resumed {
            checkpoint.map_or(0.0, |c| c.progress_percent)
        } else {
            0.0
        };

        tracing::info!(
            job = %job_id,
            strategy = %strategy,
            retry = retry_count,
            "recovery executed"
        );
        Ok(ExecutionOutcome {
            success: true,
            job_id,
            strategy_used: strategy,
            resumed_from_checkpoint: resumed,
            time_saved_pct,
            retry_count,
        })
    }

    pub fn get_retry_count(&self, job_id: JobId) -> u32 {
        let state = self.state.lock().expect("recovery lock poisoned");
        state.retries.get(&job_id).copied().unwrap_or(0)
    }

    pub fn reset_retries(&self, job_id: JobId) {
        let mut state = self.state.lock().expect("recovery lock poisoned");
        state.retries.remove(&job_id);
    }

    /// Jobs that hold at least one checkpoint and still have retry
    /// budget, in first-checkpoint order.
    pub fn list_recoverable_jobs(&self) -> Vec<JobId> {
        let state = self.state.lock().expect("recovery lock poisoned");
        state
            .job_order
            .iter()
            .filter(|id| {
                state.checkpoints.get(id).is_some_and(|c| !c.is_empty())
                    && state.retries.get(id).copied().unwrap_or(0) < self.max_retries
            })
            .copied()
            .collect()
    }

    // -- classification --------------------------------------------------

    pub fn is_safety_critical(failure: FailureType) -> bool {
        SAFETY_CRITICAL_FAILURES.contains(&failure)
    }

    pub fn is_print_compromised(failure: FailureType) -> bool {
        PRINT_COMPROMISED_FAILURES.contains(&failure)
    }
}

impl Default for RecoveryPlanner {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MAX_RETRIES)
    }
}
