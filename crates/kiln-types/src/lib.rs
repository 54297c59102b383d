//! # kiln-types: Core types for `Kiln`
//!
//! This crate contains shared types used across the `Kiln` system:
//! - Entity IDs ([`JobId`], [`SessionId`], [`CheckpointId`])
//! - Printer state ([`PrinterStatus`], [`PrinterCapabilities`])
//! - Job lifecycle ([`JobStatus`])
//! - Health monitoring ([`HealthSeverity`], [`MonitorStatus`], [`PrintPhase`])
//! - Recovery ([`FailureType`], [`RecoveryStrategy`])
//! - Safety classification ([`SafetyLevel`])
//! - Error taxonomy ([`ErrorCode`])
//! - Events ([`Event`], [`EventType`])

use std::fmt::{self, Display};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

mod event;

pub use event::{Event, EventType};

/// Heterogeneous metadata bag attached to jobs, events, and checkpoints.
///
/// The bag is passed through at boundaries and never introspected
/// internally.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

// ============================================================================
// Entity IDs
// ============================================================================

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generates a fresh random identifier.
            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }

            /// Parses an identifier from its canonical string form.
            pub fn parse(s: &str) -> Result<Self, uuid::Error> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

uuid_id! {
    /// Unique identifier for an orchestrated print job.
    JobId
}

uuid_id! {
    /// Unique identifier for a health monitoring session.
    SessionId
}

uuid_id! {
    /// Unique identifier for a recovery checkpoint.
    CheckpointId
}

/// Returns the current wall-clock time.
///
/// Single point of time acquisition so tests can reason about ordering.
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

// ============================================================================
// Printer state
// ============================================================================

/// Operational state reported by a printer backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PrinterStatus {
    Idle,
    Printing,
    Paused,
    Cancelling,
    Busy,
    Error,
    Offline,
    #[default]
    Unknown,
}

impl PrinterStatus {
    /// String form used in tool results and persisted rows.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Printing => "printing",
            Self::Paused => "paused",
            Self::Cancelling => "cancelling",
            Self::Busy => "busy",
            Self::Error => "error",
            Self::Offline => "offline",
            Self::Unknown => "unknown",
        }
    }

    /// Whether this state counts toward the busy side of fleet utilization.
    ///
    /// Paused, cancelling, and unknown printers are occupied from a
    /// scheduling standpoint even though nothing is extruding.
    pub fn counts_as_busy(self) -> bool {
        matches!(
            self,
            Self::Printing | Self::Paused | Self::Cancelling | Self::Busy | Self::Unknown
        )
    }
}

impl Display for PrinterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capability vector advertised by a printer backend.
///
/// The dispatcher consults capabilities before routing an operation so
/// that unsupported calls fail with `UNSUPPORTED` instead of a transport
/// error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrinterCapabilities {
    pub can_upload: bool,
    pub can_set_temp: bool,
    pub can_send_gcode: bool,
    pub can_pause: bool,
    pub can_stream: bool,
    pub can_snapshot: bool,
    pub can_probe_bed: bool,
    pub can_update_firmware: bool,
    pub can_detect_filament: bool,
    /// Lower-case file extensions accepted by the backend (with dot).
    pub supported_extensions: Vec<String>,
}

impl PrinterCapabilities {
    /// Whether the backend accepts files with the given name's extension.
    pub fn accepts_extension(&self, file_name: &str) -> bool {
        let lower = file_name.to_ascii_lowercase();
        self.supported_extensions
            .iter()
            .any(|ext| lower.ends_with(ext.as_str()))
    }
}

// ============================================================================
// Job lifecycle
// ============================================================================

/// Lifecycle states for an orchestrated print job.
///
/// `Assigned` covers the window between printer selection and print
/// start. A reassignable failure moves the job from `Assigned`/`Printing`
/// back to `Queued`; terminal states are sticky.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Assigned,
    Printing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Assigned => "assigned",
            Self::Printing => "printing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether the job has reached a final state.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether the job currently holds a printer binding.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Assigned | Self::Printing)
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Health monitoring
// ============================================================================

/// Severity level for health metric deviations.
///
/// Derives `Ord` so the overall report status is simply the maximum of
/// its member metric severities.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum HealthSeverity {
    #[default]
    Ok,
    Warning,
    Critical,
}

impl HealthSeverity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

impl Display for HealthSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a health monitoring session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorStatus {
    Monitoring,
    Completed,
    Failed,
    Aborted,
    Stalled,
}

impl MonitorStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Monitoring => "monitoring",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
            Self::Stalled => "stalled",
        }
    }

    /// A session leaves `Monitoring` exactly once.
    pub fn is_final(self) -> bool {
        !matches!(self, Self::Monitoring)
    }
}

impl Display for MonitorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operational phases during an FDM print job.
///
/// Phases are determined heuristically from completion percentage and
/// whether the printer is still heating to target temperatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PrintPhase {
    Heating,
    FirstLayer,
    Infill,
    Perimeters,
    Supports,
    TopLayers,
    Cooling,
    Idle,
    #[default]
    Unknown,
}

impl PrintPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Heating => "heating",
            Self::FirstLayer => "first_layer",
            Self::Infill => "infill",
            Self::Perimeters => "perimeters",
            Self::Supports => "supports",
            Self::TopLayers => "top_layers",
            Self::Cooling => "cooling",
            Self::Idle => "idle",
            Self::Unknown => "unknown",
        }
    }
}

impl Display for PrintPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classifies the FDM print phase from completion percentage.
///
/// Thresholds: first layer below 5 %, infill to 70 %, perimeters to 90 %,
/// top layers to completion. A heating printer reports [`PrintPhase::Heating`]
/// regardless of completion.
pub fn detect_print_phase(completion: Option<f64>, is_heating: bool) -> PrintPhase {
    if is_heating {
        return PrintPhase::Heating;
    }
    let Some(pct) = completion else {
        return PrintPhase::Unknown;
    };
    if pct < 0.0 {
        return PrintPhase::Unknown;
    }
    if pct < 5.0 {
        PrintPhase::FirstLayer
    } else if pct < 70.0 {
        PrintPhase::Infill
    } else if pct < 90.0 {
        PrintPhase::Perimeters
    } else {
        PrintPhase::TopLayers
    }
}

// ============================================================================
// Recovery
// ============================================================================

/// Classified cause of a print failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureType {
    UserCancelled,
    ThermalRunaway,
    BedAdhesionFailure,
    LayerShift,
    FirstLayerFailure,
    FilamentRunout,
    NozzleClog,
    PowerLoss,
    NetworkDisconnect,
    Timeout,
    PrinterError,
    SoftwareCrash,
}

impl FailureType {
    /// All known failure types, for exhaustive planning and tests.
    pub const ALL: [FailureType; 12] = [
        Self::UserCancelled,
        Self::ThermalRunaway,
        Self::BedAdhesionFailure,
        Self::LayerShift,
        Self::FirstLayerFailure,
        Self::FilamentRunout,
        Self::NozzleClog,
        Self::PowerLoss,
        Self::NetworkDisconnect,
        Self::Timeout,
        Self::PrinterError,
        Self::SoftwareCrash,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::UserCancelled => "user_cancelled",
            Self::ThermalRunaway => "thermal_runaway",
            Self::BedAdhesionFailure => "bed_adhesion_failure",
            Self::LayerShift => "layer_shift",
            Self::FirstLayerFailure => "first_layer_failure",
            Self::FilamentRunout => "filament_runout",
            Self::NozzleClog => "nozzle_clog",
            Self::PowerLoss => "power_loss",
            Self::NetworkDisconnect => "network_disconnect",
            Self::Timeout => "timeout",
            Self::PrinterError => "printer_error",
            Self::SoftwareCrash => "software_crash",
        }
    }

    /// Parses the snake_case form used by agent-facing tools.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|f| f.as_str() == s)
    }
}

impl Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recovery action the planner can recommend or execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    Abort,
    EmergencyStop,
    CancelAndRetry,
    PauseAndIntervene,
    ResumeFromCheckpoint,
    RestartFromBeginning,
    RetryCurrentStep,
    ManualIntervention,
}

impl RecoveryStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Abort => "abort",
            Self::EmergencyStop => "emergency_stop",
            Self::CancelAndRetry => "cancel_and_retry",
            Self::PauseAndIntervene => "pause_and_intervene",
            Self::ResumeFromCheckpoint => "resume_from_checkpoint",
            Self::RestartFromBeginning => "restart_from_beginning",
            Self::RetryCurrentStep => "retry_current_step",
            Self::ManualIntervention => "manual_intervention",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        const ALL: [RecoveryStrategy; 8] = [
            RecoveryStrategy::Abort,
            RecoveryStrategy::EmergencyStop,
            RecoveryStrategy::CancelAndRetry,
            RecoveryStrategy::PauseAndIntervene,
            RecoveryStrategy::ResumeFromCheckpoint,
            RecoveryStrategy::RestartFromBeginning,
            RecoveryStrategy::RetryCurrentStep,
            RecoveryStrategy::ManualIntervention,
        ];
        ALL.iter().copied().find(|st| st.as_str() == s)
    }
}

impl Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Safety classification
// ============================================================================

/// Safety classification of an agent-facing tool.
///
/// `Confirm` and `Emergency` tools require two-phase confirmation when
/// confirm mode is active.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum SafetyLevel {
    #[default]
    Safe,
    Caution,
    Confirm,
    Emergency,
}

impl SafetyLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Safe => "safe",
            Self::Caution => "caution",
            Self::Confirm => "confirm",
            Self::Emergency => "emergency",
        }
    }

    /// Whether confirm mode interposes a confirmation token for this level.
    pub fn requires_confirmation(self) -> bool {
        matches!(self, Self::Confirm | Self::Emergency)
    }
}

impl Display for SafetyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Error taxonomy
// ============================================================================

/// Machine-readable error codes carried in every failed tool envelope.
///
/// Retryability is a property of the code, not the call site: transient
/// transport and rate-limit conditions may be retried, everything else
/// requires a changed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Generic printer or runtime error, typically transient.
    Error,
    InternalError,
    GenerationTimeout,
    RateLimited,
    AuthError,
    ValidationError,
    InvalidArgs,
    InvalidState,
    NotFound,
    JobNotFound,
    FileNotFound,
    Unsupported,
    GcodeBlocked,
    PreflightFailed,
    SafetyEscalated,
    SafetyViolation,
    InvalidToken,
    TokenExpired,
    DiskFull,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Error => "ERROR",
            Self::InternalError => "INTERNAL_ERROR",
            Self::GenerationTimeout => "GENERATION_TIMEOUT",
            Self::RateLimited => "RATE_LIMITED",
            Self::AuthError => "AUTH_ERROR",
            Self::ValidationError => "VALIDATION_ERROR",
            Self::InvalidArgs => "INVALID_ARGS",
            Self::InvalidState => "INVALID_STATE",
            Self::NotFound => "NOT_FOUND",
            Self::JobNotFound => "JOB_NOT_FOUND",
            Self::FileNotFound => "FILE_NOT_FOUND",
            Self::Unsupported => "UNSUPPORTED",
            Self::GcodeBlocked => "GCODE_BLOCKED",
            Self::PreflightFailed => "PREFLIGHT_FAILED",
            Self::SafetyEscalated => "SAFETY_ESCALATED",
            Self::SafetyViolation => "SAFETY_VIOLATION",
            Self::InvalidToken => "INVALID_TOKEN",
            Self::TokenExpired => "TOKEN_EXPIRED",
            Self::DiskFull => "DISK_FULL",
        }
    }

    /// Whether a caller may retry the identical request.
    pub fn retryable(self) -> bool {
        matches!(
            self,
            Self::Error | Self::InternalError | Self::GenerationTimeout | Self::RateLimited
        )
    }
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test]
    fn job_id_roundtrip() {
        let id = JobId::generate();
        let parsed = JobId::parse(&id.to_string()).expect("canonical form parses");
        assert_eq!(id, parsed);
    }

    #[test]
    fn job_terminal_states_are_sticky_markers() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Assigned.is_terminal());
        assert!(!JobStatus::Printing.is_terminal());
    }

    #[test]
    fn severity_total_order() {
        assert!(HealthSeverity::Ok < HealthSeverity::Warning);
        assert!(HealthSeverity::Warning < HealthSeverity::Critical);
        let overall = [HealthSeverity::Ok, HealthSeverity::Critical, HealthSeverity::Warning]
            .into_iter()
            .max()
            .unwrap();
        assert_eq!(overall, HealthSeverity::Critical);
    }

    #[test_case(Some(0.0), false => PrintPhase::FirstLayer)]
    #[test_case(Some(4.9), false => PrintPhase::FirstLayer)]
    #[test_case(Some(5.0), false => PrintPhase::Infill)]
    #[test_case(Some(69.9), false => PrintPhase::Infill)]
    #[test_case(Some(70.0), false => PrintPhase::Perimeters)]
    #[test_case(Some(90.0), false => PrintPhase::TopLayers)]
    #[test_case(Some(100.0), false => PrintPhase::TopLayers)]
    #[test_case(Some(50.0), true => PrintPhase::Heating)]
    #[test_case(None, false => PrintPhase::Unknown)]
    #[test_case(Some(-1.0), false => PrintPhase::Unknown)]
    fn phase_detection(completion: Option<f64>, heating: bool) -> PrintPhase {
        detect_print_phase(completion, heating)
    }

    #[test]
    fn failure_type_parse_roundtrip() {
        for ft in FailureType::ALL {
            assert_eq!(FailureType::parse(ft.as_str()), Some(ft));
        }
        assert_eq!(FailureType::parse("spaghetti"), None);
    }

    #[test]
    fn retryable_codes_match_contract() {
        assert!(ErrorCode::Error.retryable());
        assert!(ErrorCode::InternalError.retryable());
        assert!(ErrorCode::RateLimited.retryable());
        assert!(!ErrorCode::AuthError.retryable());
        assert!(!ErrorCode::ValidationError.retryable());
        assert!(!ErrorCode::GcodeBlocked.retryable());
        assert!(!ErrorCode::SafetyEscalated.retryable());
        assert!(!ErrorCode::InvalidToken.retryable());
    }

    #[test]
    fn confirmation_levels() {
        assert!(!SafetyLevel::Safe.requires_confirmation());
        assert!(!SafetyLevel::Caution.requires_confirmation());
        assert!(SafetyLevel::Confirm.requires_confirmation());
        assert!(SafetyLevel::Emergency.requires_confirmation());
    }

    #[test]
    fn capability_extension_matching() {
        let caps = PrinterCapabilities {
            supported_extensions: vec![".gcode".into(), ".gco".into(), ".g".into()],
            ..PrinterCapabilities::default()
        };
        assert!(caps.accepts_extension("benchy.gcode"));
        assert!(caps.accepts_extension("BENCHY.GCO"));
        assert!(!caps.accepts_extension("benchy.stl"));
    }

    #[test]
    fn busy_classification_for_utilization() {
        assert!(PrinterStatus::Printing.counts_as_busy());
        assert!(PrinterStatus::Paused.counts_as_busy());
        assert!(PrinterStatus::Cancelling.counts_as_busy());
        assert!(!PrinterStatus::Idle.counts_as_busy());
        assert!(!PrinterStatus::Offline.counts_as_busy());
        assert!(!PrinterStatus::Error.counts_as_busy());
    }
}
