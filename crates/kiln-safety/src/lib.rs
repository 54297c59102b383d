//! # kiln-safety: The safety gate for `Kiln`
//!
//! No physically-consequential action reaches a printer adapter without
//! passing through this crate. The gate runs a deterministic pipeline
//! per tool invocation:
//!
//! 1. authentication (when enabled)
//! 2. per-tool rate limits over a sliding 60 s window
//! 3. circuit breaker: repeated blocks put a tool in emergency cooldown
//! 4. two-phase confirmation for destructive tools (confirm mode)
//! 5. G-code static analysis against the printer's safety profile
//! 6. pre-flight checks before print start
//! 7. audit of every terminal outcome (best-effort, never blocking)
//!
//! Stages 1–4 and 7 live in [`SafetyGate`]; G-code analysis and
//! pre-flight are free functions the dispatcher runs between gate entry
//! and the adapter call, reporting blocks back for breaker accounting.

mod audit;
mod auth;
mod classification;
mod confirm;
mod gate;
mod gcode;
mod materials;
mod preflight;
mod ratelimit;

pub use audit::{AuditLog, AuditSummary};
pub use auth::{AuthMode, AuthService};
pub use classification::{
    confirm_level_tools, rate_limits_for, safety_level_for, MAX_GCODE_BATCH, RATE_LIMITS,
};
pub use confirm::{ConfirmError, ConfirmationGate, PendingAction, CONFIRM_TOKEN_TTL_SECONDS};
pub use gate::{GateConfig, GateDecision, SafetyGate};
pub use gcode::{blocked_command_names, scan_gcode_file, validate_gcode, GcodeValidation};
pub use materials::{
    material_settings, validated_materials, LoadedMaterial, MaterialSettings, MaterialTracker,
};
pub use preflight::{run_preflight, PreflightCheck, PreflightOptions, PreflightReport};
pub use ratelimit::{RateCheck, ToolRateLimiter};
