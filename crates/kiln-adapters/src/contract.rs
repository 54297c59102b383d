//! The uniform capability-typed contract every printer backend implements.

use std::path::Path;

use chrono::{DateTime, Utc};
use kiln_types::{PrinterCapabilities, PrinterStatus};
use serde::{Deserialize, Serialize};

use crate::error::{AdapterError, AdapterResult};
use crate::profiles::SafetyProfile;

/// Connection flag, operational state, and temperatures.
///
/// `get_state` must never fail for transient connectivity: an unreachable
/// printer is reported as `connected = false` with [`PrinterStatus::Offline`];
/// a firmware halt as [`PrinterStatus::Error`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrinterState {
    pub connected: bool,
    pub state: PrinterStatus,
    pub tool_temp_actual: Option<f64>,
    pub tool_temp_target: Option<f64>,
    pub bed_temp_actual: Option<f64>,
    pub bed_temp_target: Option<f64>,
    /// Filament sensor reading, when the backend reports one.
    pub filament_detected: Option<bool>,
    /// Power telemetry in watts, when the backend reports it.
    pub power_watts: Option<f64>,
}

impl PrinterState {
    /// An unreachable printer.
    pub fn offline() -> Self {
        Self {
            connected: false,
            state: PrinterStatus::Offline,
            ..Self::default()
        }
    }
}

/// Progress of the active job as reported by the backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobProgress {
    pub file_name: Option<String>,
    /// Completion percentage in `0.0..=100.0`.
    pub completion: Option<f64>,
    pub time_elapsed_s: Option<u64>,
    pub time_remaining_s: Option<u64>,
}

/// A file stored on the printer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrinterFile {
    pub name: String,
    pub path: String,
    pub size_bytes: Option<u64>,
    pub date: Option<DateTime<Utc>>,
}

/// Outcome of a file upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResult {
    pub success: bool,
    pub file_name: String,
    pub message: String,
}

/// Outcome of a print-control command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrintResult {
    pub success: bool,
    pub message: String,
}

impl PrintResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }
}

/// A single updatable firmware component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirmwareComponent {
    pub name: String,
    pub current_version: String,
    pub available_version: Option<String>,
    pub component_type: String,
}

/// Firmware inventory for a printer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirmwareStatus {
    pub busy: bool,
    pub components: Vec<FirmwareComponent>,
    pub updates_available: u32,
}

/// The uniform backend contract.
///
/// Implementations serialise their own transport access, so every method
/// takes `&self` and the adapter is shared behind an `Arc`. Blocking I/O
/// happens inside the adapter; callers must not hold global locks across
/// these calls.
pub trait PrinterAdapter: Send + Sync {
    /// Backend identifier, e.g. `"octoprint"`.
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> PrinterCapabilities;

    /// The safety profile bound at construction.
    fn safety_profile(&self) -> SafetyProfile;

    /// Current connection flag, status, and temperatures. Infallible by
    /// contract; transient failures degrade to `offline`.
    fn get_state(&self) -> PrinterState;

    fn get_job(&self) -> AdapterResult<JobProgress>;

    /// Files on the printer, in the backend's native order.
    fn list_files(&self) -> AdapterResult<Vec<PrinterFile>>;

    /// Uploads a local file. Post-condition on success: the file is
    /// retrievable via `list_files`.
    fn upload_file(&self, local_path: &Path) -> AdapterResult<UploadResult>;

    fn delete_file(&self, remote_path: &str) -> AdapterResult<bool>;

    /// Precondition: printer status is `Idle`.
    fn start_print(&self, file_name: &str) -> AdapterResult<PrintResult>;

    fn cancel_print(&self) -> AdapterResult<PrintResult>;

    fn pause_print(&self) -> AdapterResult<PrintResult>;

    fn resume_print(&self) -> AdapterResult<PrintResult>;

    /// Delivers the halt signal without waiting for an acknowledgement.
    /// Success means "the signal was transmitted".
    fn emergency_stop(&self) -> AdapterResult<PrintResult>;

    /// Target clamped against the bound safety profile; out-of-range
    /// values fail before any byte is sent.
    fn set_tool_temp(&self, target: f64) -> AdapterResult<bool>;

    fn set_bed_temp(&self, target: f64) -> AdapterResult<bool>;

    fn send_gcode(&self, lines: &[String]) -> AdapterResult<bool>;

    /// JPEG snapshot bytes, or `None` when no camera is configured.
    fn get_snapshot(&self) -> AdapterResult<Option<Vec<u8>>> {
        Ok(None)
    }

    /// Live stream URL, when the backend exposes one.
    fn get_stream_url(&self) -> Option<String> {
        None
    }

    fn get_firmware_status(&self) -> AdapterResult<FirmwareStatus> {
        Err(AdapterError::unsupported(self.name(), "get_firmware_status"))
    }

    fn update_firmware(&self, _component: Option<&str>) -> AdapterResult<PrintResult> {
        Err(AdapterError::unsupported(self.name(), "update_firmware"))
    }

    fn rollback_firmware(&self, _component: &str) -> AdapterResult<PrintResult> {
        Err(AdapterError::unsupported(self.name(), "rollback_firmware"))
    }
}

/// Validates a hotend target against a profile before any transmission.
pub(crate) fn check_tool_temp(profile: &SafetyProfile, target: f64) -> AdapterResult<()> {
    if profile.hotend_temp_ok(target) {
        Ok(())
    } else {
        Err(AdapterError::TemperatureOutOfRange {
            heater: "hotend",
            requested: target,
            ceiling: profile.max_hotend_temp,
        })
    }
}

/// Validates a bed target against a profile before any transmission.
pub(crate) fn check_bed_temp(profile: &SafetyProfile, target: f64) -> AdapterResult<()> {
    if profile.bed_temp_ok(target) {
        Ok(())
    } else {
        Err(AdapterError::TemperatureOutOfRange {
            heater: "bed",
            requested: target,
            ceiling: profile.max_bed_temp,
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::profiles::default_profile;

    use super::*;

    #[test]
    fn temp_checks_reject_out_of_range_before_send() {
        let profile = default_profile();
        assert!(check_tool_temp(&profile, 0.0).is_ok());
        assert!(check_tool_temp(&profile, 300.0).is_ok());
        assert!(check_tool_temp(&profile, 300.5).is_err());
        assert!(check_tool_temp(&profile, -5.0).is_err());
        assert!(check_bed_temp(&profile, 130.0).is_ok());
        assert!(check_bed_temp(&profile, 130.1).is_err());
    }

    #[test]
    fn offline_state_shape() {
        let state = PrinterState::offline();
        assert!(!state.connected);
        assert_eq!(state.state, PrinterStatus::Offline);
        assert!(state.tool_temp_actual.is_none());
    }
}
