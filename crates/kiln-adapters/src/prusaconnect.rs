//! PrusaConnect/PrusaLink backend: HTTP poll with an `X-Api-Key` header.
//!
//! The hostname alone cannot distinguish an MK3 from an MK4 or MINI, so
//! the constructor takes a model hint that selects the safety profile
//! used for diagnostics and temperature ceilings.

use std::path::Path;
use std::time::Duration;

use kiln_types::{PrinterCapabilities, PrinterStatus};
use serde_json::Value;

use crate::contract::{
    JobProgress, PrintResult, PrinterAdapter, PrinterFile, PrinterState, UploadResult,
};
use crate::error::{AdapterError, AdapterResult};
use crate::profiles::{resolve_profile, SafetyProfile};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const STORAGE: &str = "usb";

/// Concrete [`PrinterAdapter`] for PrusaLink-compatible printers.
pub struct PrusaConnectAdapter {
    base_url: String,
    api_key: Option<String>,
    profile: SafetyProfile,
    agent: ureq::Agent,
}

impl PrusaConnectAdapter {
    /// `model_hint` selects the MK3/MK4/MINI safety profile; an empty or
    /// unknown hint falls back to generic limits.
    pub fn new(host: impl Into<String>, api_key: Option<String>, model_hint: &str) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(DEFAULT_TIMEOUT).build();
        Self {
            base_url: host.into().trim_end_matches('/').to_string(),
            api_key,
            profile: resolve_profile(model_hint),
            agent,
        }
    }

    fn request(&self, method: &str, path: &str) -> ureq::Request {
        let mut request = self
            .agent
            .request(method, &format!("{}{path}", self.base_url));
        if let Some(key) = &self.api_key {
            request = request.set("X-Api-Key", key);
        }
        request
    }

    fn get_json(&self, path: &str) -> AdapterResult<Value> {
        let response = self.request("GET", path).call().map_err(map_http_error)?;
        response
            .into_json()
            .map_err(|e| AdapterError::Protocol(format!("invalid JSON from {path}: {e}")))
    }

    /// Maps PrusaLink's state strings onto the shared status enum.
    pub(crate) fn map_state(state: &str) -> PrinterStatus {
        match state.to_ascii_uppercase().as_str() {
            "IDLE" | "READY" | "FINISHED" | "STOPPED" | "OPERATIONAL" => PrinterStatus::Idle,
            "PRINTING" => PrinterStatus::Printing,
            "PAUSED" => PrinterStatus::Paused,
            "BUSY" => PrinterStatus::Busy,
            "ATTENTION" | "ERROR" => PrinterStatus::Error,
            _ => PrinterStatus::Unknown,
        }
    }

    pub(crate) fn state_from_status(payload: &Value) -> PrinterState {
        let printer = &payload["printer"];
        let state = printer["state"].as_str().unwrap_or_default();
        PrinterState {
            connected: true,
            state: Self::map_state(state),
            tool_temp_actual: printer["temp_nozzle"].as_f64(),
            tool_temp_target: printer["target_nozzle"].as_f64(),
            bed_temp_actual: printer["temp_bed"].as_f64(),
            bed_temp_target: printer["target_bed"].as_f64(),
            filament_detected: None,
            power_watts: None,
        }
    }

    pub(crate) fn progress_from_status(payload: &Value) -> JobProgress {
        let job = &payload["job"];
        JobProgress {
            file_name: job["file"]["name"]
                .as_str()
                .or_else(|| job["file"]["display_name"].as_str())
                .map(ToString::to_string),
            completion: job["progress"].as_f64(),
            time_elapsed_s: job["time_printing"].as_u64(),
            time_remaining_s: job["time_remaining"].as_u64(),
        }
    }

    pub(crate) fn files_from_listing(payload: &Value) -> Vec<PrinterFile> {
        let Some(children) = payload["children"].as_array() else {
            return Vec::new();
        };
        children
            .iter()
            .filter(|f| f["type"].as_str() == Some("PRINT_FILE"))
            .map(|f| {
                let name = f["name"].as_str().unwrap_or_default().to_string();
                PrinterFile {
                    path: format!("/{STORAGE}/{name}"),
                    name,
                    size_bytes: f["size"].as_u64(),
                    date: f["m_timestamp"]
                        .as_i64()
                        .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0)),
                }
            })
            .collect()
    }

    fn active_job_id(&self) -> AdapterResult<Option<u64>> {
        let payload = self.get_json("/api/v1/status")?;
        Ok(payload["job"]["id"].as_u64())
    }
}

fn map_http_error(error: ureq::Error) -> AdapterError {
    match error {
        ureq::Error::Status(401 | 403, _) => {
            AdapterError::Firmware("API key rejected by PrusaLink".into())
        }
        ureq::Error::Status(404, _) => AdapterError::Protocol("resource not found (404)".into()),
        ureq::Error::Status(409, _) => {
            AdapterError::Firmware("operation conflicts with printer state (409)".into())
        }
        ureq::Error::Status(code, response) => AdapterError::Firmware(format!(
            "PrusaLink returned HTTP {code}: {}",
            response.status_text()
        )),
        ureq::Error::Transport(t) => AdapterError::Unreachable(t.to_string()),
    }
}

impl PrinterAdapter for PrusaConnectAdapter {
    fn name(&self) -> &'static str {
        "prusaconnect"
    }

    fn capabilities(&self) -> PrinterCapabilities {
        PrinterCapabilities {
            can_upload: true,
            can_set_temp: false,
            can_send_gcode: false,
            can_pause: true,
            can_stream: false,
            can_snapshot: false,
            can_probe_bed: false,
            can_update_firmware: false,
            can_detect_filament: false,
            supported_extensions: vec![".gcode".into(), ".bgcode".into()],
        }
    }

    fn safety_profile(&self) -> SafetyProfile {
        self.profile.clone()
    }

    fn get_state(&self) -> PrinterState {
        match self.get_json("/api/v1/status") {
            Ok(payload) => Self::state_from_status(&payload),
            Err(AdapterError::Firmware(_)) => PrinterState {
                connected: true,
                state: PrinterStatus::Error,
                ..PrinterState::default()
            },
            Err(_) => PrinterState::offline(),
        }
    }

    fn get_job(&self) -> AdapterResult<JobProgress> {
        let payload = self.get_json("/api/v1/status")?;
        Ok(Self::progress_from_status(&payload))
    }

    fn list_files(&self) -> AdapterResult<Vec<PrinterFile>> {
        let payload = self.get_json(&format!("/api/v1/files/{STORAGE}"))?;
        Ok(Self::files_from_listing(&payload))
    }

    fn upload_file(&self, local_path: &Path) -> AdapterResult<UploadResult> {
        if !local_path.is_file() {
            return Err(AdapterError::FileNotFound(local_path.display().to_string()));
        }
        let content = std::fs::read(local_path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::PermissionDenied {
                AdapterError::PermissionDenied(local_path.display().to_string())
            } else {
                AdapterError::Unreachable(format!("error reading {}: {e}", local_path.display()))
            }
        })?;
        let file_name = local_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        self.request("PUT", &format!("/api/v1/files/{STORAGE}/{file_name}"))
            .set("Content-Type", "application/octet-stream")
            .set("Overwrite", "?1")
            .send_bytes(&content)
            .map_err(map_http_error)?;

        Ok(UploadResult {
            success: true,
            file_name: file_name.clone(),
            message: format!("Uploaded {file_name} to {STORAGE} storage."),
        })
    }

    fn delete_file(&self, remote_path: &str) -> AdapterResult<bool> {
        let path = remote_path.trim_start_matches('/');
        let path = path.strip_prefix(&format!("{STORAGE}/")).unwrap_or(path);
        self.request("DELETE", &format!("/api/v1/files/{STORAGE}/{path}"))
            .call()
            .map_err(map_http_error)?;
        Ok(true)
    }

    fn start_print(&self, file_name: &str) -> AdapterResult<PrintResult> {
        let name = file_name.trim_start_matches('/');
        let name = name.strip_prefix(&format!("{STORAGE}/")).unwrap_or(name);
        self.request("POST", &format!("/api/v1/files/{STORAGE}/{name}"))
            .call()
            .map_err(map_http_error)?;
        Ok(PrintResult::ok(format!("Started printing {name}.")))
    }

    fn cancel_print(&self) -> AdapterResult<PrintResult> {
        let Some(job_id) = self.active_job_id()? else {
            return Err(AdapterError::Firmware("no active job to cancel".into()));
        };
        self.request("DELETE", &format!("/api/v1/job/{job_id}"))
            .call()
            .map_err(map_http_error)?;
        Ok(PrintResult::ok("Print cancelled."))
    }

    fn pause_print(&self) -> AdapterResult<PrintResult> {
        let Some(job_id) = self.active_job_id()? else {
            return Err(AdapterError::Firmware("no active job to pause".into()));
        };
        self.request("PUT", &format!("/api/v1/job/{job_id}/pause"))
            .call()
            .map_err(map_http_error)?;
        Ok(PrintResult::ok("Print paused."))
    }

    fn resume_print(&self) -> AdapterResult<PrintResult> {
        let Some(job_id) = self.active_job_id()? else {
            return Err(AdapterError::Firmware("no paused job to resume".into()));
        };
        self.request("PUT", &format!("/api/v1/job/{job_id}/resume"))
            .call()
            .map_err(map_http_error)?;
        Ok(PrintResult::ok("Print resumed."))
    }

    fn emergency_stop(&self) -> AdapterResult<PrintResult> {
        // PrusaLink exposes no firmware-level halt; stopping the job is
        // the strongest remote action. Transmit and return.
        match self.active_job_id()? {
            Some(job_id) => {
                self.request("DELETE", &format!("/api/v1/job/{job_id}"))
                    .call()
                    .map_err(map_http_error)?;
                Ok(PrintResult::ok(
                    "Emergency stop transmitted (job stopped). Check the printer.",
                ))
            }
            None => Ok(PrintResult::ok("No active job; nothing to stop.")),
        }
    }

    fn set_tool_temp(&self, _target: f64) -> AdapterResult<bool> {
        Err(AdapterError::unsupported(self.name(), "set_tool_temp"))
    }

    fn set_bed_temp(&self, _target: f64) -> AdapterResult<bool> {
        Err(AdapterError::unsupported(self.name(), "set_bed_temp"))
    }

    fn send_gcode(&self, _lines: &[String]) -> AdapterResult<bool> {
        Err(AdapterError::unsupported(self.name(), "send_gcode"))
    }
}

impl std::fmt::Debug for PrusaConnectAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrusaConnectAdapter")
            .field("base_url", &self.base_url)
            .field("profile", &self.profile.id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use test_case::test_case;

    use super::*;

    #[test_case("IDLE" => PrinterStatus::Idle)]
    #[test_case("READY" => PrinterStatus::Idle)]
    #[test_case("FINISHED" => PrinterStatus::Idle)]
    #[test_case("PRINTING" => PrinterStatus::Printing)]
    #[test_case("PAUSED" => PrinterStatus::Paused)]
    #[test_case("BUSY" => PrinterStatus::Busy)]
    #[test_case("ATTENTION" => PrinterStatus::Error)]
    #[test_case("printing" => PrinterStatus::Printing ; "case insensitive")]
    #[test_case("???" => PrinterStatus::Unknown)]
    fn state_mapping(state: &str) -> PrinterStatus {
        PrusaConnectAdapter::map_state(state)
    }

    #[test]
    fn model_hint_selects_profile() {
        let mk3 = PrusaConnectAdapter::new("http://mk3.local", None, "prusa-mk3s");
        assert_eq!(mk3.safety_profile().id, "prusa-mk3s");
        let mini = PrusaConnectAdapter::new("http://mini.local", None, "prusa-mini");
        assert!((mini.safety_profile().max_bed_temp - 100.0).abs() < f64::EPSILON);
        let unknown = PrusaConnectAdapter::new("http://x.local", None, "");
        assert_eq!(unknown.safety_profile().id, "generic");
    }

    #[test]
    fn status_payload_parsing() {
        let payload = json!({
            "printer": {
                "state": "PRINTING",
                "temp_nozzle": 215.0, "target_nozzle": 215.0,
                "temp_bed": 60.2, "target_bed": 60.0
            },
            "job": {
                "id": 42,
                "progress": 18.5,
                "time_printing": 300,
                "time_remaining": 1500,
                "file": {"name": "benchy.bgcode"}
            }
        });
        let state = PrusaConnectAdapter::state_from_status(&payload);
        assert_eq!(state.state, PrinterStatus::Printing);
        assert_eq!(state.tool_temp_actual, Some(215.0));

        let progress = PrusaConnectAdapter::progress_from_status(&payload);
        assert_eq!(progress.completion, Some(18.5));
        assert_eq!(progress.file_name.as_deref(), Some("benchy.bgcode"));
        assert_eq!(progress.time_remaining_s, Some(1500));
    }

    #[test]
    fn file_listing_filters_print_files() {
        let payload = json!({
            "children": [
                {"name": "benchy.bgcode", "type": "PRINT_FILE", "size": 4096, "m_timestamp": 1700000000},
                {"name": "nested", "type": "FOLDER"}
            ]
        });
        let files = PrusaConnectAdapter::files_from_listing(&payload);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "benchy.bgcode");
        assert_eq!(files[0].path, "/usb/benchy.bgcode");
    }
}
