//! OctoPrint backend: REST with an `X-Api-Key` header.
//!
//! Idle/print status is derived from the `state.flags` object returned
//! by `/api/printer`. A connection-refused or timed-out request degrades
//! to `offline`; OctoPrint's 409 (printer not operational) also reads as
//! disconnected.

use std::io::Read;
use std::path::Path;
use std::time::Duration;

use kiln_types::{PrinterCapabilities, PrinterStatus};
use serde_json::{json, Value};

use crate::contract::{
    check_bed_temp, check_tool_temp, JobProgress, PrintResult, PrinterAdapter, PrinterFile,
    PrinterState, UploadResult,
};
use crate::error::{AdapterError, AdapterResult};
use crate::profiles::SafetyProfile;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(120);

/// Concrete [`PrinterAdapter`] for OctoPrint servers.
pub struct OctoPrintAdapter {
    base_url: String,
    api_key: String,
    profile: SafetyProfile,
    agent: ureq::Agent,
}

impl OctoPrintAdapter {
    pub fn new(host: impl Into<String>, api_key: impl Into<String>, profile: SafetyProfile) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(DEFAULT_TIMEOUT)
            .build();
        Self {
            base_url: host.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            profile,
            agent,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn get_json(&self, path: &str) -> AdapterResult<Value> {
        let response = self
            .agent
            .get(&self.url(path))
            .set("X-Api-Key", &self.api_key)
            .call()
            .map_err(map_http_error)?;
        response
            .into_json()
            .map_err(|e| AdapterError::Protocol(format!("invalid JSON from {path}: {e}")))
    }

    fn post_json(&self, path: &str, body: &Value) -> AdapterResult<()> {
        self.agent
            .post(&self.url(path))
            .set("X-Api-Key", &self.api_key)
            .send_json(body.clone())
            .map_err(map_http_error)?;
        Ok(())
    }

    // -- payload parsers ------------------------------------------------

    /// Derives the operational status from `/api/printer`'s `state.flags`.
    pub(crate) fn status_from_flags(flags: &Value) -> PrinterStatus {
        let flag = |name: &str| flags.get(name).and_then(Value::as_bool).unwrap_or(false);
        if flag("error") || flag("closedOrError") {
            PrinterStatus::Error
        } else if flag("cancelling") {
            PrinterStatus::Cancelling
        } else if flag("pausing") || flag("paused") {
            PrinterStatus::Paused
        } else if flag("printing") {
            PrinterStatus::Printing
        } else if flag("operational") {
            PrinterStatus::Idle
        } else {
            PrinterStatus::Unknown
        }
    }

    pub(crate) fn state_from_payload(payload: &Value) -> PrinterState {
        let flags = &payload["state"]["flags"];
        let temp = |heater: &str, field: &str| payload["temperature"][heater][field].as_f64();
        PrinterState {
            connected: true,
            state: Self::status_from_flags(flags),
            tool_temp_actual: temp("tool0", "actual"),
            tool_temp_target: temp("tool0", "target"),
            bed_temp_actual: temp("bed", "actual"),
            bed_temp_target: temp("bed", "target"),
            filament_detected: None,
            power_watts: None,
        }
    }

    pub(crate) fn progress_from_payload(payload: &Value) -> JobProgress {
        JobProgress {
            file_name: payload["job"]["file"]["name"]
                .as_str()
                .map(ToString::to_string),
            completion: payload["progress"]["completion"].as_f64(),
            time_elapsed_s: payload["progress"]["printTime"].as_u64(),
            time_remaining_s: payload["progress"]["printTimeLeft"].as_u64(),
        }
    }

    pub(crate) fn files_from_payload(payload: &Value) -> Vec<PrinterFile> {
        let Some(entries) = payload["files"].as_array() else {
            return Vec::new();
        };
        entries
            .iter()
            .filter(|f| f["type"].as_str() != Some("folder"))
            .map(|f| PrinterFile {
                name: f["name"].as_str().unwrap_or_default().to_string(),
                path: f["path"]
                    .as_str()
                    .or_else(|| f["name"].as_str())
                    .unwrap_or_default()
                    .to_string(),
                size_bytes: f["size"].as_u64(),
                date: f["date"]
                    .as_i64()
                    .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0)),
            })
            .collect()
    }
}

fn map_http_error(error: ureq::Error) -> AdapterError {
    match error {
        // 409 means the printer itself is not operational/connected.
        ureq::Error::Status(409, _) => {
            AdapterError::Unreachable("printer is not operational (409)".into())
        }
        ureq::Error::Status(401 | 403, _) => {
            AdapterError::Firmware("API key rejected by OctoPrint".into())
        }
        ureq::Error::Status(404, _) => AdapterError::Protocol("resource not found (404)".into()),
        ureq::Error::Status(code, response) => AdapterError::Firmware(format!(
            "OctoPrint returned HTTP {code}: {}",
            response.status_text()
        )),
        ureq::Error::Transport(t) => AdapterError::Unreachable(t.to_string()),
    }
}

impl PrinterAdapter for OctoPrintAdapter {
    fn name(&self) -> &'static str {
        "octoprint"
    }

    fn capabilities(&self) -> PrinterCapabilities {
        PrinterCapabilities {
            can_upload: true,
            can_set_temp: true,
            can_send_gcode: true,
            can_pause: true,
            can_stream: true,
            can_snapshot: true,
            can_probe_bed: false,
            can_update_firmware: false,
            can_detect_filament: false,
            supported_extensions: vec![".gcode".into(), ".gco".into(), ".g".into()],
        }
    }

    fn safety_profile(&self) -> SafetyProfile {
        self.profile.clone()
    }

    fn get_state(&self) -> PrinterState {
        match self.get_json("/api/printer") {
            Ok(payload) => Self::state_from_payload(&payload),
            Err(AdapterError::Firmware(_)) => PrinterState {
                connected: true,
                state: PrinterStatus::Error,
                ..PrinterState::default()
            },
            Err(_) => PrinterState::offline(),
        }
    }

    fn get_job(&self) -> AdapterResult<JobProgress> {
        let payload = self.get_json("/api/job")?;
        Ok(Self::progress_from_payload(&payload))
    }

    fn list_files(&self) -> AdapterResult<Vec<PrinterFile>> {
        let payload = self.get_json("/api/files/local")?;
        Ok(Self::files_from_payload(&payload))
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

        // OctoPrint expects multipart/form-data with a `file` part.
        let boundary = format!("kiln-{:016x}", std::process::id() as u64);
        let mut body = Vec::with_capacity(content.len() + 256);
        body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        body.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"file\"; filename=\"{file_name}\"\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
        body.extend_from_slice(&content);
        body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

        self.agent
            .post(&self.url("/api/files/local"))
            .set("X-Api-Key", &self.api_key)
            .set(
                "Content-Type",
                &format!("multipart/form-data; boundary={boundary}"),
            )
            .timeout(UPLOAD_TIMEOUT)
            .send_bytes(&body)
            .map_err(map_http_error)?;

        Ok(UploadResult {
            success: true,
            file_name: file_name.clone(),
            message: format!("Uploaded {file_name} to OctoPrint."),
        })
    }

    fn delete_file(&self, remote_path: &str) -> AdapterResult<bool> {
        self.agent
            .delete(&self.url(&format!("/api/files/local/{remote_path}")))
            .set("X-Api-Key", &self.api_key)
            .call()
            .map_err(map_http_error)?;
        Ok(true)
    }

    fn start_print(&self, file_name: &str) -> AdapterResult<PrintResult> {
        // Select the file with print=true, which also starts the job.
        self.post_json(
            &format!("/api/files/local/{file_name}"),
            &json!({"command": "select", "print": true}),
        )?;
        Ok(PrintResult::ok(format!("Started printing {file_name}.")))
    }

    fn cancel_print(&self) -> AdapterResult<PrintResult> {
        self.post_json("/api/job", &json!({"command": "cancel"}))?;
        Ok(PrintResult::ok("Print cancelled."))
    }

    fn pause_print(&self) -> AdapterResult<PrintResult> {
        self.post_json("/api/job", &json!({"command": "pause", "action": "pause"}))?;
        Ok(PrintResult::ok("Print paused."))
    }

    fn resume_print(&self) -> AdapterResult<PrintResult> {
        self.post_json("/api/job", &json!({"command": "pause", "action": "resume"}))?;
        Ok(PrintResult::ok("Print resumed."))
    }

    fn emergency_stop(&self) -> AdapterResult<PrintResult> {
        // M112 delivered as a raw command; transmission is the success
        // criterion, the halted firmware will not answer meaningfully.
        self.post_json("/api/printer/command", &json!({"commands": ["M112"]}))?;
        Ok(PrintResult::ok(
            "Emergency stop triggered (M112 sent). Printer will need a reset.",
        ))
    }

    fn set_tool_temp(&self, target: f64) -> AdapterResult<bool> {
        check_tool_temp(&self.profile, target)?;
        self.post_json(
            "/api/printer/tool",
            &json!({"command": "target", "targets": {"tool0": target}}),
        )?;
        Ok(true)
    }

    fn set_bed_temp(&self, target: f64) -> AdapterResult<bool> {
        check_bed_temp(&self.profile, target)?;
        self.post_json(
            "/api/printer/bed",
            &json!({"command": "target", "target": target}),
        )?;
        Ok(true)
    }

    fn send_gcode(&self, lines: &[String]) -> AdapterResult<bool> {
        self.post_json("/api/printer/command", &json!({"commands": lines}))?;
        Ok(true)
    }

    fn get_snapshot(&self) -> AdapterResult<Option<Vec<u8>>> {
        let response = match self
            .agent
            .get(&self.url("/webcam/?action=snapshot"))
            .call()
        {
            Ok(r) => r,
            Err(ureq::Error::Status(404, _)) => return Ok(None),
            Err(e) => return Err(map_http_error(e)),
        };
        let mut bytes = Vec::new();
        response
            .into_reader()
            .read_to_end(&mut bytes)
            .map_err(|e| AdapterError::Unreachable(format!("snapshot read failed: {e}")))?;
        Ok(Some(bytes))
    }

    fn get_stream_url(&self) -> Option<String> {
        Some(format!("{}/webcam/?action=stream", self.base_url))
    }
}

impl std::fmt::Debug for OctoPrintAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OctoPrintAdapter")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_from_flags_precedence() {
        let flags = json!({"operational": true, "printing": false, "paused": false, "error": false});
        assert_eq!(OctoPrintAdapter::status_from_flags(&flags), PrinterStatus::Idle);

        let flags = json!({"operational": true, "printing": true});
        assert_eq!(OctoPrintAdapter::status_from_flags(&flags), PrinterStatus::Printing);

        let flags = json!({"operational": true, "printing": true, "paused": true});
        assert_eq!(OctoPrintAdapter::status_from_flags(&flags), PrinterStatus::Paused);

        let flags = json!({"operational": true, "printing": true, "cancelling": true});
        assert_eq!(OctoPrintAdapter::status_from_flags(&flags), PrinterStatus::Cancelling);

        let flags = json!({"error": true});
        assert_eq!(OctoPrintAdapter::status_from_flags(&flags), PrinterStatus::Error);

        let flags = json!({});
        assert_eq!(OctoPrintAdapter::status_from_flags(&flags), PrinterStatus::Unknown);
    }

    #[test]
    fn state_parses_temperatures() {
        let payload = json!({
            "state": {"flags": {"operational": true}},
            "temperature": {
                "tool0": {"actual": 210.3, "target": 210.0},
                "bed": {"actual": 59.8, "target": 60.0}
            }
        });
        let state = OctoPrintAdapter::state_from_payload(&payload);
        assert!(state.connected);
        assert_eq!(state.state, PrinterStatus::Idle);
        assert_eq!(state.tool_temp_actual, Some(210.3));
        assert_eq!(state.bed_temp_target, Some(60.0));
    }

    #[test]
    fn progress_parses_job_payload() {
        let payload = json!({
            "job": {"file": {"name": "benchy.gcode"}},
            "progress": {"completion": 42.5, "printTime": 1200, "printTimeLeft": 1800}
        });
        let progress = OctoPrintAdapter::progress_from_payload(&payload);
        assert_eq!(progress.file_name.as_deref(), Some("benchy.gcode"));
        assert_eq!(progress.completion, Some(42.5));
        assert_eq!(progress.time_elapsed_s, Some(1200));
        assert_eq!(progress.time_remaining_s, Some(1800));
    }

    #[test]
    fn files_skip_folders() {
        let payload = json!({
            "files": [
                {"name": "benchy.gcode", "path": "benchy.gcode", "size": 1024, "date": 1700000000},
                {"name": "subdir", "type": "folder"},
                {"name": "cal.gco", "path": "cal.gco"}
            ]
        });
        let files = OctoPrintAdapter::files_from_payload(&payload);
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].name, "benchy.gcode");
        assert_eq!(files[0].size_bytes, Some(1024));
        assert!(files[0].date.is_some());
        assert_eq!(files[1].size_bytes, None);
    }
}
