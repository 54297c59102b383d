//! Moonraker (Klipper) backend: JSON-RPC 2.0 over WebSocket.
//!
//! Requests carry a monotonically increasing `id`; the reply with the
//! matching `id` is the response, everything else on the socket is a
//! notification and is skipped. Status is derived from Klipper's
//! `print_stats`. File uploads go over Moonraker's HTTP endpoint since
//! the WebSocket API has no transfer channel.

use std::net::TcpStream;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use kiln_types::{PrinterCapabilities, PrinterStatus};
use serde_json::{json, Value};
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message, WebSocket};

use crate::contract::{
    check_bed_temp, check_tool_temp, JobProgress, PrintResult, PrinterAdapter, PrinterFile,
    PrinterState, UploadResult,
};
use crate::error::{AdapterError, AdapterResult};
use crate::profiles::SafetyProfile;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

type Socket = WebSocket<MaybeTlsStream<TcpStream>>;

struct Inner {
    socket: Option<Socket>,
    next_id: u64,
}

/// Concrete [`PrinterAdapter`] for Moonraker/Klipper hosts.
pub struct MoonrakerAdapter {
    /// Host without scheme, e.g. `"mainsail.local"` or `"10.0.0.5:7125"`.
    host: String,
    api_key: Option<String>,
    profile: SafetyProfile,
    inner: Mutex<Inner>,
}

impl MoonrakerAdapter {
    pub fn new(
        host: impl Into<String>,
        api_key: Option<String>,
        profile: SafetyProfile,
    ) -> Self {
        let host = host
            .into()
            .trim_start_matches("http://")
            .trim_start_matches("ws://")
            .trim_end_matches('/')
            .to_string();
        Self {
            host,
            api_key,
            profile,
            inner: Mutex::new(Inner {
                socket: None,
                next_id: 1,
            }),
        }
    }

    fn ws_url(&self) -> String {
        format!("ws://{}/websocket", self.host)
    }

    fn http_url(&self, path: &str) -> String {
        format!("http://{}{path}", self.host)
    }

    fn connect(&self, inner: &mut Inner) -> AdapterResult<()> {
        if inner.socket.is_some() {
            return Ok(());
        }
        let (socket, _response) = tungstenite::connect(self.ws_url())
            .map_err(|e| AdapterError::Unreachable(format!("websocket connect failed: {e}")))?;
        if let MaybeTlsStream::Plain(stream) = socket.get_ref() {
            let _ = stream.set_read_timeout(Some(DEFAULT_TIMEOUT));
        }
        inner.socket = Some(socket);
        tracing::info!(host = %self.host, "connected to Moonraker websocket");
        Ok(())
    }

    /// Performs one JSON-RPC call, correlating the reply by request id.
    fn call(&self, method: &str, params: Value) -> AdapterResult<Value> {
        let mut inner = self.inner.lock().expect("moonraker lock poisoned");
        self.connect(&mut inner)?;
        let id = inner.next_id;
        inner.next_id += 1;

        let request = Self::build_request(method, &params, id, self.api_key.as_deref());

        let send_result = inner
            .socket
            .as_mut()
            .expect("socket connected above")
            .send(Message::Text(request.to_string()));
        if let Err(e) = send_result {
            inner.socket = None;
            return Err(AdapterError::Unreachable(format!("websocket send failed: {e}")));
        }

        // Skip notifications until our id comes back or the read times out.
        loop {
            let read_result = inner.socket.as_mut().expect("socket present").read();
            let message = match read_result {
                Ok(m) => m,
                Err(e) => {
                    inner.socket = None;
                    return Err(AdapterError::Timeout {
                        operation: format!("{method} ({e})"),
                        seconds: DEFAULT_TIMEOUT.as_secs(),
                    });
                }
            };
            let Message::Text(text) = message else {
                continue;
            };
            let Ok(payload) = serde_json::from_str::<Value>(&text) else {
                continue;
            };
            if payload["id"].as_u64() != Some(id) {
                continue;
            }
            if let Some(error) = payload.get("error") {
                let message = error["message"].as_str().unwrap_or("unknown error");
                return Err(AdapterError::Firmware(format!("{method}: {message}")));
            }
            return Ok(payload["result"].clone());
        }
    }

    /// Sends a request without waiting for any reply.
    fn call_fire_and_forget(&self, method: &str) -> AdapterResult<()> {
        let mut inner = self.inner.lock().expect("moonraker lock poisoned");
        self.connect(&mut inner)?;
        let id = inner.next_id;
        inner.next_id += 1;
        let request = Self::build_request(method, &json!({}), id, self.api_key.as_deref());
        let send_result = inner
            .socket
            .as_mut()
            .expect("socket connected above")
            .send(Message::Text(request.to_string()));
        if let Err(e) = send_result {
            inner.socket = None;
            return Err(AdapterError::Unreachable(format!("websocket send failed: {e}")));
        }
        Ok(())
    }

    pub(crate) fn build_request(
        method: &str,
        params: &Value,
        id: u64,
        api_key: Option<&str>,
    ) -> Value {
        let mut params = params.clone();
        if let (Some(key), Some(obj)) = (api_key, params.as_object_mut()) {
            obj.insert("api_key".into(), json!(key));
        }
        json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": id,
        })
    }

    /// Maps Klipper's `print_stats.state` onto the shared status enum.
    pub(crate) fn status_from_print_stats(state: &str) -> PrinterStatus {
        match state {
            "standby" | "complete" | "cancelled" => PrinterStatus::Idle,
            "printing" => PrinterStatus::Printing,
            "paused" => PrinterStatus::Paused,
            "error" => PrinterStatus::Error,
            _ => PrinterStatus::Unknown,
        }
    }

    pub(crate) fn state_from_query(result: &Value) -> PrinterState {
        let status = &result["status"];
        let print_state = status["print_stats"]["state"].as_str().unwrap_or_default();
        let filament = status["filament_switch_sensor filament_sensor"]["filament_detected"]
            .as_bool();
        PrinterState {
            connected: true,
            state: Self::status_from_print_stats(print_state),
            tool_temp_actual: status["extruder"]["temperature"].as_f64(),
            tool_temp_target: status["extruder"]["target"].as_f64(),
            bed_temp_actual: status["heater_bed"]["temperature"].as_f64(),
            bed_temp_target: status["heater_bed"]["target"].as_f64(),
            filament_detected: filament,
            power_watts: None,
        }
    }

    pub(crate) fn progress_from_query(result: &Value) -> JobProgress {
        let status = &result["status"];
        let completion = status["virtual_sdcard"]["progress"]
            .as_f64()
            .map(|p| (p * 100.0 * 100.0).round() / 100.0);
        let elapsed = status["print_stats"]["print_duration"].as_f64();
        // Remaining time is estimated from progress; Klipper does not
        // report it directly.
        let remaining = match (completion, elapsed) {
            (Some(pct), Some(elapsed)) if pct > 0.0 && pct < 100.0 => {
                Some((elapsed / (pct / 100.0) - elapsed) as u64)
            }
            _ => None,
        };
        JobProgress {
            file_name: status["print_stats"]["filename"]
                .as_str()
                .filter(|s| !s.is_empty())
                .map(ToString::to_string),
            completion,
            time_elapsed_s: elapsed.map(|e| e as u64),
            time_remaining_s: remaining,
        }
    }

    pub(crate) fn files_from_list(result: &Value) -> Vec<PrinterFile> {
        let Some(entries) = result.as_array() else {
            return Vec::new();
        };
        entries
            .iter()
            .map(|f| {
                let path = f["path"].as_str().unwrap_or_default().to_string();
                let name = path.rsplit('/').next().unwrap_or_default().to_string();
                PrinterFile {
                    name,
                    path,
                    size_bytes: f["size"].as_u64(),
                    date: f["modified"]
                        .as_f64()
                        .and_then(|secs| chrono::DateTime::from_timestamp(secs as i64, 0)),
                }
            })
            .collect()
    }

    const QUERY_OBJECTS: &'static str = concat!(
        "{\"objects\": {\"print_stats\": null, \"extruder\": null, ",
        "\"heater_bed\": null, \"virtual_sdcard\": null, ",
        "\"filament_switch_sensor filament_sensor\": null}}"
    );

    fn query_objects(&self) -> AdapterResult<Value> {
        let params: Value =
            serde_json::from_str(Self::QUERY_OBJECTS).expect("static query params parse");
        self.call("printer.objects.query", params)
    }
}

impl PrinterAdapter for MoonrakerAdapter {
    fn name(&self) -> &'static str {
        "moonraker"
    }

    fn capabilities(&self) -> PrinterCapabilities {
        PrinterCapabilities {
            can_upload: true,
            can_set_temp: true,
            can_send_gcode: true,
            can_pause: true,
            can_stream: true,
            can_snapshot: true,
            can_probe_bed: true,
            can_update_firmware: true,
            can_detect_filament: true,
            supported_extensions: vec![".gcode".into(), ".gco".into(), ".g".into()],
        }
    }

    fn safety_profile(&self) -> SafetyProfile {
        self.profile.clone()
    }

    fn get_state(&self) -> PrinterState {
        match self.query_objects() {
            Ok(result) => Self::state_from_query(&result),
            Err(AdapterError::Firmware(_)) => PrinterState {
                connected: true,
                state: PrinterStatus::Error,
                ..PrinterState::default()
            },
            Err(_) => PrinterState::offline(),
        }
    }

    fn get_job(&self) -> AdapterResult<JobProgress> {
        let result = self.query_objects()?;
        Ok(Self::progress_from_query(&result))
    }

    fn list_files(&self) -> AdapterResult<Vec<PrinterFile>> {
        let result = self.call("server.files.list", json!({"root": "gcodes"}))?;
        Ok(Self::files_from_list(&result))
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

        let boundary = format!("kiln-{:016x}", std::process::id() as u64);
        let mut body = Vec::with_capacity(content.len() + 256);
        body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        body.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"file\"; filename=\"{file_name}\"\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(&content);
        body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

        let mut request = ureq::post(&self.http_url("/server/files/upload")).set(
            "Content-Type",
            &format!("multipart/form-data; boundary={boundary}"),
        );
        if let Some(key) = &self.api_key {
            request = request.set("X-Api-Key", key);
        }
        request
            .send_bytes(&body)
            .map_err(|e| AdapterError::Unreachable(format!("upload failed: {e}")))?;

        Ok(UploadResult {
            success: true,
            file_name: file_name.clone(),
            message: format!("Uploaded {file_name} to Moonraker."),
        })
    }

    fn delete_file(&self, remote_path: &str) -> AdapterResult<bool> {
        self.call(
            "server.files.delete_file",
            json!({"path": format!("gcodes/{remote_path}")}),
        )?;
        Ok(true)
    }

    fn start_print(&self, file_name: &str) -> AdapterResult<PrintResult> {
        self.call("printer.print.start", json!({"filename": file_name}))?;
        Ok(PrintResult::ok(format!("Started printing {file_name}.")))
    }

    fn cancel_print(&self) -> AdapterResult<PrintResult> {
        self.call("printer.print.cancel", json!({}))?;
        Ok(PrintResult::ok("Print cancelled."))
    }

    fn pause_print(&self) -> AdapterResult<PrintResult> {
        self.call("printer.print.pause", json!({}))?;
        Ok(PrintResult::ok("Print paused."))
    }

    fn resume_print(&self) -> AdapterResult<PrintResult> {
        self.call("printer.print.resume", json!({}))?;
        Ok(PrintResult::ok("Print resumed."))
    }

    fn emergency_stop(&self) -> AdapterResult<PrintResult> {
        // Transmit and return; Klipper enters shutdown and will not reply.
        self.call_fire_and_forget("printer.emergency_stop")?;
        Ok(PrintResult::ok(
            "Emergency stop triggered. Klipper requires FIRMWARE_RESTART to recover.",
        ))
    }

    fn set_tool_temp(&self, target: f64) -> AdapterResult<bool> {
        check_tool_temp(&self.profile, target)?;
        self.call(
            "printer.gcode.script",
            json!({"script": format!("M104 S{}", target as i64)}),
        )?;
        Ok(true)
    }

    fn set_bed_temp(&self, target: f64) -> AdapterResult<bool> {
        check_bed_temp(&self.profile, target)?;
        self.call(
            "printer.gcode.script",
            json!({"script": format!("M140 S{}", target as i64)}),
        )?;
        Ok(true)
    }

    fn send_gcode(&self, lines: &[String]) -> AdapterResult<bool> {
        self.call(
            "printer.gcode.script",
            json!({"script": lines.join("\n")}),
        )?;
        Ok(true)
    }

    fn get_snapshot(&self) -> AdapterResult<Option<Vec<u8>>> {
        let response = match ureq::get(&self.http_url("/webcam/?action=snapshot"))
            .timeout(DEFAULT_TIMEOUT)
            .call()
        {
            Ok(r) => r,
            Err(ureq::Error::Status(404, _)) => return Ok(None),
            Err(e) => return Err(AdapterError::Unreachable(e.to_string())),
        };
        let mut bytes = Vec::new();
        std::io::Read::read_to_end(&mut response.into_reader(), &mut bytes)
            .map_err(|e| AdapterError::Unreachable(format!("snapshot read failed: {e}")))?;
        Ok(Some(bytes))
    }

    fn get_stream_url(&self) -> Option<String> {
        Some(format!("http://{}/webcam/?action=stream", self.host))
    }
}

impl std::fmt::Debug for MoonrakerAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MoonrakerAdapter")
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test]
    fn request_carries_id_and_method() {
        let request =
            MoonrakerAdapter::build_request("printer.print.start", &json!({"filename": "a.gcode"}), 7, None);
        assert_eq!(request["jsonrpc"], "2.0");
        assert_eq!(request["method"], "printer.print.start");
        assert_eq!(request["id"], 7);
        assert_eq!(request["params"]["filename"], "a.gcode");
    }

    #[test]
    fn request_injects_api_key() {
        let request = MoonrakerAdapter::build_request("server.files.list", &json!({}), 1, Some("k"));
        assert_eq!(request["params"]["api_key"], "k");
    }

    #[test_case("standby" => PrinterStatus::Idle)]
    #[test_case("complete" => PrinterStatus::Idle)]
    #[test_case("cancelled" => PrinterStatus::Idle)]
    #[test_case("printing" => PrinterStatus::Printing)]
    #[test_case("paused" => PrinterStatus::Paused)]
    #[test_case("error" => PrinterStatus::Error)]
    #[test_case("???" => PrinterStatus::Unknown)]
    fn print_stats_mapping(state: &str) -> PrinterStatus {
        MoonrakerAdapter::status_from_print_stats(state)
    }

    #[test]
    fn state_from_query_reads_temps_and_filament() {
        let result = json!({
            "status": {
                "print_stats": {"state": "printing", "filename": "benchy.gcode", "print_duration": 600.0},
                "extruder": {"temperature": 209.8, "target": 210.0},
                "heater_bed": {"temperature": 60.1, "target": 60.0},
                "virtual_sdcard": {"progress": 0.425},
                "filament_switch_sensor filament_sensor": {"filament_detected": true}
            }
        });
        let state = MoonrakerAdapter::state_from_query(&result);
        assert_eq!(state.state, PrinterStatus::Printing);
        assert_eq!(state.tool_temp_actual, Some(209.8));
        assert_eq!(state.filament_detected, Some(true));

        let progress = MoonrakerAdapter::progress_from_query(&result);
        assert_eq!(progress.completion, Some(42.5));
        assert_eq!(progress.file_name.as_deref(), Some("benchy.gcode"));
        assert_eq!(progress.time_elapsed_s, Some(600));
        // 600s at 42.5% leaves roughly 812s.
        assert_eq!(progress.time_remaining_s, Some(811));
    }

    #[test]
    fn files_from_list_splits_names() {
        let result = json!([
            {"path": "benchy.gcode", "size": 1024, "modified": 1700000000.0},
            {"path": "subdir/cal.gcode", "size": 2048}
        ]);
        let files = MoonrakerAdapter::files_from_list(&result);
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].name, "benchy.gcode");
        assert_eq!(files[1].name, "cal.gcode");
        assert_eq!(files[1].path, "subdir/cal.gcode");
    }
}
