//! In-memory [`PrinterAdapter`] double for tests across the workspace.
//!
//! The mock records every mutating call and lets tests script status,
//! temperatures, progress, and failure injection without a transport.

use std::path::Path;
use std::sync::Mutex;

use kiln_types::{PrinterCapabilities, PrinterStatus};

use crate::contract::{
    JobProgress, PrintResult, PrinterAdapter, PrinterFile, PrinterState, UploadResult,
};
use crate::error::{AdapterError, AdapterResult};
use crate::profiles::{default_profile, SafetyProfile};

#[derive(Debug, Default)]
struct MockState {
    connected: bool,
    status: PrinterStatus,
    tool_temp_actual: Option<f64>,
    tool_temp_target: Option<f64>,
    bed_temp_actual: Option<f64>,
    bed_temp_target: Option<f64>,
    filament_detected: Option<bool>,
    power_watts: Option<f64>,
    progress: JobProgress,
    files: Vec<PrinterFile>,
    gcode_sent: Vec<String>,
    commands: Vec<String>,
    fail_next: Option<String>,
    snapshot: Option<Vec<u8>>,
}

/// Scriptable in-memory printer.
pub struct MockPrinter {
    label: String,
    profile: SafetyProfile,
    state: Mutex<MockState>,
}

impl MockPrinter {
    /// A connected, idle printer with ambient temperatures.
    pub fn idle(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            profile: default_profile(),
            state: Mutex::new(MockState {
                connected: true,
                status: PrinterStatus::Idle,
                tool_temp_actual: Some(24.0),
                tool_temp_target: Some(0.0),
                bed_temp_actual: Some(23.5),
                bed_temp_target: Some(0.0),
                ..MockState::default()
            }),
        }
    }

    pub fn with_profile(label: impl Into<String>, profile: SafetyProfile) -> Self {
        let mut printer = Self::idle(label);
        printer.profile = profile;
        printer
    }

    pub fn set_status(&self, status: PrinterStatus) {
        let mut state = self.state.lock().unwrap();
        state.status = status;
        state.connected = status != PrinterStatus::Offline;
    }

    pub fn set_offline(&self) {
        let mut state = self.state.lock().unwrap();
        state.connected = false;
        state.status = PrinterStatus::Offline;
    }

    pub fn set_temps(
        &self,
        tool_actual: f64,
        tool_target: f64,
        bed_actual: f64,
        bed_target: f64,
    ) {
        let mut state = self.state.lock().unwrap();
        state.tool_temp_actual = Some(tool_actual);
        state.tool_temp_target = Some(tool_target);
        state.bed_temp_actual = Some(bed_actual);
        state.bed_temp_target = Some(bed_target);
    }

    pub fn set_filament_detected(&self, detected: Option<bool>) {
        self.state.lock().unwrap().filament_detected = detected;
    }

    pub fn set_power_watts(&self, watts: Option<f64>) {
        self.state.lock().unwrap().power_watts = watts;
    }

    pub fn set_progress(&self, file_name: &str, completion: f64) {
        let mut state = self.state.lock().unwrap();
        state.progress = JobProgress {
            file_name: Some(file_name.to_string()),
            completion: Some(completion),
            time_elapsed_s: None,
            time_remaining_s: None,
        };
    }

    pub fn add_file(&self, name: &str, size: Option<u64>) {
        self.state.lock().unwrap().files.push(PrinterFile {
            name: name.to_string(),
            path: name.to_string(),
            size_bytes: size,
            date: None,
        });
    }

    pub fn set_snapshot(&self, bytes: Vec<u8>) {
        self.state.lock().unwrap().snapshot = Some(bytes);
    }

    /// The next mutating operation fails once with a firmware error.
    pub fn fail_next(&self, message: &str) {
        self.state.lock().unwrap().fail_next = Some(message.to_string());
    }

    /// G-code lines delivered via `send_gcode`.
    pub fn gcode_sent(&self) -> Vec<String> {
        self.state.lock().unwrap().gcode_sent.clone()
    }

    /// Every mutating call, in order (`start:file`, `cancel`, ...).
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().unwrap().commands.clone()
    }

    fn take_failure(&self) -> AdapterResult<()> {
        let mut state = self.state.lock().unwrap();
        match state.fail_next.take() {
            Some(message) => Err(AdapterError::Firmware(message)),
            None => Ok(()),
        }
    }

    fn record(&self, command: impl Into<String>) {
        self.state.lock().unwrap().commands.push(command.into());
    }
}

impl PrinterAdapter for MockPrinter {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn capabilities(&self) -> PrinterCapabilities {
        PrinterCapabilities {
            can_upload: true,
            can_set_temp: true,
            can_send_gcode: true,
            can_pause: true,
            can_stream: false,
            // No camera: health checks must not probe for snapshots.
            can_snapshot: false,
            can_probe_bed: false,
            can_update_firmware: false,
            can_detect_filament: true,
            supported_extensions: vec![".gcode".into(), ".gco".into(), ".g".into()],
        }
    }

    fn safety_profile(&self) -> SafetyProfile {
        self.profile.clone()
    }

    fn get_state(&self) -> PrinterState {
        let state = self.state.lock().unwrap();
        PrinterState {
            connected: state.connected,
            state: state.status,
            tool_temp_actual: state.tool_temp_actual,
            tool_temp_target: state.tool_temp_target,
            bed_temp_actual: state.bed_temp_actual,
            bed_temp_target: state.bed_temp_target,
            filament_detected: state.filament_detected,
            power_watts: state.power_watts,
        }
    }

    fn get_job(&self) -> AdapterResult<JobProgress> {
        Ok(self.state.lock().unwrap().progress.clone())
    }

    fn list_files(&self) -> AdapterResult<Vec<PrinterFile>> {
        Ok(self.state.lock().unwrap().files.clone())
    }

    fn upload_file(&self, local_path: &Path) -> AdapterResult<UploadResult> {
        self.take_failure()?;
        if !local_path.is_file() {
            return Err(AdapterError::FileNotFound(local_path.display().to_string()));
        }
        let file_name = local_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.add_file(&file_name, std::fs::metadata(local_path).ok().map(|m| m.len()));
        self.record(format!("upload:{file_name}"));
        Ok(UploadResult {
            success: true,
            file_name: file_name.clone(),
            message: format!("Uploaded {file_name}."),
        })
    }

    fn delete_file(&self, remote_path: &str) -> AdapterResult<bool> {
        self.take_failure()?;
        let mut state = self.state.lock().unwrap();
        let before = state.files.len();
        state.files.retain(|f| f.name != remote_path && f.path != remote_path);
        state.commands.push(format!("delete:{remote_path}"));
        Ok(before != state.files.len())
    }

    fn start_print(&self, file_name: &str) -> AdapterResult<PrintResult> {
        self.take_failure()?;
        self.record(format!("start:{file_name}"));
        self.set_status(PrinterStatus::Printing);
        self.set_progress(file_name, 0.0);
        Ok(PrintResult::ok(format!("Started printing {file_name}.")))
    }

    fn cancel_print(&self) -> AdapterResult<PrintResult> {
        self.take_failure()?;
        self.record("cancel");
        self.set_status(PrinterStatus::Idle);
        Ok(PrintResult::ok("Print cancelled."))
    }

    fn pause_print(&self) -> AdapterResult<PrintResult> {
        self.take_failure()?;
        self.record("pause");
        self.set_status(PrinterStatus::Paused);
        Ok(PrintResult::ok("Print paused."))
    }

    fn resume_print(&self) -> AdapterResult<PrintResult> {
        self.take_failure()?;
        self.record("resume");
        self.set_status(PrinterStatus::Printing);
        Ok(PrintResult::ok("Print resumed."))
    }

    fn emergency_stop(&self) -> AdapterResult<PrintResult> {
        self.record("emergency_stop");
        self.set_offline();
        Ok(PrintResult::ok("Emergency stop triggered."))
    }

    fn set_tool_temp(&self, target: f64) -> AdapterResult<bool> {
        crate::contract::check_tool_temp(&self.profile, target)?;
        self.take_failure()?;
        let mut state = self.state.lock().unwrap();
        state.tool_temp_target = Some(target);
        state.commands.push(format!("tool_temp:{target}"));
        Ok(true)
    }

    fn set_bed_temp(&self, target: f64) -> AdapterResult<bool> {
        crate::contract::check_bed_temp(&self.profile, target)?;
        self.take_failure()?;
        let mut state = self.state.lock().unwrap();
        state.bed_temp_target = Some(target);
        state.commands.push(format!("bed_temp:{target}"));
        Ok(true)
    }

    fn send_gcode(&self, lines: &[String]) -> AdapterResult<bool> {
        self.take_failure()?;
        let mut state = self.state.lock().unwrap();
        state.gcode_sent.extend(lines.iter().cloned());
        state.commands.push(format!("gcode:{}", lines.len()));
        Ok(true)
    }

    fn get_snapshot(&self) -> AdapterResult<Option<Vec<u8>>> {
        Ok(self.state.lock().unwrap().snapshot.clone())
    }
}

impl std::fmt::Debug for MockPrinter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockPrinter").field("label", &self.label).finish()
    }
}
