//! USB/serial adapter speaking the Marlin/RepRap G-code protocol.
//!
//! A command acquires the per-adapter mutex, writes `<command>\n`, then
//! reads lines until an `ok` prefix (success), an `Error:` prefix
//! (failure), or the deadline. Emergency stop writes and returns without
//! reading. An I/O error marks the port disconnected; the next operation
//! triggers a linear-backoff reconnect of up to three attempts.
//!
//! Wire formats handled here:
//! - `M105` temperatures: `T:<a> /<t> B:<a> /<t>`
//! - `M27` SD progress: `SD printing byte <cur>/<total>`
//! - `M20` listing bracketed by `Begin file list` / `End file list`
//! - `M115` firmware: `FIRMWARE_NAME:<name> FIRMWARE_VERSION:<ver>`

use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use kiln_types::{PrinterCapabilities, PrinterStatus};

use crate::contract::{
    check_bed_temp, check_tool_temp, FirmwareComponent, FirmwareStatus, JobProgress, PrintResult,
    PrinterAdapter, PrinterFile, PrinterState, UploadResult,
};
use crate::error::{AdapterError, AdapterResult};
use crate::gcode_text::{bed_temp_command, strip_comment, tool_temp_command};
use crate::profiles::SafetyProfile;

const DEFAULT_BAUD: u32 = 115_200;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const LIST_TIMEOUT: Duration = Duration::from_secs(15);
const MAX_RECONNECT_ATTEMPTS: u32 = 3;

/// Byte-stream transport for one serial port. Abstracted so the protocol
/// logic is exercisable without hardware.
pub(crate) trait LineIo: Send {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;
    /// Reads one line, or `None` when the read timed out.
    fn read_line(&mut self) -> io::Result<Option<String>>;
}

/// Production transport over a [`serialport::SerialPort`].
struct PortLink {
    port: Box<dyn serialport::SerialPort>,
    pending: Vec<u8>,
}

impl LineIo for PortLink {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.port.write_all(bytes)?;
        self.port.flush()
    }

    fn read_line(&mut self) -> io::Result<Option<String>> {
        loop {
            if let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.pending.drain(..=pos).collect();
                let text = String::from_utf8_lossy(&line).trim().to_string();
                return Ok(Some(text));
            }
            let mut buf = [0u8; 256];
            match self.port.read(&mut buf) {
                Ok(0) => return Ok(None),
                Ok(n) => self.pending.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::TimedOut => return Ok(None),
                Err(e) => return Err(e),
            }
        }
    }
}

type Opener = Box<dyn Fn(&str, u32, Duration) -> AdapterResult<Box<dyn LineIo>> + Send + Sync>;

fn open_port(path: &str, baud: u32, timeout: Duration) -> AdapterResult<Box<dyn LineIo>> {
    let port = serialport::new(path, baud)
        .timeout(timeout)
        .open()
        .map_err(|e| match e.kind {
            serialport::ErrorKind::NoDevice => AdapterError::Unreachable(format!(
                "serial port {path} not found; check USB cable and port path"
            )),
            serialport::ErrorKind::Io(io::ErrorKind::PermissionDenied) => {
                AdapterError::PermissionDenied(path.to_string())
            }
            _ => AdapterError::Unreachable(format!("failed to open serial port {path}: {e}")),
        })?;
    Ok(Box::new(PortLink {
        port,
        pending: Vec::new(),
    }))
}

struct Inner {
    link: Option<Box<dyn LineIo>>,
    connected: bool,
    /// Active SD print file, set by `start_print`.
    current_file: Option<String>,
    /// Marlin M27 cannot distinguish paused from printing.
    paused: bool,
}

/// Concrete [`PrinterAdapter`] backed by a USB serial connection.
pub struct SerialAdapter {
    port_path: String,
    baud: u32,
    timeout: Duration,
    profile: SafetyProfile,
    opener: Opener,
    inner: Mutex<Inner>,
}

impl SerialAdapter {
    /// Opens the port and waits for the printer's startup banner.
    pub fn open(port_path: impl Into<String>, profile: SafetyProfile) -> AdapterResult<Self> {
        Self::open_with_baud(port_path, DEFAULT_BAUD, profile)
    }

    pub fn open_with_baud(
        port_path: impl Into<String>,
        baud: u32,
        profile: SafetyProfile,
    ) -> AdapterResult<Self> {
        let adapter = Self::with_opener(port_path, baud, profile, Box::new(open_port));
        adapter.connect()?;
        Ok(adapter)
    }

    pub(crate) fn with_opener(
        port_path: impl Into<String>,
        baud: u32,
        profile: SafetyProfile,
        opener: Opener,
    ) -> Self {
        Self {
            port_path: port_path.into(),
            baud,
            timeout: DEFAULT_TIMEOUT,
            profile,
            opener,
            inner: Mutex::new(Inner {
                link: None,
                connected: false,
                current_file: None,
                paused: false,
            }),
        }
    }

    fn connect(&self) -> AdapterResult<()> {
        let mut inner = self.inner.lock().expect("serial adapter lock poisoned");
        self.connect_locked(&mut inner)
    }

    fn connect_locked(&self, inner: &mut Inner) -> AdapterResult<()> {
        if inner.connected && inner.link.is_some() {
            return Ok(());
        }
        let mut link = (self.opener)(&self.port_path, self.baud, self.timeout)?;
        Self::drain_startup(&mut *link, self.timeout);
        inner.link = Some(link);
        inner.connected = true;
        tracing::info!(port = %self.port_path, baud = self.baud, "connected to serial printer");
        Ok(())
    }

    /// Consumes Marlin's startup text until `start`/`ok` or the deadline.
    /// Some printers send nothing; proceed regardless.
    fn drain_startup(link: &mut dyn LineIo, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            match link.read_line() {
                Ok(Some(line)) => {
                    let lower = line.to_ascii_lowercase();
                    if lower.contains("start") || lower == "ok" {
                        return;
                    }
                }
                Ok(None) | Err(_) => return,
            }
        }
    }

    /// Reconnects with linear backoff after connection loss.
    fn ensure_connected(&self, inner: &mut Inner) -> AdapterResult<()> {
        if inner.connected && inner.link.is_some() {
            return Ok(());
        }
        for attempt in 1..=MAX_RECONNECT_ATTEMPTS {
            tracing::warn!(
                port = %self.port_path,
                attempt,
                max = MAX_RECONNECT_ATTEMPTS,
                "serial connection lost; reconnecting"
            );
            inner.connected = false;
            inner.link = None;
            match self.connect_locked(inner) {
                Ok(()) => return Ok(()),
                Err(_) if attempt < MAX_RECONNECT_ATTEMPTS => {
                    std::thread::sleep(Duration::from_secs(u64::from(attempt)));
                }
                Err(e) => {
                    tracing::error!(port = %self.port_path, error = %e, "reconnect failed");
                }
            }
        }
        Err(AdapterError::Unreachable(format!(
            "lost connection to serial printer on {} after {MAX_RECONNECT_ATTEMPTS} reconnect attempts",
            self.port_path
        )))
    }

    fn send_command(&self, command: &str) -> AdapterResult<String> {
        self.send_command_with(command, self.timeout, true)
    }

    fn send_command_with(
        &self,
        command: &str,
        timeout: Duration,
        wait_for_ok: bool,
    ) -> AdapterResult<String> {
        let mut inner = self.inner.lock().expect("serial adapter lock poisoned");
        self.ensure_connected(&mut inner)?;
        Self::send_command_locked(&mut inner, command, timeout, wait_for_ok)
    }

    /// Sends while the lock is already held so multi-command operations
    /// (SD upload) do not interleave with other callers.
    fn send_command_locked(
        inner: &mut Inner,
        command: &str,
        timeout: Duration,
        wait_for_ok: bool,
    ) -> AdapterResult<String> {
        let link = inner
            .link
            .as_mut()
            .ok_or_else(|| AdapterError::Unreachable("serial port not open".into()))?;

        let line = format!("{}\n", command.trim());
        if let Err(e) = link.write_all(line.as_bytes()) {
            inner.connected = false;
            return Err(AdapterError::Unreachable(format!(
                "failed to send command {command:?}: {e}"
            )));
        }
        tracing::debug!(tx = command.trim(), "serial");

        if !wait_for_ok {
            return Ok(String::new());
        }

        let mut response_lines: Vec<String> = Vec::new();
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            let line = match link.read_line() {
                Ok(Some(line)) => line,
                Ok(None) => continue,
                Err(e) => {
                    inner.connected = false;
                    return Err(AdapterError::Unreachable(format!(
                        "serial read error after {command:?}: {e}"
                    )));
                }
            };
            if line.is_empty() {
                continue;
            }
            tracing::debug!(rx = %line, "serial");
            response_lines.push(line.clone());

            let lower = line.to_ascii_lowercase();
            if lower.starts_with("ok") {
                return Ok(response_lines.join("\n"));
            }
            if lower.starts_with("error") {
                return Err(AdapterError::Firmware(format!(
                    "firmware error for {command:?}: {line}"
                )));
            }
        }

        Err(AdapterError::Timeout {
            operation: command.to_string(),
            seconds: timeout.as_secs(),
        })
    }

    // -- wire-format parsers -------------------------------------------

    /// Parses `T:<a> /<t> B:<a> /<t>` from an M105 response.
    pub(crate) fn parse_temps(response: &str) -> (Option<f64>, Option<f64>, Option<f64>, Option<f64>) {
        fn pair_after(response: &str, key: &str) -> (Option<f64>, Option<f64>) {
            let Some(idx) = response.find(key) else {
                return (None, None);
            };
            let rest = &response[idx + key.len()..];
            let mut parts = rest.splitn(2, '/');
            let actual = parts
                .next()
                .and_then(|s| s.trim().parse::<f64>().ok());
            let target = parts.next().and_then(|s| {
                let end = s
                    .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == ' '))
                    .unwrap_or(s.len());
                s[..end].trim().parse::<f64>().ok()
            });
            (actual, target)
        }
        let (tool_a, tool_t) = pair_after(response, "T:");
        let (bed_a, bed_t) = pair_after(response, "B:");
        (tool_a, tool_t, bed_a, bed_t)
    }

    /// Parses `SD printing byte <cur>/<total>` from an M27 response.
    pub(crate) fn parse_sd_progress(response: &str) -> Option<(u64, u64)> {
        let idx = response.find("SD printing byte")?;
        let rest = response[idx + "SD printing byte".len()..].trim_start();
        let frac: String = rest
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '/' || *c == ' ')
            .collect();
        let mut parts = frac.split('/');
        let current = parts.next()?.trim().parse().ok()?;
        let total = parts.next()?.trim().parse().ok()?;
        Some((current, total))
    }

    /// Extracts file entries between the M20 listing markers.
    pub(crate) fn parse_file_list(response: &str) -> Vec<PrinterFile> {
        let mut files = Vec::new();
        let mut in_list = false;
        for line in response.lines() {
            let stripped = line.trim();
            let lower = stripped.to_ascii_lowercase();
            if lower.contains("begin file list") {
                in_list = true;
                continue;
            }
            if lower.contains("end file list") {
                break;
            }
            if !in_list || stripped.is_empty() || lower.starts_with("ok") {
                continue;
            }
            // Marlin may append the size: "BENCHY.GCO 12345"
            let mut parts = stripped.split_whitespace();
            let name = parts.next().unwrap_or_default().to_string();
            let size = parts.next().and_then(|s| s.parse().ok());
            files.push(PrinterFile {
                path: name.clone(),
                name,
                size_bytes: size,
                date: None,
            });
        }
        files
    }

    /// Parses `FIRMWARE_NAME:` / `FIRMWARE_VERSION:` tokens from M115.
    pub(crate) fn parse_firmware(response: &str) -> (String, String) {
        fn token_after(response: &str, key: &str) -> Option<String> {
            let idx = response.find(key)?;
            let rest = &response[idx + key.len()..];
            let token: String = rest.chars().take_while(|c| !c.is_whitespace()).collect();
            (!token.is_empty()).then_some(token)
        }
        (
            token_after(response, "FIRMWARE_NAME:").unwrap_or_else(|| "Unknown".into()),
            token_after(response, "FIRMWARE_VERSION:").unwrap_or_else(|| "Unknown".into()),
        )
    }

    /// Truncates a file name to Marlin's 8.3 SD format, upper-cased.
    pub(crate) fn sd_file_name(local_name: &str) -> String {
        let upper = local_name.to_ascii_uppercase();
        if upper.len() <= 12 {
            return upper;
        }
        match upper.rsplit_once('.') {
            Some((base, ext)) => {
                let base: String = base.chars().take(8).collect();
                let ext: String = ext.chars().take(3).collect();
                format!("{base}.{ext}")
            }
            None => upper.chars().take(12).collect(),
        }
    }

    /// Current tool position via `M114`, or `None` if the query fails.
    pub fn tool_position(&self) -> Option<(f64, f64, f64, f64)> {
        let response = self.send_command("M114").ok()?;
        fn axis(response: &str, key: &str) -> Option<f64> {
            let idx = response.find(key)?;
            let rest = &response[idx + key.len()..];
            let token: String = rest
                .chars()
                .take_while(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
                .collect();
            token.parse().ok()
        }
        Some((
            axis(&response, "X:")?,
            axis(&response, "Y:")?,
            axis(&response, "Z:")?,
            axis(&response, "E:").unwrap_or(0.0),
        ))
    }

    /// Sends the power-loss resume positioning sequence.
    ///
    /// Disables Marlin's built-in recovery, homes X/Y only (homing Z
    /// would crash the nozzle into the part), heats, sets the Z position
    /// without moving, raises the nozzle, primes, and restores fan and
    /// flow. The caller starts the actual resume file afterwards.
    pub fn resume_positioning(
        &self,
        z_height_mm: f64,
        hotend_temp_c: f64,
        bed_temp_c: f64,
        fan_speed_pct: f64,
        flow_rate_pct: f64,
    ) -> AdapterResult<PrintResult> {
        if z_height_mm <= 0.0 {
            return Err(AdapterError::InvalidArgument(format!(
                "z_height_mm must be > 0, got {z_height_mm}"
            )));
        }
        if hotend_temp_c <= 0.0 {
            return Err(AdapterError::InvalidArgument(format!(
                "hotend temperature must be > 0, got {hotend_temp_c}"
            )));
        }
        check_tool_temp(&self.profile, hotend_temp_c)?;
        check_bed_temp(&self.profile, bed_temp_c)?;

        let fan_pwm = (fan_speed_pct * 2.55) as i64;
        let commands = [
            "M413 S0".to_string(),
            "G28 X Y".to_string(),
            format!("M140 S{bed_temp_c}"),
            format!("M104 S{hotend_temp_c}"),
            format!("M190 S{bed_temp_c}"),
            format!("M109 S{hotend_temp_c}"),
            "G92 E0".to_string(),
            format!("G92 Z{z_height_mm}"),
            "G91".to_string(),
            "G1 Z2 F300".to_string(),
            "G90".to_string(),
            "G1 E30 F200".to_string(),
            "G92 E0".to_string(),
            format!("M106 S{fan_pwm}"),
            format!("M221 S{}", flow_rate_pct as i64),
        ];
        self.send_gcode(&commands)?;
        Ok(PrintResult::ok(format!(
            "resume positioning complete at Z={z_height_mm}mm; start the resume file to continue"
        )))
    }
}

impl PrinterAdapter for SerialAdapter {
    fn name(&self) -> &'static str {
        "serial"
    }

    fn capabilities(&self) -> PrinterCapabilities {
        PrinterCapabilities {
            can_upload: true,
            can_set_temp: true,
            can_send_gcode: true,
            can_pause: true,
            can_stream: false,
            can_snapshot: false,
            can_probe_bed: true,
            can_update_firmware: false,
            can_detect_filament: false,
            supported_extensions: vec![".gcode".into(), ".gco".into(), ".g".into()],
        }
    }

    fn safety_profile(&self) -> SafetyProfile {
        self.profile.clone()
    }

    fn get_state(&self) -> PrinterState {
        let temp_response = match self.send_command("M105") {
            Ok(r) => r,
            // Firmware halt is ERROR; anything transport-ish is OFFLINE.
            Err(AdapterError::Firmware(_)) => {
                return PrinterState {
                    connected: true,
                    state: PrinterStatus::Error,
                    ..PrinterState::default()
                };
            }
            Err(_) => return PrinterState::offline(),
        };

        let (tool_a, tool_t, bed_a, bed_t) = Self::parse_temps(&temp_response);

        let mut status = PrinterStatus::Idle;
        if let Ok(sd_response) = self.send_command("M27") {
            if let Some((current, total)) = Self::parse_sd_progress(&sd_response) {
                let mut inner = self.inner.lock().expect("serial adapter lock poisoned");
                if total > 0 && current < total {
                    status = if inner.paused {
                        PrinterStatus::Paused
                    } else {
                        PrinterStatus::Printing
                    };
                } else {
                    inner.paused = false;
                }
            }
        }

        PrinterState {
            connected: true,
            state: status,
            tool_temp_actual: tool_a,
            tool_temp_target: tool_t,
            bed_temp_actual: bed_a,
            bed_temp_target: bed_t,
            filament_detected: None,
            power_watts: None,
        }
    }

    fn get_job(&self) -> AdapterResult<JobProgress> {
        let current_file = self
            .inner
            .lock()
            .expect("serial adapter lock poisoned")
            .current_file
            .clone();

        let response = match self.send_command("M27") {
            Ok(r) => r,
            Err(e) if e.is_transient() => return Ok(JobProgress::default()),
            Err(e) => return Err(e),
        };

        let completion = Self::parse_sd_progress(&response).map(|(current, total)| {
            if total > 0 {
                (current as f64 / total as f64 * 100.0 * 100.0).round() / 100.0
            } else {
                0.0
            }
        });

        Ok(JobProgress {
            file_name: current_file,
            completion,
            time_elapsed_s: None,
            time_remaining_s: None,
        })
    }

    fn list_files(&self) -> AdapterResult<Vec<PrinterFile>> {
        let response = self.send_command_with("M20", LIST_TIMEOUT, true).map_err(|e| {
            let msg = e.to_string().to_ascii_lowercase();
            if msg.contains("no sd card") || msg.contains("volume.init") {
                AdapterError::Firmware("no SD card detected; insert one and retry".into())
            } else {
                e
            }
        })?;
        Ok(Self::parse_file_list(&response))
    }

    fn upload_file(&self, local_path: &Path) -> AdapterResult<UploadResult> {
        if !local_path.is_file() {
            return Err(AdapterError::FileNotFound(local_path.display().to_string()));
        }
        let content = std::fs::read_to_string(local_path).map_err(|e| {
            if e.kind() == io::ErrorKind::PermissionDenied {
                AdapterError::PermissionDenied(local_path.display().to_string())
            } else {
                AdapterError::Unreachable(format!("error reading {}: {e}", local_path.display()))
            }
        })?;
        let file_name = Self::sd_file_name(
            &local_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
        );

        let mut inner = self.inner.lock().expect("serial adapter lock poisoned");
        self.ensure_connected(&mut inner)?;

        Self::send_command_locked(&mut inner, &format!("M28 {file_name}"), self.timeout, true)?;

        let mut line_count = 0u64;
        let write_result: AdapterResult<()> = (|| {
            let link = inner
                .link
                .as_mut()
                .ok_or_else(|| AdapterError::Unreachable("serial port not open".into()))?;
            for line in content.lines() {
                let Some(code) = strip_comment(line) else {
                    continue;
                };
                // Marlin buffers SD writes; no per-line ok wait.
                link.write_all(format!("{code}\n").as_bytes()).map_err(|e| {
                    AdapterError::Unreachable(format!("error during SD upload: {e}"))
                })?;
                line_count += 1;
            }
            Ok(())
        })();

        // Always close the SD write, even on error.
        let close_result =
            Self::send_command_locked(&mut inner, "M29", self.timeout, true);
        write_result?;
        close_result?;

        tracing::info!(file = %file_name, lines = line_count, "uploaded to SD card");
        Ok(UploadResult {
            success: true,
            file_name: file_name.clone(),
            message: format!("Uploaded {file_name} to SD card."),
        })
    }

    fn delete_file(&self, remote_path: &str) -> AdapterResult<bool> {
        self.send_command(&format!("M30 {remote_path}"))?;
        Ok(true)
    }

    fn start_print(&self, file_name: &str) -> AdapterResult<PrintResult> {
        self.send_command(&format!("M23 {file_name}"))?;
        self.send_command("M24")?;
        let mut inner = self.inner.lock().expect("serial adapter lock poisoned");
        inner.current_file = Some(file_name.to_string());
        inner.paused = false;
        Ok(PrintResult::ok(format!(
            "Started printing {file_name} from SD card."
        )))
    }

    fn cancel_print(&self) -> AdapterResult<PrintResult> {
        // M524 aborts an SD print; older firmware only understands M0.
        if self.send_command("M524").is_err() {
            self.send_command("M0")?;
        }
        let mut inner = self.inner.lock().expect("serial adapter lock poisoned");
        inner.current_file = None;
        inner.paused = false;
        Ok(PrintResult::ok("Print cancelled."))
    }

    fn pause_print(&self) -> AdapterResult<PrintResult> {
        self.send_command("M25")?;
        self.inner.lock().expect("serial adapter lock poisoned").paused = true;
        Ok(PrintResult::ok("Print paused."))
    }

    fn resume_print(&self) -> AdapterResult<PrintResult> {
        self.send_command("M24")?;
        self.inner.lock().expect("serial adapter lock poisoned").paused = false;
        Ok(PrintResult::ok("Print resumed."))
    }

    fn emergency_stop(&self) -> AdapterResult<PrintResult> {
        // Fire-and-forget: the printer halts immediately, so no ok will
        // arrive. A failed read after a successful write still counts.
        let sent = match self.send_command_with("M112", self.timeout, false) {
            Ok(_) => true,
            Err(AdapterError::Unreachable(msg)) if msg.contains("failed to send") => false,
            Err(_) => true,
        };
        let mut inner = self.inner.lock().expect("serial adapter lock poisoned");
        inner.current_file = None;
        inner.paused = false;
        inner.connected = false;
        if sent {
            Ok(PrintResult::ok(
                "Emergency stop triggered (M112 sent). Printer will need a reset.",
            ))
        } else {
            Err(AdapterError::Unreachable(
                "emergency stop failed: could not deliver M112".into(),
            ))
        }
    }

    fn set_tool_temp(&self, target: f64) -> AdapterResult<bool> {
        check_tool_temp(&self.profile, target)?;
        self.send_command(&tool_temp_command(target))?;
        Ok(true)
    }

    fn set_bed_temp(&self, target: f64) -> AdapterResult<bool> {
        check_bed_temp(&self.profile, target)?;
        self.send_command(&bed_temp_command(target))?;
        Ok(true)
    }

    fn send_gcode(&self, lines: &[String]) -> AdapterResult<bool> {
        for line in lines {
            self.send_command(line)?;
        }
        Ok(true)
    }

    fn get_firmware_status(&self) -> AdapterResult<FirmwareStatus> {
        let response = self.send_command("M115")?;
        let (fw_name, fw_version) = Self::parse_firmware(&response);
        Ok(FirmwareStatus {
            busy: false,
            components: vec![FirmwareComponent {
                name: fw_name,
                current_version: fw_version,
                available_version: None,
                component_type: "firmware".into(),
            }],
            updates_available: 0,
        })
    }
}

impl std::fmt::Debug for SerialAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialAdapter")
            .field("port", &self.port_path)
            .field("baud", &self.baud)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Arc;

    use crate::profiles::default_profile;

    use super::*;

    /// Scripted transport: a written command whose text starts with the
    /// front entry's key queues that entry's response lines. Writes that
    /// match nothing (SD data lines) are recorded and produce no reply.
    struct ScriptedLink {
        responses: Arc<Mutex<VecDeque<(String, String)>>>,
        sent: Arc<Mutex<Vec<String>>>,
        queued: VecDeque<String>,
    }

    fn scripted(responses: &[(&str, &str)]) -> (SerialAdapter, Arc<Mutex<Vec<String>>>) {
        let responses = Arc::new(Mutex::new(
            responses
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect::<VecDeque<_>>(),
        ));
        let sent = Arc::new(Mutex::new(Vec::new()));
        let responses2 = Arc::clone(&responses);
        let sent2 = Arc::clone(&sent);
        let opener: Opener = Box::new(move |_, _, _| {
            Ok(Box::new(ScriptedLink {
                responses: Arc::clone(&responses2),
                sent: Arc::clone(&sent2),
                queued: VecDeque::new(),
            }) as Box<dyn LineIo>)
        });
        let adapter =
            SerialAdapter::with_opener("/dev/ttyTEST", DEFAULT_BAUD, default_profile(), opener);
        adapter.connect().unwrap();
        (adapter, sent)
    }

    impl LineIo for ScriptedLink {
        fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
            let cmd = String::from_utf8_lossy(bytes).trim().to_string();
            self.sent.lock().unwrap().push(cmd.clone());
            let mut responses = self.responses.lock().unwrap();
            let matches = responses
                .front()
                .is_some_and(|(key, _)| cmd.starts_with(key.as_str()));
            if matches {
                let (_, response) = responses.pop_front().unwrap();
                for line in response.lines() {
                    self.queued.push_back(line.to_string());
                }
            }
            Ok(())
        }

        fn read_line(&mut self) -> io::Result<Option<String>> {
            match self.queued.pop_front() {
                Some(line) => Ok(Some(line)),
                // Fail fast instead of spinning out a real-time deadline
                // when a test script is exhausted.
                None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "script exhausted")),
            }
        }
    }

    #[test]
    fn parse_m105_temps() {
        let (ta, tt, ba, bt) =
            SerialAdapter::parse_temps("ok T:210.0 /210.0 B:60.0 /60.0 @:127 B@:127");
        assert_eq!(ta, Some(210.0));
        assert_eq!(tt, Some(210.0));
        assert_eq!(ba, Some(60.0));
        assert_eq!(bt, Some(60.0));
    }

    #[test]
    fn parse_m105_without_bed() {
        let (ta, tt, ba, bt) = SerialAdapter::parse_temps("T:195.4 /200.0");
        assert_eq!(ta, Some(195.4));
        assert_eq!(tt, Some(200.0));
        assert_eq!(ba, None);
        assert_eq!(bt, None);
    }

    #[test]
    fn parse_m27_progress() {
        assert_eq!(
            SerialAdapter::parse_sd_progress("SD printing byte 1234/5678"),
            Some((1234, 5678))
        );
        assert_eq!(SerialAdapter::parse_sd_progress("Not SD printing"), None);
    }

    #[test]
    fn parse_m20_listing() {
        let response = "Begin file list\nBENCHY.GCO 12345\nCALIBRA~1.GCO\nEnd file list\nok";
        let files = SerialAdapter::parse_file_list(response);
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].name, "BENCHY.GCO");
        assert_eq!(files[0].size_bytes, Some(12345));
        assert_eq!(files[1].name, "CALIBRA~1.GCO");
        assert_eq!(files[1].size_bytes, None);
    }

    #[test]
    fn parse_m115_firmware() {
        let (name, version) = SerialAdapter::parse_firmware(
            "FIRMWARE_NAME:Marlin FIRMWARE_VERSION:2.1.2 SOURCE_CODE_URL:github",
        );
        assert_eq!(name, "Marlin");
        assert_eq!(version, "2.1.2");
    }

    #[test]
    fn sd_names_are_8_3() {
        assert_eq!(SerialAdapter::sd_file_name("benchy.gcode"), "BENCHY.GCO");
        assert_eq!(SerialAdapter::sd_file_name("cal.gco"), "CAL.GCO");
        assert_eq!(
            SerialAdapter::sd_file_name("averylongfilename.gcode"),
            "AVERYLON.GCO"
        );
    }

    #[test]
    fn get_state_idle_with_temps() {
        let (adapter, _) = scripted(&[
            ("M105", "T:210.0 /210.0 B:60.0 /60.0\nok"),
            ("M27", "Not SD printing\nok"),
        ]);
        let state = adapter.get_state();
        assert!(state.connected);
        assert_eq!(state.state, PrinterStatus::Idle);
        assert_eq!(state.tool_temp_actual, Some(210.0));
        assert_eq!(state.bed_temp_target, Some(60.0));
    }

    #[test]
    fn get_state_printing_from_sd_progress() {
        let (adapter, _) = scripted(&[
            ("M105", "T:210.0 /210.0 B:60.0 /60.0\nok"),
            ("M27", "SD printing byte 100/1000\nok"),
        ]);
        assert_eq!(adapter.get_state().state, PrinterStatus::Printing);
    }

    #[test]
    fn get_state_error_on_firmware_halt() {
        let (adapter, _) = scripted(&[("M105", "Error:Printer halted. kill() called!")]);
        let state = adapter.get_state();
        assert!(state.connected);
        assert_eq!(state.state, PrinterStatus::Error);
    }

    #[test]
    fn start_print_selects_then_starts() {
        let (adapter, sent) = scripted(&[("M23", "ok"), ("M24", "ok")]);
        let result = adapter.start_print("BENCHY.GCO").unwrap();
        assert!(result.success);
        assert_eq!(*sent.lock().unwrap(), vec!["M23 BENCHY.GCO", "M24"]);
    }

    #[test]
    fn cancel_falls_back_to_m0() {
        let (adapter, sent) = scripted(&[("M524", "Error:Unknown command: M524"), ("M0", "ok")]);
        let result = adapter.cancel_print().unwrap();
        assert!(result.success);
        assert_eq!(*sent.lock().unwrap(), vec!["M524", "M0"]);
    }

    #[test]
    fn emergency_stop_does_not_wait_for_ok() {
        let (adapter, sent) = scripted(&[]);
        let result = adapter.emergency_stop().unwrap();
        assert!(result.success);
        assert_eq!(*sent.lock().unwrap(), vec!["M112"]);
        // Port is marked disconnected afterwards.
        assert!(!adapter.inner.lock().unwrap().connected);
    }

    #[test]
    fn set_tool_temp_validates_before_sending() {
        let (adapter, sent) = scripted(&[("M104", "ok")]);
        assert!(matches!(
            adapter.set_tool_temp(400.0),
            Err(AdapterError::TemperatureOutOfRange { .. })
        ));
        assert!(sent.lock().unwrap().is_empty(), "no bytes before validation");
        assert!(adapter.set_tool_temp(210.0).unwrap());
        assert_eq!(*sent.lock().unwrap(), vec!["M104 S210"]);
    }

    #[test]
    fn negative_bed_temp_rejected() {
        let (adapter, sent) = scripted(&[]);
        assert!(adapter.set_bed_temp(-1.0).is_err());
        assert!(sent.lock().unwrap().is_empty());
    }

    #[test]
    fn upload_streams_file_between_m28_and_m29() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("benchy.gcode");
        std::fs::write(&path, "; header comment\nG28\nG1 X10 ; move\n\nM104 S200\n").unwrap();

        let (adapter, sent) = scripted(&[("M28", "ok"), ("M29", "ok")]);
        let result = adapter.upload_file(&path).unwrap();
        assert!(result.success);
        assert_eq!(result.file_name, "BENCHY.GCO");

        let sent = sent.lock().unwrap();
        assert_eq!(sent.first().unwrap(), "M28 BENCHY.GCO");
        assert_eq!(sent.last().unwrap(), "M29");
        // Comment-only and blank lines are skipped.
        assert_eq!(&sent[1..sent.len() - 1], &["G28", "G1 X10", "M104 S200"]);
    }

    #[test]
    fn upload_missing_file_is_file_not_found() {
        let (adapter, _) = scripted(&[]);
        let err = adapter
            .upload_file(Path::new("/nonexistent/benchy.gcode"))
            .unwrap_err();
        assert!(matches!(err, AdapterError::FileNotFound(_)));
    }

    #[test]
    fn firmware_status_from_m115() {
        let (adapter, _) = scripted(&[("M115", "FIRMWARE_NAME:Marlin FIRMWARE_VERSION:2.1.2\nok")]);
        let status = adapter.get_firmware_status().unwrap();
        assert_eq!(status.components.len(), 1);
        assert_eq!(status.components[0].name, "Marlin");
        assert_eq!(status.components[0].current_version, "2.1.2");
    }
}
