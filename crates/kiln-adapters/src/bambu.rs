//! Bambu Lab backend: MQTT over TLS on :8883 plus FTPS on :990.
//!
//! The printer publishes state on `device/<serial>/report` and accepts
//! commands on `device/<serial>/request`, framed as
//! `{"print": {"command": <verb>, "sequence_id": "<n>", ...}}`. A reader
//! thread folds `push_status` reports into a latest-state cache so
//! `get_state` never touches the network. File operations multiplex over
//! FTPS with user `bblp` and the LAN access code as password.
//!
//! Bambu LAN mode uses a self-signed certificate, so both TLS channels
//! run with a verifier that accepts any certificate, as the LAN clients
//! in the wild do.

use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kiln_types::{PrinterCapabilities, PrinterStatus};
use rumqttc::{Client, Event, MqttOptions, Packet, QoS, TlsConfiguration, Transport};
use serde_json::{json, Map, Value};

use crate::contract::{
    check_bed_temp, check_tool_temp, JobProgress, PrintResult, PrinterAdapter, PrinterFile,
    PrinterState, UploadResult,
};
use crate::error::{AdapterError, AdapterResult};
use crate::gcode_text::{bed_temp_command, tool_temp_command};
use crate::profiles::SafetyProfile;

const MQTT_PORT: u16 = 8883;
const FTPS_PORT: u16 = 990;
const FTP_USER: &str = "bblp";
const KEEPALIVE: Duration = Duration::from_secs(30);

/// Maps the printer's `gcode_state` field onto the shared status enum.
pub(crate) fn map_gcode_state(gcode_state: &str) -> PrinterStatus {
    match gcode_state {
        "idle" | "finish" => PrinterStatus::Idle,
        "running" => PrinterStatus::Printing,
        "prepare" | "slicing" | "init" => PrinterStatus::Busy,
        "pause" => PrinterStatus::Paused,
        "failed" => PrinterStatus::Error,
        "offline" => PrinterStatus::Offline,
        _ => PrinterStatus::Unknown,
    }
}

mod mqtt_tls {
    //! Accept-any-certificate verifier for the printer's self-signed cert.

    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};

    #[derive(Debug)]
    struct NoVerifier;

    impl ServerCertVerifier for NoVerifier {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            vec![
                SignatureScheme::RSA_PKCS1_SHA256,
                SignatureScheme::RSA_PKCS1_SHA384,
                SignatureScheme::RSA_PKCS1_SHA512,
                SignatureScheme::ECDSA_NISTP256_SHA256,
                SignatureScheme::ECDSA_NISTP384_SHA384,
                SignatureScheme::RSA_PSS_SHA256,
                SignatureScheme::RSA_PSS_SHA384,
                SignatureScheme::RSA_PSS_SHA512,
                SignatureScheme::ED25519,
            ]
        }
    }

    pub(super) fn client_config() -> ClientConfig {
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(std::sync::Arc::new(NoVerifier))
            .with_no_client_auth()
    }
}

pub(crate) struct Shared {
    pub(crate) connected: AtomicBool,
    /// Latest `print` object fields merged from report messages.
    pub(crate) status: Mutex<Map<String, Value>>,
}

/// Concrete [`PrinterAdapter`] for Bambu Lab printers in LAN mode.
pub struct BambuAdapter {
    host: String,
    access_code: String,
    serial: String,
    profile: SafetyProfile,
    topic_request: String,
    sequence: AtomicU64,
    shared: Arc<Shared>,
    client: Mutex<Option<Client>>,
}

impl BambuAdapter {
    pub fn new(
        host: impl Into<String>,
        access_code: impl Into<String>,
        serial: impl Into<String>,
        profile: SafetyProfile,
    ) -> AdapterResult<Self> {
        let host = host.into();
        let access_code = access_code.into();
        let serial = serial.into();
        if host.is_empty() {
            return Err(AdapterError::InvalidArgument("host must not be empty".into()));
        }
        if access_code.is_empty() {
            return Err(AdapterError::InvalidArgument(
                "access_code must not be empty".into(),
            ));
        }
        if serial.is_empty() {
            return Err(AdapterError::InvalidArgument("serial must not be empty".into()));
        }

        let adapter = Self {
            topic_request: format!("device/{serial}/request"),
            host,
            access_code,
            serial,
            profile,
            sequence: AtomicU64::new(1),
            shared: Arc::new(Shared {
                connected: AtomicBool::new(false),
                status: Mutex::new(Map::new()),
            }),
            client: Mutex::new(None),
        };
        adapter.start_mqtt();
        Ok(adapter)
    }

    /// Spawns the MQTT reader thread and stores the command client.
    fn start_mqtt(&self) {
        let mut options = MqttOptions::new(
            format!("kiln-{}", self.serial),
            self.host.clone(),
            MQTT_PORT,
        );
        options.set_credentials(FTP_USER, &self.access_code);
        options.set_keep_alive(KEEPALIVE);
        options.set_transport(Transport::Tls(TlsConfiguration::Rustls(Arc::new(
            mqtt_tls::client_config(),
        ))));

        let (client, mut connection) = Client::new(options, 16);
        let topic_report = format!("device/{}/report", self.serial);
        if let Err(e) = client.subscribe(topic_report.as_str(), QoS::AtMostOnce) {
            tracing::warn!(error = %e, "initial report subscription failed");
        }
        *self.client.lock().expect("bambu client lock poisoned") = Some(client);

        let shared = Arc::clone(&self.shared);
        let serial = self.serial.clone();
        std::thread::Builder::new()
            .name(format!("kiln-bambu-{serial}"))
            .spawn(move || {
                for notification in connection.iter() {
                    match notification {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            shared.connected.store(true, Ordering::SeqCst);
                            tracing::info!(serial = %serial, "bambu MQTT connected");
                        }
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            if let Ok(payload) =
                                serde_json::from_slice::<Value>(&publish.payload)
                            {
                                Self::fold_report(&shared, &payload);
                            }
                        }
                        Ok(_) => {}
                        Err(e) => {
                            shared.connected.store(false, Ordering::SeqCst);
                            tracing::debug!(serial = %serial, error = %e, "bambu MQTT error");
                            std::thread::sleep(Duration::from_secs(1));
                        }
                    }
                }
            })
            .expect("failed to spawn bambu MQTT thread");
    }

    /// Merges the `print` object of a report into the latest-state cache.
    pub(crate) fn fold_report(shared: &Shared, payload: &Value) {
        let Some(print) = payload.get("print").and_then(Value::as_object) else {
            return;
        };
        let mut status = shared.status.lock().expect("bambu status lock poisoned");
        for (key, value) in print {
            status.insert(key.clone(), value.clone());
        }
    }

    fn next_sequence(&self) -> String {
        self.sequence.fetch_add(1, Ordering::Relaxed).to_string()
    }

    fn publish(&self, payload: &Value) -> AdapterResult<()> {
        let guard = self.client.lock().expect("bambu client lock poisoned");
        let client = guard
            .as_ref()
            .ok_or_else(|| AdapterError::Unreachable("MQTT client not started".into()))?;
        client
            .publish(
                self.topic_request.as_str(),
                QoS::AtMostOnce,
                false,
                payload.to_string(),
            )
            .map_err(|e| AdapterError::Unreachable(format!("MQTT publish failed: {e}")))
    }

    // -- command framing ------------------------------------------------

    /// `.3mf` archives start via `project_file`; plain G-code via
    /// `gcode_file` with an `/sdcard/` path.
    pub(crate) fn start_payload(file_name: &str, sequence_id: &str) -> Value {
        let base_name = file_name.rsplit('/').next().unwrap_or(file_name);
        if base_name.to_ascii_lowercase().ends_with(".3mf") {
            json!({
                "print": {
                    "command": "project_file",
                    "param": "Metadata/plate_1.gcode",
                    "subtask_name": base_name,
                    "url": format!("file:///sdcard/{base_name}"),
                    "sequence_id": sequence_id,
                }
            })
        } else {
            let param = if file_name.starts_with('/') {
                file_name.to_string()
            } else {
                format!("/sdcard/{file_name}")
            };
            json!({
                "print": {
                    "command": "gcode_file",
                    "param": param,
                    "sequence_id": sequence_id,
                }
            })
        }
    }

    pub(crate) fn control_payload(verb: &str, sequence_id: &str) -> Value {
        json!({
            "print": {
                "command": verb,
                "param": "",
                "sequence_id": sequence_id,
            }
        })
    }

    pub(crate) fn gcode_payload(lines: &[String], sequence_id: &str) -> Value {
        json!({
            "print": {
                "command": "gcode_line",
                "param": lines.join("\n"),
                "sequence_id": sequence_id,
            }
        })
    }

    fn cached_status(&self) -> Map<String, Value> {
        self.shared
            .status
            .lock()
            .expect("bambu status lock poisoned")
            .clone()
    }

    // -- FTPS file channel ----------------------------------------------

    fn ftp_connect(&self) -> AdapterResult<suppaftp::RustlsFtpStream> {
        use suppaftp::RustlsConnector;

        let config = ftps_tls::client_config();
        let addr = format!("{}:{FTPS_PORT}", self.host);
        let mut ftp = suppaftp::RustlsFtpStream::connect_secure_implicit(
            &addr,
            RustlsConnector::from(Arc::new(config)),
            &self.host,
        )
        .map_err(|e| AdapterError::Unreachable(format!("FTPS connect failed: {e}")))?;
        ftp.login(FTP_USER, &self.access_code)
            .map_err(|e| AdapterError::Unreachable(format!("FTPS login failed: {e}")))?;
        Ok(ftp)
    }
}

mod ftps_tls {
    //! Same accept-any verifier, built against suppaftp's rustls.

    use suppaftp::rustls::client::danger::{
        HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
    };
    use suppaftp::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use suppaftp::rustls::{self, ClientConfig, DigitallySignedStruct, SignatureScheme};

    #[derive(Debug)]
    struct NoVerifier;

    impl ServerCertVerifier for NoVerifier {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            vec![
                SignatureScheme::RSA_PKCS1_SHA256,
                SignatureScheme::RSA_PKCS1_SHA384,
                SignatureScheme::RSA_PKCS1_SHA512,
                SignatureScheme::ECDSA_NISTP256_SHA256,
                SignatureScheme::ECDSA_NISTP384_SHA384,
                SignatureScheme::RSA_PSS_SHA256,
                SignatureScheme::RSA_PSS_SHA384,
                SignatureScheme::RSA_PSS_SHA512,
                SignatureScheme::ED25519,
            ]
        }
    }

    pub(super) fn client_config() -> ClientConfig {
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(std::sync::Arc::new(NoVerifier))
            .with_no_client_auth()
    }
}

impl PrinterAdapter for BambuAdapter {
    fn name(&self) -> &'static str {
        "bambu"
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
            can_detect_filament: true,
            supported_extensions: vec![".gcode".into(), ".gco".into(), ".3mf".into()],
        }
    }

    fn safety_profile(&self) -> SafetyProfile {
        self.profile.clone()
    }

    fn get_state(&self) -> PrinterState {
        if !self.shared.connected.load(Ordering::SeqCst) {
            return PrinterState::offline();
        }
        let status = self.cached_status();
        let gcode_state = status
            .get("gcode_state")
            .and_then(Value::as_str)
            .unwrap_or("");
        let temp = |key: &str| status.get(key).and_then(Value::as_f64);
        PrinterState {
            connected: true,
            state: if gcode_state.is_empty() {
                PrinterStatus::Unknown
            } else {
                map_gcode_state(&gcode_state.to_ascii_lowercase())
            },
            tool_temp_actual: temp("nozzle_temper"),
            tool_temp_target: temp("nozzle_target_temper"),
            bed_temp_actual: temp("bed_temper"),
            bed_temp_target: temp("bed_target_temper"),
            filament_detected: status
                .get("hw_switch_state")
                .and_then(Value::as_i64)
                .map(|v| v == 1),
            power_watts: None,
        }
    }

    fn get_job(&self) -> AdapterResult<JobProgress> {
        if !self.shared.connected.load(Ordering::SeqCst) {
            return Ok(JobProgress::default());
        }
        let status = self.cached_status();
        let completion = status.get("mc_percent").and_then(Value::as_f64);
        // gcode_file takes precedence over the task name when both exist.
        let file_name = status
            .get("gcode_file")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .or_else(|| status.get("subtask_name").and_then(Value::as_str))
            .map(ToString::to_string);
        let remaining_min = status.get("mc_remaining_time").and_then(Value::as_u64);
        Ok(JobProgress {
            file_name,
            completion,
            time_elapsed_s: None,
            time_remaining_s: remaining_min.map(|m| m * 60),
        })
    }

    fn list_files(&self) -> AdapterResult<Vec<PrinterFile>> {
        let mut ftp = self.ftp_connect()?;
        let listing = ftp
            .nlst(None)
            .map_err(|e| AdapterError::Unreachable(format!("FTPS listing failed: {e}")))?;
        let _ = ftp.quit();
        Ok(listing
            .into_iter()
            .filter(|name| !name.ends_with('/'))
            .map(|name| PrinterFile {
                path: format!("/{name}"),
                name,
                size_bytes: None,
                date: None,
            })
            .collect())
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

        let mut ftp = self.ftp_connect()?;
        let result = ftp
            .put_file(&file_name, &mut Cursor::new(content))
            .map_err(|e| AdapterError::Unreachable(format!("FTPS upload failed: {e}")));
        let _ = ftp.quit();
        result?;

        Ok(UploadResult {
            success: true,
            file_name: file_name.clone(),
            message: format!("Uploaded {file_name} via FTPS."),
        })
    }

    fn delete_file(&self, remote_path: &str) -> AdapterResult<bool> {
        let mut ftp = self.ftp_connect()?;
        let result = ftp
            .rm(remote_path.trim_start_matches('/'))
            .map_err(|e| AdapterError::Unreachable(format!("FTPS delete failed: {e}")));
        let _ = ftp.quit();
        result?;
        Ok(true)
    }

    fn start_print(&self, file_name: &str) -> AdapterResult<PrintResult> {
        let payload = Self::start_payload(file_name, &self.next_sequence());
        self.publish(&payload)?;
        Ok(PrintResult::ok(format!("Started printing {file_name}.")))
    }

    fn cancel_print(&self) -> AdapterResult<PrintResult> {
        self.publish(&Self::control_payload("stop", &self.next_sequence()))?;
        Ok(PrintResult::ok("Print cancelled."))
    }

    fn pause_print(&self) -> AdapterResult<PrintResult> {
        self.publish(&Self::control_payload("pause", &self.next_sequence()))?;
        Ok(PrintResult::ok("Print paused."))
    }

    fn resume_print(&self) -> AdapterResult<PrintResult> {
        self.publish(&Self::control_payload("resume", &self.next_sequence()))?;
        Ok(PrintResult::ok("Print resumed."))
    }

    fn emergency_stop(&self) -> AdapterResult<PrintResult> {
        // No M112 equivalent over MQTT; stop plus heater-off G-code is the
        // strongest halt the protocol offers. Publish QoS 0, do not wait.
        self.publish(&Self::control_payload("stop", &self.next_sequence()))?;
        let off = vec!["M104 S0".to_string(), "M140 S0".to_string()];
        self.publish(&Self::gcode_payload(&off, &self.next_sequence()))?;
        Ok(PrintResult::ok(
            "Emergency stop transmitted (stop + heaters off).",
        ))
    }

    fn set_tool_temp(&self, target: f64) -> AdapterResult<bool> {
        check_tool_temp(&self.profile, target)?;
        let lines = vec![tool_temp_command(target)];
        self.publish(&Self::gcode_payload(&lines, &self.next_sequence()))?;
        Ok(true)
    }

    fn set_bed_temp(&self, target: f64) -> AdapterResult<bool> {
        check_bed_temp(&self.profile, target)?;
        let lines = vec![bed_temp_command(target)];
        self.publish(&Self::gcode_payload(&lines, &self.next_sequence()))?;
        Ok(true)
    }

    fn send_gcode(&self, lines: &[String]) -> AdapterResult<bool> {
        if lines.is_empty() {
            return Err(AdapterError::InvalidArgument("no commands provided".into()));
        }
        self.publish(&Self::gcode_payload(lines, &self.next_sequence()))?;
        Ok(true)
    }
}

impl std::fmt::Debug for BambuAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BambuAdapter")
            .field("host", &self.host)
            .field("serial", &self.serial)
            .finish_non_exhaustive()
    }
}
