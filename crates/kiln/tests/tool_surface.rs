//! Tool-surface tests for printer control and the safety gate.

use std::sync::Arc;
use std::time::Duration;

use kiln::Kiln;
use kiln_adapters::testing::MockPrinter;
use kiln_adapters::PrinterAdapter;
use kiln_config::KilnConfig;
use kiln_types::EventType;
use serde_json::json;

fn kiln_with_printer(config: KilnConfig) -> (Kiln, Arc<MockPrinter>) {
    let kiln = Kiln::new(config);
    let printer = Arc::new(MockPrinter::idle("P1"));
    kiln.registry().register("P1", printer.clone()).unwrap();
    kiln.registry().refresh_all();
    (kiln, printer)
}

#[test]
fn printer_status_reports_state_and_capabilities() {
    let (kiln, printer) = kiln_with_printer(KilnConfig::default());
    printer.set_temps(210.0, 210.0, 60.0, 60.0);

    let result = kiln.call_tool("printer_status", json!({}));
    assert_eq!(result["success"], true);
    assert_eq!(result["printer_name"], "P1");
    assert_eq!(result["printer"]["state"], "idle");
    assert_eq!(result["printer"]["tool_temp_actual"], 210.0);
    assert_eq!(result["capabilities"]["can_send_gcode"], true);
}

#[test]
fn unknown_tool_and_missing_printer() {
    let kiln = Kiln::new(KilnConfig::default());
    let result = kiln.call_tool("frobnicate", json!({}));
    assert_eq!(result["error"]["code"], "NOT_FOUND");

    let result = kiln.call_tool("printer_status", json!({}));
    assert_eq!(result["success"], false);
    assert_eq!(result["error"]["code"], "NOT_FOUND");
}

#[test]
fn upload_then_start_print_flow() {
    let (kiln, printer) = kiln_with_printer(KilnConfig::default());
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("benchy.gcode");
    std::fs::write(&path, "G28\nG1 X10 Y10\nM104 S200\n").unwrap();

    let upload = kiln.call_tool("upload_file", json!({"file_path": path.to_str().unwrap()}));
    assert_eq!(upload["success"], true, "{upload}");
    assert_eq!(upload["file_name"], "benchy.gcode");

    let files = kiln.call_tool("printer_files", json!({}));
    assert_eq!(files["count"], 1);

    let start = kiln.call_tool("start_print", json!({"file_name": "benchy.gcode"}));
    assert_eq!(start["success"], true, "{start}");
    assert_eq!(printer.commands().last().unwrap(), "start:benchy.gcode");
}

#[test]
fn start_print_blocked_by_preflight() {
    let (kiln, printer) = kiln_with_printer(KilnConfig::default());
    printer.set_status(kiln_types::PrinterStatus::Printing);

    let result = kiln.call_tool("start_print", json!({"file_name": "benchy.gcode"}));
    assert_eq!(result["success"], false);
    assert_eq!(result["error"]["code"], "PREFLIGHT_FAILED");
    assert_eq!(result["preflight"]["ready"], false);
    // The printer never saw a start command.
    assert!(printer.commands().is_empty());

    // And the refusal is audited.
    let audit = kiln.call_tool(
        "safety_audit",
        json!({"action": "preflight_failed", "tool_name": "start_print"}),
    );
    assert_eq!(audit["entries"].as_array().unwrap().len(), 1);
}

#[test]
fn upload_rejects_missing_and_empty_files() {
    let (kiln, _printer) = kiln_with_printer(KilnConfig::default());

    let missing = kiln.call_tool("upload_file", json!({"file_path": "/no/such.gcode"}));
    assert_eq!(missing["error"]["code"], "FILE_NOT_FOUND");

    let dir = tempfile::tempdir().unwrap();
    let empty = dir.path().join("empty.gcode");
    std::fs::write(&empty, "").unwrap();
    let result = kiln.call_tool("upload_file", json!({"file_path": empty.to_str().unwrap()}));
    assert_eq!(result["error"]["code"], "VALIDATION_ERROR");
}

#[test]
fn upload_scans_gcode_content() {
    let (kiln, printer) = kiln_with_printer(KilnConfig::default());
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sketchy.gcode");
    std::fs::write(&path, "G28\nM502\n").unwrap();

    let result = kiln.call_tool("upload_file", json!({"file_path": path.to_str().unwrap()}));
    assert_eq!(result["success"], false);
    assert_eq!(result["error"]["code"], "GCODE_BLOCKED");
    assert_eq!(result["blocked_commands"][0], "M502");
    // Nothing reached the printer.
    assert!(printer.list_files().unwrap().is_empty());
}

#[test]
fn send_gcode_blocks_over_ceiling_and_counts_toward_breaker() {
    let (kiln, printer) = kiln_with_printer(KilnConfig::default());

    // Generic profile: hotend ceiling 300, bed ceiling 130.
    let result = kiln.call_tool("send_gcode", json!({"commands": "M140 S200\nM104 S320"}));
    assert_eq!(result["success"], false);
    assert_eq!(result["error"]["code"], "GCODE_BLOCKED");
    assert_eq!(result["error"]["retryable"], false);
    let blocked: Vec<String> = result["blocked_commands"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect();
    assert!(blocked.contains(&"M104 S320".to_string()));
    // No bytes were transmitted to the adapter.
    assert!(printer.gcode_sent().is_empty());

    // The block was audited and recorded for the circuit breaker.
    let audit = kiln.call_tool("safety_audit", json!({"action": "blocked"}));
    assert_eq!(audit["entries"].as_array().unwrap().len(), 1);
}

#[test]
fn circuit_breaker_escalates_after_three_blocks() {
    let (kiln, printer) = kiln_with_printer(KilnConfig::default());
    let escalations = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let counter = Arc::clone(&escalations);
    kiln.bus()
        .subscribe(Some(EventType::SafetyEscalated), move |_| {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });

    // Three G-code blocks inside the 60s window. Calls are spaced past
    // the 500ms minimum interval so each one reaches the validator.
    for _ in 0..3 {
        let result = kiln.call_tool("send_gcode", json!({"commands": "M104 S999"}));
        assert_eq!(result["error"]["code"], "GCODE_BLOCKED");
        std::thread::sleep(Duration::from_millis(600));
    }
    assert_eq!(escalations.load(std::sync::atomic::Ordering::SeqCst), 1);

    // The fourth invocation, even with valid G-code, is refused.
    let result = kiln.call_tool("send_gcode", json!({"commands": "G28"}));
    assert_eq!(result["success"], false);
    assert_eq!(result["error"]["code"], "SAFETY_ESCALATED");
    assert!(printer.gcode_sent().is_empty());
}

#[test]
fn gcode_batch_cap_is_exactly_one_hundred() {
    let (kiln, _printer) = kiln_with_printer(KilnConfig::default());

    let hundred = (0..100).map(|_| "G4 P1").collect::<Vec<_>>().join("\n");
    let result = kiln.call_tool("send_gcode", json!({"commands": hundred}));
    assert_eq!(result["success"], true, "{result}");
    assert_eq!(result["count"], 100);

    std::thread::sleep(Duration::from_millis(600));
    let hundred_one = (0..101).map(|_| "G4 P1").collect::<Vec<_>>().join("\n");
    let result = kiln.call_tool("send_gcode", json!({"commands": hundred_one}));
    assert_eq!(result["error"]["code"], "VALIDATION_ERROR");
}

#[test]
fn send_gcode_dry_run_transmits_nothing() {
    let (kiln, printer) = kiln_with_printer(KilnConfig::default());
    let result = kiln.call_tool(
        "send_gcode",
        json!({"commands": "G28\nG1 Z10", "dry_run": true}),
    );
    assert_eq!(result["success"], true);
    assert_eq!(result["dry_run"], true);
    assert_eq!(result["count"], 2);
    assert!(printer.gcode_sent().is_empty());

    let audit = kiln.call_tool("safety_audit", json!({"action": "dry_run"}));
    assert_eq!(audit["entries"].as_array().unwrap().len(), 1);
}

#[test]
fn validate_gcode_previews_without_side_effects() {
    let (kiln, printer) = kiln_with_printer(KilnConfig::default());
    let result = kiln.call_tool("validate_gcode", json!({"commands": "M104 S999\nG28"}));
    assert_eq!(result["success"], true);
    assert_eq!(result["valid"], false);
    assert_eq!(result["blocked_commands"][0], "M104 S999");
    assert!(printer.gcode_sent().is_empty());
    // A preview is not a block: no breaker accounting.
    assert!(!kiln.gate().in_cooldown("send_gcode"));
}

#[test]
fn set_temperature_ceiling_boundary() {
    let (kiln, _printer) = kiln_with_printer(KilnConfig::default());

    // Exactly at the generic 300C ceiling: accepted.
    let result = kiln.call_tool("set_temperature", json!({"tool_temp": 300.0}));
    assert_eq!(result["success"], true, "{result}");
    assert_eq!(result["tool"]["accepted"], true);

    std::thread::sleep(Duration::from_millis(2100));
    let result = kiln.call_tool("set_temperature", json!({"tool_temp": 300.5}));
    assert_eq!(result["error"]["code"], "VALIDATION_ERROR");

    std::thread::sleep(Duration::from_millis(2100));
    let result = kiln.call_tool("set_temperature", json!({"bed_temp": -1.0}));
    assert_eq!(result["error"]["code"], "VALIDATION_ERROR");

    std::thread::sleep(Duration::from_millis(2100));
    let result = kiln.call_tool("set_temperature", json!({}));
    assert_eq!(result["error"]["code"], "INVALID_ARGS");
}

#[test]
fn rate_limit_refuses_rapid_calls() {
    let (kiln, _printer) = kiln_with_printer(KilnConfig::default());
    let first = kiln.call_tool("emergency_stop", json!({}));
    assert_eq!(first["success"], true);

    let second = kiln.call_tool("emergency_stop", json!({}));
    assert_eq!(second["success"], false);
    assert_eq!(second["error"]["code"], "RATE_LIMITED");
    assert_eq!(second["error"]["retryable"], true);
}

#[test]
fn confirm_mode_defers_destructive_tools() {
    let mut config = KilnConfig::default();
    config.safety.confirm_mode = true;
    let (kiln, printer) = kiln_with_printer(config);
    printer.add_file("benchy.gcode", Some(2048));

    let first = kiln.call_tool("start_print", json!({"file_name": "benchy.gcode"}));
    assert_eq!(first["success"], false);
    assert_eq!(first["confirmation_required"], true);
    let token = first["token"].as_str().unwrap().to_string();
    assert!(printer.commands().is_empty(), "nothing executed yet");

    let confirmed = kiln.call_tool("confirm_action", json!({"token": token}));
    assert_eq!(confirmed["success"], true, "{confirmed}");
    assert_eq!(printer.commands().last().unwrap(), "start:benchy.gcode");

    // Tokens are single-use.
    let replay = kiln.call_tool("confirm_action", json!({"token": token}));
    assert_eq!(replay["error"]["code"], "INVALID_TOKEN");
}

#[test]
fn upload_confirmation_is_independent_of_confirm_mode() {
    let mut config = KilnConfig::default();
    config.safety.confirm_upload = true;
    let (kiln, printer) = kiln_with_printer(config);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("part.gcode");
    std::fs::write(&path, "G28\n").unwrap();

    let first = kiln.call_tool("upload_file", json!({"file_path": path.to_str().unwrap()}));
    assert_eq!(first["confirmation_required"], true);
    assert!(printer.list_files().unwrap().is_empty());

    let token = first["token"].as_str().unwrap();
    let confirmed = kiln.call_tool("confirm_action", json!({"token": token}));
    assert_eq!(confirmed["success"], true, "{confirmed}");
    assert_eq!(printer.list_files().unwrap().len(), 1);
}

#[test]
fn auth_gates_scoped_tools() {
    let mut config = KilnConfig::default();
    config.safety.auth_enabled = true;
    config.safety.auth_token = "sekrit".into();
    let (kiln, _printer) = kiln_with_printer(config);

    let denied = kiln.call_tool("cancel_print", json!({}));
    assert_eq!(denied["error"]["code"], "AUTH_ERROR");
    assert_eq!(denied["error"]["retryable"], false);

    let allowed = kiln.call_tool("cancel_print", json!({"auth_token": "sekrit"}));
    assert_eq!(allowed["success"], true, "{allowed}");

    // Read-only tools stay open.
    let status = kiln.call_tool("printer_status", json!({}));
    assert_eq!(status["success"], true);
}

#[test]
fn await_print_completion_returns_final_state() {
    let (kiln, printer) = kiln_with_printer(KilnConfig::default());
    printer.set_progress("benchy.gcode", 100.0);
    let result = kiln.call_tool(
        "await_print_completion",
        json!({"timeout_seconds": 1, "poll_interval_seconds": 0.1}),
    );
    assert_eq!(result["success"], true);
    assert_eq!(result["completed"], true);
    assert_eq!(result["timed_out"], false);
    assert_eq!(result["final_state"], "idle");
}

#[test]
fn await_print_completion_times_out_on_stuck_print() {
    let (kiln, printer) = kiln_with_printer(KilnConfig::default());
    printer.set_status(kiln_types::PrinterStatus::Printing);
    let result = kiln.call_tool(
        "await_print_completion",
        json!({"timeout_seconds": 0, "poll_interval_seconds": 0.05}),
    );
    assert_eq!(result["timed_out"], true);
    assert_eq!(result["completed"], false);
}

#[test]
fn snapshot_roundtrips_base64() {
    let (kiln, printer) = kiln_with_printer(KilnConfig::default());
    printer.set_snapshot(vec![0xFF, 0xD8, 0xFF, 0xE0]);
    let result = kiln.call_tool("printer_snapshot", json!({}));
    assert_eq!(result["success"], true);
    assert_eq!(result["image_b64"], "/9j/4A==");
    assert_eq!(result["size_bytes"], 4);
}

#[test]
fn safety_status_summarises_gate_state() {
    let (kiln, _printer) = kiln_with_printer(KilnConfig::default());
    let result = kiln.call_tool("safety_status", json!({}));
    assert_eq!(result["success"], true);
    assert_eq!(result["temperature_limits"]["max_hotend"], 300.0);
    assert_eq!(result["confirm_mode_enabled"], false);
    assert!(result["blocked_gcode_commands"]
        .as_array()
        .unwrap()
        .iter()
        .any(|v| v == "M502"));
    assert!(result["rate_limits"]["send_gcode"]
        .as_str()
        .unwrap()
        .contains("500ms"));
}

#[test]
fn firmware_tools_report_unsupported_backends() {
    let (kiln, _printer) = kiln_with_printer(KilnConfig::default());
    let result = kiln.call_tool("firmware_status", json!({}));
    assert_eq!(result["error"]["code"], "UNSUPPORTED");
    assert_eq!(result["error"]["retryable"], false);
}

#[test]
fn catalog_lists_every_routed_tool() {
    let kiln = Kiln::new(KilnConfig::default());
    let catalog = kiln.list_tools();
    assert!(catalog.contains(&"printer_status"));
    assert!(catalog.contains(&"confirm_action"));
    assert!(catalog.contains(&"await_print_completion"));
    // Everything in the catalog dispatches to something real.
    for tool in catalog {
        let result = kiln.call_tool(tool, json!({}));
        assert!(
            result["error"]["code"] != "NOT_FOUND"
                || result["error"]["message"]
                    .as_str()
                    .is_none_or(|m| !m.contains("unknown tool")),
            "tool {tool} is not routed"
        );
    }
}
