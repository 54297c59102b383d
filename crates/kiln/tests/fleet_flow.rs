//! Tool-surface tests for fleet orchestration, monitoring, and recovery.

use std::sync::Arc;

use kiln::Kiln;
use kiln_adapters::testing::MockPrinter;
use kiln_config::KilnConfig;
use serde_json::json;

fn kiln_with_printers(names: &[&str]) -> (Kiln, Vec<Arc<MockPrinter>>) {
    let kiln = Kiln::new(KilnConfig::default());
    let mut printers = Vec::new();
    for name in names {
        let printer = Arc::new(MockPrinter::idle(*name));
        kiln.registry().register(*name, printer.clone()).unwrap();
        printers.push(printer);
    }
    kiln.registry().refresh_all();
    (kiln, printers)
}

#[test]
fn fleet_status_lists_registered_printers() {
    let (kiln, printers) = kiln_with_printers(&["P1", "P2"]);
    printers[1].set_offline();

    let result = kiln.call_tool("fleet_status", json!({}));
    assert_eq!(result["success"], true);
    assert_eq!(result["count"], 2);
    assert_eq!(result["printers"][0]["name"], "P1");
    assert_eq!(result["printers"][1]["status"], "offline");
    assert_eq!(result["idle_printers"], json!(["P1"]));
}

#[test]
fn register_unregister_roundtrip_restores_state() {
    let (kiln, _printers) = kiln_with_printers(&[]);

    // Unknown backends are rejected before any construction.
    let bad = kiln.call_tool(
        "register_printer",
        json!({"name": "x", "printer_type": "zortrax", "host": "http://x"}),
    );
    assert_eq!(bad["error"]["code"], "INVALID_ARGS");

    // OctoPrint requires an API key.
    let no_key = kiln.call_tool(
        "register_printer",
        json!({"name": "x", "printer_type": "octoprint", "host": "http://x"}),
    );
    assert_eq!(no_key["error"]["code"], "INVALID_ARGS");

    let gone = kiln.call_tool("unregister_printer", json!({"name": "ghost"}));
    assert_eq!(gone["error"]["code"], "NOT_FOUND");
}

#[test]
fn submit_assign_complete_via_tools() {
    let (kiln, _printers) = kiln_with_printers(&["P1"]);

    let submitted = kiln.call_tool("submit_job", json!({"file_path": "benchy.gcode"}));
    assert_eq!(submitted["success"], true);
    let job_id = submitted["job_id"].as_str().unwrap().to_string();

    let assigned = kiln.call_tool("assign_jobs", json!({}));
    assert_eq!(assigned["assigned"], 1);
    assert_eq!(assigned["results"][0]["printer_name"], "P1");

    let status = kiln.call_tool("job_status", json!({"job_id": job_id}));
    assert_eq!(status["job"]["status"], "assigned");
    assert_eq!(status["job"]["attempt"], 1);
    assert_eq!(status["job"]["printer_name"], "P1");
}

#[test]
fn queue_summary_orders_next_by_priority() {
    let (kiln, _printers) = kiln_with_printers(&[]);
    kiln.call_tool("submit_job", json!({"file_path": "low.gcode", "priority": 0}));
    kiln.call_tool("submit_job", json!({"file_path": "high.gcode", "priority": 5}));

    let summary = kiln.call_tool("queue_summary", json!({}));
    assert_eq!(summary["counts"]["queued"], 2);
    assert_eq!(summary["next_job"]["file_path"], "high.gcode");
    assert_eq!(summary["total"], 2);
}

#[test]
fn cancel_job_stops_hardware_for_printing_jobs() {
    let (kiln, printers) = kiln_with_printers(&["P1"]);
    let submitted = kiln.call_tool("submit_job", json!({"file_path": "benchy.gcode"}));
    let job_id = submitted["job_id"].as_str().unwrap().to_string();
    kiln.call_tool("assign_jobs", json!({}));

    let job_uuid = kiln_types::JobId::parse(&job_id).unwrap();
    kiln.orchestrator().mark_printing(job_uuid).unwrap();

    let cancelled = kiln.call_tool("cancel_job", json!({"job_id": job_id}));
    assert_eq!(cancelled["success"], true);
    assert_eq!(cancelled["cancelled"], true);
    // The printer received a cancel before the record was closed.
    assert!(printers[0].commands().contains(&"cancel".to_string()));

    // Idempotent on a terminal job.
    let again = kiln.call_tool("cancel_job", json!({"job_id": job_id}));
    assert_eq!(again["cancelled"], false);

    let ghost = kiln.call_tool(
        "cancel_job",
        json!({"job_id": kiln_types::JobId::generate().to_string()}),
    );
    assert_eq!(ghost["error"]["code"], "NOT_FOUND");
}

#[test]
fn job_history_persists_terminal_rows_with_priority_and_attempt() {
    let (kiln, _printers) = kiln_with_printers(&["P1"]);
    let submitted = kiln.call_tool(
        "submit_job",
        json!({"file_path": "benchy.gcode", "priority": 7}),
    );
    let job_id = submitted["job_id"].as_str().unwrap().to_string();
    kiln.call_tool("assign_jobs", json!({}));

    let job_uuid = kiln_types::JobId::parse(&job_id).unwrap();
    kiln.orchestrator().mark_printing(job_uuid).unwrap();
    kiln.orchestrator().mark_completed(job_uuid).unwrap();

    let history = kiln.call_tool("job_history", json!({}));
    assert_eq!(history["count"], 1, "{history}");
    let row = &history["jobs"][0];
    assert_eq!(row["status"], "completed");
    assert_eq!(row["priority"], 7);
    assert_eq!(row["attempt"], 1);

    let filtered = kiln.call_tool("job_history", json!({"status": "failed"}));
    assert_eq!(filtered["count"], 0);

    let invalid = kiln.call_tool("job_history", json!({"status": "melted"}));
    assert_eq!(invalid["error"]["code"], "INVALID_ARGS");
}

#[test]
fn recent_events_reflect_job_lifecycle() {
    let (kiln, _printers) = kiln_with_printers(&["P1"]);
    kiln.call_tool("submit_job", json!({"file_path": "a.gcode"}));
    kiln.call_tool("assign_jobs", json!({}));

    let events = kiln.call_tool("recent_events", json!({"limit": 10}));
    let types: Vec<String> = events["events"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["type"].as_str().unwrap().to_string())
        .collect();
    assert!(types.contains(&"job_submitted".to_string()));
    assert!(types.contains(&"job_started".to_string()));
}

#[test]
fn fleet_utilization_through_tool() {
    let (kiln, printers) = kiln_with_printers(&["P1", "P2"]);
    printers[1].set_status(kiln_types::PrinterStatus::Printing);

    let result = kiln.call_tool("fleet_utilization", json!({}));
    let util = &result["utilization"];
    assert_eq!(util["total_printers"], 2);
    assert_eq!(util["busy_printers"], 1);
    assert_eq!(util["utilization_pct"], 50.0);
}

#[test]
fn health_check_and_history_tools() {
    let (kiln, printers) = kiln_with_printers(&["P1"]);
    printers[0].set_temps(210.0, 210.0, 60.0, 60.0);

    let result = kiln.call_tool("printer_health", json!({}));
    assert_eq!(result["success"], true);
    assert_eq!(result["report"]["overall_status"], "ok");
    assert_eq!(result["report"]["printer_name"], "P1");

    let history = kiln.call_tool("health_history", json!({"hours": 1}));
    assert_eq!(history["count"], 1);
}

#[test]
fn monitoring_session_tools_roundtrip() {
    let (kiln, _printers) = kiln_with_printers(&["P1"]);

    let started = kiln.call_tool(
        "start_monitoring",
        json!({"printer_name": "P1", "interval_seconds": 0.01, "job_id": "job-9"}),
    );
    assert_eq!(started["success"], true, "{started}");
    let session_id = started["session_id"].as_str().unwrap().to_string();

    // Double-start is refused while the session is live.
    let dup = kiln.call_tool("start_monitoring", json!({"printer_name": "P1"}));
    assert_eq!(dup["error"]["code"], "INVALID_STATE");

    let sessions = kiln.call_tool("monitor_sessions", json!({"printer_name": "P1"}));
    assert_eq!(sessions["count"], 1);
    assert_eq!(sessions["sessions"][0]["job_id"], "job-9");

    let stopped = kiln.call_tool("stop_monitoring", json!({"printer_name": "P1"}));
    assert_eq!(stopped["success"], true);
    assert_eq!(stopped["session"]["session_id"], session_id);
    assert!(stopped["session"]["status"] != "monitoring");

    // Idempotent stop returns the same final snapshot.
    let again = kiln.call_tool("stop_monitoring", json!({"printer_name": "P1"}));
    assert_eq!(again["session"]["session_id"], session_id);

    let never = kiln.call_tool("stop_monitoring", json!({"printer_name": "ghost"}));
    assert_eq!(never["error"]["code"], "NOT_FOUND");
}

#[test]
fn issue_reporting_through_tools() {
    let (kiln, _printers) = kiln_with_printers(&["P1"]);
    let started = kiln.call_tool(
        "start_monitoring",
        json!({"printer_name": "P1", "interval_seconds": 100.0}),
    );
    let session_id = started["session_id"].as_str().unwrap().to_string();

    let bad = kiln.call_tool(
        "report_print_issue",
        json!({"session_id": session_id, "issue_type": "layer_shift", "confidence": 2.0}),
    );
    assert_eq!(bad["error"]["code"], "VALIDATION_ERROR");

    let issue = kiln.call_tool(
        "report_print_issue",
        json!({
            "session_id": session_id,
            "issue_type": "adhesion_failure",
            "confidence": 0.9,
            "detail": "corner lifting",
        }),
    );
    assert_eq!(issue["success"], true);
    assert_eq!(issue["issue"]["auto_pause_triggered"], true);

    kiln.call_tool("stop_monitoring", json!({"printer_name": "P1"}));
}

#[test]
fn recovery_tools_roundtrip() {
    let (kiln, _printers) = kiln_with_printers(&[]);
    let job_id = kiln_types::JobId::generate().to_string();

    let saved = kiln.call_tool(
        "save_checkpoint",
        json!({
            "job_id": job_id,
            "printer_name": "P1",
            "phase": "infill",
            "progress_percent": 62.5,
            "state": {"z_height_mm": 31.2, "layer_number": 156},
        }),
    );
    assert_eq!(saved["success"], true, "{saved}");
    assert_eq!(saved["checkpoint"]["progress_percent"], 62.5);
    assert_eq!(saved["checkpoint"]["data"]["layer_number"], 156);

    let plan = kiln.call_tool(
        "plan_recovery",
        json!({"job_id": job_id, "failure_type": "power_loss"}),
    );
    assert_eq!(plan["success"], true);
    let rec = &plan["recommendation"];
    assert_eq!(rec["recommended_strategy"], "resume_from_checkpoint");
    assert_eq!(rec["estimated_waste_pct"], 37.5);
    assert!(rec["risk_assessment"].as_str().unwrap().contains("Z=31.20mm"));

    let recoverable = kiln.call_tool("list_recoverable_jobs", json!({}));
    assert_eq!(recoverable["jobs"][0], job_id);

    let executed = kiln.call_tool(
        "execute_recovery",
        json!({"job_id": job_id, "strategy": "resume_from_checkpoint"}),
    );
    assert_eq!(executed["success"], true);
    assert_eq!(executed["outcome"]["resumed_from_checkpoint"], true);
    assert_eq!(executed["outcome"]["time_saved_pct"], 62.5);

    // Burn through the remaining budget (default 3).
    kiln.call_tool(
        "execute_recovery",
        json!({"job_id": job_id, "strategy": "retry_current_step"}),
    );
    kiln.call_tool(
        "execute_recovery",
        json!({"job_id": job_id, "strategy": "retry_current_step"}),
    );
    let exhausted = kiln.call_tool(
        "execute_recovery",
        json!({"job_id": job_id, "strategy": "retry_current_step"}),
    );
    assert_eq!(exhausted["error"]["code"], "VALIDATION_ERROR");
    assert!(exhausted["error"]["message"]
        .as_str()
        .unwrap()
        .contains("exceeded max retries"));

    let reset = kiln.call_tool("reset_retries", json!({"job_id": job_id}));
    assert_eq!(reset["success"], true);
    let after_reset = kiln.call_tool(
        "execute_recovery",
        json!({"job_id": job_id, "strategy": "retry_current_step"}),
    );
    assert_eq!(after_reset["success"], true);

    let bad_failure = kiln.call_tool(
        "plan_recovery",
        json!({"job_id": job_id, "failure_type": "gremlins"}),
    );
    assert_eq!(bad_failure["error"]["code"], "INVALID_ARGS");
}

#[test]
fn material_tools_roundtrip() {
    let (kiln, _printers) = kiln_with_printers(&["P1"]);

    let set = kiln.call_tool(
        "set_material",
        json!({"material_type": "pla", "color": "galaxy black"}),
    );
    assert_eq!(set["material_type"], "PLA");

    let get = kiln.call_tool("get_material", json!({}));
    assert_eq!(get["material"]["material_type"], "PLA");

    let matches = kiln.call_tool("check_material_match", json!({"expected_material": "PLA"}));
    assert_eq!(matches["matches"], true);

    let mismatch = kiln.call_tool("check_material_match", json!({"expected_material": "ABS"}));
    assert_eq!(mismatch["matches"], false);
}

#[test]
fn safety_profile_tools() {
    let (kiln, _printers) = kiln_with_printers(&[]);

    let list = kiln.call_tool("list_safety_profiles", json!({}));
    assert!(list["count"].as_u64().unwrap() >= 7);

    let mk4 = kiln.call_tool("get_safety_profile", json!({"printer_id": "prusa-mk4"}));
    assert_eq!(mk4["profile"]["max_hotend_temp"], 300.0);

    let missing = kiln.call_tool("get_safety_profile", json!({"printer_id": "makerbot"}));
    assert_eq!(missing["error"]["code"], "NOT_FOUND");
}
