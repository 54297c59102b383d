//! The agent-facing operation catalog.
//!
//! Each tool is a pure function from an argument map to a result
//! envelope. The dispatcher imposes the safety gate on every tool
//! classified above `safe`, publishes lifecycle events via the bus, and
//! never performs hardware I/O itself — mutation is delegated to an
//! adapter or the orchestrator.

mod fleet;
mod health;
mod printer;
mod recovery;
mod safety;

use kiln_safety::GateDecision;
use kiln_types::{ErrorCode, Metadata};
use serde_json::{json, Map, Value};

use crate::context::Kiln;
use crate::envelope::err;

pub(crate) type Args = Map<String, Value>;

/// Every callable tool name, grouped as in the documentation.
pub const CATALOG: &[&str] = &[
    // printer control
    "printer_status",
    "printer_files",
    "upload_file",
    "delete_file",
    "start_print",
    "cancel_print",
    "pause_print",
    "resume_print",
    "emergency_stop",
    "set_temperature",
    "send_gcode",
    "validate_gcode",
    "preflight_check",
    "printer_snapshot",
    "firmware_status",
    "update_firmware",
    "rollback_firmware",
    "await_print_completion",
    // fleet and queue
    "fleet_status",
    "fleet_utilization",
    "register_printer",
    "unregister_printer",
    "submit_job",
    "assign_jobs",
    "job_status",
    "queue_summary",
    "cancel_job",
    "job_history",
    "recent_events",
    // health monitoring
    "printer_health",
    "start_monitoring",
    "stop_monitoring",
    "monitor_sessions",
    "health_history",
    "report_print_issue",
    // recovery
    "save_checkpoint",
    "plan_recovery",
    "execute_recovery",
    "list_recoverable_jobs",
    "reset_retries",
    // safety and materials
    "safety_status",
    "safety_audit",
    "safety_settings",
    "confirm_action",
    "list_safety_profiles",
    "get_safety_profile",
    "set_material",
    "get_material",
    "check_material_match",
];

impl Kiln {
    /// Invokes a tool by name with JSON arguments.
    pub fn call_tool(&self, name: &str, args: Value) -> Value {
        let args = match args {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            _ => return err(ErrorCode::InvalidArgs, "arguments must be a JSON object"),
        };
        dispatch(self, name, &args, false)
    }

    /// Names of every tool in the catalog.
    pub fn list_tools(&self) -> &'static [&'static str] {
        CATALOG
    }
}

pub(crate) fn dispatch(ctx: &Kiln, name: &str, args: &Args, suppress_confirm: bool) -> Value {
    match name {
        "printer_status" => printer::printer_status(ctx, args),
        "printer_files" => printer::printer_files(ctx, args),
        "upload_file" => printer::upload_file(ctx, args, suppress_confirm),
        "delete_file" => printer::delete_file(ctx, args, suppress_confirm),
        "start_print" => printer::start_print(ctx, args, suppress_confirm),
        "cancel_print" => printer::cancel_print(ctx, args, suppress_confirm),
        "pause_print" => printer::pause_print(ctx, args),
        "resume_print" => printer::resume_print(ctx, args),
        "emergency_stop" => printer::emergency_stop(ctx, args, suppress_confirm),
        "set_temperature" => printer::set_temperature(ctx, args, suppress_confirm),
        "send_gcode" => printer::send_gcode(ctx, args, suppress_confirm),
        "validate_gcode" => printer::validate_gcode(ctx, args),
        "preflight_check" => printer::preflight_check(ctx, args),
        "printer_snapshot" => printer::printer_snapshot(ctx, args),
        "firmware_status" => printer::firmware_status(ctx, args),
        "update_firmware" => printer::update_firmware(ctx, args, suppress_confirm),
        "rollback_firmware" => printer::rollback_firmware(ctx, args, suppress_confirm),
        "await_print_completion" => printer::await_print_completion(ctx, args),

        "fleet_status" => fleet::fleet_status(ctx, args),
        "fleet_utilization" => fleet::fleet_utilization(ctx, args),
        "register_printer" => fleet::register_printer(ctx, args),
        "unregister_printer" => fleet::unregister_printer(ctx, args),
        "submit_job" => fleet::submit_job(ctx, args),
        "assign_jobs" => fleet::assign_jobs(ctx, args),
        "job_status" => fleet::job_status(ctx, args),
        "queue_summary" => fleet::queue_summary(ctx, args),
        "cancel_job" => fleet::cancel_job(ctx, args),
        "job_history" => fleet::job_history(ctx, args),
        "recent_events" => fleet::recent_events(ctx, args),

        "printer_health" => health::printer_health(ctx, args),
        "start_monitoring" => health::start_monitoring(ctx, args),
        "stop_monitoring" => health::stop_monitoring(ctx, args),
        "monitor_sessions" => health::monitor_sessions(ctx, args),
        "health_history" => health::health_history(ctx, args),
        "report_print_issue" => health::report_print_issue(ctx, args),

        "save_checkpoint" => recovery::save_checkpoint(ctx, args),
        "plan_recovery" => recovery::plan_recovery(ctx, args),
        "execute_recovery" => recovery::execute_recovery(ctx, args),
        "list_recoverable_jobs" => recovery::list_recoverable_jobs(ctx, args),
        "reset_retries" => recovery::reset_retries(ctx, args),

        "safety_status" => safety::safety_status(ctx, args),
        "safety_audit" => safety::safety_audit(ctx, args),
        "safety_settings" => safety::safety_settings(ctx, args),
        "confirm_action" => safety::confirm_action(ctx, args),
        "list_safety_profiles" => safety::list_safety_profiles(ctx, args),
        "get_safety_profile" => safety::get_safety_profile(ctx, args),
        "set_material" => safety::set_material(ctx, args),
        "get_material" => safety::get_material(ctx, args),
        "check_material_match" => safety::check_material_match(ctx, args),

        _ => err(ErrorCode::NotFound, format!("unknown tool: {name:?}")),
    }
}

// -- shared argument helpers ------------------------------------------------

pub(crate) fn arg_str<'a>(args: &'a Args, key: &str) -> Option<&'a str> {
    args.get(key).and_then(Value::as_str)
}

pub(crate) fn arg_f64(args: &Args, key: &str) -> Option<f64> {
    args.get(key).and_then(Value::as_f64)
}

pub(crate) fn arg_u64(args: &Args, key: &str) -> Option<u64> {
    args.get(key).and_then(Value::as_u64)
}

pub(crate) fn arg_i64(args: &Args, key: &str) -> Option<i64> {
    args.get(key).and_then(Value::as_i64)
}

pub(crate) fn arg_bool(args: &Args, key: &str) -> Option<bool> {
    args.get(key).and_then(Value::as_bool)
}

/// Caps a user-supplied limit to `1..=max`.
pub(crate) fn capped_limit(args: &Args, default: usize, max: usize) -> usize {
    arg_u64(args, "limit")
        .map_or(default, |v| v as usize)
        .clamp(1, max)
}

/// Runs gate stages 1–4 for a tool. `None` means proceed; `Some` is the
/// envelope to return immediately (refusal or confirmation request).
pub(crate) fn gate_check(
    ctx: &Kiln,
    tool: &str,
    scope: &str,
    args: &Args,
    suppress_confirm: bool,
) -> Option<Value> {
    gate_check_deferrable(ctx, tool, scope, args, suppress_confirm, false)
}

/// `gate_check` with an extra confirmation trigger independent of
/// confirm mode (upload confirmation).
pub(crate) fn gate_check_deferrable(
    ctx: &Kiln,
    tool: &str,
    scope: &str,
    args: &Args,
    suppress_confirm: bool,
    force_confirm: bool,
) -> Option<Value> {
    let presented = arg_str(args, "auth_token");
    let metadata: Metadata = args.clone();
    match ctx.gate().admit_deferrable(
        tool,
        scope,
        &metadata,
        presented,
        suppress_confirm,
        force_confirm,
    ) {
        GateDecision::Proceed => None,
        decision => Some(decision_envelope(decision)),
    }
}

/// Serialises a non-proceed gate decision.
pub(crate) fn decision_envelope(decision: GateDecision) -> Value {
    match decision {
        GateDecision::Proceed => json!({"success": true}),
        GateDecision::ConfirmationRequired {
            token,
            tool_name,
            expires_in_seconds,
            message,
        } => json!({
            "success": false,
            "confirmation_required": true,
            "token": token,
            "tool": tool_name,
            "expires_in_seconds": expires_in_seconds,
            "message": message,
        }),
        GateDecision::Refused { code, message } => err(code, message),
    }
}

/// Resolves the printer targeted by `args`, or an error envelope.
pub(crate) fn resolve_printer(
    ctx: &Kiln,
    args: &Args,
) -> Result<(String, std::sync::Arc<dyn kiln_adapters::PrinterAdapter>), Value> {
    ctx.resolve_printer(arg_str(args, "printer_name"))
        .map_err(|message| err(ErrorCode::NotFound, message))
}
