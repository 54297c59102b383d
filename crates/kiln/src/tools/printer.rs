//! Direct printer-control tools.

use std::path::Path;
use std::time::{Duration, Instant};

use base64::Engine;
use kiln_safety::{
    run_preflight, scan_gcode_file, validate_gcode as validate_lines, PreflightOptions,
    MAX_GCODE_BATCH,
};
use kiln_types::{ErrorCode, PrinterStatus};
use serde_json::{json, Value};

use crate::context::Kiln;
use crate::envelope::{adapter_error, err, err_with, ok};
use crate::tools::{
    arg_bool, arg_f64, arg_str, arg_u64, gate_check, gate_check_deferrable, resolve_printer, Args,
};

const MAX_UPLOAD_BYTES: u64 = 500 * 1024 * 1024;
const GCODE_EXTENSIONS: &[&str] = &[".gcode", ".gco", ".g"];

pub(crate) fn printer_status(ctx: &Kiln, args: &Args) -> Value {
    let (name, adapter) = match resolve_printer(ctx, args) {
        Ok(pair) => pair,
        Err(envelope) => return envelope,
    };
    let state = adapter.get_state();
    let job = adapter.get_job().unwrap_or_default();
    ok(json!({
        "printer_name": name,
        "printer": state,
        "job": job,
        "capabilities": adapter.capabilities(),
    }))
}

pub(crate) fn printer_files(ctx: &Kiln, args: &Args) -> Value {
    let (_, adapter) = match resolve_printer(ctx, args) {
        Ok(pair) => pair,
        Err(envelope) => return envelope,
    };
    match adapter.list_files() {
        Ok(files) => {
            let count = files.len();
            ok(json!({"files": files, "count": count}))
        }
        Err(e) => adapter_error(&e),
    }
}

pub(crate) fn upload_file(ctx: &Kiln, args: &Args, suppress_confirm: bool) -> Value {
    // Upload confirmation is its own toggle, independent of confirm mode.
    let force_confirm = ctx.config().safety.confirm_upload;
    if let Some(envelope) = gate_check_deferrable(
        ctx,
        "upload_file",
        "files",
        args,
        suppress_confirm,
        force_confirm,
    ) {
        return envelope;
    }
    let Some(file_path) = arg_str(args, "file_path") else {
        return err(ErrorCode::InvalidArgs, "file_path is required");
    };
    let (name, adapter) = match resolve_printer(ctx, args) {
        Ok(pair) => pair,
        Err(envelope) => return envelope,
    };

    let path = Path::new(file_path);
    let Ok(metadata) = std::fs::metadata(path) else {
        return err(ErrorCode::FileNotFound, format!("File not found: {file_path}"));
    };
    if metadata.len() == 0 {
        return err(ErrorCode::ValidationError, "File is empty (0 bytes).");
    }
    if metadata.len() > MAX_UPLOAD_BYTES {
        return err(
            ErrorCode::ValidationError,
            format!(
                "File too large ({:.1} MiB); maximum upload size is {} MiB.",
                metadata.len() as f64 / 1024.0 / 1024.0,
                MAX_UPLOAD_BYTES / 1024 / 1024
            ),
        );
    }

    // G-code files are statically analysed before any transfer.
    let lower = file_path.to_ascii_lowercase();
    let mut warnings: Vec<String> = Vec::new();
    if GCODE_EXTENSIONS.iter().any(|ext| lower.ends_with(ext)) {
        match scan_gcode_file(path, &adapter.safety_profile()) {
            Ok(scan) if !scan.valid => {
                ctx.gate().record_audit(
                    "upload_file",
                    "blocked",
                    Some(&name),
                    serde_json::from_value(json!({
                        "file": file_path,
                        "blocked_commands": &scan.blocked_commands,
                    }))
                    .unwrap_or_default(),
                );
                ctx.gate().record_block("upload_file");
                return err_with(
                    ErrorCode::GcodeBlocked,
                    "File contains blocked G-code commands and was not uploaded.",
                    json!({
                        "blocked_commands": scan.blocked_commands,
                        "errors": scan.errors,
                        "warnings": scan.warnings,
                    }),
                );
            }
            Ok(scan) => warnings = scan.warnings,
            Err(e) => {
                return err(ErrorCode::Error, format!("could not scan {file_path}: {e}"));
            }
        }
    }

    match adapter.upload_file(path) {
        Ok(result) => {
            ctx.gate().record_audit(
                "upload_file",
                "executed",
                Some(&name),
                serde_json::from_value(json!({"file": &result.file_name})).unwrap_or_default(),
            );
            ok(json!({
                "file_name": result.file_name,
                "message": result.message,
                "warnings": warnings,
            }))
        }
        Err(e) => adapter_error(&e),
    }
}

pub(crate) fn delete_file(ctx: &Kiln, args: &Args, suppress_confirm: bool) -> Value {
    if let Some(envelope) = gate_check(ctx, "delete_file", "files", args, suppress_confirm) {
        return envelope;
    }
    let Some(file_path) = arg_str(args, "file_path") else {
        return err(ErrorCode::InvalidArgs, "file_path is required");
    };
    let (name, adapter) = match resolve_printer(ctx, args) {
        Ok(pair) => pair,
        Err(envelope) => return envelope,
    };
    match adapter.delete_file(file_path) {
        Ok(deleted) => {
            ctx.gate().record_audit(
                "delete_file",
                "executed",
                Some(&name),
                serde_json::from_value(json!({"file": file_path})).unwrap_or_default(),
            );
            ok(json!({"deleted": deleted, "file": file_path}))
        }
        Err(e) => adapter_error(&e),
    }
}

pub(crate) fn start_print(ctx: &Kiln, args: &Args, suppress_confirm: bool) -> Value {
    if let Some(envelope) = gate_check(ctx, "start_print", "print", args, suppress_confirm) {
        return envelope;
    }
    let Some(file_name) = arg_str(args, "file_name") else {
        return err(ErrorCode::InvalidArgs, "file_name is required");
    };
    let (name, adapter) = match resolve_printer(ctx, args) {
        Ok(pair) => pair,
        Err(envelope) => return envelope,
    };

    // Mandatory pre-flight; cannot be skipped.
    let options = PreflightOptions {
        remote_file: Some(file_name.to_string()),
        strict_material: ctx.config().safety.strict_material_check,
        printer_name: name.clone(),
        ..PreflightOptions::default()
    };
    let report = run_preflight(adapter.as_ref(), ctx.materials(), &options);
    if !report.ready {
        ctx.gate().record_audit(
            "start_print",
            "preflight_failed",
            Some(&name),
            serde_json::from_value(json!({"file": file_name, "summary": &report.summary}))
                .unwrap_or_default(),
        );
        return err_with(
            ErrorCode::PreflightFailed,
            report.summary.clone(),
            json!({"preflight": report}),
        );
    }

    match adapter.start_print(file_name) {
        Ok(result) => {
            ctx.gate().record_audit(
                "start_print",
                "executed",
                Some(&name),
                serde_json::from_value(json!({"file": file_name})).unwrap_or_default(),
            );
            ok(json!({"message": result.message, "file_name": file_name}))
        }
        Err(e) => adapter_error(&e),
    }
}

pub(crate) fn cancel_print(ctx: &Kiln, args: &Args, suppress_confirm: bool) -> Value {
    if let Some(envelope) = gate_check(ctx, "cancel_print", "print", args, suppress_confirm) {
        return envelope;
    }
    let (name, adapter) = match resolve_printer(ctx, args) {
        Ok(pair) => pair,
        Err(envelope) => return envelope,
    };
    match adapter.cancel_print() {
        Ok(result) => {
            ctx.gate()
                .record_audit("cancel_print", "executed", Some(&name), Default::default());
            ok(json!({"message": result.message}))
        }
        Err(e) => adapter_error(&e),
    }
}

pub(crate) fn pause_print(ctx: &Kiln, args: &Args) -> Value {
    if let Some(envelope) = gate_check(ctx, "pause_print", "print", args, false) {
        return envelope;
    }
    let (_, adapter) = match resolve_printer(ctx, args) {
        Ok(pair) => pair,
        Err(envelope) => return envelope,
    };
    match adapter.pause_print() {
        Ok(result) => ok(json!({"message": result.message})),
        Err(e) => adapter_error(&e),
    }
}

pub(crate) fn resume_print(ctx: &Kiln, args: &Args) -> Value {
    if let Some(envelope) = gate_check(ctx, "resume_print", "print", args, false) {
        return envelope;
    }
    let (_, adapter) = match resolve_printer(ctx, args) {
        Ok(pair) => pair,
        Err(envelope) => return envelope,
    };
    match adapter.resume_print() {
        Ok(result) => ok(json!({"message": result.message})),
        Err(e) => adapter_error(&e),
    }
}

pub(crate) fn emergency_stop(ctx: &Kiln, args: &Args, suppress_confirm: bool) -> Value {
    if let Some(envelope) = gate_check(ctx, "emergency_stop", "print", args, suppress_confirm) {
        return envelope;
    }
    let (name, adapter) = match resolve_printer(ctx, args) {
        Ok(pair) => pair,
        Err(envelope) => return envelope,
    };
    match adapter.emergency_stop() {
        Ok(result) => {
            ctx.gate()
                .record_audit("emergency_stop", "executed", Some(&name), Default::default());
            ok(json!({"message": result.message}))
        }
        Err(e) => adapter_error(&e),
    }
}

pub(crate) fn set_temperature(ctx: &Kiln, args: &Args, suppress_confirm: bool) -> Value {
    if let Some(envelope) = gate_check(ctx, "set_temperature", "temperature", args, suppress_confirm)
    {
        return envelope;
    }
    let tool_temp = arg_f64(args, "tool_temp");
    let bed_temp = arg_f64(args, "bed_temp");
    if tool_temp.is_none() && bed_temp.is_none() {
        return err(
            ErrorCode::InvalidArgs,
            "At least one of tool_temp or bed_temp must be provided.",
        );
    }
    let (name, adapter) = match resolve_printer(ctx, args) {
        Ok(pair) => pair,
        Err(envelope) => return envelope,
    };

    // Relative-change advisory, never blocking.
    let mut warnings: Vec<String> = Vec::new();
    let state = adapter.get_state();
    if let (Some(requested), Some(current)) = (tool_temp, state.tool_temp_target) {
        if current > 0.0 && (requested - current).abs() > 10.0 {
            warnings.push(format!(
                "Large hotend temperature change: {current:.0}\u{b0}C -> {requested:.0}\u{b0}C"
            ));
        }
    }
    if let (Some(requested), Some(current)) = (bed_temp, state.bed_temp_target) {
        if current > 0.0 && (requested - current).abs() > 50.0 {
            warnings.push(format!(
                "Large bed temperature change: {current:.0}\u{b0}C -> {requested:.0}\u{b0}C"
            ));
        }
    }

    let mut result = json!({});
    if let Some(target) = tool_temp {
        match adapter.set_tool_temp(target) {
            Ok(accepted) => {
                result["tool"] = json!({"target": target, "accepted": accepted});
            }
            Err(e) => return adapter_error(&e),
        }
    }
    if let Some(target) = bed_temp {
        match adapter.set_bed_temp(target) {
            Ok(accepted) => {
                result["bed"] = json!({"target": target, "accepted": accepted});
            }
            Err(e) => return adapter_error(&e),
        }
    }

    ctx.gate().record_audit(
        "set_temperature",
        "executed",
        Some(&name),
        serde_json::from_value(json!({"tool_temp": tool_temp, "bed_temp": bed_temp}))
            .unwrap_or_default(),
    );
    if !warnings.is_empty() {
        result["warnings"] = json!(warnings);
    }
    ok(result)
}

fn split_commands(commands: &str) -> Vec<String> {
    commands
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(ToString::to_string)
        .collect()
}

pub(crate) fn send_gcode(ctx: &Kiln, args: &Args, suppress_confirm: bool) -> Value {
    let dry_run = arg_bool(args, "dry_run").unwrap_or(false);
    // Dry runs skip confirmation: nothing is transmitted.
    if let Some(envelope) =
        gate_check(ctx, "send_gcode", "print", args, suppress_confirm || dry_run)
    {
        return envelope;
    }
    let Some(commands) = arg_str(args, "commands") else {
        return err(ErrorCode::InvalidArgs, "commands is required");
    };
    let (name, adapter) = match resolve_printer(ctx, args) {
        Ok(pair) => pair,
        Err(envelope) => return envelope,
    };

    let lines = split_commands(commands);
    if lines.is_empty() {
        return err(ErrorCode::InvalidArgs, "No commands provided.");
    }
    if lines.len() > MAX_GCODE_BATCH {
        return err(
            ErrorCode::ValidationError,
            format!(
                "Too many commands ({}). Maximum {MAX_GCODE_BATCH} per batch; split into \
                 multiple calls.",
                lines.len()
            ),
        );
    }

    let validation = validate_lines(&lines, &adapter.safety_profile());
    if !validation.valid {
        ctx.gate().record_audit(
            "send_gcode",
            "blocked",
            Some(&name),
            serde_json::from_value(json!({
                "blocked_commands": &validation.blocked_commands,
                "errors": &validation.errors,
            }))
            .unwrap_or_default(),
        );
        // Counts toward the tool's circuit breaker.
        ctx.gate().record_block("send_gcode");
        return err_with(
            ErrorCode::GcodeBlocked,
            "G-code blocked by safety validator.",
            json!({
                "blocked_commands": validation.blocked_commands,
                "errors": validation.errors,
                "warnings": validation.warnings,
            }),
        );
    }

    let count = validation.commands.len();
    if dry_run {
        ctx.gate().record_audit(
            "send_gcode",
            "dry_run",
            Some(&name),
            serde_json::from_value(json!({"count": count})).unwrap_or_default(),
        );
        return ok(json!({
            "dry_run": true,
            "commands_validated": validation.commands,
            "count": count,
            "warnings": validation.warnings,
            "message": format!(
                "{count} command(s) validated successfully. Nothing was sent (dry run)."
            ),
        }));
    }

    if !adapter.capabilities().can_send_gcode {
        return err(
            ErrorCode::Unsupported,
            format!("send_gcode is not supported by the {} adapter", adapter.name()),
        );
    }

    match adapter.send_gcode(&validation.commands) {
        Ok(_) => {
            ctx.gate().record_audit(
                "send_gcode",
                "executed",
                Some(&name),
                serde_json::from_value(json!({"count": count})).unwrap_or_default(),
            );
            ok(json!({
                "commands_sent": validation.commands,
                "count": count,
                "warnings": validation.warnings,
                "message": format!("Sent {count} G-code command(s)."),
            }))
        }
        Err(e) => adapter_error(&e),
    }
}

pub(crate) fn validate_gcode(ctx: &Kiln, args: &Args) -> Value {
    let Some(commands) = arg_str(args, "commands") else {
        return err(ErrorCode::InvalidArgs, "commands is required");
    };
    let (_, adapter) = match resolve_printer(ctx, args) {
        Ok(pair) => pair,
        Err(envelope) => return envelope,
    };
    let lines = split_commands(commands);
    if lines.is_empty() {
        return err(ErrorCode::InvalidArgs, "No commands provided.");
    }
    let validation = validate_lines(&lines, &adapter.safety_profile());
    ok(json!({
        "valid": validation.valid,
        "commands": validation.commands,
        "errors": validation.errors,
        "warnings": validation.warnings,
        "blocked_commands": validation.blocked_commands,
    }))
}

pub(crate) fn preflight_check(ctx: &Kiln, args: &Args) -> Value {
    let (name, adapter) = match resolve_printer(ctx, args) {
        Ok(pair) => pair,
        Err(envelope) => return envelope,
    };
    let options = PreflightOptions {
        file_path: arg_str(args, "file_path").map(Into::into),
        expected_material: arg_str(args, "expected_material").map(ToString::to_string),
        remote_file: arg_str(args, "remote_file").map(ToString::to_string),
        strict_material: ctx.config().safety.strict_material_check,
        printer_name: name,
    };
    let report = run_preflight(adapter.as_ref(), ctx.materials(), &options);
    ok(json!({
        "ready": report.ready,
        "checks": report.checks,
        "errors": report.errors,
        "summary": report.summary,
        "temperatures": {
            "tool_actual": report.tool_temp_actual,
            "tool_target": report.tool_temp_target,
            "bed_actual": report.bed_temp_actual,
            "bed_target": report.bed_temp_target,
        },
    }))
}

pub(crate) fn printer_snapshot(ctx: &Kiln, args: &Args) -> Value {
    let (_, adapter) = match resolve_printer(ctx, args) {
        Ok(pair) => pair,
        Err(envelope) => return envelope,
    };
    match adapter.get_snapshot() {
        Ok(Some(bytes)) => ok(json!({
            "image_b64": base64::engine::general_purpose::STANDARD.encode(&bytes),
            "size_bytes": bytes.len(),
            "stream_url": adapter.get_stream_url(),
        })),
        Ok(None) => ok(json!({
            "image_b64": Value::Null,
            "stream_url": adapter.get_stream_url(),
            "message": "No camera configured for this printer.",
        })),
        Err(e) => adapter_error(&e),
    }
}

pub(crate) fn firmware_status(ctx: &Kiln, args: &Args) -> Value {
    let (_, adapter) = match resolve_printer(ctx, args) {
        Ok(pair) => pair,
        Err(envelope) => return envelope,
    };
    match adapter.get_firmware_status() {
        Ok(status) => ok(json!({"firmware": status})),
        Err(e) => adapter_error(&e),
    }
}

pub(crate) fn update_firmware(ctx: &Kiln, args: &Args, suppress_confirm: bool) -> Value {
    if let Some(envelope) = gate_check(ctx, "update_firmware", "admin", args, suppress_confirm) {
        return envelope;
    }
    let (name, adapter) = match resolve_printer(ctx, args) {
        Ok(pair) => pair,
        Err(envelope) => return envelope,
    };
    match adapter.update_firmware(arg_str(args, "component")) {
        Ok(result) => {
            ctx.gate()
                .record_audit("update_firmware", "executed", Some(&name), Default::default());
            ok(json!({"message": result.message}))
        }
        Err(e) => adapter_error(&e),
    }
}

pub(crate) fn rollback_firmware(ctx: &Kiln, args: &Args, suppress_confirm: bool) -> Value {
    if let Some(envelope) = gate_check(ctx, "rollback_firmware", "admin", args, suppress_confirm) {
        return envelope;
    }
    let Some(component) = arg_str(args, "component") else {
        return err(ErrorCode::InvalidArgs, "component is required");
    };
    let (name, adapter) = match resolve_printer(ctx, args) {
        Ok(pair) => pair,
        Err(envelope) => return envelope,
    };
    match adapter.rollback_firmware(component) {
        Ok(result) => {
            ctx.gate().record_audit(
                "rollback_firmware",
                "executed",
                Some(&name),
                Default::default(),
            );
            ok(json!({"message": result.message}))
        }
        Err(e) => adapter_error(&e),
    }
}

/// Polls until the active print reaches a terminal printer state or the
/// timeout expires.
pub(crate) fn await_print_completion(ctx: &Kiln, args: &Args) -> Value {
    let (_, adapter) = match resolve_printer(ctx, args) {
        Ok(pair) => pair,
        Err(envelope) => return envelope,
    };
    let timeout = Duration::from_secs(arg_u64(args, "timeout_seconds").unwrap_or(3600));
    let poll = Duration::from_secs_f64(
        arg_f64(args, "poll_interval_seconds").unwrap_or(5.0).max(0.1),
    );

    let deadline = Instant::now() + timeout;
    loop {
        let state = adapter.get_state();
        let active = matches!(
            state.state,
            PrinterStatus::Printing | PrinterStatus::Paused | PrinterStatus::Busy
        );
        if !active {
            let progress = adapter.get_job().unwrap_or_default();
            let completed = state.state == PrinterStatus::Idle
                && progress.completion.is_none_or(|pct| pct >= 100.0);
            return ok(json!({
                "completed": completed,
                "timed_out": false,
                "final_state": state.state,
                "connected": state.connected,
                "job": progress,
            }));
        }
        if Instant::now() >= deadline {
            let progress = adapter.get_job().unwrap_or_default();
            return ok(json!({
                "completed": false,
                "timed_out": true,
                "final_state": state.state,
                "job": progress,
                "message": format!(
                    "Print still {} after {}s; call again to keep waiting.",
                    state.state,
                    timeout.as_secs()
                ),
            }));
        }
        std::thread::sleep(poll.min(deadline.saturating_duration_since(Instant::now())));
    }
}
