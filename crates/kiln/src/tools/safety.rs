//! Safety dashboard, audit, confirmation, profile, and material tools.

use kiln_safety::{blocked_command_names, confirm_level_tools, RATE_LIMITS};
use kiln_types::ErrorCode;
use serde_json::{json, Value};

use crate::context::Kiln;
use crate::envelope::{confirm_error, err, ok};
use crate::tools::{arg_str, capped_limit, dispatch, Args};

pub(crate) fn safety_status(ctx: &Kiln, args: &Args) -> Value {
    // Profile of the targeted printer when one is resolvable, else the
    // configured model, else generic limits.
    let profile = match ctx.resolve_printer(arg_str(args, "printer_name")) {
        Ok((_, adapter)) => adapter.safety_profile(),
        Err(_) => kiln_adapters::resolve_profile(&ctx.config().printer.model),
    };

    let rate_limits: serde_json::Map<String, Value> = RATE_LIMITS
        .iter()
        .map(|(tool, interval_ms, per_minute)| {
            (
                (*tool).to_string(),
                json!(format!("{interval_ms}ms cooldown, {per_minute}/min")),
            )
        })
        .collect();

    let summary = ctx.gate().audit_log().summary(3600);
    let summary_line = format!(
        "Safety profile: {}. Temp limits: {}\u{b0}C hotend / {}\u{b0}C bed. \
         {} rate-limited tools. {} blocked action(s) in the last hour.",
        profile.display_name,
        profile.max_hotend_temp,
        profile.max_bed_temp,
        RATE_LIMITS.len(),
        summary.blocked,
    );

    ok(json!({
        "safety_profile": &profile,
        "temperature_limits": {
            "max_hotend": profile.max_hotend_temp,
            "max_bed": profile.max_bed_temp,
        },
        "rate_limits": rate_limits,
        "confirm_level_tools": confirm_level_tools(),
        "auth": {"enabled": ctx.gate().auth_enabled()},
        "confirm_mode_enabled": ctx.gate().confirm_mode(),
        "blocked_gcode_commands": blocked_command_names(),
        "recent_blocked_actions": summary.recent_blocked,
        "summary": summary_line,
    }))
}

pub(crate) fn safety_audit(ctx: &Kiln, args: &Args) -> Value {
    let limit = capped_limit(args, 25, 100);
    let entries = ctx
        .gate()
        .audit_log()
        .query(arg_str(args, "action"), arg_str(args, "tool_name"), limit);
    let summary = ctx.gate().audit_log().summary(3600);
    ok(json!({"entries": entries, "summary": summary}))
}

pub(crate) fn safety_settings(ctx: &Kiln, _args: &Args) -> Value {
    let safety = &ctx.config().safety;
    ok(json!({
        "confirm_mode": safety.confirm_mode,
        "confirm_upload": safety.confirm_upload,
        "strict_material_check": safety.strict_material_check,
        "auth_enabled": safety.auth_enabled,
    }))
}

/// Executes a previously requested action that required confirmation.
///
/// The confirmed call re-enters the dispatcher with the confirmation
/// stage suppressed, so rate limits and G-code analysis still apply.
pub(crate) fn confirm_action(ctx: &Kiln, args: &Args) -> Value {
    let Some(token) = arg_str(args, "token") else {
        return err(ErrorCode::InvalidArgs, "token is required");
    };
    match ctx.gate().redeem(token) {
        Ok(action) => dispatch(ctx, &action.tool_name, &action.args, true),
        Err(e) => confirm_error(&e),
    }
}

pub(crate) fn list_safety_profiles(_ctx: &Kiln, _args: &Args) -> Value {
    let profiles = kiln_adapters::list_profiles();
    let count = profiles.len();
    ok(json!({"profiles": profiles, "count": count}))
}

pub(crate) fn get_safety_profile(_ctx: &Kiln, args: &Args) -> Value {
    let Some(printer_id) = arg_str(args, "printer_id") else {
        return err(ErrorCode::InvalidArgs, "printer_id is required");
    };
    match kiln_adapters::get_profile(printer_id) {
        Some(profile) => ok(json!({"profile": profile})),
        None => err(
            ErrorCode::NotFound,
            format!("no safety profile for {printer_id:?}"),
        ),
    }
}

pub(crate) fn set_material(ctx: &Kiln, args: &Args) -> Value {
    let Some(material_type) = arg_str(args, "material_type") else {
        return err(ErrorCode::InvalidArgs, "material_type is required");
    };
    let printer = match ctx.resolve_printer(arg_str(args, "printer_name")) {
        Ok((name, _)) => name,
        Err(message) => return err(ErrorCode::NotFound, message),
    };
    ctx.materials().set_material(
        &printer,
        material_type,
        arg_str(args, "color").map(ToString::to_string),
    );
    ok(json!({
        "printer_name": printer,
        "material_type": material_type.to_ascii_uppercase(),
    }))
}

pub(crate) fn get_material(ctx: &Kiln, args: &Args) -> Value {
    let printer = match ctx.resolve_printer(arg_str(args, "printer_name")) {
        Ok((name, _)) => name,
        Err(message) => return err(ErrorCode::NotFound, message),
    };
    match ctx.materials().get_material(&printer) {
        Some(material) => ok(json!({"printer_name": printer, "material": material})),
        None => ok(json!({
            "printer_name": printer,
            "material": Value::Null,
            "message": "No material recorded for this printer.",
        })),
    }
}

pub(crate) fn check_material_match(ctx: &Kiln, args: &Args) -> Value {
    let Some(expected) = arg_str(args, "expected_material") else {
        return err(ErrorCode::InvalidArgs, "expected_material is required");
    };
    let printer = match ctx.resolve_printer(arg_str(args, "printer_name")) {
        Ok((name, _)) => name,
        Err(message) => return err(ErrorCode::NotFound, message),
    };
    match ctx.materials().check_match(&printer, expected) {
        None => ok(json!({"matches": true, "printer_name": printer})),
        Some(mismatch) => ok(json!({
            "matches": false,
            "printer_name": printer,
            "message": mismatch,
        })),
    }
}
