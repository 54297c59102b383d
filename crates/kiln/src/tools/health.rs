//! Health monitoring tools.

use std::time::Duration;

use kiln_types::{ErrorCode, MonitorStatus, SessionId};
use serde_json::{json, Value};

use crate::context::Kiln;
use crate::envelope::{err, health_error, ok};
use crate::tools::{arg_f64, arg_str, Args};

fn parse_session_id(args: &Args) -> Result<SessionId, Value> {
    let raw = arg_str(args, "session_id")
        .ok_or_else(|| err(ErrorCode::InvalidArgs, "session_id is required"))?;
    SessionId::parse(raw)
        .map_err(|_| err(ErrorCode::InvalidArgs, format!("invalid session_id: {raw:?}")))
}

fn require_printer(ctx: &Kiln, args: &Args) -> Result<String, Value> {
    match arg_str(args, "printer_name") {
        Some(name) => Ok(name.to_string()),
        None => ctx
            .resolve_printer(None)
            .map(|(name, _)| name)
            .map_err(|message| err(ErrorCode::NotFound, message)),
    }
}

pub(crate) fn printer_health(ctx: &Kiln, args: &Args) -> Value {
    let printer = match require_printer(ctx, args) {
        Ok(name) => name,
        Err(envelope) => return envelope,
    };
    match ctx.monitor().check_health(&printer) {
        Ok(report) => ok(json!({"report": report})),
        Err(e) => health_error(&e),
    }
}

pub(crate) fn start_monitoring(ctx: &Kiln, args: &Args) -> Value {
    let printer = match require_printer(ctx, args) {
        Ok(name) => name,
        Err(envelope) => return envelope,
    };
    let interval = Duration::from_secs_f64(
        arg_f64(args, "interval_seconds").unwrap_or(30.0).max(0.001),
    );
    let job_id = arg_str(args, "job_id").map(ToString::to_string);

    match ctx
        .monitor()
        .start_monitoring(&printer, interval, job_id, None, None)
    {
        Ok(session_id) => ok(json!({
            "session_id": session_id.to_string(),
            "printer_name": printer,
            "interval_seconds": interval.as_secs_f64(),
            "message": format!("Monitoring started for {printer:?}."),
        })),
        Err(e) => health_error(&e),
    }
}

pub(crate) fn stop_monitoring(ctx: &Kiln, args: &Args) -> Value {
    let printer = match require_printer(ctx, args) {
        Ok(name) => name,
        Err(envelope) => return envelope,
    };
    match ctx.monitor().stop_monitoring(&printer) {
        Ok(session) => ok(json!({"session": session})),
        Err(e) => health_error(&e),
    }
}

pub(crate) fn monitor_sessions(ctx: &Kiln, args: &Args) -> Value {
    let status = match arg_str(args, "status") {
        None => None,
        Some("monitoring") => Some(MonitorStatus::Monitoring),
        Some("completed") => Some(MonitorStatus::Completed),
        Some("failed") => Some(MonitorStatus::Failed),
        Some("aborted") => Some(MonitorStatus::Aborted),
        Some("stalled") => Some(MonitorStatus::Stalled),
        Some(other) => {
            return err(
                ErrorCode::InvalidArgs,
                format!("invalid status filter: {other:?}"),
            )
        }
    };
    let sessions = ctx
        .monitor()
        .list_sessions(arg_str(args, "printer_name"), status);
    let count = sessions.len();
    ok(json!({"sessions": sessions, "count": count}))
}

pub(crate) fn health_history(ctx: &Kiln, args: &Args) -> Value {
    let printer = match require_printer(ctx, args) {
        Ok(name) => name,
        Err(envelope) => return envelope,
    };
    let hours = arg_f64(args, "hours").unwrap_or(24.0);
    let reports = ctx.monitor().health_history(&printer, hours);
    let count = reports.len();
    ok(json!({
        "printer_name": printer,
        "hours": hours,
        "reports": reports,
        "count": count,
    }))
}

pub(crate) fn report_print_issue(ctx: &Kiln, args: &Args) -> Value {
    let session_id = match parse_session_id(args) {
        Ok(id) => id,
        Err(envelope) => return envelope,
    };
    let Some(issue_type) = arg_str(args, "issue_type") else {
        return err(ErrorCode::InvalidArgs, "issue_type is required");
    };
    let Some(confidence) = arg_f64(args, "confidence") else {
        return err(ErrorCode::InvalidArgs, "confidence is required");
    };
    let detail = arg_str(args, "detail").map(ToString::to_string);

    match ctx
        .monitor()
        .report_issue(session_id, issue_type, confidence, detail)
    {
        Ok(issue) => ok(json!({"issue": issue})),
        Err(e) => health_error(&e),
    }
}
