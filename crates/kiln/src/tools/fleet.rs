//! Fleet, queue, and event tools.

use kiln_config::PrinterBackend;
use kiln_orchestrator::SubmitRequest;
use kiln_types::{ErrorCode, JobId, JobStatus};
use serde_json::{json, Value};

use crate::context::Kiln;
use crate::envelope::{adapter_error, err, ok, orchestrator_error};
use crate::tools::{arg_i64, arg_str, arg_u64, capped_limit, gate_check, Args};

fn job_view(job: &kiln_orchestrator::Job) -> Value {
    json!({
        "job_id": job.id.to_string(),
        "file_path": job.file_path,
        "printer_name": job.printer_name,
        "status": job.status,
        "submitted_at": job.submitted_at,
        "started_at": job.started_at,
        "completed_at": job.completed_at,
        "submitted_by": job.submitted_by,
        "priority": job.priority,
        "error": job.error,
        "attempt": job.attempt,
        "max_attempts": job.max_attempts,
        "preferred_printer": job.preferred_printer,
        "failed_printers": job.failed_printers,
        "metadata": job.metadata,
        "elapsed_seconds": job.elapsed_seconds(),
        "wait_seconds": job.wait_seconds(),
        "is_terminal": job.is_terminal(),
    })
}

fn parse_job_id(args: &Args) -> Result<JobId, Value> {
    let raw = arg_str(args, "job_id")
        .ok_or_else(|| err(ErrorCode::InvalidArgs, "job_id is required"))?;
    JobId::parse(raw).map_err(|_| err(ErrorCode::InvalidArgs, format!("invalid job_id: {raw:?}")))
}

pub(crate) fn fleet_status(ctx: &Kiln, _args: &Args) -> Value {
    ctx.ensure_default_printer();
    if ctx.registry().is_empty() {
        return ok(json!({
            "printers": [],
            "count": 0,
            "message": "No printers registered.",
        }));
    }
    let status = ctx.registry().refresh_all();
    let idle = ctx.registry().get_idle_printers();
    let count = status.len();
    ok(json!({
        "printers": status,
        "count": count,
        "idle_printers": idle,
    }))
}

pub(crate) fn fleet_utilization(ctx: &Kiln, _args: &Args) -> Value {
    ctx.registry().refresh_all();
    ok(json!({"utilization": ctx.orchestrator().utilization()}))
}

pub(crate) fn register_printer(ctx: &Kiln, args: &Args) -> Value {
    if let Some(envelope) = gate_check(ctx, "register_printer", "admin", args, false) {
        return envelope;
    }
    let Some(name) = arg_str(args, "name") else {
        return err(ErrorCode::InvalidArgs, "name is required");
    };
    let Some(printer_type) = arg_str(args, "printer_type") else {
        return err(ErrorCode::InvalidArgs, "printer_type is required");
    };
    let Some(host) = arg_str(args, "host") else {
        return err(ErrorCode::InvalidArgs, "host is required");
    };
    let Some(backend) = PrinterBackend::parse(printer_type) else {
        return err(
            ErrorCode::InvalidArgs,
            format!(
                "unsupported printer_type {printer_type:?}; expected octoprint, moonraker, \
                 bambu, prusaconnect, or serial"
            ),
        );
    };

    let adapter = match Kiln::build_adapter(
        backend,
        host,
        arg_str(args, "api_key"),
        arg_str(args, "serial"),
        arg_str(args, "model").unwrap_or_default(),
    ) {
        Ok(adapter) => adapter,
        Err(e) => return adapter_error(&e),
    };

    match ctx.registry().register(name, adapter) {
        Ok(()) => {
            ctx.registry().refresh_all();
            ok(json!({
                "name": name,
                "message": format!("Registered printer {name:?} ({printer_type} @ {host})."),
            }))
        }
        Err(e) => err(ErrorCode::ValidationError, e.to_string()),
    }
}

pub(crate) fn unregister_printer(ctx: &Kiln, args: &Args) -> Value {
    if let Some(envelope) = gate_check(ctx, "unregister_printer", "admin", args, false) {
        return envelope;
    }
    let Some(name) = arg_str(args, "name") else {
        return err(ErrorCode::InvalidArgs, "name is required");
    };
    if ctx.registry().unregister(name) {
        ok(json!({"name": name, "message": format!("Unregistered printer {name:?}.")}))
    } else {
        err(ErrorCode::NotFound, format!("printer not found: {name:?}"))
    }
}

pub(crate) fn submit_job(ctx: &Kiln, args: &Args) -> Value {
    if let Some(envelope) = gate_check(ctx, "submit_job", "queue", args, false) {
        return envelope;
    }
    let Some(file_path) = arg_str(args, "file_path").or_else(|| arg_str(args, "file_name")) else {
        return err(ErrorCode::InvalidArgs, "file_path is required");
    };

    let mut request = SubmitRequest::new(file_path)
        .submitted_by(arg_str(args, "submitted_by").unwrap_or("agent"))
        .priority(arg_i64(args, "priority").unwrap_or(0));
    if let Some(printer) = arg_str(args, "printer_name") {
        request = request.preferred_printer(printer);
    }
    if let Some(max_attempts) = arg_u64(args, "max_attempts") {
        request = request.max_attempts(max_attempts as u32);
    }
    if let Some(Value::Object(metadata)) = args.get("metadata") {
        request.metadata = metadata.clone();
    }

    match ctx.orchestrator().submit(request) {
        Ok(job_id) => ok(json!({
            "job_id": job_id.to_string(),
            "message": format!("Job {job_id} submitted to queue."),
        })),
        Err(e) => orchestrator_error(&e),
    }
}

pub(crate) fn assign_jobs(ctx: &Kiln, _args: &Args) -> Value {
    ctx.registry().refresh_all();
    let results = ctx.orchestrator().assign_all();
    let assigned = results.iter().filter(|r| r.success).count();
    ok(json!({
        "results": results,
        "assigned": assigned,
    }))
}

pub(crate) fn job_status(ctx: &Kiln, args: &Args) -> Value {
    let job_id = match parse_job_id(args) {
        Ok(id) => id,
        Err(envelope) => return envelope,
    };
    match ctx.orchestrator().get_job(job_id) {
        Some(job) => ok(json!({"job": job_view(&job)})),
        None => err(ErrorCode::NotFound, format!("Job not found: {job_id}")),
    }
}

pub(crate) fn queue_summary(ctx: &Kiln, _args: &Args) -> Value {
    let orch = ctx.orchestrator();
    let util = orch.utilization();
    let queued = orch.list_jobs(Some(JobStatus::Queued), None, usize::MAX);
    // Highest priority first, FIFO tie-break: the next job to run.
    let next = queued
        .iter()
        .min_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.submitted_at.cmp(&b.submitted_at))
        })
        .map(job_view);
    let recent = orch.list_jobs(None, None, 10);
    ok(json!({
        "counts": {
            "queued": util.queued_jobs,
            "active": util.active_jobs,
            "completed": util.completed_jobs,
            "failed": util.failed_jobs,
            "cancelled": util.cancelled_jobs,
        },
        "total": orch.job_count(),
        "next_job": next,
        "recent_jobs": recent.iter().map(job_view).collect::<Vec<_>>(),
    }))
}

pub(crate) fn cancel_job(ctx: &Kiln, args: &Args) -> Value {
    if let Some(envelope) = gate_check(ctx, "cancel_job", "queue", args, false) {
        return envelope;
    }
    let job_id = match parse_job_id(args) {
        Ok(id) => id,
        Err(envelope) => return envelope,
    };
    let reason = arg_str(args, "reason").unwrap_or("user requested");

    // Stopping the hardware is the caller's duty when the job is mid-print;
    // the dispatcher does it here so agents get one coherent tool.
    let job = ctx.orchestrator().get_job(job_id);
    if let Some(job) = &job {
        if job.status == JobStatus::Printing {
            if let Some(printer) = &job.printer_name {
                if let Some(adapter) = ctx.registry().get(printer) {
                    if let Err(e) = adapter.cancel_print() {
                        tracing::warn!(job = %job_id, printer = %printer, error = %e,
                            "printer cancel failed while cancelling job");
                    }
                }
            }
        }
    }

    match ctx.orchestrator().cancel(job_id, reason) {
        Ok(cancelled) => ok(json!({
            "cancelled": cancelled,
            "message": if cancelled {
                format!("Job {job_id} cancelled.")
            } else {
                format!("Job {job_id} is already terminal; nothing to cancel.")
            },
        })),
        Err(e) => orchestrator_error(&e),
    }
}

pub(crate) fn job_history(ctx: &Kiln, args: &Args) -> Value {
    let limit = capped_limit(args, 20, 100);
    let status_filter = match arg_str(args, "status") {
        None => None,
        Some("completed") => Some(JobStatus::Completed),
        Some("failed") => Some(JobStatus::Failed),
        Some("cancelled") => Some(JobStatus::Cancelled),
        Some(other) => {
            return err(
                ErrorCode::InvalidArgs,
                format!("invalid status filter {other:?}; use completed, failed, or cancelled"),
            )
        }
    };

    match ctx.job_store().list_jobs(status_filter, limit) {
        Ok(rows) => {
            let rows: Vec<_> = rows
                .into_iter()
                .filter(|row| row.status.is_terminal())
                .collect();
            let count = rows.len();
            ok(json!({"jobs": rows, "count": count}))
        }
        Err(e) => err(ErrorCode::InternalError, e.to_string()),
    }
}

pub(crate) fn recent_events(ctx: &Kiln, args: &Args) -> Value {
    let limit = capped_limit(args, 20, 100);
    let events = ctx.bus().recent_events(limit);
    let count = events.len();
    ok(json!({"events": events, "count": count}))
}
