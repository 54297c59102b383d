//! Recovery planner tools.

use kiln_recovery::CheckpointData;
use kiln_types::{ErrorCode, FailureType, JobId, RecoveryStrategy};
use serde_json::{json, Value};

use crate::context::Kiln;
use crate::envelope::{err, ok, recovery_error};
use crate::tools::{arg_f64, arg_str, Args};

fn parse_job_id(args: &Args) -> Result<JobId, Value> {
    let raw = arg_str(args, "job_id")
        .ok_or_else(|| err(ErrorCode::InvalidArgs, "job_id is required"))?;
    JobId::parse(raw).map_err(|_| err(ErrorCode::InvalidArgs, format!("invalid job_id: {raw:?}")))
}

pub(crate) fn save_checkpoint(ctx: &Kiln, args: &Args) -> Value {
    let job_id = match parse_job_id(args) {
        Ok(id) => id,
        Err(envelope) => return envelope,
    };
    let Some(printer_name) = arg_str(args, "printer_name") else {
        return err(ErrorCode::InvalidArgs, "printer_name is required");
    };
    let phase = arg_str(args, "phase").unwrap_or("printing");
    let Some(progress) = arg_f64(args, "progress_percent") else {
        return err(ErrorCode::InvalidArgs, "progress_percent is required");
    };
    if !(0.0..=100.0).contains(&progress) {
        return err(
            ErrorCode::ValidationError,
            format!("progress_percent must be within 0..=100, got {progress}"),
        );
    }

    let data: CheckpointData = match args.get("state") {
        Some(value) => match serde_json::from_value(value.clone()) {
            Ok(data) => data,
            Err(e) => {
                return err(ErrorCode::ValidationError, format!("invalid state bag: {e}"))
            }
        },
        None => CheckpointData::default(),
    };

    let checkpoint = ctx
        .recovery()
        .save_checkpoint(job_id, printer_name, phase, progress, data);
    ok(json!({"checkpoint": checkpoint}))
}

pub(crate) fn plan_recovery(ctx: &Kiln, args: &Args) -> Value {
    let job_id = match parse_job_id(args) {
        Ok(id) => id,
        Err(envelope) => return envelope,
    };
    let Some(raw) = arg_str(args, "failure_type") else {
        return err(ErrorCode::InvalidArgs, "failure_type is required");
    };
    let Some(failure) = FailureType::parse(raw) else {
        return err(
            ErrorCode::InvalidArgs,
            format!("unknown failure_type: {raw:?}"),
        );
    };

    let recommendation = ctx.recovery().plan_recovery(job_id, failure);
    ok(json!({"recommendation": recommendation}))
}

pub(crate) fn execute_recovery(ctx: &Kiln, args: &Args) -> Value {
    let job_id = match parse_job_id(args) {
        Ok(id) => id,
        Err(envelope) => return envelope,
    };
    let Some(raw) = arg_str(args, "strategy") else {
        return err(ErrorCode::InvalidArgs, "strategy is required");
    };
    let Some(strategy) = RecoveryStrategy::parse(raw) else {
        return err(ErrorCode::InvalidArgs, format!("unknown strategy: {raw:?}"));
    };

    match ctx.recovery().execute_recovery(job_id, strategy) {
        Ok(outcome) => {
            ctx.gate().record_audit(
                "execute_recovery",
                "executed",
                None,
                serde_json::from_value(json!({
                    "job_id": job_id.to_string(),
                    "strategy": strategy,
                }))
                .unwrap_or_default(),
            );
            ok(json!({"outcome": outcome}))
        }
        Err(e) => recovery_error(&e),
    }
}

pub(crate) fn list_recoverable_jobs(ctx: &Kiln, _args: &Args) -> Value {
    let jobs: Vec<String> = ctx
        .recovery()
        .list_recoverable_jobs()
        .into_iter()
        .map(|id| id.to_string())
        .collect();
    let count = jobs.len();
    ok(json!({"jobs": jobs, "count": count}))
}

pub(crate) fn reset_retries(ctx: &Kiln, args: &Args) -> Value {
    let job_id = match parse_job_id(args) {
        Ok(id) => id,
        Err(envelope) => return envelope,
    };
    ctx.recovery().reset_retries(job_id);
    ok(json!({"job_id": job_id.to_string(), "message": "Retry budget reset."}))
}
