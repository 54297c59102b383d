//! Tool-result envelopes.
//!
//! Every tool returns `{"success": true, ...}` or
//! `{"success": false, "error": {"code", "message", "retryable"}}`.
//! Retryability is derived from the code, so agents can branch on it
//! without parsing messages.

use kiln_adapters::AdapterError;
use kiln_health::HealthError;
use kiln_orchestrator::OrchestratorError;
use kiln_recovery::RecoveryError;
use kiln_safety::ConfirmError;
use kiln_types::ErrorCode;
use serde_json::{json, Map, Value};

/// A successful envelope with extra fields merged in.
pub fn ok(fields: Value) -> Value {
    let mut envelope = Map::new();
    envelope.insert("success".into(), json!(true));
    if let Value::Object(extra) = fields {
        for (key, value) in extra {
            envelope.insert(key, value);
        }
    }
    Value::Object(envelope)
}

/// A failed envelope.
pub fn err(code: ErrorCode, message: impl Into<String>) -> Value {
    json!({
        "success": false,
        "error": {
            "code": code.as_str(),
            "message": message.into(),
            "retryable": code.retryable(),
        },
    })
}

/// A failed envelope with extra diagnostic fields alongside the error.
pub fn err_with(code: ErrorCode, message: impl Into<String>, fields: Value) -> Value {
    let mut envelope = err(code, message);
    if let (Value::Object(envelope), Value::Object(extra)) = (&mut envelope, fields) {
        for (key, value) in extra {
            envelope.insert(key, value);
        }
    }
    envelope
}

pub fn adapter_error(error: &AdapterError) -> Value {
    let code = match error {
        AdapterError::FileNotFound(_) => ErrorCode::FileNotFound,
        AdapterError::TemperatureOutOfRange { .. } => ErrorCode::ValidationError,
        AdapterError::Unsupported { .. } => ErrorCode::Unsupported,
        AdapterError::InvalidArgument(_) => ErrorCode::InvalidArgs,
        _ => ErrorCode::Error,
    };
    err(code, error.to_string())
}

pub fn orchestrator_error(error: &OrchestratorError) -> Value {
    let code = match error {
        OrchestratorError::JobNotFound(_) => ErrorCode::NotFound,
        OrchestratorError::InvalidTransition { .. } | OrchestratorError::AlreadyTerminal { .. } => {
            ErrorCode::InvalidState
        }
        OrchestratorError::EmptyFilePath => ErrorCode::InvalidArgs,
    };
    err(code, error.to_string())
}

pub fn health_error(error: &HealthError) -> Value {
    let code = match error {
        HealthError::PrinterNotFound(_) | HealthError::SessionNotFound(_) => ErrorCode::NotFound,
        HealthError::AlreadyMonitoring(_) | HealthError::SessionNotActive { .. } => {
            ErrorCode::InvalidState
        }
        HealthError::InvalidConfidence(_) => ErrorCode::ValidationError,
    };
    err(code, error.to_string())
}

pub fn recovery_error(error: &RecoveryError) -> Value {
    err(ErrorCode::ValidationError, error.to_string())
}

pub fn confirm_error(error: &ConfirmError) -> Value {
    let code = match error {
        ConfirmError::InvalidToken => ErrorCode::InvalidToken,
        ConfirmError::TokenExpired { .. } => ErrorCode::TokenExpired,
    };
    err(code, error.to_string())
}
