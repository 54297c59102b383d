//! The gate itself: stages 1–4 of the pipeline plus audit, in one
//! mutex-per-component bundle shared by every tool handler.

use kiln_events::EventBus;
use kiln_types::{ErrorCode, Event, EventType, Metadata};

use crate::audit::AuditLog;
use crate::auth::{AuthMode, AuthService};
use crate::classification::{rate_limits_for, safety_level_for};
use crate::confirm::{ConfirmError, ConfirmationGate, PendingAction, CONFIRM_TOKEN_TTL_SECONDS};
use crate::ratelimit::{RateCheck, ToolRateLimiter};

/// Gate toggles, typically lifted from `KilnConfig`.
#[derive(Debug, Clone, Default)]
pub struct GateConfig {
    /// Interpose confirmation tokens for confirm/emergency tools.
    pub confirm_mode: bool,
    /// Authentication mode for the tool surface.
    pub auth: Option<(String, Vec<String>)>,
}

/// What the gate decided about one invocation.
#[derive(Debug, Clone)]
pub enum GateDecision {
    /// All stages passed; run the tool.
    Proceed,
    /// Confirm mode interposed; redeem the token to execute.
    ConfirmationRequired {
        token: String,
        tool_name: String,
        expires_in_seconds: u64,
        message: String,
    },
    /// Refused at some stage; return the error envelope.
    Refused { code: ErrorCode, message: String },
}

/// Synchronous pre-action validator for every gated tool call.
pub struct SafetyGate {
    auth: AuthService,
    confirm_mode: bool,
    limiter: ToolRateLimiter,
    confirmations: ConfirmationGate,
    audit: AuditLog,
    bus: EventBus,
}

impl SafetyGate {
    pub fn new(config: &GateConfig, bus: EventBus, audit: AuditLog) -> Self {
        let auth = match &config.auth {
            Some((token, scopes)) => AuthService::new(AuthMode::Token {
                token: token.clone(),
                scopes: scopes.clone(),
            }),
            None => AuthService::disabled(),
        };
        Self {
            auth,
            confirm_mode: config.confirm_mode,
            limiter: ToolRateLimiter::new(),
            confirmations: ConfirmationGate::new(),
            audit,
            bus,
        }
    }

    /// Runs stages 1–4 for one invocation.
    ///
    /// `suppress_confirmation` is set by `confirm_action` so the
    /// confirmed execution does not re-mint a token; every other stage
    /// still applies to it.
    pub fn admit(
        &self,
        tool_name: &str,
        scope: &str,
        args: &Metadata,
        presented_token: Option<&str>,
        suppress_confirmation: bool,
    ) -> GateDecision {
        self.admit_deferrable(
            tool_name,
            scope,
            args,
            presented_token,
            suppress_confirmation,
            false,
        )
    }

    /// Like [`Self::admit`], but `force_confirm` interposes a
    /// confirmation token regardless of confirm mode (upload
    /// confirmation). A deferred invocation passes the rate-limit check
    /// without consuming a slot; the slot is consumed when the confirmed
    /// execution re-enters with confirmation suppressed.
    pub fn admit_deferrable(
        &self,
        tool_name: &str,
        scope: &str,
        args: &Metadata,
        presented_token: Option<&str>,
        suppress_confirmation: bool,
        force_confirm: bool,
    ) -> GateDecision {
        let will_defer = !suppress_confirmation
            && (force_confirm
                || (self.confirm_mode && safety_level_for(tool_name).requires_confirmation()));

        // 1. Authentication.
        if let Some(denial) = self.auth.check(presented_token, scope) {
            self.record_audit(tool_name, "auth_denied", None, {
                let mut d = Metadata::new();
                d.insert("message".into(), serde_json::json!(denial));
                d
            });
            return GateDecision::Refused {
                code: ErrorCode::AuthError,
                message: denial,
            };
        }

        // 2 + 3. Rate limits and circuit breaker.
        if let Some((min_interval_ms, max_per_minute)) = rate_limits_for(tool_name) {
            match self
                .limiter
                .check(tool_name, min_interval_ms, max_per_minute, !will_defer)
            {
                RateCheck::Allowed => {}
                RateCheck::Limited { message } => {
                    self.record_audit(tool_name, "rate_limited", None, {
                        let mut d = Metadata::new();
                        d.insert("message".into(), serde_json::json!(message));
                        d
                    });
                    // Rate violations feed the breaker.
                    self.note_block(tool_name);
                    return GateDecision::Refused {
                        code: ErrorCode::RateLimited,
                        message,
                    };
                }
                RateCheck::Escalated { message, .. } => {
                    self.record_audit(tool_name, "escalated", None, {
                        let mut d = Metadata::new();
                        d.insert("message".into(), serde_json::json!(message));
                        d
                    });
                    return GateDecision::Refused {
                        code: ErrorCode::SafetyEscalated,
                        message,
                    };
                }
            }
        }

        // 4. Two-phase confirmation.
        if will_defer {
            let token = self.confirmations.mint(tool_name, args.clone());
            self.record_audit(tool_name, "confirmation_required", None, {
                let mut d = Metadata::new();
                d.insert("args".into(), serde_json::json!(args));
                d
            });
            let level = safety_level_for(tool_name);
            return GateDecision::ConfirmationRequired {
                message: format!(
                    "{tool_name} requires confirmation (safety level: {level}). \
                     Call confirm_action with token {token:?} to proceed. Token \
                     expires in {} minutes.",
                    CONFIRM_TOKEN_TTL_SECONDS / 60
                ),
                token,
                tool_name: tool_name.to_string(),
                expires_in_seconds: CONFIRM_TOKEN_TTL_SECONDS,
            };
        }

        GateDecision::Proceed
    }

    /// Records a post-admission block (G-code refusal, preflight
    /// failure) toward the tool's circuit breaker.
    pub fn record_block(&self, tool_name: &str) {
        self.note_block(tool_name);
    }

    fn note_block(&self, tool_name: &str) {
        if let Some(escalation) = self.limiter.record_block(tool_name) {
            self.record_audit(tool_name, "escalated", None, {
                let mut d = Metadata::new();
                d.insert("message".into(), serde_json::json!(escalation));
                d
            });
            let mut data = Metadata::new();
            data.insert("tool".into(), serde_json::json!(tool_name));
            data.insert("message".into(), serde_json::json!(escalation));
            self.bus
                .publish(Event::new(EventType::SafetyEscalated, data, "safety_gate"));
            tracing::warn!(tool = tool_name, "circuit breaker tripped");
        }
    }

    /// Redeems a confirmation token, auditing the redemption.
    pub fn redeem(&self, token: &str) -> Result<PendingAction, ConfirmError> {
        let action = self.confirmations.take(token)?;
        self.record_audit(&action.tool_name, "confirmed", None, {
            let mut d = Metadata::new();
            d.insert("args".into(), serde_json::json!(action.args));
            d
        });
        Ok(action)
    }

    /// Appends an audit entry; best-effort by construction.
    pub fn record_audit(
        &self,
        tool_name: &str,
        action: &str,
        printer_name: Option<&str>,
        details: Metadata,
    ) {
        self.audit.record(tool_name, action, printer_name, details);
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.audit
    }

    pub fn auth_enabled(&self) -> bool {
        self.auth.enabled()
    }

    pub fn confirm_mode(&self) -> bool {
        self.confirm_mode
    }

    pub fn in_cooldown(&self, tool_name: &str) -> bool {
        self.limiter.in_cooldown(tool_name)
    }
}

#[cfg(test)]
mod tests {
    use kiln_types::SafetyLevel;

    use super::*;

    fn gate(config: GateConfig) -> SafetyGate {
        SafetyGate::new(&config, EventBus::new(), AuditLog::new())
    }

    #[test]
    fn safe_tool_proceeds_without_limits() {
        let g = gate(GateConfig::default());
        for _ in 0..10 {
            assert!(matches!(
                g.admit("printer_status", "status", &Metadata::new(), None, false),
                GateDecision::Proceed
            ));
        }
    }

    #[test]
    fn auth_denial_is_audited() {
        let g = gate(GateConfig {
            auth: Some(("secret".into(), vec!["print".into()])),
            ..GateConfig::default()
        });

        let denied = g.admit("start_print", "print", &Metadata::new(), None, false);
        assert!(matches!(
            denied,
            GateDecision::Refused {
                code: ErrorCode::AuthError,
                ..
            }
        ));
        assert_eq!(g.audit_log().query(Some("auth_denied"), None, 10).len(), 1);

        let allowed = g.admit(
            "start_print",
            "print",
            &Metadata::new(),
            Some("secret"),
            false,
        );
        assert!(matches!(allowed, GateDecision::Proceed));

        let wrong_scope = g.admit("register_printer", "admin", &Metadata::new(), Some("secret"), false);
        assert!(matches!(
            wrong_scope,
            GateDecision::Refused {
                code: ErrorCode::AuthError,
                ..
            }
        ));
    }

    #[test]
    fn rapid_calls_hit_the_interval_limit() {
        let g = gate(GateConfig::default());
        assert!(matches!(
            g.admit("set_temperature", "temperature", &Metadata::new(), None, false),
            GateDecision::Proceed
        ));
        // Immediately again: under the 2000ms minimum interval.
        let second = g.admit("set_temperature", "temperature", &Metadata::new(), None, false);
        assert!(matches!(
            second,
            GateDecision::Refused {
                code: ErrorCode::RateLimited,
                ..
            }
        ));
        assert_eq!(g.audit_log().query(Some("rate_limited"), None, 10).len(), 1);
    }

    #[test]
    fn three_blocks_escalate_and_publish() {
        let bus = EventBus::new();
        let escalations = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = std::sync::Arc::clone(&escalations);
        bus.subscribe(Some(kiln_types::EventType::SafetyEscalated), move |_| {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });
        let g = SafetyGate::new(&GateConfig::default(), bus, AuditLog::new());

        g.record_block("send_gcode");
        g.record_block("send_gcode");
        assert!(!g.in_cooldown("send_gcode"));
        g.record_block("send_gcode");
        assert!(g.in_cooldown("send_gcode"));
        assert_eq!(escalations.load(std::sync::atomic::Ordering::SeqCst), 1);

        // The next invocation, even with valid input, is escalated.
        let refused = g.admit("send_gcode", "print", &Metadata::new(), None, false);
        match refused {
            GateDecision::Refused { code, message } => {
                assert_eq!(code, ErrorCode::SafetyEscalated);
                assert!(message.contains("cooldown"));
            }
            other => panic!("expected refusal, got {other:?}"),
        }
    }

    #[test]
    fn confirm_mode_interposes_token_once() {
        let g = gate(GateConfig {
            confirm_mode: true,
            ..GateConfig::default()
        });

        let mut args = Metadata::new();
        args.insert("file_name".into(), serde_json::json!("benchy.gcode"));
        let decision = g.admit("start_print", "print", &args, None, false);
        let GateDecision::ConfirmationRequired { token, tool_name, .. } = decision else {
            panic!("expected confirmation request");
        };
        assert_eq!(tool_name, "start_print");
        assert_eq!(safety_level_for("start_print"), SafetyLevel::Confirm);

        // Redeeming hands back the deferred call and audits it.
        let action = g.redeem(&token).unwrap();
        assert_eq!(action.tool_name, "start_print");
        assert_eq!(action.args["file_name"], "benchy.gcode");
        assert_eq!(g.audit_log().query(Some("confirmed"), None, 10).len(), 1);

        // Suppressed re-entry (the confirmed execution) skips stage 4.
        let rerun = g.admit("start_print", "print", &args, None, true);
        assert!(matches!(rerun, GateDecision::Proceed));

        // Tokens are single-use.
        assert!(g.redeem(&token).is_err());
    }

    #[test]
    fn deferred_call_consumes_no_rate_slot() {
        let g = gate(GateConfig {
            confirm_mode: true,
            ..GateConfig::default()
        });

        // start_print has a 5s minimum interval. The deferred request
        // must not start that clock, or confirmation within 5s would
        // always be rate-limited.
        let decision = g.admit("start_print", "print", &Metadata::new(), None, false);
        assert!(matches!(decision, GateDecision::ConfirmationRequired { .. }));

        let confirmed = g.admit("start_print", "print", &Metadata::new(), None, true);
        assert!(matches!(confirmed, GateDecision::Proceed));

        // The executed call did consume the slot.
        let rapid = g.admit("start_print", "print", &Metadata::new(), None, true);
        assert!(matches!(
            rapid,
            GateDecision::Refused {
                code: ErrorCode::RateLimited,
                ..
            }
        ));
    }

    #[test]
    fn forced_confirmation_without_confirm_mode() {
        let g = gate(GateConfig::default());
        let decision = g.admit_deferrable(
            "upload_file",
            "files",
            &Metadata::new(),
            None,
            false,
            true,
        );
        assert!(matches!(decision, GateDecision::ConfirmationRequired { .. }));

        // Suppressed re-entry proceeds even with the force flag set.
        let rerun = g.admit_deferrable("upload_file", "files", &Metadata::new(), None, true, true);
        assert!(matches!(rerun, GateDecision::Proceed));
    }

    #[test]
    fn caution_tools_skip_confirmation() {
        let g = gate(GateConfig {
            confirm_mode: true,
            ..GateConfig::default()
        });
        let decision = g.admit("pause_print", "print", &Metadata::new(), None, false);
        assert!(matches!(decision, GateDecision::Proceed));
    }
}
