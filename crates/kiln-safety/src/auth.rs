//! Token-with-scope authentication for the tool surface.
//!
//! Deliberately minimal: deployments that want real identity put a
//! gateway in front. When disabled (the default) every check passes, so
//! existing setups keep working unchanged.

/// Authentication mode for the gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMode {
    /// No authentication; every request is allowed.
    Disabled,
    /// A single static token; scopes listed at construction.
    Token {
        token: String,
        /// Scopes the token grants. Empty grants every scope.
        scopes: Vec<String>,
    },
}

/// Validates a presented token against the required scope.
pub struct AuthService {
    mode: AuthMode,
}

impl AuthService {
    pub fn new(mode: AuthMode) -> Self {
        Self { mode }
    }

    pub fn disabled() -> Self {
        Self::new(AuthMode::Disabled)
    }

    pub fn enabled(&self) -> bool {
        self.mode != AuthMode::Disabled
    }

    /// Returns a human-readable denial reason, or `None` when allowed.
    pub fn check(&self, presented: Option<&str>, scope: &str) -> Option<String> {
        match &self.mode {
            AuthMode::Disabled => None,
            AuthMode::Token { token, scopes } => {
                let Some(presented) = presented else {
                    return Some("authentication required but no token presented".into());
                };
                if presented != token {
                    return Some("invalid authentication token".into());
                }
                if !scopes.is_empty() && !scopes.iter().any(|s| s == scope) {
                    return Some(format!("token lacks required scope {scope:?}"));
                }
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_allows_everything() {
        let auth = AuthService::disabled();
        assert!(!auth.enabled());
        assert!(auth.check(None, "print").is_none());
        assert!(auth.check(Some("whatever"), "admin").is_none());
    }

    #[test]
    fn token_must_match() {
        let auth = AuthService::new(AuthMode::Token {
            token: "secret".into(),
            scopes: vec![],
        });
        assert!(auth.enabled());
        assert!(auth.check(None, "print").is_some());
        assert!(auth.check(Some("wrong"), "print").is_some());
        assert!(auth.check(Some("secret"), "print").is_none());
    }

    #[test]
    fn scopes_restrict_when_listed() {
        let auth = AuthService::new(AuthMode::Token {
            token: "secret".into(),
            scopes: vec!["print".into(), "files".into()],
        });
        assert!(auth.check(Some("secret"), "print").is_none());
        assert!(auth.check(Some("secret"), "admin").is_some());
    }
}
