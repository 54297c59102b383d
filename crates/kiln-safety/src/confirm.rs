//! Two-phase confirmation for destructive tools.
//!
//! When confirm mode is active, a confirm/emergency-level tool call
//! returns an opaque token instead of executing. `confirm_action`
//! redeems the token within its TTL to run the original call exactly
//! once; tokens are single-use and pruned lazily.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use kiln_types::Metadata;
use rand::RngCore;
use thiserror::Error;

/// Token lifetime.
pub const CONFIRM_TOKEN_TTL_SECONDS: u64 = 300;

/// Errors redeeming a confirmation token.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfirmError {
    #[error("invalid or already-used confirmation token")]
    InvalidToken,

    #[error("confirmation token expired ({age_s}s old, limit {limit_s}s); re-issue the original command")]
    TokenExpired { age_s: u64, limit_s: u64 },
}

/// A deferred tool call awaiting confirmation.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingAction {
    pub tool_name: String,
    pub args: Metadata,
}

struct PendingEntry {
    action: PendingAction,
    created: Instant,
}

/// Mints and redeems single-use confirmation tokens.
pub struct ConfirmationGate {
    ttl: Duration,
    pending: Mutex<HashMap<String, PendingEntry>>,
}

impl ConfirmationGate {
    pub fn new() -> Self {
        Self::with_ttl(Duration::from_secs(CONFIRM_TOKEN_TTL_SECONDS))
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Stores the deferred call and returns a fresh opaque token.
    pub fn mint(&self, tool_name: &str, args: Metadata) -> String {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        let token: String = bytes.iter().map(|b| format!("{b:02x}")).collect();

        let mut pending = self.pending.lock().expect("confirmation lock poisoned");
        // Lazy prune keeps the map bounded without a background task.
        pending.retain(|_, entry| entry.created.elapsed() <= self.ttl);
        pending.insert(
            token.clone(),
            PendingEntry {
                action: PendingAction {
                    tool_name: tool_name.to_string(),
                    args,
                },
                created: Instant::now(),
            },
        );
        token
    }

    /// Redeems a token, consuming it regardless of outcome.
    pub fn take(&self, token: &str) -> Result<PendingAction, ConfirmError> {
        let mut pending = self.pending.lock().expect("confirmation lock poisoned");
        let entry = pending.remove(token).ok_or(ConfirmError::InvalidToken)?;
        let age = entry.created.elapsed();
        if age > self.ttl {
            return Err(ConfirmError::TokenExpired {
                age_s: age.as_secs(),
                limit_s: self.ttl.as_secs(),
            });
        }
        Ok(entry.action)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("confirmation lock poisoned").len()
    }
}

impl Default for ConfirmationGate {
    fn default() -> Self {
        Self::new()
    }
}
