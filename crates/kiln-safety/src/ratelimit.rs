//! Per-tool rate limiter with an escalating circuit breaker.
//!
//! The limiter enforces a minimum interval between consecutive calls
//! and a maximum per rolling 60 s window, pruning history lazily on
//! each check. The breaker watches *blocked* attempts: three within its
//! window put the tool into a 5-minute emergency cooldown during which
//! every invocation is refused as escalated.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

/// Blocks within the window required to trip the breaker.
const BLOCK_THRESHOLD: usize = 3;
/// Breaker observation window, seconds.
const BLOCK_WINDOW_S: f64 = 60.0;
/// Emergency cooldown duration, seconds.
const COOLDOWN_S: f64 = 300.0;
/// Rolling window for max-per-minute accounting, seconds.
const CALL_WINDOW_S: f64 = 60.0;

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, PartialEq)]
pub enum RateCheck {
    Allowed,
    /// Over a limit; retry after the embedded advice.
    Limited { message: String },
    /// Tool is in emergency cooldown.
    Escalated { message: String, remaining_s: u64 },
}

#[derive(Default)]
struct ToolHistory {
    last_call: Option<f64>,
    calls: Vec<f64>,
    blocks: Vec<f64>,
    cooldown_until: Option<f64>,
}

struct LimiterState {
    tools: HashMap<String, ToolHistory>,
}

/// Sliding-window rate limiter plus circuit breaker, one state bucket
/// per tool name. All state behind one mutex; checks are O(1) amortised
/// via lazy pruning.
pub struct ToolRateLimiter {
    epoch: Instant,
    state: Mutex<LimiterState>,
}

impl ToolRateLimiter {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            state: Mutex::new(LimiterState {
                tools: HashMap::new(),
            }),
        }
    }

    fn now_s(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    /// Checks and (when allowed) records one call.
    ///
    /// `record = false` verifies the limits without consuming a slot;
    /// used when the call will be deferred behind a confirmation token
    /// rather than executed.
    pub fn check(
        &self,
        tool: &str,
        min_interval_ms: u64,
        max_per_minute: u32,
        record: bool,
    ) -> RateCheck {
        let now = self.now_s();
        self.check_at(tool, min_interval_ms, max_per_minute, now, record)
    }

    /// Records a blocked attempt for the breaker. Returns the
    /// escalation message when this block trips the cooldown.
    pub fn record_block(&self, tool: &str) -> Option<String> {
        let now = self.now_s();
        self.record_block_at(tool, now)
    }

    /// Whether the tool is currently cooling down.
    pub fn in_cooldown(&self, tool: &str) -> bool {
        let now = self.now_s();
        let state = self.state.lock().expect("rate limiter lock poisoned");
        state
            .tools
            .get(tool)
            .and_then(|h| h.cooldown_until)
            .is_some_and(|until| now < until)
    }

    // Time-explicit variants keep the window arithmetic testable
    // without sleeping.

    pub(crate) fn check_at(
        &self,
        tool: &str,
        min_interval_ms: u64,
        max_per_minute: u32,
        now: f64,
        record: bool,
    ) -> RateCheck {
        let mut state = self.state.lock().expect("rate limiter lock poisoned");
        let history = state.tools.entry(tool.to_string()).or_default();

        // Circuit breaker first: a cooling tool refuses everything.
        if let Some(until) = history.cooldown_until {
            if now < until {
                let remaining = (until - now).ceil() as u64;
                return RateCheck::Escalated {
                    message: format!(
                        "Tool {tool} is in emergency cooldown due to repeated blocked \
                         attempts. Cooldown expires in {remaining}s."
                    ),
                    remaining_s: remaining,
                };
            }
            history.cooldown_until = None;
        }

        // Minimum interval between consecutive calls.
        if min_interval_ms > 0 {
            if let Some(last) = history.last_call {
                let elapsed_ms = (now - last) * 1000.0;
                if elapsed_ms < min_interval_ms as f64 {
                    let wait = (min_interval_ms as f64 - elapsed_ms) / 1000.0;
                    return RateCheck::Limited {
                        message: format!(
                            "Rate limited: {tool} called too rapidly. Wait {wait:.1}s before retrying."
                        ),
                    };
                }
            }
        }

        // Max calls per rolling window, pruned lazily.
        if max_per_minute > 0 {
            history.calls.retain(|t| *t > now - CALL_WINDOW_S);
            if history.calls.len() >= max_per_minute as usize {
                return RateCheck::Limited {
                    message: format!(
                        "Rate limited: {tool} called {max_per_minute} times in the last \
                         minute. Wait before retrying."
                    ),
                };
            }
        }

        if record {
            history.last_call = Some(now);
            history.calls.push(now);
        }
        RateCheck::Allowed
    }

    pub(crate) fn record_block_at(&self, tool: &str, now: f64) -> Option<String> {
        let mut state = self.state.lock().expect("rate limiter lock poisoned");
        let history = state.tools.entry(tool.to_string()).or_default();

        history.blocks.retain(|t| *t > now - BLOCK_WINDOW_S);
        history.blocks.push(now);

        if history.blocks.len() >= BLOCK_THRESHOLD {
            let count = history.blocks.len();
            history.cooldown_until = Some(now + COOLDOWN_S);
            // Reset the window so the cooldown does not immediately
            // re-trip when it expires.
            history.blocks.clear();
            return Some(format!(
                "SAFETY ESCALATED: {tool} has been blocked {count} times in \
                 {BLOCK_WINDOW_S:.0}s. Tool is suspended for {:.0} minutes. \
                 Review your approach before retrying.",
                COOLDOWN_S / 60.0
            ));
        }
        None
    }
}

impl Default for ToolRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
