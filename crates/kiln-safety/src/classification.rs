//! Static safety classification and rate-limit tables, keyed by tool
//! name. Tools absent from the tables are `safe` and unlimited.

use kiln_types::SafetyLevel;

/// Hard cap on G-code lines per `send_gcode` call.
pub const MAX_GCODE_BATCH: usize = 100;

/// Per-tool `(min_interval_ms, max_per_minute)`.
///
/// Read-only tools have no limits; physically-dangerous tools get
/// cooldowns so a runaway agent cannot hammer the hardware.
pub const RATE_LIMITS: &[(&str, u64, u32)] = &[
    ("set_temperature", 2000, 10),
    ("send_gcode", 500, 30),
    ("emergency_stop", 5000, 3),
    ("cancel_print", 5000, 3),
    ("start_print", 5000, 3),
    ("upload_file", 2000, 10),
    ("pause_print", 5000, 6),
    ("resume_print", 5000, 6),
];

const LEVELS: &[(&str, SafetyLevel)] = &[
    ("emergency_stop", SafetyLevel::Emergency),
    ("start_print", SafetyLevel::Confirm),
    ("cancel_print", SafetyLevel::Confirm),
    ("send_gcode", SafetyLevel::Confirm),
    ("set_temperature", SafetyLevel::Confirm),
    ("upload_file", SafetyLevel::Confirm),
    ("delete_file", SafetyLevel::Confirm),
    ("update_firmware", SafetyLevel::Confirm),
    ("rollback_firmware", SafetyLevel::Confirm),
    ("pause_print", SafetyLevel::Caution),
    ("resume_print", SafetyLevel::Caution),
    ("execute_recovery", SafetyLevel::Caution),
];

/// Safety classification for a tool; unknown tools default to `safe`.
pub fn safety_level_for(tool_name: &str) -> SafetyLevel {
    LEVELS
        .iter()
        .find(|(name, _)| *name == tool_name)
        .map_or(SafetyLevel::Safe, |(_, level)| *level)
}

/// Rate limits for a tool, or `None` when unlimited.
pub fn rate_limits_for(tool_name: &str) -> Option<(u64, u32)> {
    RATE_LIMITS
        .iter()
        .find(|(name, _, _)| *name == tool_name)
        .map(|(_, interval, per_minute)| (*interval, *per_minute))
}

/// Tools whose classification requires confirmation in confirm mode.
pub fn confirm_level_tools() -> Vec<&'static str> {
    let mut tools: Vec<&'static str> = LEVELS
        .iter()
        .filter(|(_, level)| level.requires_confirmation())
        .map(|(name, _)| *name)
        .collect();
    tools.sort_unstable();
    tools
}
