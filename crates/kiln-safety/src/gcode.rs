//! G-code static analysis.
//!
//! Rejects firmware-settings writes and commands that would exceed the
//! printer's temperature ceilings before a single byte is transmitted.
//! Advisory findings (nozzle below the bed, extreme feedrate) are
//! warnings and do not block.

use std::path::Path;

use kiln_adapters::SafetyProfile;
use serde::{Deserialize, Serialize};

/// Commands that are never forwarded, with the reason.
const BLOCKED_COMMANDS: &[(&str, &str)] = &[
    ("M500", "writes settings to EEPROM"),
    ("M501", "restores settings from EEPROM"),
    ("M502", "factory-resets firmware settings"),
    ("M502.1", "erases EEPROM"),
    ("M997", "flashes firmware"),
    ("M999", "restarts after a kill, bypassing the error state"),
    ("M302", "allows cold extrusion"),
    ("M906", "changes stepper driver current"),
    ("M913", "changes hybrid threshold"),
    ("M914", "changes stallguard sensitivity"),
];

/// Outcome of validating a batch of G-code lines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GcodeValidation {
    pub valid: bool,
    /// The parsed, comment-stripped command list.
    pub commands: Vec<String>,
    /// Blocking findings.
    pub errors: Vec<String>,
    /// Non-blocking advisories.
    pub warnings: Vec<String>,
    /// The specific lines that caused blocking findings.
    pub blocked_commands: Vec<String>,
}

/// Validates a batch of commands against a safety profile.
///
/// Comment-only and empty lines are dropped from the command list.
pub fn validate_gcode(lines: &[String], profile: &SafetyProfile) -> GcodeValidation {
    let mut commands = Vec::new();
    let mut errors = Vec::new();
    let mut warnings = Vec::new();
    let mut blocked = Vec::new();

    for raw in lines {
        let line = match raw.split_once(';') {
            Some((code, _)) => code.trim(),
            None => raw.trim(),
        };
        if line.is_empty() {
            continue;
        }
        commands.push(line.to_string());

        let opcode = line
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_ascii_uppercase();

        if let Some((_, reason)) = BLOCKED_COMMANDS.iter().find(|(cmd, _)| *cmd == opcode) {
            errors.push(format!("{opcode} is blocked: {reason}"));
            blocked.push(line.to_string());
            continue;
        }

        match opcode.as_str() {
            // Hotend temperature commands.
            "M104" | "M109" => {
                if let Some(target) = param_value(line, 'S') {
                    if target < 0.0 || target > profile.max_hotend_temp {
                        errors.push(format!(
                            "{opcode} S{target} exceeds hotend limit {}\u{b0}C for profile {}",
                            profile.max_hotend_temp, profile.id
                        ));
                        blocked.push(line.to_string());
                    }
                }
            }
            // Bed temperature commands.
            "M140" | "M190" => {
                if let Some(target) = param_value(line, 'S') {
                    if target < 0.0 || target > profile.max_bed_temp {
                        errors.push(format!(
                            "{opcode} S{target} exceeds bed limit {}\u{b0}C for profile {}",
                            profile.max_bed_temp, profile.id
                        ));
                        blocked.push(line.to_string());
                    }
                }
            }
            // Moves: advisory checks only.
            "G0" | "G1" => {
                if let Some(z) = param_value(line, 'Z') {
                    if z < 0.0 {
                        warnings.push(format!(
                            "{line}: Z{z} is below the bed surface"
                        ));
                    }
                }
                if let Some(feed) = param_value(line, 'F') {
                    // F is mm/min; the profile ceiling is mm/s.
                    if feed > profile.max_feedrate_mm_s * 60.0 {
                        warnings.push(format!(
                            "{line}: feedrate {feed} mm/min exceeds profile maximum {} mm/s",
                            profile.max_feedrate_mm_s
                        ));
                    }
                }
            }
            _ => {}
        }
    }

    GcodeValidation {
        valid: errors.is_empty(),
        commands,
        errors,
        warnings,
        blocked_commands: blocked,
    }
}

/// Scans a local G-code file with the same rules as [`validate_gcode`].
pub fn scan_gcode_file(path: &Path, profile: &SafetyProfile) -> std::io::Result<GcodeValidation> {
    let content = std::fs::read_to_string(path)?;
    let lines: Vec<String> = content.lines().map(ToString::to_string).collect();
    Ok(validate_gcode(&lines, profile))
}

/// Extracts a single-letter numeric parameter (e.g. `S210`, `Z-1.5`).
fn param_value(line: &str, letter: char) -> Option<f64> {
    for token in line.split_whitespace().skip(1) {
        let mut chars = token.chars();
        if chars.next()?.to_ascii_uppercase() == letter.to_ascii_uppercase() {
            return chars.as_str().parse().ok();
        }
    }
    None
}

/// Names of all blocked commands, for the safety dashboard.
pub fn blocked_command_names() -> Vec<&'static str> {
    let mut names: Vec<&'static str> = BLOCKED_COMMANDS.iter().map(|(cmd, _)| *cmd).collect();
    names.sort_unstable();
    names
}

#[cfg(test)]
mod tests {
    use kiln_adapters::default_profile;

    use super::*;

    fn lines(input: &[&str]) -> Vec<String> {
        input.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn safe_commands_pass() {
        let result = validate_gcode(
            &lines(&["G28", "G1 X10 Y10 Z5 F1200", "M104 S200", "M140 S60"]),
            &default_profile(),
        );
        assert!(result.valid);
        assert_eq!(result.commands.len(), 4);
        assert!(result.errors.is_empty());
        assert!(result.blocked_commands.is_empty());
    }

    #[test]
    fn firmware_writes_blocked() {
        let result = validate_gcode(&lines(&["M500", "G28"]), &default_profile());
        assert!(!result.valid);
        assert_eq!(result.blocked_commands, vec!["M500"]);
        assert!(result.errors[0].contains("EEPROM"));
    }

    #[test]
    fn hotend_ceiling_enforced_inclusively() {
        let profile = default_profile();
        let at_limit = validate_gcode(&lines(&["M104 S300"]), &profile);
        assert!(at_limit.valid);

        let over = validate_gcode(&lines(&["M140 S200", "M104 S320"]), &profile);
        assert!(!over.valid);
        assert_eq!(over.blocked_commands, vec!["M104 S320"]);
        // The bed command at 200 is also over the 130 ceiling.
        assert_eq!(over.errors.len(), 2);
    }

    #[test]
    fn bed_ceiling_and_negative_temps() {
        let profile = default_profile();
        let result = validate_gcode(&lines(&["M190 S131"]), &profile);
        assert!(!result.valid);

        let negative = validate_gcode(&lines(&["M104 S-5"]), &profile);
        assert!(!negative.valid);
    }

    #[test]
    fn advisories_do_not_block() {
        let profile = default_profile();
        let result = validate_gcode(
            &lines(&["G1 Z-0.5 F200", "G1 X100 F99999"]),
            &profile,
        );
        assert!(result.valid);
        assert_eq!(result.warnings.len(), 2);
        assert!(result.warnings[0].contains("below the bed"));
        assert!(result.warnings[1].contains("feedrate"));
    }

    #[test]
    fn comments_and_blanks_dropped() {
        let result = validate_gcode(
            &lines(&["; setup", "", "G28 ; home", "   "]),
            &default_profile(),
        );
        assert!(result.valid);
        assert_eq!(result.commands, vec!["G28"]);
    }

    #[test]
    fn wait_variants_checked_like_set_variants() {
        let profile = default_profile();
        let result = validate_gcode(&lines(&["M109 S301"]), &profile);
        assert!(!result.valid);
    }

    #[test]
    fn per_profile_ceilings_differ() {
        let ender = kiln_adapters::get_profile("ender3").unwrap();
        // 280 is fine on the generic profile but over the Ender 3's 260.
        let result = validate_gcode(&lines(&["M104 S280"]), &ender);
        assert!(!result.valid);
    }

    #[test]
    fn scan_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("part.gcode");
        std::fs::write(&path, "G28\nM104 S999\n").unwrap();
        let result = scan_gcode_file(&path, &default_profile()).unwrap();
        assert!(!result.valid);
        assert_eq!(result.blocked_commands, vec!["M104 S999"]);
    }

    #[test]
    fn blocked_names_sorted() {
        let names = blocked_command_names();
        assert!(names.contains(&"M500"));
        assert!(names.contains(&"M997"));
        let mut sorted = names.clone();
        sorted.sort_unstable();
        assert_eq!(names, sorted);
    }
}
