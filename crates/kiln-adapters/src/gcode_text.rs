//! Small helpers for composing and cleaning G-code lines shared by the
//! serial and Bambu backends.

/// Formats a hotend target command. Marlin truncates fractional targets.
pub(crate) fn tool_temp_command(target: f64) -> String {
    format!("M104 S{}", target as i64)
}

/// Formats a bed target command.
pub(crate) fn bed_temp_command(target: f64) -> String {
    format!("M140 S{}", target as i64)
}

/// Strips a trailing `;` comment and surrounding whitespace.
/// Returns `None` for blank and comment-only lines.
pub(crate) fn strip_comment(line: &str) -> Option<&str> {
    let code = match line.split_once(';') {
        Some((code, _)) => code,
        None => line,
    };
    let code = code.trim();
    if code.is_empty() {
        None
    } else {
        Some(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temp_commands_truncate() {
        assert_eq!(tool_temp_command(210.7), "M104 S210");
        assert_eq!(bed_temp_command(60.0), "M140 S60");
        assert_eq!(tool_temp_command(0.0), "M104 S0");
    }

    #[test]
    fn comment_stripping() {
        assert_eq!(strip_comment("G28 ; home"), Some("G28"));
        assert_eq!(strip_comment("  G1 X10  "), Some("G1 X10"));
        assert_eq!(strip_comment("; pure comment"), None);
        assert_eq!(strip_comment("   "), None);
    }
}
