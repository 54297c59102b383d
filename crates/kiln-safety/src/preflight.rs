//! Pre-print readiness checks.
//!
//! `run_preflight` aggregates every check into a report with a single
//! `ready` flag; check failures populate the report, they never raise.

use std::path::{Path, PathBuf};

use kiln_adapters::PrinterAdapter;
use kiln_types::PrinterStatus;
use serde::Serialize;

use crate::materials::{material_settings, MaterialTracker};

const GCODE_EXTENSIONS: &[&str] = &[".gcode", ".gco", ".g"];
const MAX_FILE_BYTES: u64 = 2 * 1024 * 1024 * 1024;

/// One named check outcome.
#[derive(Debug, Clone, Serialize)]
pub struct PreflightCheck {
    pub name: &'static str,
    pub passed: bool,
    pub message: String,
}

/// Optional inputs that enable the conditional checks.
#[derive(Debug, Clone, Default)]
pub struct PreflightOptions {
    /// Local G-code file to validate before upload.
    pub file_path: Option<PathBuf>,
    /// Expected material type, e.g. `"PLA"`.
    pub expected_material: Option<String>,
    /// File name expected to exist on the printer.
    pub remote_file: Option<String>,
    /// Upgrade material-compatibility misses to blocking errors.
    pub strict_material: bool,
    /// Printer name used for loaded-material lookup.
    pub printer_name: String,
}

/// Aggregated pre-flight outcome.
#[derive(Debug, Clone, Serialize)]
pub struct PreflightReport {
    pub ready: bool,
    pub checks: Vec<PreflightCheck>,
    pub errors: Vec<String>,
    pub summary: String,
    pub tool_temp_actual: Option<f64>,
    pub tool_temp_target: Option<f64>,
    pub bed_temp_actual: Option<f64>,
    pub bed_temp_target: Option<f64>,
}

/// Runs the full check battery against one printer.
pub fn run_preflight(
    adapter: &dyn PrinterAdapter,
    materials: &MaterialTracker,
    options: &PreflightOptions,
) -> PreflightReport {
    let mut checks: Vec<PreflightCheck> = Vec::new();
    let mut errors: Vec<String> = Vec::new();
    let profile = adapter.safety_profile();
    let state = adapter.get_state();

    // -- printer state --------------------------------------------------
    let connected = state.connected;
    checks.push(PreflightCheck {
        name: "printer_connected",
        passed: connected,
        message: if connected {
            "Printer is connected".into()
        } else {
            "Printer is offline".into()
        },
    });
    if !connected {
        errors.push("Printer is not connected / offline".into());
    }

    let idle = state.state == PrinterStatus::Idle;
    checks.push(PreflightCheck {
        name: "printer_idle",
        passed: idle,
        message: format!("Printer state: {}", state.state),
    });
    if !idle {
        errors.push(format!("Printer is not idle (state: {})", state.state));
    }

    let no_error = state.state != PrinterStatus::Error;
    checks.push(PreflightCheck {
        name: "no_errors",
        passed: no_error,
        message: if no_error {
            "No errors".into()
        } else {
            "Printer is in error state".into()
        },
    });
    if !no_error {
        errors.push("Printer is in an error state".into());
    }

    // -- temperatures ---------------------------------------------------
    let mut temp_problems: Vec<String> = Vec::new();
    if let Some(tool) = state.tool_temp_actual {
        if tool > profile.max_hotend_temp {
            temp_problems.push(format!(
                "Tool temp ({tool:.1}\u{b0}C) exceeds safe max ({:.0}\u{b0}C)",
                profile.max_hotend_temp
            ));
        }
    }
    if let Some(bed) = state.bed_temp_actual {
        if bed > profile.max_bed_temp {
            temp_problems.push(format!(
                "Bed temp ({bed:.1}\u{b0}C) exceeds safe max ({:.0}\u{b0}C)",
                profile.max_bed_temp
            ));
        }
    }
    let temps_safe = temp_problems.is_empty();
    checks.push(PreflightCheck {
        name: "temperatures_safe",
        passed: temps_safe,
        message: if temps_safe {
            "Temperatures within limits".into()
        } else {
            temp_problems.join("; ")
        },
    });
    errors.extend(temp_problems);

    // -- material (conditional) ----------------------------------------
    if let Some(expected) = &options.expected_material {
        if let Some(mismatch) = materials.check_match(&options.printer_name, expected) {
            checks.push(PreflightCheck {
                name: "material_match",
                passed: false,
                message: mismatch.clone(),
            });
            errors.push(mismatch);
        } else if materials.get_material(&options.printer_name).is_some() {
            checks.push(PreflightCheck {
                name: "material_match",
                passed: true,
                message: format!(
                    "Loaded material matches expected ({})",
                    expected.to_ascii_uppercase()
                ),
            });
        }

        // Compatibility against the intelligence table, when a concrete
        // model profile is bound.
        if profile.id != "generic" {
            match material_settings(&profile.id, expected) {
                Some(settings) => checks.push(PreflightCheck {
                    name: "material_compatible",
                    passed: true,
                    message: format!(
                        "{} is validated for {:?} (hotend {:.0}\u{b0}C, bed {:.0}\u{b0}C)",
                        expected.to_ascii_uppercase(),
                        profile.id,
                        settings.hotend_temp_c,
                        settings.bed_temp_c
                    ),
                }),
                None => {
                    let message = format!(
                        "Material {} is not validated for printer model {:?}. \
                         This material may damage the printer.",
                        expected.to_ascii_uppercase(),
                        profile.id
                    );
                    checks.push(PreflightCheck {
                        name: "material_compatible",
                        passed: !options.strict_material,
                        message: message.clone(),
                    });
                    if options.strict_material {
                        errors.push(message);
                    }
                }
            }
        }
    }

    // -- local file (conditional) --------------------------------------
    if let Some(path) = &options.file_path {
        let file_errors = validate_local_file(path);
        let passed = file_errors.is_empty();
        checks.push(PreflightCheck {
            name: "file_valid",
            passed,
            message: if passed {
                "File OK".into()
            } else {
                file_errors.join("; ")
            },
        });
        errors.extend(file_errors);
    }

    // -- remote file (conditional) -------------------------------------
    if let Some(remote) = &options.remote_file {
        let remote_lower = remote.to_ascii_lowercase();
        match adapter.list_files() {
            Ok(files) => {
                let found = files.iter().any(|f| {
                    f.name.to_ascii_lowercase() == remote_lower
                        || f.path.to_ascii_lowercase() == remote_lower
                });
                checks.push(PreflightCheck {
                    name: "file_on_printer",
                    passed: found,
                    message: if found {
                        format!("File {remote:?} found on printer")
                    } else {
                        format!("File {remote:?} not found on printer")
                    },
                });
                if !found {
                    errors.push(format!("File {remote:?} not found on printer"));
                }
            }
            Err(_) => {
                let message = "Unable to list files on printer to verify remote file".to_string();
                checks.push(PreflightCheck {
                    name: "file_on_printer",
                    passed: false,
                    message: message.clone(),
                });
                errors.push(message);
            }
        }
    }

    let ready = checks.iter().all(|c| c.passed);
    let summary = if ready {
        "All pre-flight checks passed. Ready to print.".to_string()
    } else {
        format!("Pre-flight checks failed: {}.", errors.join("; "))
    };

    PreflightReport {
        ready,
        checks,
        errors,
        summary,
        tool_temp_actual: state.tool_temp_actual,
        tool_temp_target: state.tool_temp_target,
        bed_temp_actual: state.bed_temp_actual,
        bed_temp_target: state.bed_temp_target,
    }
}

/// Local file validation: exists, regular, readable, G-code extension,
/// non-empty, under 2 GiB.
fn validate_local_file(path: &Path) -> Vec<String> {
    let mut errors = Vec::new();
    let display = path.display();

    let Ok(metadata) = std::fs::metadata(path) else {
        errors.push(format!("File not found: {display}"));
        return errors;
    };
    if !metadata.is_file() {
        errors.push(format!("Not a regular file: {display}"));
        return errors;
    }

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    if !GCODE_EXTENSIONS.iter().any(|ext| name.ends_with(ext)) {
        errors.push(format!(
            "Unrecognised extension for {display}; expected .gcode, .gco, or .g"
        ));
    }

    if metadata.len() == 0 {
        errors.push(format!("File is empty (0 bytes): {display}"));
    } else if metadata.len() >= MAX_FILE_BYTES {
        errors.push(format!("File too large (>= 2 GiB): {display}"));
    }

    if std::fs::File::open(path).is_err() {
        errors.push(format!("File is not readable: {display}"));
    }

    errors
}

#[cfg(test)]
mod tests {
    use kiln_adapters::testing::MockPrinter;

    use super::*;

    fn options() -> PreflightOptions {
        PreflightOptions {
            printer_name: "P1".into(),
            strict_material: true,
            ..PreflightOptions::default()
        }
    }

    fn check<'r>(report: &'r PreflightReport, name: &str) -> &'r PreflightCheck {
        report
            .checks
            .iter()
            .find(|c| c.name == name)
            .unwrap_or_else(|| panic!("missing check {name}"))
    }

    #[test]
    fn idle_connected_printer_is_ready() {
        let printer = MockPrinter::idle("P1");
        let report = run_preflight(&printer, &MaterialTracker::new(), &options());
        assert!(report.ready);
        assert!(check(&report, "printer_connected").passed);
        assert!(check(&report, "printer_idle").passed);
        assert!(check(&report, "no_errors").passed);
        assert!(check(&report, "temperatures_safe").passed);
        assert!(report.errors.is_empty());
        assert!(report.summary.contains("Ready to print"));
    }

    #[test]
    fn offline_printer_fails_multiple_checks() {
        let printer = MockPrinter::idle("P1");
        printer.set_offline();
        let report = run_preflight(&printer, &MaterialTracker::new(), &options());
        assert!(!report.ready);
        assert!(!check(&report, "printer_connected").passed);
        assert!(!check(&report, "printer_idle").passed);
    }

    #[test]
    fn printing_printer_is_not_ready() {
        let printer = MockPrinter::idle("P1");
        printer.set_status(kiln_types::PrinterStatus::Printing);
        let report = run_preflight(&printer, &MaterialTracker::new(), &options());
        assert!(!report.ready);
        assert!(!check(&report, "printer_idle").passed);
        assert!(check(&report, "no_errors").passed);
    }

    #[test]
    fn hot_printer_fails_temperature_check() {
        let printer = MockPrinter::idle("P1");
        printer.set_temps(320.0, 0.0, 60.0, 0.0);
        let report = run_preflight(&printer, &MaterialTracker::new(), &options());
        assert!(!report.ready);
        assert!(!check(&report, "temperatures_safe").passed);
        assert!(report.errors[0].contains("Tool temp"));
    }

    #[test]
    fn material_mismatch_blocks() {
        let printer = MockPrinter::idle("P1");
        let materials = MaterialTracker::new();
        materials.set_material("P1", "PLA", None);

        let mut opts = options();
        opts.expected_material = Some("PETG".into());
        let report = run_preflight(&printer, &materials, &opts);
        assert!(!report.ready);
        assert!(!check(&report, "material_match").passed);

        opts.expected_material = Some("pla".into());
        let report = run_preflight(&printer, &materials, &opts);
        assert!(report.ready);
        assert!(check(&report, "material_match").passed);
    }

    #[test]
    fn compatibility_respects_strict_mode() {
        let profile = kiln_adapters::get_profile("ender3").unwrap();
        let printer = MockPrinter::with_profile("P1", profile);

        // ABS is not validated for the Ender 3.
        let mut opts = options();
        opts.expected_material = Some("ABS".into());
        let strict = run_preflight(&printer, &MaterialTracker::new(), &opts);
        assert!(!strict.ready);
        assert!(!check(&strict, "material_compatible").passed);

        opts.strict_material = false;
        let lax = run_preflight(&printer, &MaterialTracker::new(), &opts);
        assert!(lax.ready);
        assert!(check(&lax, "material_compatible").passed);
        assert!(check(&lax, "material_compatible")
            .message
            .contains("not validated"));
    }

    #[test]
    fn local_file_checks() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("part.gcode");
        std::fs::write(&good, "G28\n").unwrap();

        let printer = MockPrinter::idle("P1");
        let mut opts = options();
        opts.file_path = Some(good);
        let report = run_preflight(&printer, &MaterialTracker::new(), &opts);
        assert!(report.ready);
        assert!(check(&report, "file_valid").passed);

        let empty = dir.path().join("empty.gcode");
        std::fs::write(&empty, "").unwrap();
        opts.file_path = Some(empty);
        let report = run_preflight(&printer, &MaterialTracker::new(), &opts);
        assert!(!report.ready);
        assert!(check(&report, "file_valid").message.contains("empty"));

        let wrong_ext = dir.path().join("model.stl");
        std::fs::write(&wrong_ext, "solid\n").unwrap();
        opts.file_path = Some(wrong_ext);
        let report = run_preflight(&printer, &MaterialTracker::new(), &opts);
        assert!(!report.ready);

        opts.file_path = Some(dir.path().join("missing.gcode"));
        let report = run_preflight(&printer, &MaterialTracker::new(), &opts);
        assert!(!check(&report, "file_valid").passed);
    }

    #[test]
    fn remote_file_matching_is_case_insensitive() {
        let printer = MockPrinter::idle("P1");
        printer.add_file("BENCHY.GCO", Some(1024));

        let mut opts = options();
        opts.remote_file = Some("benchy.gco".into());
        let report = run_preflight(&printer, &MaterialTracker::new(), &opts);
        assert!(report.ready);
        assert!(check(&report, "file_on_printer").passed);

        opts.remote_file = Some("other.gco".into());
        let report = run_preflight(&printer, &MaterialTracker::new(), &opts);
        assert!(!report.ready);
    }
}
