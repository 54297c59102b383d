//! Health metric evaluation.
//!
//! `evaluate_health` is a pure function from one sampled printer state
//! to a report, so every severity rule is testable without a printer or
//! a clock.

use chrono::{DateTime, Utc};
use kiln_adapters::{JobProgress, PrinterState};
use kiln_types::{detect_print_phase, HealthSeverity, PrintPhase, SessionId};
use serde::{Deserialize, Serialize};

use crate::policy::MonitorPolicy;

/// Power draw below this reads as a lost supply.
const POWER_FLOOR_W: f64 = 10.0;
/// Power draw above this reads as a runaway heater.
const POWER_CEILING_W: f64 = 600.0;
/// Heuristic mid-print draw for a consumer FDM machine.
const POWER_EXPECTED_W: f64 = 200.0;

/// A single health measurement for one monitored dimension.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthMetric {
    pub name: String,
    pub current: f64,
    pub expected: f64,
    /// Absolute deviation from expected.
    pub deviation: f64,
    pub severity: HealthSeverity,
    pub unit: String,
    pub detail: Option<String>,
}

/// Aggregated health report for one printer at one instant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub printer_name: String,
    pub metrics: Vec<HealthMetric>,
    /// Maximum severity across member metrics.
    pub overall_status: HealthSeverity,
    pub checked_at: DateTime<Utc>,
    pub phase: PrintPhase,
    pub session_id: Option<SessionId>,
}

impl HealthReport {
    pub fn metric(&self, name: &str) -> Option<&HealthMetric> {
        self.metrics.iter().find(|m| m.name == name)
    }
}

/// Severity for a thermal deviation: within the threshold is OK, up to
/// twice the threshold warns, beyond that is critical.
fn thermal_severity(deviation: f64, threshold: f64) -> HealthSeverity {
    if deviation <= threshold {
        HealthSeverity::Ok
    } else if deviation <= threshold * 2.0 {
        HealthSeverity::Warning
    } else {
        HealthSeverity::Critical
    }
}

fn thermal_metric(
    name: &str,
    heater: &str,
    actual: f64,
    target: f64,
    threshold: f64,
) -> HealthMetric {
    let deviation = (actual - target).abs();
    let severity = thermal_severity(deviation, threshold);
    let detail = match severity {
        HealthSeverity::Ok => None,
        HealthSeverity::Warning => Some(format!(
            "{heater} temperature drifted {deviation:.1}\u{b0}C from target {target:.0}\u{b0}C"
        )),
        HealthSeverity::Critical => Some(format!(
            "{heater} temperature drifted {deviation:.1}\u{b0}C from target \
             {target:.0}\u{b0}C; possible heater or thermistor fault"
        )),
    };
    HealthMetric {
        name: name.to_string(),
        current: actual,
        expected: target,
        deviation: (deviation * 100.0).round() / 100.0,
        severity,
        unit: "\u{b0}C".into(),
        detail,
    }
}

/// Evaluates every applicable metric from one state/progress sample.
///
/// `snapshot_ok` carries the webcam probe result when the printer has a
/// camera: `None` means no camera, `Some(false)` an unreachable feed.
pub fn evaluate_health(
    printer_name: &str,
    state: &PrinterState,
    progress: Option<&JobProgress>,
    snapshot_ok: Option<bool>,
    policy: &MonitorPolicy,
) -> HealthReport {
    let mut metrics: Vec<HealthMetric> = Vec::new();

    // Thermal stability, only when both readings exist.
    if let (Some(actual), Some(target)) = (state.tool_temp_actual, state.tool_temp_target) {
        metrics.push(thermal_metric(
            "hotend_temperature",
            "Hotend",
            actual,
            target,
            policy.temp_drift_threshold,
        ));
    }
    if let (Some(actual), Some(target)) = (state.bed_temp_actual, state.bed_temp_target) {
        metrics.push(thermal_metric(
            "bed_temperature",
            "Bed",
            actual,
            target,
            policy.temp_drift_threshold,
        ));
    }

    // Print progress.
    let completion = progress.and_then(|p| p.completion);
    if let Some(pct) = completion {
        metrics.push(HealthMetric {
            name: "print_progress".into(),
            current: pct,
            expected: 100.0,
            deviation: ((100.0 - pct) * 100.0).round() / 100.0,
            severity: HealthSeverity::Ok,
            unit: "%".into(),
            detail: None,
        });
    }

    // Filament sensor, when reported.
    if let Some(detected) = state.filament_detected {
        metrics.push(HealthMetric {
            name: "filament_sensor".into(),
            current: f64::from(u8::from(detected)),
            expected: 1.0,
            deviation: if detected { 0.0 } else { 1.0 },
            severity: if detected {
                HealthSeverity::Ok
            } else {
                HealthSeverity::Critical
            },
            unit: "bool".into(),
            detail: (!detected).then(|| "Filament not detected; runout or sensor fault".into()),
        });
    }

    // Power telemetry, when reported.
    if let Some(watts) = state.power_watts {
        let (severity, detail) = if watts < POWER_FLOOR_W {
            (
                HealthSeverity::Critical,
                Some(format!(
                    "Power draw {watts:.0}W; printer may have lost power"
                )),
            )
        } else if watts > POWER_CEILING_W {
            (
                HealthSeverity::Warning,
                Some(format!(
                    "Power draw {watts:.0}W is unusually high; check heater PIDs"
                )),
            )
        } else {
            (HealthSeverity::Ok, None)
        };
        metrics.push(HealthMetric {
            name: "power_consumption".into(),
            current: watts,
            expected: POWER_EXPECTED_W,
            deviation: ((watts - POWER_EXPECTED_W).abs() * 100.0).round() / 100.0,
            severity,
            unit: "W".into(),
            detail,
        });
    }

    // Webcam reachability, when the printer has a camera.
    if let Some(ok) = snapshot_ok {
        metrics.push(HealthMetric {
            name: "webcam_quality".into(),
            current: f64::from(u8::from(ok)),
            expected: 1.0,
            deviation: if ok { 0.0 } else { 1.0 },
            severity: if ok {
                HealthSeverity::Ok
            } else {
                HealthSeverity::Warning
            },
            unit: "bool".into(),
            detail: (!ok).then(|| "Webcam snapshot unavailable; feed may be offline".into()),
        });
    }

    // Connection presence; absence is critical.
    metrics.push(HealthMetric {
        name: "connection_status".into(),
        current: f64::from(u8::from(state.connected)),
        expected: 1.0,
        deviation: if state.connected { 0.0 } else { 1.0 },
        severity: if state.connected {
            HealthSeverity::Ok
        } else {
            HealthSeverity::Critical
        },
        unit: "bool".into(),
        detail: (!state.connected)
            .then(|| "Printer is offline; possible unexpected shutdown".into()),
    });

    let overall_status = metrics
        .iter()
        .map(|m| m.severity)
        .max()
        .unwrap_or(HealthSeverity::Ok);

    let is_heating = matches!(
        (state.tool_temp_actual, state.tool_temp_target),
        (Some(actual), Some(target)) if actual < target - 10.0
    );

    HealthReport {
        printer_name: printer_name.to_string(),
        metrics,
        overall_status,
        checked_at: kiln_types::now(),
        phase: detect_print_phase(completion, is_heating),
        session_id: None,
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    fn state(tool: (f64, f64), bed: (f64, f64)) -> PrinterState {
        PrinterState {
            connected: true,
            state: kiln_types::PrinterStatus::Printing,
            tool_temp_actual: Some(tool.0),
            tool_temp_target: Some(tool.1),
            bed_temp_actual: Some(bed.0),
            bed_temp_target: Some(bed.1),
            filament_detected: None,
            power_watts: None,
        }
    }

    fn default_policy() -> MonitorPolicy {
        MonitorPolicy::default()
    }

    #[test_case(0.0 => HealthSeverity::Ok)]
    #[test_case(5.0 => HealthSeverity::Ok ; "at threshold")]
    #[test_case(5.1 => HealthSeverity::Warning)]
    #[test_case(10.0 => HealthSeverity::Warning ; "at double threshold")]
    #[test_case(10.1 => HealthSeverity::Critical)]
    fn thermal_bands(deviation: f64) -> HealthSeverity {
        thermal_severity(deviation, 5.0)
    }

    #[test]
    fn stable_temps_produce_ok_report() {
        let report = evaluate_health(
            "P1",
            &state((210.0, 210.0), (60.0, 60.0)),
            None,
            None,
            &default_policy(),
        );
        assert_eq!(report.overall_status, HealthSeverity::Ok);
        assert_eq!(report.metric("hotend_temperature").unwrap().severity, HealthSeverity::Ok);
        assert_eq!(report.metric("connection_status").unwrap().severity, HealthSeverity::Ok);
    }

    #[test]
    fn hotend_drift_escalates_overall() {
        let report = evaluate_health(
            "P1",
            &state((198.0, 210.0), (60.0, 60.0)),
            None,
            None,
            &default_policy(),
        );
        // 12 degrees > 2x the 5 degree threshold.
        let hotend = report.metric("hotend_temperature").unwrap();
        assert_eq!(hotend.severity, HealthSeverity::Critical);
        assert!(hotend.detail.as_ref().unwrap().contains("thermistor"));
        assert_eq!(report.overall_status, HealthSeverity::Critical);
    }

    #[test]
    fn disconnection_is_critical() {
        let mut s = state((0.0, 0.0), (0.0, 0.0));
        s.connected = false;
        let report = evaluate_health("P1", &s, None, None, &default_policy());
        assert_eq!(
            report.metric("connection_status").unwrap().severity,
            HealthSeverity::Critical
        );
        assert_eq!(report.overall_status, HealthSeverity::Critical);
    }

    #[test]
    fn filament_runout_is_critical() {
        let mut s = state((210.0, 210.0), (60.0, 60.0));
        s.filament_detected = Some(false);
        let report = evaluate_health("P1", &s, None, None, &default_policy());
        assert_eq!(
            report.metric("filament_sensor").unwrap().severity,
            HealthSeverity::Critical
        );

        s.filament_detected = Some(true);
        let report = evaluate_health("P1", &s, None, None, &default_policy());
        assert_eq!(
            report.metric("filament_sensor").unwrap().severity,
            HealthSeverity::Ok
        );
    }

    #[test]
    fn power_anomaly_bands() {
        let mut s = state((210.0, 210.0), (60.0, 60.0));

        s.power_watts = Some(5.0);
        let report = evaluate_health("P1", &s, None, None, &default_policy());
        assert_eq!(
            report.metric("power_consumption").unwrap().severity,
            HealthSeverity::Critical
        );

        s.power_watts = Some(700.0);
        let report = evaluate_health("P1", &s, None, None, &default_policy());
        assert_eq!(
            report.metric("power_consumption").unwrap().severity,
            HealthSeverity::Warning
        );

        s.power_watts = Some(180.0);
        let report = evaluate_health("P1", &s, None, None, &default_policy());
        assert_eq!(
            report.metric("power_consumption").unwrap().severity,
            HealthSeverity::Ok
        );
    }

    #[test]
    fn webcam_probe_results() {
        let s = state((210.0, 210.0), (60.0, 60.0));
        let report = evaluate_health("P1", &s, None, Some(false), &default_policy());
        assert_eq!(
            report.metric("webcam_quality").unwrap().severity,
            HealthSeverity::Warning
        );
        // No camera: no metric at all.
        let report = evaluate_health("P1", &s, None, None, &default_policy());
        assert!(report.metric("webcam_quality").is_none());
    }

    #[test]
    fn progress_metric_and_phase() {
        let progress = JobProgress {
            file_name: Some("benchy.gcode".into()),
            completion: Some(42.0),
            time_elapsed_s: None,
            time_remaining_s: None,
        };
        let report = evaluate_health(
            "P1",
            &state((210.0, 210.0), (60.0, 60.0)),
            Some(&progress),
            None,
            &default_policy(),
        );
        let metric = report.metric("print_progress").unwrap();
        assert_eq!(metric.current, 42.0);
        assert_eq!(metric.deviation, 58.0);
        assert_eq!(report.phase, PrintPhase::Infill);
    }

    #[test]
    fn heating_phase_detected_from_temps() {
        let report = evaluate_health(
            "P1",
            &state((150.0, 210.0), (60.0, 60.0)),
            None,
            None,
            &default_policy(),
        );
        assert_eq!(report.phase, PrintPhase::Heating);
    }
}
