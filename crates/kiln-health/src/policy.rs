//! Monitoring policy: cadence, thresholds, and retention.

use kiln_config::MonitorConfig;
use serde::{Deserialize, Serialize};

/// Configurable policy governing one monitoring session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorPolicy {
    /// Wait after session start before the first check, seconds.
    pub check_delay_seconds: u64,
    /// Number of checks per session.
    pub check_count: u32,
    /// Seconds between checks.
    pub check_interval_seconds: u64,
    /// Flag the printer for pause when a failure is confirmed.
    pub auto_pause_on_failure: bool,
    /// Minimum confidence for an issue to trigger auto-pause.
    pub failure_confidence_threshold: f64,
    /// Seconds of unchanged progress before a stall is declared.
    /// Zero disables stall detection.
    pub stall_timeout_seconds: u64,
    /// Acceptable thermal deviation in degrees Celsius; twice this is
    /// critical.
    pub temp_drift_threshold: f64,
    /// Hours of per-printer report history retained in memory.
    pub history_max_hours: u64,
}

impl Default for MonitorPolicy {
    fn default() -> Self {
        Self {
            check_delay_seconds: 60,
            check_count: 5,
            check_interval_seconds: 30,
            auto_pause_on_failure: true,
            failure_confidence_threshold: 0.8,
            stall_timeout_seconds: 600,
            temp_drift_threshold: 5.0,
            history_max_hours: 72,
        }
    }
}

impl From<&MonitorConfig> for MonitorPolicy {
    fn from(config: &MonitorConfig) -> Self {
        Self {
            check_delay_seconds: config.check_delay_seconds,
            check_count: config.check_count,
            check_interval_seconds: config.check_interval_seconds,
            auto_pause_on_failure: config.auto_pause,
            stall_timeout_seconds: config.stall_timeout_seconds,
            temp_drift_threshold: config.temp_drift_threshold,
            history_max_hours: config.history_max_hours,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_policy() {
        let policy = MonitorPolicy::default();
        assert_eq!(policy.check_delay_seconds, 60);
        assert_eq!(policy.check_count, 5);
        assert_eq!(policy.check_interval_seconds, 30);
        assert!(policy.auto_pause_on_failure);
        assert_eq!(policy.stall_timeout_seconds, 600);
        assert!((policy.temp_drift_threshold - 5.0).abs() < f64::EPSILON);
        assert_eq!(policy.history_max_hours, 72);
    }

    #[test]
    fn from_config_carries_overrides() {
        let config = MonitorConfig {
            check_delay_seconds: 5,
            check_count: 2,
            check_interval_seconds: 1,
            auto_pause: false,
            temp_drift_threshold: 3.0,
            stall_timeout_seconds: 0,
            history_max_hours: 12,
        };
        let policy = MonitorPolicy::from(&config);
        assert_eq!(policy.check_delay_seconds, 5);
        assert!(!policy.auto_pause_on_failure);
        assert_eq!(policy.stall_timeout_seconds, 0);
        assert_eq!(policy.history_max_hours, 12);
        // Non-config fields keep their defaults.
        assert!((policy.failure_confidence_threshold - 0.8).abs() < f64::EPSILON);
    }
}
