//! Configuration management for Kiln
//!
//! Provides hierarchical configuration loading from multiple sources:
//! 1. Environment variables (`KILN_*` prefix, highest precedence)
//! 2. `kiln.toml` (project config)
//! 3. Built-in defaults (lowest precedence)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

mod error;
mod loader;

pub use error::ConfigError;
pub use loader::ConfigLoader;

/// Main Kiln configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KilnConfig {
    pub printer: PrinterConfig,
    pub safety: SafetyConfig,
    pub monitor: MonitorConfig,
    pub recovery: RecoveryConfig,
    pub log: LogConfig,
}

/// Connection settings for the default (env-configured) printer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrinterConfig {
    /// Base URL or IP of the printer server, or serial port path.
    pub host: String,
    /// API key, LAN access code, or empty when the backend needs none.
    pub api_key: String,
    /// Backend protocol for the default printer.
    pub printer_type: PrinterBackend,
    /// Bambu device serial number.
    pub serial: String,
    /// Safety-profile identifier (e.g. `"ender3"`, `"bambu-x1c"`).
    pub model: String,
}

impl Default for PrinterConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            api_key: String::new(),
            printer_type: PrinterBackend::Octoprint,
            serial: String::new(),
            model: String::new(),
        }
    }
}

/// Supported printer backend protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrinterBackend {
    Octoprint,
    Moonraker,
    Bambu,
    Prusaconnect,
    Serial,
}

impl PrinterBackend {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Octoprint => "octoprint",
            Self::Moonraker => "moonraker",
            Self::Bambu => "bambu",
            Self::Prusaconnect => "prusaconnect",
            Self::Serial => "serial",
        }
    }

    /// Parses the lowercase name used in config and tool arguments.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "octoprint" => Some(Self::Octoprint),
            "moonraker" => Some(Self::Moonraker),
            "bambu" => Some(Self::Bambu),
            "prusaconnect" => Some(Self::Prusaconnect),
            "serial" => Some(Self::Serial),
            _ => None,
        }
    }
}

/// Safety-gate toggles.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Two-phase confirmation for confirm/emergency level tools.
    pub confirm_mode: bool,
    /// Two-phase confirmation for file uploads specifically.
    pub confirm_upload: bool,
    /// Treat material-compatibility mismatches as blocking errors.
    pub strict_material_check: bool,
    pub auth_enabled: bool,
    pub auth_token: String,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            confirm_mode: false,
            confirm_upload: false,
            strict_material_check: true,
            auth_enabled: false,
            auth_token: String::new(),
        }
    }
}

/// Health-monitor policy defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Wait before the first snapshot of a session, in seconds.
    pub check_delay_seconds: u64,
    /// Number of checks per session.
    pub check_count: u32,
    /// Seconds between checks.
    pub check_interval_seconds: u64,
    /// Flag the printer for pause on critical health.
    pub auto_pause: bool,
    /// Acceptable thermal deviation in degrees Celsius.
    pub temp_drift_threshold: f64,
    /// Seconds of unchanged progress before a stall is declared.
    /// Zero disables stall detection.
    pub stall_timeout_seconds: u64,
    /// Hours of per-printer health history retained in memory.
    pub history_max_hours: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            check_delay_seconds: 60,
            check_count: 5,
            check_interval_seconds: 30,
            auto_pause: true,
            temp_drift_threshold: 5.0,
            stall_timeout_seconds: 600,
            history_max_hours: 72,
        }
    }
}

/// Recovery planner limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Per-job retry budget.
    pub max_retries: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self { max_retries: 3 }
    }
}

/// Log output selection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl KilnConfig {
    /// Load configuration from `kiln.toml` in the working directory (if
    /// present) with `KILN_*` environment overrides.
    pub fn load() -> Result<Self> {
        ConfigLoader::new().load()
    }

    /// Load configuration rooted at a specific project directory.
    pub fn load_from_dir(project_dir: impl AsRef<Path>) -> Result<Self> {
        ConfigLoader::new().with_project_dir(project_dir).load()
    }
}
