//! Configuration loader with multi-source merging

use crate::{ConfigError, KilnConfig, LogFormat, PrinterBackend};
use anyhow::{Context, Result};
use std::env;
use std::path::{Path, PathBuf};

/// File name looked up in the project directory.
const CONFIG_FILE: &str = "kiln.toml";

/// Configuration loader with builder pattern
pub struct ConfigLoader {
    project_dir: PathBuf,
    env_prefix: String,
}

impl ConfigLoader {
    /// Create a new config loader with default project directory (current dir)
    pub fn new() -> Self {
        Self {
            project_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            env_prefix: "KILN".to_string(),
        }
    }

    /// Set the project directory
    pub fn with_project_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.project_dir = dir.as_ref().to_path_buf();
        self
    }

    /// Set the environment variable prefix (default: "KILN")
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Load configuration from all sources with proper precedence
    pub fn load(self) -> Result<KilnConfig> {
        // 1. Built-in defaults
        let mut config = KilnConfig::default();

        // 2. Project config (kiln.toml)
        let config_file = self.project_dir.join(CONFIG_FILE);
        if config_file.exists() {
            let path = config_file.display().to_string();
            let text = std::fs::read_to_string(&config_file).map_err(|source| {
                ConfigError::Io {
                    path: path.clone(),
                    source,
                }
            })?;
            config = toml::from_str(&text)
                .map_err(|source| ConfigError::Parse { path, source })
                .context("failed to parse kiln.toml")?;
        }

        // 3. Environment variables (KILN_*)
        self.apply_env(&mut config)?;

        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default(self) -> KilnConfig {
        self.load().unwrap_or_default()
    }

    /// Applies recognised `KILN_*` environment overrides in place.
    ///
    /// Unknown variables under the prefix are ignored; malformed values
    /// for recognised keys are an error rather than a silent fallback.
    fn apply_env(&self, config: &mut KilnConfig) -> Result<()> {
        let var = |suffix: &str| env::var(format!("{}_{suffix}", self.env_prefix)).ok();

        if let Some(v) = var("PRINTER_HOST") {
            config.printer.host = v;
        }
        if let Some(v) = var("PRINTER_API_KEY") {
            config.printer.api_key = v;
        }
        if let Some(v) = var("PRINTER_TYPE") {
            config.printer.printer_type = PrinterBackend::parse(&v).ok_or_else(|| {
                invalid(self, "PRINTER_TYPE", &v, "expected octoprint|moonraker|bambu|prusaconnect|serial")
            })?;
        }
        if let Some(v) = var("PRINTER_SERIAL") {
            config.printer.serial = v;
        }
        if let Some(v) = var("PRINTER_MODEL") {
            config.printer.model = v;
        }

        if let Some(v) = var("CONFIRM_MODE") {
            config.safety.confirm_mode = parse_bool(&v);
        }
        if let Some(v) = var("CONFIRM_UPLOAD") {
            config.safety.confirm_upload = parse_bool(&v);
        }
        if let Some(v) = var("STRICT_MATERIAL_CHECK") {
            config.safety.strict_material_check = parse_bool(&v);
        }
        if let Some(v) = var("AUTH_ENABLED") {
            config.safety.auth_enabled = parse_bool(&v);
        }
        if let Some(v) = var("AUTH_TOKEN") {
            config.safety.auth_token = v;
        }

        if let Some(v) = var("MONITOR_CHECK_DELAY") {
            config.monitor.check_delay_seconds =
                v.parse().map_err(|_| invalid(self, "MONITOR_CHECK_DELAY", &v, "expected seconds"))?;
        }
        if let Some(v) = var("MONITOR_CHECK_COUNT") {
            config.monitor.check_count =
                v.parse().map_err(|_| invalid(self, "MONITOR_CHECK_COUNT", &v, "expected a count"))?;
        }
        if let Some(v) = var("MONITOR_CHECK_INTERVAL") {
            config.monitor.check_interval_seconds =
                v.parse().map_err(|_| invalid(self, "MONITOR_CHECK_INTERVAL", &v, "expected seconds"))?;
        }
        if let Some(v) = var("MONITOR_AUTO_PAUSE") {
            config.monitor.auto_pause = parse_bool(&v);
        }
        if let Some(v) = var("MONITOR_TEMP_DRIFT_THRESHOLD") {
            config.monitor.temp_drift_threshold = v
                .parse()
                .map_err(|_| invalid(self, "MONITOR_TEMP_DRIFT_THRESHOLD", &v, "expected degrees"))?;
        }
        if let Some(v) = var("MONITOR_STALL_TIMEOUT") {
            config.monitor.stall_timeout_seconds =
                v.parse().map_err(|_| invalid(self, "MONITOR_STALL_TIMEOUT", &v, "expected seconds"))?;
        }
        if let Some(v) = var("MONITOR_HISTORY_MAX_HOURS") {
            config.monitor.history_max_hours = v
                .parse()
                .map_err(|_| invalid(self, "MONITOR_HISTORY_MAX_HOURS", &v, "expected hours"))?;
        }

        if let Some(v) = var("RECOVERY_MAX_RETRIES") {
            config.recovery.max_retries =
                v.parse().map_err(|_| invalid(self, "RECOVERY_MAX_RETRIES", &v, "expected a count"))?;
        }

        if let Some(v) = var("LOG_FORMAT") {
            config.log.format = match v.trim().to_ascii_lowercase().as_str() {
                "text" => LogFormat::Text,
                "json" => LogFormat::Json,
                _ => return Err(invalid(self, "LOG_FORMAT", &v, "expected text|json").into()),
            };
        }

        Ok(())
    }
}

fn invalid(loader: &ConfigLoader, suffix: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidEnvValue {
        var: format!("{}_{suffix}", loader.env_prefix),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

/// Truthy forms accepted for boolean toggles.
fn parse_bool(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes")
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_load_defaults() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let config = ConfigLoader::new()
            .with_project_dir(temp_dir.path())
            // Unique prefix so ambient KILN_* variables cannot leak in.
            .with_env_prefix("KILN_TEST_DEFAULTS")
            .load()
            .expect("Failed to load config");

        assert_eq!(config.monitor.check_interval_seconds, 30);
        assert_eq!(config.recovery.max_retries, 3);
    }

    #[test]
    fn test_load_project_config() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let project_dir = temp_dir.path();

        let config_content = r#"
[printer]
host = "http://octopi.local"
printer_type = "moonraker"
model = "voron-350"

[monitor]
check_count = 12
stall_timeout_seconds = 0

[recovery]
max_retries = 5
"#;
        fs::write(project_dir.join("kiln.toml"), config_content).expect("Failed to write config");

        let config = ConfigLoader::new()
            .with_project_dir(project_dir)
            .with_env_prefix("KILN_TEST_PROJECT")
            .load()
            .expect("Failed to load config");

        assert_eq!(config.printer.host, "http://octopi.local");
        assert_eq!(config.printer.printer_type, PrinterBackend::Moonraker);
        assert_eq!(config.printer.model, "voron-350");
        assert_eq!(config.monitor.check_count, 12);
        assert_eq!(config.monitor.stall_timeout_seconds, 0);
        assert_eq!(config.recovery.max_retries, 5);
    }

    #[test]
    fn test_env_overrides_file() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let project_dir = temp_dir.path();
        fs::write(
            project_dir.join("kiln.toml"),
            "[printer]\nhost = \"http://from-file\"\n",
        )
        .expect("Failed to write config");

        env::set_var("KILN_TEST_ENV_PRINTER_HOST", "http://from-env");
        env::set_var("KILN_TEST_ENV_MONITOR_CHECK_DELAY", "5");
        env::set_var("KILN_TEST_ENV_CONFIRM_MODE", "yes");

        let config = ConfigLoader::new()
            .with_project_dir(project_dir)
            .with_env_prefix("KILN_TEST_ENV")
            .load()
            .expect("Failed to load config");

        env::remove_var("KILN_TEST_ENV_PRINTER_HOST");
        env::remove_var("KILN_TEST_ENV_MONITOR_CHECK_DELAY");
        env::remove_var("KILN_TEST_ENV_CONFIRM_MODE");

        assert_eq!(config.printer.host, "http://from-env");
        assert_eq!(config.monitor.check_delay_seconds, 5);
        assert!(config.safety.confirm_mode);
    }

    #[test]
    fn test_invalid_env_value_is_an_error() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        env::set_var("KILN_TEST_BAD_RECOVERY_MAX_RETRIES", "lots");

        let result = ConfigLoader::new()
            .with_project_dir(temp_dir.path())
            .with_env_prefix("KILN_TEST_BAD")
            .load();

        env::remove_var("KILN_TEST_BAD_RECOVERY_MAX_RETRIES");
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_bool_forms() {
        assert!(parse_bool("1"));
        assert!(parse_bool("true"));
        assert!(parse_bool("YES"));
        assert!(!parse_bool("0"));
        assert!(!parse_bool("false"));
        assert!(!parse_bool("banana"));
    }
}
