//! TOML configuration loading, following a `ConfigLoader` pattern: a
//! blanket trait over `DeserializeOwned`, a
//! `ConfigError` enum distinguishing "file missing" from "parse failed"
//! from "semantically invalid", and `#[serde(default = ...)]` fields so
//! every knob has a sane default and a config file only needs to name
//! what it overrides.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Error loading or validating a configuration file.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("configuration file not found")]
    FileNotFound,
    #[error("failed to parse configuration: {0}")]
    ParseError(String),
    #[error("configuration validation failed: {0}")]
    ValidationError(String),
}

/// Blanket trait for loading any deserializable config struct from TOML.
pub trait ConfigLoader: Sized + serde::de::DeserializeOwned {
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound
            } else {
                ConfigError::ParseError(e.to_string())
            }
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

impl<T: serde::de::DeserializeOwned> ConfigLoader for T {}

/// Log level for configuration (mirrors `tracing::Level`, serializes to
/// lowercase strings so TOML reads naturally: `log_level = "debug"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub const fn as_tracing_level(self) -> tracing::Level {
        match self {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

/// Fields shared across the workspace's binaries — currently just the
/// binary's own log level, kept separate from `CoreConfig` so it can be
/// embedded the way `evo_common::config::SharedConfig` is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedConfig {
    #[serde(default = "default_log_level")]
    pub log_level: LogLevel,
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

fn default_plc_host() -> String {
    "192.168.6.6".to_string()
}
fn default_plc_port() -> u16 {
    502
}
fn default_unit_id() -> u8 {
    1
}
fn default_plc_timeout_ms() -> u64 {
    3_000
}
fn default_analysis_base_url() -> String {
    "http://127.0.0.1:8000".to_string()
}
fn default_analysis_timeout_ms() -> u64 {
    10_000
}
fn default_starvation_threshold_g() -> f64 {
    0.3
}
fn default_starvation_window_s() -> u64 {
    15
}
fn default_poll_interval_ms() -> u64 {
    100
}
fn default_idle_poll_interval_ms() -> u64 {
    500
}
fn default_coarse_time_max_attempts() -> u32 {
    15
}
fn default_fine_time_max_attempts() -> u32 {
    15
}
fn default_adaptive_rounds() -> u32 {
    3
}
fn default_adaptive_attempts_per_round() -> u32 {
    15
}
fn default_adaptive_required_successes() -> u32 {
    3
}

/// PLC connection parameters. Defaults to `192.168.6.6:502`, unit id 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlcConfig {
    #[serde(default = "default_plc_host")]
    pub host: String,
    #[serde(default = "default_plc_port")]
    pub port: u16,
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
    #[serde(default = "default_plc_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for PlcConfig {
    fn default() -> Self {
        Self {
            host: default_plc_host(),
            port: default_plc_port(),
            unit_id: default_unit_id(),
            timeout_ms: default_plc_timeout_ms(),
        }
    }
}

/// Analysis-service HTTP client parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnalysisConfig {
    #[serde(default = "default_analysis_base_url")]
    pub base_url: String,
    #[serde(default = "default_analysis_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            base_url: default_analysis_base_url(),
            timeout_ms: default_analysis_timeout_ms(),
        }
    }
}

/// Monitoring engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MonitorConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_idle_poll_interval_ms")]
    pub idle_poll_interval_ms: u64,
    #[serde(default = "default_starvation_threshold_g")]
    pub starvation_threshold_g: f64,
    #[serde(default = "default_starvation_window_s")]
    pub starvation_window_s: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            idle_poll_interval_ms: default_idle_poll_interval_ms(),
            starvation_threshold_g: default_starvation_threshold_g(),
            starvation_window_s: default_starvation_window_s(),
        }
    }
}

/// Attempt/round budgets for the four stage controllers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BudgetConfig {
    #[serde(default = "default_coarse_time_max_attempts")]
    pub coarse_time_max_attempts: u32,
    #[serde(default = "default_fine_time_max_attempts")]
    pub fine_time_max_attempts: u32,
    #[serde(default = "default_adaptive_rounds")]
    pub adaptive_rounds: u32,
    #[serde(default = "default_adaptive_attempts_per_round")]
    pub adaptive_attempts_per_round: u32,
    #[serde(default = "default_adaptive_required_successes")]
    pub adaptive_required_successes: u32,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            coarse_time_max_attempts: default_coarse_time_max_attempts(),
            fine_time_max_attempts: default_fine_time_max_attempts(),
            adaptive_rounds: default_adaptive_rounds(),
            adaptive_attempts_per_round: default_adaptive_attempts_per_round(),
            adaptive_required_successes: default_adaptive_required_successes(),
        }
    }
}

/// Top-level configuration for the `weigher` binary.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct CoreConfig {
    #[serde(default)]
    pub shared: SharedConfig,
    #[serde(default)]
    pub plc: PlcConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
}

impl CoreConfig {
    /// Validate cross-field constraints the individual `#[serde(default)]`
    /// values can't express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.plc.port == 0 {
            return Err(ConfigError::ValidationError(
                "plc.port must be nonzero".to_string(),
            ));
        }
        if self.monitor.starvation_threshold_g < 0.0 {
            return Err(ConfigError::ValidationError(
                "monitor.starvation_threshold_g must be >= 0".to_string(),
            ));
        }
        if self.budget.adaptive_required_successes == 0 {
            return Err(ConfigError::ValidationError(
                "budget.adaptive_required_successes must be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(CoreConfig::default().validate().is_ok());
    }

    #[test]
    fn empty_toml_uses_all_defaults() {
        let cfg: CoreConfig = toml::from_str("").expect("empty config parses");
        assert_eq!(cfg.plc.host, "192.168.6.6");
        assert_eq!(cfg.plc.port, 502);
        assert_eq!(cfg.plc.unit_id, 1);
        assert_eq!(cfg.monitor.poll_interval_ms, 100);
        assert_eq!(cfg.budget.adaptive_required_successes, 3);
    }

    #[test]
    fn partial_override_keeps_other_defaults() {
        let toml_src = r#"
            [plc]
            host = "10.0.0.5"
        "#;
        let cfg: CoreConfig = toml::from_str(toml_src).unwrap();
        assert_eq!(cfg.plc.host, "10.0.0.5");
        assert_eq!(cfg.plc.port, 502);
    }

    #[test]
    fn unknown_field_rejected() {
        let toml_src = r#"
            [plc]
            hostname = "typo"
        "#;
        let result: Result<CoreConfig, _> = toml::from_str(toml_src);
        assert!(result.is_err());
    }

    #[test]
    fn zero_port_fails_validation() {
        let mut cfg = CoreConfig::default();
        cfg.plc.port = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn missing_file_reports_not_found() {
        let result = CoreConfig::load(Path::new("/nonexistent/weigher.toml"));
        assert!(matches!(result, Err(ConfigError::FileNotFound)));
    }

    #[test]
    fn load_from_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weigher.toml");
        std::fs::write(&path, "[plc]\nport = 1502\n").unwrap();
        let cfg = CoreConfig::load(&path).unwrap();
        assert_eq!(cfg.plc.port, 1502);
    }
}
