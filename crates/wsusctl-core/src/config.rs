//! wsusctl configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, WsusError};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WsusConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub operations: OperationsConfig,
    #[serde(default)]
    pub scripts: ScriptsConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl WsusConfig {
    /// Load config from the default path (~/.wsusctl/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| WsusError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| WsusError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| WsusError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Reject values outside the ranges the console supports.
    pub fn validate(&self) -> Result<()> {
        let ops = &self.operations;
        check_range("operations.max_concurrent_operations", ops.max_concurrent_operations as u64, 1, 10)?;
        check_range("operations.max_retry_attempts", ops.max_retry_attempts as u64, 0, 5)?;
        check_range("operations.initial_retry_delay_ms", ops.initial_retry_delay_ms, 100, 60_000)?;
        check_range("operations.operation_timeout_secs", ops.operation_timeout_secs, 10, 3600)?;
        if self.server.name.trim().is_empty() {
            return Err(WsusError::Config("server.name must not be empty".into()));
        }
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the wsusctl home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".wsusctl")
    }
}

fn check_range(field: &str, value: u64, min: u64, max: u64) -> Result<()> {
    if value < min || value > max {
        return Err(WsusError::Config(format!(
            "{field} = {value} is out of range ({min}..={max})"
        )));
    }
    Ok(())
}

/// Expand `~` in a configured path.
pub fn expand_path(p: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(p).to_string())
}

/// WSUS server connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_name")]
    pub name: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
    #[serde(default)]
    pub use_ssl: bool,
}

fn default_server_name() -> String { "localhost".into() }
fn default_server_port() -> u16 { 8530 }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: default_server_name(),
            port: default_server_port(),
            use_ssl: false,
        }
    }
}

/// Limits applied to every scripted operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationsConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_operations: usize,
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
    #[serde(default = "default_initial_retry_delay")]
    pub initial_retry_delay_ms: u64,
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_secs: u64,
}

fn default_max_concurrent() -> usize { 5 }
fn default_max_retry_attempts() -> u32 { 3 }
fn default_initial_retry_delay() -> u64 { 1000 }
fn default_operation_timeout() -> u64 { 300 }

impl Default for OperationsConfig {
    fn default() -> Self {
        Self {
            max_concurrent_operations: default_max_concurrent(),
            max_retry_attempts: default_max_retry_attempts(),
            initial_retry_delay_ms: default_initial_retry_delay(),
            operation_timeout_secs: default_operation_timeout(),
        }
    }
}

/// Where the operation scripts live and how to launch them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptsConfig {
    #[serde(default = "default_scripts_dir")]
    pub directory: String,
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default = "default_shell_args")]
    pub shell_args: Vec<String>,
}

fn default_scripts_dir() -> String { "~/.wsusctl/scripts".into() }
fn default_shell() -> String { "powershell.exe".into() }
fn default_shell_args() -> Vec<String> {
    vec!["-NoProfile", "-NonInteractive", "-ExecutionPolicy", "Bypass", "-File"]
        .into_iter().map(String::from).collect()
}

impl Default for ScriptsConfig {
    fn default() -> Self {
        Self {
            directory: default_scripts_dir(),
            shell: default_shell(),
            shell_args: default_shell_args(),
        }
    }
}

/// When staged-approval tracking entries are re-evaluated against telemetry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationPolicy {
    /// Every run of the owning scheduled task refreshes its entries.
    #[default]
    OnTaskRun,
    /// Only an explicit evaluation request refreshes entries.
    OnDemand,
}

/// Scheduled task engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "bool_true")]
    pub mirror_enabled: bool,
    #[serde(default = "default_mirror_folder")]
    pub mirror_folder: String,
    /// Command the OS task runner invokes; `run-task <id>` is appended.
    #[serde(default = "default_launcher")]
    pub launcher: String,
    #[serde(default)]
    pub evaluation: EvaluationPolicy,
}

fn bool_true() -> bool { true }
fn default_data_dir() -> String { "~/.wsusctl/data".into() }
fn default_mirror_folder() -> String { "\\WsusCtl".into() }
fn default_launcher() -> String { "wsusctl.exe".into() }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            mirror_enabled: true,
            mirror_folder: default_mirror_folder(),
            launcher: default_launcher(),
            evaluation: EvaluationPolicy::default(),
        }
    }
}

/// Logging output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String { "info".into() }

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = WsusConfig::default();
        assert_eq!(config.server.port, 8530);
        assert_eq!(config.operations.max_concurrent_operations, 5);
        assert_eq!(config.operations.max_retry_attempts, 3);
        assert_eq!(config.scheduler.evaluation, EvaluationPolicy::OnTaskRun);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            [server]
            name = "wsus01.corp.local"
            port = 8531
            use_ssl = true

            [operations]
            max_concurrent_operations = 8
            initial_retry_delay_ms = 500

            [scheduler]
            evaluation = "on_demand"
        "#;

        let config: WsusConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.name, "wsus01.corp.local");
        assert!(config.server.use_ssl);
        assert_eq!(config.operations.max_concurrent_operations, 8);
        assert_eq!(config.operations.max_retry_attempts, 3);
        assert_eq!(config.operations.initial_retry_delay_ms, 500);
        assert_eq!(config.scheduler.evaluation, EvaluationPolicy::OnDemand);
    }

    #[test]
    fn test_config_missing_fields_use_defaults() {
        let config: WsusConfig = toml::from_str("").unwrap();
        assert_eq!(config.server.name, "localhost");
        assert_eq!(config.scripts.shell, "powershell.exe");
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        let mut config = WsusConfig::default();
        config.operations.max_retry_attempts = 6;
        assert!(matches!(config.validate(), Err(WsusError::Config(_))));

        let mut config = WsusConfig::default();
        config.operations.max_concurrent_operations = 0;
        assert!(config.validate().is_err());

        let mut config = WsusConfig::default();
        config.operations.max_concurrent_operations = 10;
        config.operations.max_retry_attempts = 0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[operations]\nmax_retry_attempts = 9\n").unwrap();
        assert!(WsusConfig::load_from(&path).is_err());
    }

    #[test]
    fn test_home_dir() {
        let home = WsusConfig::home_dir();
        assert!(home.to_string_lossy().contains("wsusctl"));
    }
}
