//! Monitoring configuration
//!
//! Loads from environment variables:
//! - RUST_LOG: Tracing level (debug, info, warn, error)
//! - MONITORING_ENABLED: Enable/disable logging setup (true/false)
//! - LOG_FORMAT: Console output format (json or text)
//! - LOG_DIR: Directory for log files (default: ~/.sprintcore/logs)
//! - LOG_TO_FILE: Write daily-rotated JSON logs to LOG_DIR (default: true)

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// Enable or disable monitoring
    pub enabled: bool,

    /// Log level (debug, info, warn, error)
    pub log_level: String,

    /// Console log format (json or text)
    pub log_format: LogFormat,

    /// Directory for log files
    pub log_dir: PathBuf,

    pub enable_file_logging: bool,

    pub enable_console_logging: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Text,
}

impl LogFormat {
    pub fn as_str(&self) -> &str {
        match self {
            LogFormat::Json => "json",
            LogFormat::Text => "text",
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "text" => Ok(LogFormat::Text),
            _ => Err(format!("Unknown log format: {}", s)),
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            log_dir: Self::default_log_dir(),
            enable_file_logging: true,
            enable_console_logging: true,
        }
    }
}

impl MonitoringConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(enabled) = std::env::var("MONITORING_ENABLED") {
            config.enabled = enabled.to_lowercase() == "true";
        }

        if let Ok(log_level) = std::env::var("RUST_LOG") {
            config.log_level = log_level;
        }

        if let Ok(log_format) = std::env::var("LOG_FORMAT") {
            match log_format.parse() {
                Ok(format) => config.log_format = format,
                Err(e) => eprintln!("Ignoring LOG_FORMAT: {}", e),
            }
        }

        if let Ok(log_dir) = std::env::var("LOG_DIR") {
            config.log_dir = PathBuf::from(log_dir);
        }

        if let Ok(to_file) = std::env::var("LOG_TO_FILE") {
            config.enable_file_logging = to_file.to_lowercase() == "true" || to_file == "1";
        }

        config
    }

    /// Get default log directory: ~/.sprintcore/logs
    pub fn default_log_dir() -> PathBuf {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        PathBuf::from(format!("{}/.sprintcore/logs", home))
    }

    /// Ensure log directory exists
    pub fn ensure_log_dir(&self) -> std::io::Result<()> {
        if !self.log_dir.exists() {
            std::fs::create_dir_all(&self.log_dir)?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let perms = std::fs::Permissions::from_mode(0o755);
                std::fs::set_permissions(&self.log_dir, perms)?;
            }

            tracing::info!(path = %self.log_dir.display(), "Created log directory");
        }

        Ok(())
    }
}
