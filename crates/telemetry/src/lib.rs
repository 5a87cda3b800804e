//! # Inkwell Telemetry
//!
//! Logging bootstrap shared by the Inkwell binaries.

pub mod logging;

use serde::{Deserialize, Serialize};

pub use logging::{init, LogFormat, LogLevel, TelemetryError};

/// Telemetry configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Log level, overridden by `RUST_LOG` when set
    pub log_level: LogLevel,
    /// Output format
    pub format: LogFormat,
    /// Include the module path in each line
    pub with_target: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            format: LogFormat::Pretty,
            with_target: true,
        }
    }
}

impl TelemetryConfig {
    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    pub fn json(mut self, json: bool) -> Self {
        self.format = if json { LogFormat::Json } else { LogFormat::Pretty };
        self
    }
}
