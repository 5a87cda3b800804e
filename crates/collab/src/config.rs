//! Sync configuration

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CollabError, Result};

/// Timing and threshold knobs for a document session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Quiet period after the last edit before transmitting
    #[serde(with = "duration_millis")]
    pub debounce: Duration,
    /// Upper bound on how long a batch can be held back
    #[serde(with = "duration_millis")]
    pub max_debounce: Duration,
    /// Pending queue length that forces an immediate flush
    pub flush_threshold: usize,
    /// How long save waits for pending operations to drain
    #[serde(with = "duration_millis")]
    pub save_timeout: Duration,
    /// Snapshot polling interval on the fallback path
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,
    /// Per-attempt push connection timeout
    #[serde(with = "duration_millis")]
    pub connect_timeout: Duration,
    /// Push connection attempts before falling back to polling
    pub reconnect_attempts: u32,
    /// Backoff unit; attempt `n` waits `n * reconnect_backoff`
    #[serde(with = "duration_millis")]
    pub reconnect_backoff: Duration,
    /// Keepalive ping interval on the push channel
    #[serde(with = "duration_millis")]
    pub heartbeat: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(150),
            max_debounce: Duration::from_millis(1000),
            flush_threshold: 20,
            save_timeout: Duration::from_millis(2000),
            poll_interval: Duration::from_millis(3000),
            connect_timeout: Duration::from_millis(1500),
            reconnect_attempts: 3,
            reconnect_backoff: Duration::from_millis(500),
            heartbeat: Duration::from_millis(30_000),
        }
    }
}

impl SyncConfig {
    /// Parse from TOML; missing keys take their defaults
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self = toml::from_str(source).map_err(|e| CollabError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(path)
            .map_err(|e| CollabError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&source)
    }

    pub fn validate(&self) -> Result<()> {
        if self.reconnect_attempts == 0 {
            return Err(CollabError::Config("reconnect_attempts must be at least 1".into()));
        }
        if self.poll_interval.is_zero() || self.heartbeat.is_zero() {
            return Err(CollabError::Config("poll_interval and heartbeat must be non-zero".into()));
        }
        if self.max_debounce < self.debounce {
            return Err(CollabError::Config("max_debounce must not be shorter than debounce".into()));
        }
        Ok(())
    }

    /// Delay before reconnect attempt `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.reconnect_backoff * attempt
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
