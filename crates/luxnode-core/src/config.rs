//! Coordinator configuration.

use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Timing knobs for a coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Delay before each connect attempt, in milliseconds. One attempt per entry.
    pub retry_delays_ms: Vec<u64>,
    /// Upper bound for a single connect attempt.
    pub connect_timeout_ms: u64,
    /// Upper bound for the disconnect request before the link is closed anyway.
    pub disconnect_timeout_ms: u64,
    pub keepalive_interval_secs: u64,
    pub keepalive_timeout_ms: u64,
    /// Pause between a memory-bank request and its response read.
    pub bank_settle_ms: u64,
    /// Pause after the post-authentication cache refresh.
    pub auth_settle_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            retry_delays_ms: vec![0, 100, 200, 400],
            connect_timeout_ms: 10_000,
            disconnect_timeout_ms: 5_000,
            keepalive_interval_secs: 15,
            keepalive_timeout_ms: 5_000,
            bank_settle_ms: 50,
            auth_settle_ms: 500,
        }
    }
}

impl CoordinatorConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: CoordinatorConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn retry_delays(&self) -> impl Iterator<Item = Duration> + '_ {
        self.retry_delays_ms.iter().map(|ms| Duration::from_millis(*ms))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    pub fn keepalive_timeout(&self) -> Duration {
        Duration::from_millis(self.keepalive_timeout_ms)
    }

    pub fn bank_settle(&self) -> Duration {
        Duration::from_millis(self.bank_settle_ms)
    }

    pub fn auth_settle(&self) -> Duration {
        Duration::from_millis(self.auth_settle_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: CoordinatorConfig = toml::from_str("keepalive_interval_secs = 30").unwrap();
        assert_eq!(config.keepalive_interval(), Duration::from_secs(30));
        assert_eq!(config.retry_delays_ms, vec![0, 100, 200, 400]);
        assert_eq!(config.bank_settle(), Duration::from_millis(50));
    }

    #[test]
    fn test_config_file_roundtrip() {
        let path = std::env::temp_dir().join(format!("luxnode-config-{}.toml", std::process::id()));
        let config = CoordinatorConfig {
            retry_delays_ms: vec![0, 250],
            ..Default::default()
        };
        config.save_to_file(&path).unwrap();
        let loaded = CoordinatorConfig::load_from_file(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(loaded, config);
    }
}
