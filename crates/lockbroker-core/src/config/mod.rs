//! Configuration loading and validation

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Lockbroker configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub monitor: MonitorConfig,
    pub alerts: AlertConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the RPC server listens on
    pub listen_addr: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Seconds between checks of the longest-held lock
    pub check_interval_secs: u64,
    /// Seconds a lock may be held before operators are alerted
    pub max_hold_secs: u64,
    /// Seconds to stay quiet after a stale lock alert
    pub alert_cooldown_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    /// Whether operators are notified; when false alerts are only logged
    pub enabled: bool,
    /// Webhook receiving alerts as JSON
    pub webhook_url: Option<String>,
    /// Seconds before a webhook request is abandoned
    pub timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8010".to_string(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 30,
            max_hold_secs: 5 * 60,
            alert_cooldown_secs: 30 * 60,
        }
    }
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            webhook_url: None,
            timeout_secs: 5,
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> anyhow::Result<SocketAddr> {
        self.listen_addr
            .parse()
            .with_context(|| format!("Invalid listen address: {}", self.listen_addr))
    }
}

impl MonitorConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn max_hold(&self) -> Duration {
        Duration::from_secs(self.max_hold_secs)
    }

    pub fn alert_cooldown(&self) -> Duration {
        Duration::from_secs(self.alert_cooldown_secs)
    }
}

impl AlertConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Config {
    /// Get the config directory path
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        let dir = if let Ok(custom_dir) = env::var("LOCKBROKER_CONFIG_DIR") {
            PathBuf::from(custom_dir)
        } else {
            dirs::config_dir()
                .ok_or_else(|| anyhow!("Could not determine config directory"))?
                .join("lockbroker")
        };
        Ok(dir)
    }

    /// Get the config file path
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from the default location, or defaults if absent
    pub fn load() -> anyhow::Result<Self> {
        let path = Self::config_path()?;

        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Config::default())
        }
    }

    /// Load configuration from an explicit file
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        self.server.socket_addr()?;

        if self.monitor.check_interval_secs == 0 {
            return Err(anyhow!("monitor.check_interval_secs must be greater than 0"));
        }
        if self.monitor.max_hold_secs == 0 {
            return Err(anyhow!("monitor.max_hold_secs must be greater than 0"));
        }
        if self.alerts.timeout_secs == 0 {
            return Err(anyhow!("alerts.timeout_secs must be greater than 0"));
        }
        if let Some(url) = &self.alerts.webhook_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(anyhow!("alerts.webhook_url must be an http(s) URL: {}", url));
            }
        }

        Ok(())
    }

    /// Get a configuration value by key
    pub fn get(&self, key: &str) -> anyhow::Result<String> {
        match key {
            "server.listen_addr" => Ok(self.server.listen_addr.clone()),

            "monitor.check_interval_secs" => Ok(self.monitor.check_interval_secs.to_string()),
            "monitor.max_hold_secs" => Ok(self.monitor.max_hold_secs.to_string()),
            "monitor.alert_cooldown_secs" => Ok(self.monitor.alert_cooldown_secs.to_string()),

            "alerts.enabled" => Ok(self.alerts.enabled.to_string()),
            "alerts.webhook_url" => Ok(self
                .alerts
                .webhook_url
                .clone()
                .unwrap_or_else(|| "(not set)".to_string())),
            "alerts.timeout_secs" => Ok(self.alerts.timeout_secs.to_string()),

            _ => Err(anyhow!(
                "Unknown configuration key: {}. Use `lockbroker config show` to see available keys.",
                key
            )),
        }
    }

    /// List all configuration keys
    pub fn keys() -> &'static [&'static str] {
        &[
            "server.listen_addr",
            "monitor.check_interval_secs",
            "monitor.max_hold_secs",
            "monitor.alert_cooldown_secs",
            "alerts.enabled",
            "alerts.webhook_url",
            "alerts.timeout_secs",
        ]
    }

    /// Render the configuration as TOML
    pub fn to_toml(&self) -> anyhow::Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.server.listen_addr, "127.0.0.1:8010");
        assert_eq!(config.monitor.check_interval(), Duration::from_secs(30));
        assert_eq!(config.monitor.max_hold(), Duration::from_secs(300));
        assert_eq!(config.monitor.alert_cooldown(), Duration::from_secs(1800));
        assert!(config.alerts.enabled);
        assert_eq!(config.alerts.timeout(), Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_falls_back_to_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        fs::write(&path, "[monitor]\nmax_hold_secs = 60\n").unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.monitor.max_hold_secs, 60);
        assert_eq!(config.monitor.check_interval_secs, 30);
        assert_eq!(config.server.listen_addr, "127.0.0.1:8010");
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = Config::default();
        config.server.listen_addr = "not-an-address".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.monitor.check_interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.alerts.webhook_url = Some("ftp://example.com".to_string());
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.alerts.timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_get_every_key() {
        let config = Config::default();
        for key in Config::keys() {
            assert!(config.get(key).is_ok(), "key {} should resolve", key);
        }
        assert_eq!(config.get("alerts.webhook_url").unwrap(), "(not set)");
        assert!(config.get("nope").is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = Config::default();
        config.alerts.webhook_url = Some("https://alerts.example.com/hook".to_string());

        let rendered = config.to_toml().unwrap();
        let parsed: Config = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed, config);
    }
}
