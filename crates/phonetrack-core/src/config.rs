use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::platform;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub http: HttpConfig,
    /// One `[[tracker]]` table per tracked device.
    #[serde(default, rename = "tracker", skip_serializing_if = "Vec::is_empty")]
    pub trackers: Vec<TrackerConfig>,
}

/// Local API exposing tracker entities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_enabled")]
    pub enabled: bool,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Options for one tracked device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Full `getlastpositions` endpoint, token included.
    pub url: String,
    /// Device name as reported by PhoneTrack.
    pub device_name: String,
    #[serde(default = "default_display_name")]
    pub display_name: String,
    /// Meters.  Fixes with worse accuracy are ignored.
    #[serde(default = "default_max_gps_accuracy")]
    pub max_gps_accuracy: u32,
    /// Seconds between polls.
    #[serde(default = "default_update_interval")]
    pub update_interval: u64,
    /// Minutes without a fresh fix before the device is unavailable.
    #[serde(default = "default_last_update_timeout")]
    pub last_update_timeout: u32,
}

impl TrackerConfig {
    pub fn new(url: impl Into<String>, device_name: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            device_name: device_name.into(),
            display_name: default_display_name(),
            max_gps_accuracy: default_max_gps_accuracy(),
            update_interval: default_update_interval(),
            last_update_timeout: default_last_update_timeout(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: default_http_enabled(),
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

fn default_http_enabled() -> bool {
    true
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8765
}

fn default_display_name() -> String {
    "PhoneTrack".to_string()
}

fn default_max_gps_accuracy() -> u32 {
    100
}

fn default_update_interval() -> u64 {
    60
}

fn default_last_update_timeout() -> u32 {
    30
}

impl Config {
    /// Load from the default location, writing a default file on first run.
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            let config = Self::default();
            config.save_to(&config_path)?;
            return Ok(config);
        }

        Self::load_from(&config_path)
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: Self =
            toml::from_str(&content).with_context(|| format!("invalid config {}", path.display()))?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.http.enabled);
        assert_eq!(config.http.port, 8765);
        assert_eq!(config.http.bind_address, "127.0.0.1");
        assert!(config.trackers.is_empty());
        assert!(Config::config_path().ends_with("phonetrack/config.toml"));
    }

    #[test]
    fn test_tracker_defaults_applied() {
        let config: Config = toml::from_str(
            r#"
            [[tracker]]
            url = "https://cloud.example.org/apps/phonetrack/api/getlastpositions/abc"
            device_name = "phone1"
            "#,
        )
        .unwrap();

        assert_eq!(config.trackers.len(), 1);
        let t = &config.trackers[0];
        assert_eq!(t.device_name, "phone1");
        assert_eq!(t.display_name, "PhoneTrack");
        assert_eq!(t.max_gps_accuracy, 100);
        assert_eq!(t.update_interval, 60);
        assert_eq!(t.last_update_timeout, 30);
        assert_eq!(*t, TrackerConfig::new(t.url.clone(), "phone1"));
    }

    #[test]
    fn test_tracker_requires_url_and_device() {
        let result: Result<Config, _> = toml::from_str("[[tracker]]\ndevice_name = \"x\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.http.port = 9000;
        let mut tracker = TrackerConfig::new("https://h/getlastpositions/t", "tablet");
        tracker.update_interval = 120;
        config.trackers.push(tracker.clone());
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.http.port, 9000);
        assert_eq!(loaded.trackers, vec![tracker]);
    }

    #[test]
    fn test_load_from_missing_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load_from(&dir.path().join("nope.toml")).unwrap_err();
        assert!(err.to_string().contains("failed to read"));
    }
}
