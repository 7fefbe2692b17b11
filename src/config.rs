//! Settings loader and validator for the beans bridge.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root settings struct mirroring the YAML schema.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    pub beans: Beans,
    pub timeouts: Timeouts,
    pub retry: Retry,
    pub cache: Cache,
}

/// Location of the external binary and the workspace it operates on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Beans {
    pub binary: String,
    pub workspace: String,
}

impl Default for Beans {
    fn default() -> Self {
        Self {
            binary: "beans".into(),
            workspace: ".".into(),
        }
    }
}

/// Subprocess deadlines.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Timeouts {
    pub command_ms: u64,
    pub probe_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            command_ms: 30_000,
            probe_ms: 5_000,
        }
    }
}

/// Backoff for transient failures.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Retry {
    pub max_retries: u32,
    pub base_delay_ms: u64,
}

impl Default for Retry {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 100,
        }
    }
}

/// Lifetimes of the offline snapshot and the workspace config cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Cache {
    pub offline_ttl_seconds: u64,
    pub config_ttl_ms: u64,
}

impl Default for Cache {
    fn default() -> Self {
        Self {
            offline_ttl_seconds: 300,
            config_ttl_ms: 5_000,
        }
    }
}

impl Settings {
    pub fn workspace_root(&self) -> PathBuf {
        PathBuf::from(&self.beans.workspace)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.command_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.probe_ms)
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.retry.base_delay_ms)
    }

    pub fn offline_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.offline_ttl_seconds)
    }

    pub fn config_ttl(&self) -> Duration {
        Duration::from_millis(self.cache.config_ttl_ms)
    }
}

/// Load settings from a YAML file and validate them.
/// - If `path` is None, returns the defaults.
pub fn load(path: Option<&Path>) -> Result<Settings, ConfigError> {
    let Some(path) = path else {
        return Ok(Settings::default());
    };
    let content = fs::read_to_string(path)?;
    let cfg: Settings = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a settings instance.
fn validate(cfg: &Settings) -> Result<(), ConfigError> {
    if cfg.beans.binary.trim().is_empty() {
        return Err(ConfigError::Invalid("beans.binary must be non-empty"));
    }
    if cfg.beans.workspace.trim().is_empty() {
        return Err(ConfigError::Invalid("beans.workspace must be non-empty"));
    }
    if cfg.timeouts.command_ms == 0 {
        return Err(ConfigError::Invalid("timeouts.command_ms must be > 0"));
    }
    if cfg.timeouts.probe_ms == 0 {
        return Err(ConfigError::Invalid("timeouts.probe_ms must be > 0"));
    }
    if cfg.retry.max_retries > 10 {
        return Err(ConfigError::Invalid("retry.max_retries must be <= 10"));
    }
    if cfg.cache.offline_ttl_seconds == 0 {
        return Err(ConfigError::Invalid("cache.offline_ttl_seconds must be > 0"));
    }
    Ok(())
}

/// Example settings file with every field spelled out.
pub fn example() -> &'static str {
    r#"beans:
  binary: "beans"
  workspace: "."

timeouts:
  command_ms: 30000
  probe_ms: 5000

retry:
  max_retries: 3
  base_delay_ms: 100

cache:
  offline_ttl_seconds: 300
  config_ttl_ms: 5000
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parse_example_ok() {
        let cfg: Settings = serde_yaml::from_str(example()).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg, Settings::default());
    }

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let cfg: Settings = serde_yaml::from_str("beans:\n  binary: /opt/beans\n").unwrap();
        assert_eq!(cfg.beans.binary, "/opt/beans");
        assert_eq!(cfg.beans.workspace, ".");
        assert_eq!(cfg.retry.max_retries, 3);
        assert_eq!(cfg.command_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn invalid_binary() {
        let mut cfg = Settings::default();
        cfg.beans.binary = " ".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("beans.binary")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn invalid_timeouts_and_cache() {
        let mut cfg = Settings::default();
        cfg.timeouts.command_ms = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg = Settings::default();
        cfg.timeouts.probe_ms = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg = Settings::default();
        cfg.cache.offline_ttl_seconds = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn load_without_path_is_default() {
        assert_eq!(load(None).unwrap(), Settings::default());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("beans-bridge.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.timeouts.probe_ms, 5000);
        assert_eq!(cfg.offline_ttl(), Duration::from_secs(300));
    }
}
