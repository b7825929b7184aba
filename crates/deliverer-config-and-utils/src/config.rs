//! Configuration management.

use crate::{CoreError, CoreResult, Paths};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Environment variable overriding the log level.
const ENV_LOG_LEVEL: &str = "DELIVERER_LOG_LEVEL";
/// Environment variable overriding the delivery loop interval, in milliseconds.
const ENV_INTERVAL_MS: &str = "DELIVERER_INTERVAL_MS";

/// Upper bound for the second-denominated deliverer windows (30 days).
pub const MAX_WINDOW_SECS: u64 = 30 * 24 * 60 * 60;

/// Tunables for the delivery engine, as stored on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DelivererSettings {
    /// Period of the delivery loop's wake timer.
    pub interval_ms: u64,
    /// Attempts after which a conversation's queue fails permanently.
    pub max_attempts: u32,
    /// Time offline after which outstanding sends fail permanently.
    pub disconnect_limit_secs: u64,
    /// Age after which a pending record expires.
    pub expire_after_secs: u64,
    /// Capacity of the fire-and-forget queue.
    pub bypass_queue_capacity: usize,
}

impl Default for DelivererSettings {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            max_attempts: 180,
            disconnect_limit_secs: 10 * 60,
            expire_after_secs: 60 * 60,
            bypass_queue_capacity: 100,
        }
    }
}

/// Main configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
    /// Delivery engine tunables.
    #[serde(default)]
    pub deliverer: DelivererSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            deliverer: DelivererSettings::default(),
        }
    }
}

impl Config {
    /// Create a new Config with default values, then override from environment.
    pub fn new() -> Self {
        let mut config = Self::default();
        config.load_from_env();
        config
    }

    /// Load configuration from the config file, falling back to defaults.
    /// Environment variables win over the file.
    pub fn load(paths: &Paths) -> CoreResult<Self> {
        let config_path = paths.config_file();

        let mut config = if config_path.exists() {
            Self::load_from_file(&config_path)?
        } else {
            Self::default()
        };

        config.load_from_env();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a file.
    pub fn save(&self, paths: &Paths) -> CoreResult<()> {
        paths.ensure_dirs()?;
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(paths.config_file(), content)?;
        Ok(())
    }

    /// Reject settings that would stall or spin the delivery loop.
    pub fn validate(&self) -> CoreResult<()> {
        if self.deliverer.interval_ms == 0 {
            return Err(CoreError::Config(
                "deliverer.interval_ms must be positive".to_string(),
            ));
        }
        if self.deliverer.max_attempts == 0 {
            return Err(CoreError::Config(
                "deliverer.max_attempts must be positive".to_string(),
            ));
        }
        if self.deliverer.bypass_queue_capacity == 0 {
            return Err(CoreError::Config(
                "deliverer.bypass_queue_capacity must be positive".to_string(),
            ));
        }
        check_window("deliverer.disconnect_limit_secs", self.deliverer.disconnect_limit_secs)?;
        check_window("deliverer.expire_after_secs", self.deliverer.expire_after_secs)?;
        Ok(())
    }

    fn load_from_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from a key lookup (the process environment in production).
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(log_level) = lookup(ENV_LOG_LEVEL) {
            self.log_level = log_level;
        }
        if let Some(raw) = lookup(ENV_INTERVAL_MS) {
            match raw.trim().parse::<u64>() {
                Ok(ms) => self.deliverer.interval_ms = ms,
                Err(e) => tracing::warn!(value = %raw, error = %e, "Ignoring invalid {}", ENV_INTERVAL_MS),
            }
        }
    }
}

fn check_window(name: &str, secs: u64) -> CoreResult<()> {
    if secs == 0 || secs > MAX_WINDOW_SECS {
        return Err(CoreError::Config(format!(
            "{name} must be between 1 and {MAX_WINDOW_SECS}, got {secs}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.log_level, DEFAULT_LOG_LEVEL);
        assert_eq!(config.deliverer.interval_ms, 5_000);
        assert_eq!(config.deliverer.max_attempts, 180);
        assert_eq!(config.deliverer.disconnect_limit_secs, 600);
        assert_eq!(config.deliverer.expire_after_secs, 3600);
    }

    #[test]
    fn test_config_load_from_file_with_partial_settings() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.json");

        let config_json = r#"{
            "log_level": "debug",
            "deliverer": { "interval_ms": 250 }
        }"#;
        std::fs::write(&config_path, config_json).unwrap();

        let config = Config::load_from_file(&config_path).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.deliverer.interval_ms, 250);
        assert_eq!(config.deliverer.max_attempts, 180);
    }

    #[test]
    fn test_config_save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let paths = Paths::with_base_dir(dir.path().to_path_buf());

        let mut config = Config::default();
        config.log_level = "trace".to_string();
        config.deliverer.max_attempts = 12;
        config.save(&paths).unwrap();

        let loaded = Config::load_from_file(&paths.config_file()).unwrap();
        assert_eq!(loaded.log_level, "trace");
        assert_eq!(loaded.deliverer.max_attempts, 12);
    }

    #[test]
    fn test_config_load_nonexistent_uses_defaults() {
        let dir = tempdir().unwrap();
        let paths = Paths::with_base_dir(dir.path().to_path_buf());

        let config = Config::load(&paths).unwrap();
        assert_eq!(config.deliverer, DelivererSettings::default());
    }

    #[test]
    fn test_invalid_json_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();

        assert!(matches!(
            Config::load_from_file(&path),
            Err(CoreError::Json(_))
        ));
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let mut config = Config::default();
        config.deliverer.interval_ms = 0;
        assert!(matches!(config.validate(), Err(CoreError::Config(_))));
    }

    #[test]
    fn test_validate_bounds_window_settings() {
        let mut config = Config::default();
        config.deliverer.disconnect_limit_secs = u64::MAX;
        assert!(matches!(config.validate(), Err(CoreError::Config(_))));

        let mut config = Config::default();
        config.deliverer.expire_after_secs = 1 << 62;
        assert!(matches!(config.validate(), Err(CoreError::Config(_))));

        let mut config = Config::default();
        config.deliverer.expire_after_secs = 0;
        assert!(matches!(config.validate(), Err(CoreError::Config(_))));

        let mut config = Config::default();
        config.deliverer.disconnect_limit_secs = MAX_WINDOW_SECS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_overrides_apply_log_level_and_interval() {
        let env: HashMap<&str, &str> = [
            (ENV_LOG_LEVEL, "warn"),
            (ENV_INTERVAL_MS, "1500"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.log_level, "warn");
        assert_eq!(config.deliverer.interval_ms, 1500);
    }

    #[test]
    fn test_invalid_interval_override_is_ignored() {
        let mut config = Config::default();
        config.apply_overrides(|k| (k == ENV_INTERVAL_MS).then(|| "soon".to_string()));
        assert_eq!(config.deliverer.interval_ms, 5_000);
    }
}
