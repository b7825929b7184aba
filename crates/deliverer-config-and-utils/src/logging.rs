//! Logging setup for hosts embedding the deliverer.

use crate::{Config, Paths};
use observability::LogConfig;

/// Service name stamped on every log line.
pub const SERVICE_NAME: &str = "deliverer";

/// Logging settings derived from the loaded config: JSONL output to
/// `paths.log_file()` plus compact stderr. `RUST_LOG` still wins over
/// `config.log_level`.
pub fn log_config(config: &Config, paths: &Paths) -> LogConfig {
    LogConfig {
        service_name: SERVICE_NAME.into(),
        default_level: config.log_level.clone(),
        log_path: Some(paths.log_file()),
        also_stderr: true,
    }
}

/// Install the global subscriber. Later calls are ignored.
pub fn init_logging(config: &Config, paths: &Paths) {
    observability::init_with_config(log_config(config, paths));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn log_config_follows_config_and_paths() {
        let paths = Paths::with_base_dir(PathBuf::from("/var/lib/deliverer"));
        let config = Config {
            log_level: "debug".to_string(),
            ..Config::default()
        };

        let log = log_config(&config, &paths);
        assert_eq!(log.service_name, "deliverer");
        assert_eq!(log.default_level, "debug");
        assert_eq!(
            log.log_path,
            Some(PathBuf::from("/var/lib/deliverer/logs/deliverer.jsonl"))
        );
        assert!(log.also_stderr);
    }
}
