//! Configuration, paths, errors, and logging setup for the outbound
//! delivery engine.

mod config;
mod error;
mod logging;
mod paths;

pub use config::{Config, DelivererSettings, DEFAULT_LOG_LEVEL, MAX_WINDOW_SECS};
pub use error::{CoreError, CoreResult};
pub use logging::{init_logging, log_config, SERVICE_NAME};
pub use paths::Paths;
