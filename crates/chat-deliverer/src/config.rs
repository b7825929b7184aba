//! Engine tunables.

use deliverer_config_and_utils::{CoreError, CoreResult, DelivererSettings};
use std::time::Duration;

/// Capacity of the wake-signal channels.
pub const DEFAULT_SIGNAL_CAPACITY: usize = 100;

#[derive(Debug, Clone)]
pub struct DelivererConfig {
    /// Period of the delivery loop's wake timer.
    pub interval: Duration,
    /// Attempts after which a conversation's queue fails as `TOO_MANY_ATTEMPTS`.
    pub max_attempts: u32,
    /// Time offline after which failures become permanent `OFFLINE`.
    pub disconnect_limit: chrono::Duration,
    /// Age after which a pending record fails as `EXPIRED`.
    pub expire_after: chrono::Duration,
    pub bypass_queue_capacity: usize,
    pub signal_capacity: usize,
}

impl Default for DelivererConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_attempts: 180,
            disconnect_limit: chrono::Duration::minutes(10),
            expire_after: chrono::Duration::hours(1),
            bypass_queue_capacity: 100,
            signal_capacity: DEFAULT_SIGNAL_CAPACITY,
        }
    }
}

impl TryFrom<&DelivererSettings> for DelivererConfig {
    type Error = CoreError;

    fn try_from(settings: &DelivererSettings) -> CoreResult<Self> {
        Ok(Self {
            interval: Duration::from_millis(settings.interval_ms),
            max_attempts: settings.max_attempts,
            disconnect_limit: window("disconnect_limit_secs", settings.disconnect_limit_secs)?,
            expire_after: window("expire_after_secs", settings.expire_after_secs)?,
            bypass_queue_capacity: settings.bypass_queue_capacity.max(1),
            signal_capacity: DEFAULT_SIGNAL_CAPACITY,
        })
    }
}

fn window(name: &str, secs: u64) -> CoreResult<chrono::Duration> {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .ok_or_else(|| CoreError::Config(format!("deliverer.{name} out of range: {secs}")))
}
