//! Wiring for hosts that keep their outboxes on disk.

use crate::collaborators::Collaborators;
use crate::config::DelivererConfig;
use crate::engine::Deliverer;
use crate::error::DelivererResult;
use chat_outbox::{SqliteOutboxProvider, SystemClock};
use deliverer_config_and_utils::{Config, Paths};
use std::sync::Arc;
use tracing::info;

/// Build a deliverer backed by per-user SQLite outboxes under
/// `paths.outbox_dir()`, using the system clock.
///
/// The engine is returned unstarted.
pub fn open_deliverer(
    paths: &Paths,
    config: &Config,
    collab: Collaborators,
) -> DelivererResult<Deliverer> {
    config.validate()?;
    paths.ensure_dirs()?;

    let engine_config = DelivererConfig::try_from(&config.deliverer)?;
    info!(
        outbox_dir = %paths.outbox_dir().display(),
        interval_ms = config.deliverer.interval_ms,
        max_attempts = engine_config.max_attempts,
        "Deliverer configuration loaded"
    );

    let clock = Arc::new(SystemClock);
    let provider = Arc::new(SqliteOutboxProvider::new(paths.outbox_dir(), clock.clone()));
    Ok(Deliverer::new(engine_config, clock, provider, collab))
}
