//! Error handlers for per-item faults.
//!
//! A handler receives the fault and decides: `Ok(())` skips the offending
//! shard, member or sample and keeps the epoch going; `Err(e)` ends the epoch
//! with `e`. Configuration errors never reach a handler.

use anyhow::{Error, Result};
use std::sync::Arc;
use tracing::warn;

pub type Handler = Arc<dyn Fn(Error) -> Result<()> + Send + Sync>;

/// Propagate every fault. This is the default.
#[must_use]
pub fn reraise_exception() -> Handler {
    Arc::new(|err: Error| -> Result<()> { Err(err) })
}

/// Skip every fault silently.
#[must_use]
pub fn ignore_and_continue() -> Handler {
    Arc::new(|_: Error| -> Result<()> { Ok(()) })
}

/// Skip every fault after logging it.
#[must_use]
pub fn warn_and_continue() -> Handler {
    Arc::new(|err: Error| -> Result<()> {
        warn!("skipping after fault: {err:#}");
        Ok(())
    })
}

/// Run `err` through `handler`; `Some` holds the error to emit downstream.
pub(crate) fn route(handler: &Handler, err: Error) -> Option<Error> {
    handler(err).err()
}
