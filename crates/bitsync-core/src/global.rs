//! Process-wide coordinator
//!
//! Prefer passing a [`Coordinator`] explicitly. This instance exists for the
//! composition root of applications whose independent surfaces (windows,
//! plugins) must share one set of transfers.
//!
//! Lifecycle: created on first use (or by [`init_global`]), lives for the
//! rest of the process, and is cleared by [`shutdown`] on exit.

use crate::engine::Coordinator;
use crate::error::BitsyncError;
use bitsync_types::EngineSettings;
use std::sync::OnceLock;
use tracing::info;

static COORDINATOR: OnceLock<Coordinator> = OnceLock::new();

/// The process-wide coordinator, created with default settings if needed
pub fn global() -> &'static Coordinator {
    COORDINATOR.get_or_init(Coordinator::default)
}

/// Create the process-wide coordinator with explicit settings
///
/// Fails if it already exists.
pub fn init_global(settings: EngineSettings) -> Result<&'static Coordinator, BitsyncError> {
    COORDINATOR
        .set(Coordinator::new(settings))
        .map_err(|_| {
            BitsyncError::InvalidOperation("global coordinator already initialised".to_string())
        })?;
    Ok(global())
}

/// Tear down the process-wide coordinator: cancel timers, clear all state
pub fn shutdown() {
    if let Some(coordinator) = COORDINATOR.get() {
        coordinator.teardown();
        info!("Global coordinator shut down");
    }
}
