//! Handler definitions for the health surface.
//!
//! `AppState` is the shared state carried through axum extractors.

pub mod health;
pub mod registry;

pub use health::{health_handler, liveness_handler, readiness_handler};
pub use registry::instances_handler;

use std::time::Instant;

use crate::engine::Engine;

/// Shared application state passed to all axum handlers via `State` extraction.
#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
    /// Server start time, used for uptime calculation.
    pub start_time: Instant,
}

impl AppState {
    #[must_use]
    pub fn new(engine: Engine) -> Self {
        Self {
            engine,
            start_time: Instant::now(),
        }
    }
}
