//! Operational HTTP surface: health probes and a registry snapshot.

pub mod handlers;
pub mod middleware;
pub mod server;

pub use handlers::AppState;
pub use server::{HealthConfig, HealthServer};
