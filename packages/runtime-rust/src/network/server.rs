//! Health server with deferred startup.
//!
//! `new()` assembles state, `start()` binds the TCP listener and `serve()`
//! accepts connections until the shutdown future resolves. Binding early
//! lets the caller learn an OS-assigned port before serving.

use std::future::Future;

use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::info;

use super::handlers::{
    health_handler, instances_handler, liveness_handler, readiness_handler, AppState,
};
use super::middleware::build_http_layers;
use crate::engine::Engine;

#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub host: String,
    /// 0 means OS-assigned.
    pub port: u16,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
        }
    }
}

pub struct HealthServer {
    config: HealthConfig,
    state: AppState,
    listener: Option<TcpListener>,
}

impl HealthServer {
    #[must_use]
    pub fn new(config: HealthConfig, engine: Engine) -> Self {
        Self {
            config,
            state: AppState::new(engine),
            listener: None,
        }
    }

    /// Routes:
    /// - `GET /health` -- detailed health JSON
    /// - `GET /health/live` -- liveness probe
    /// - `GET /health/ready` -- readiness probe
    /// - `GET /registry/instances` -- registry snapshot
    pub fn build_router(&self) -> Router {
        build_router(self.state.clone())
    }

    /// Binds the listener and returns the bound port.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();
        info!(host = %self.config.host, port, "health listener bound");
        self.listener = Some(listener);
        Ok(port)
    }

    /// Serves until `shutdown` resolves.
    ///
    /// # Errors
    ///
    /// Returns an error if `start()` was not called, or on a fatal I/O error.
    pub async fn serve(self, shutdown: impl Future<Output = ()> + Send + 'static) -> anyhow::Result<()> {
        let listener = self
            .listener
            .ok_or_else(|| anyhow::anyhow!("start() must be called before serve()"))?;
        let router = build_router(self.state);

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;
        info!("health server stopped");
        Ok(())
    }
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/health/live", get(liveness_handler))
        .route("/health/ready", get(readiness_handler))
        .route("/registry/instances", get(instances_handler))
        .layer(build_http_layers())
        .with_state(state)
}
