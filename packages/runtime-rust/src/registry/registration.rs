//! Outbound half of the registry: telling peers about this instance.
//!
//! [`RegistrationManager`] records Self in the local store, pushes
//! `REGISTER` to peers through a [`RegistryPublisher`], keeps doing so on
//! every heartbeat tick (sweeping dead peers on the same tick), and sends
//! `UNREGISTER` on the way out.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use meshrpc_core::{InstanceStatus, RegistryMessage};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::executor::MessageExecutor;
use super::self_identity::SelfIdentity;
use super::RegistryError;
use crate::config::EngineConfig;
use crate::worker::{BackgroundRunnable, BackgroundWorker};

// ---------------------------------------------------------------------------
// RegistryPublisher
// ---------------------------------------------------------------------------

/// Delivers registry messages to peers. At most once per call; the
/// heartbeat schedule provides the retries.
#[async_trait]
pub trait RegistryPublisher: Send + Sync {
    async fn publish(&self, message: &RegistryMessage) -> anyhow::Result<()>;
}

/// For a node with no peers.
pub struct NoopPublisher;

#[async_trait]
impl RegistryPublisher for NoopPublisher {
    async fn publish(&self, _message: &RegistryMessage) -> anyhow::Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Shared registration steps
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct Registrar {
    identity: Arc<SelfIdentity>,
    executor: Arc<MessageExecutor>,
    publisher: Arc<dyn RegistryPublisher>,
}

impl Registrar {
    async fn register_locally(&self) -> Result<(), RegistryError> {
        let stored = self
            .executor
            .register_self(self.identity.microservice_info(), self.identity.schemas_summary())
            .await?;
        if !stored {
            warn!(
                instance_id = %self.identity.instance_id(),
                "local store refused self registration"
            );
        }
        Ok(())
    }

    async fn publish(&self, message: RegistryMessage) {
        let message_type = message.message_type();
        if let Err(e) = self.publisher.publish(&message).await {
            warn!(
                message_type = %message_type,
                instance_id = %self.identity.instance_id(),
                error = %format!("{e:#}"),
                "failed to publish registry message"
            );
        }
    }

    async fn publish_register(&self) {
        self.publish(RegistryMessage::Register(self.identity.register_request()))
            .await;
    }
}

// ---------------------------------------------------------------------------
// Heartbeat
// ---------------------------------------------------------------------------

struct HeartbeatRunnable {
    registrar: Registrar,
    dead_instance_timeout: Duration,
}

#[async_trait]
impl BackgroundRunnable for HeartbeatRunnable {
    type Task = ();

    async fn run(&mut self, (): ()) {
        self.on_tick().await;
    }

    async fn on_tick(&mut self) {
        self.registrar.publish_register().await;
        if let Err(e) = self.registrar.register_locally().await {
            warn!(error = %e, "heartbeat could not refresh self");
        }
        match self.registrar.executor.sweep(self.dead_instance_timeout).await {
            Ok(0) => {}
            Ok(removed) => info!(removed, "evicted instances that stopped heartbeating"),
            Err(e) => warn!(error = %e, "dead instance sweep failed"),
        }
    }
}

// ---------------------------------------------------------------------------
// RegistrationManager
// ---------------------------------------------------------------------------

pub struct RegistrationManager {
    registrar: Registrar,
    heartbeat_interval: Duration,
    dead_instance_timeout: Duration,
    heartbeat: Mutex<Option<BackgroundWorker<HeartbeatRunnable>>>,
}

impl RegistrationManager {
    #[must_use]
    pub fn new(
        identity: Arc<SelfIdentity>,
        executor: Arc<MessageExecutor>,
        publisher: Arc<dyn RegistryPublisher>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            registrar: Registrar {
                identity,
                executor,
                publisher,
            },
            heartbeat_interval: Duration::from_millis(config.heartbeat_interval_ms.max(1)),
            dead_instance_timeout: config.dead_instance_timeout(),
            heartbeat: Mutex::new(None),
        }
    }

    /// Registers Self locally, announces it to peers and starts the
    /// heartbeat. A failed announcement is logged; the heartbeat retries it.
    ///
    /// # Errors
    ///
    /// `ExecutorStopped` if the local registry is gone.
    pub async fn run(&self) -> Result<(), RegistryError> {
        self.registrar.register_locally().await?;
        self.registrar.publish_register().await;

        let mut heartbeat = self.heartbeat.lock().await;
        if heartbeat.is_none() {
            let runnable = HeartbeatRunnable {
                registrar: self.registrar.clone(),
                dead_instance_timeout: self.dead_instance_timeout,
            };
            *heartbeat = Some(BackgroundWorker::start(
                runnable,
                1,
                Some(self.heartbeat_interval),
            ));
            debug!(
                interval_ms = self.heartbeat_interval.as_millis(),
                "registry heartbeat started"
            );
        }
        Ok(())
    }

    /// Changes Self's status and pushes it immediately, without waiting
    /// for the next heartbeat.
    ///
    /// # Errors
    ///
    /// `ExecutorStopped` if the local registry is gone.
    pub async fn update_status(&self, status: InstanceStatus) -> Result<(), RegistryError> {
        self.registrar.identity.set_status(status);
        self.registrar.register_locally().await?;
        self.registrar.publish_register().await;
        info!(
            instance_id = %self.registrar.identity.instance_id(),
            status = %status,
            "instance status published"
        );
        Ok(())
    }

    /// Triggers one heartbeat now. Returns `false` if no heartbeat is
    /// running to take it.
    pub async fn heartbeat_now(&self) -> bool {
        let heartbeat = self.heartbeat.lock().await;
        let Some(worker) = heartbeat.as_ref() else {
            debug!("heartbeat trigger ignored, heartbeat not running");
            return false;
        };
        match worker.submit(()).await {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "heartbeat trigger dropped");
                false
            }
        }
    }

    #[must_use]
    pub fn identity(&self) -> &Arc<SelfIdentity> {
        &self.registrar.identity
    }

    /// Stops the heartbeat, tells peers this instance is leaving and drops
    /// it from the local store.
    ///
    /// # Errors
    ///
    /// `ExecutorStopped` if the local registry is gone.
    pub async fn destroy(&self) -> Result<(), RegistryError> {
        if let Some(mut worker) = self.heartbeat.lock().await.take() {
            worker.stop().await;
        }
        let request = self.registrar.identity.unregister_request();
        self.registrar
            .publish(RegistryMessage::Unregister(request.clone()))
            .await;
        self.registrar
            .executor
            .execute(RegistryMessage::Unregister(request))
            .await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
