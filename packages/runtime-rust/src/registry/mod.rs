//! Lightweight peer registry.
//!
//! Every instance keeps its own view of the microservices it has heard
//! about. Peers push `REGISTER` (also used as heartbeat) and `UNREGISTER`
//! messages; the first time an instance is seen, its metadata is fetched
//! from the instance itself. All mutations are sequenced by the
//! [`MessageExecutor`]; readers use the lock-free [`Discovery`] surface.

pub mod discovery;
pub mod executor;
pub mod registration;
pub mod self_identity;
pub mod store;
pub mod store_service;

use meshrpc_core::{InstanceStatus, MessageType};

pub use discovery::{Discovery, DiscoveryClient, InstanceView, NoopDiscoveryClient, ServiceView};
pub use executor::{MessageExecutor, MessageExecutorBuilder, MessageHandler};
pub use registration::{NoopPublisher, RegistrationManager, RegistryPublisher};
pub use self_identity::SelfIdentity;
pub use store::{Directory, InstanceStore, MicroserviceStore, Store, StoreReader};
pub use store_service::StoreService;

// ---------------------------------------------------------------------------
// RegistryError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("can not select endpoint for instance {instance_id}")]
    NoEndpoint { instance_id: String },
    #[error(
        "schemas changed, but version not changed, and has {instance_count} existing instances (service {service_id})"
    )]
    SchemaConflict {
        service_id: String,
        instance_count: usize,
    },
    #[error("failed to fetch metadata from {endpoint}: {message}")]
    Discovery { endpoint: String, message: String },
    #[error("no handler registered for {0} messages")]
    NoHandler(MessageType),
    #[error("{message_type} handler panicked: {message}")]
    HandlerPanicked {
        message_type: MessageType,
        message: String,
    },
    #[error("registry executor is not running")]
    ExecutorStopped,
    #[error("self identity can not change after the instance is UP: {0}")]
    SelfSealed(String),
    #[error("schema {0} is already registered")]
    DuplicateSchema(String),
}

// ---------------------------------------------------------------------------
// RegistryEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    Unregistered,
    Expired,
}

/// Change notifications published after each applied registry mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    InstanceRegistered {
        service_id: String,
        instance_id: String,
    },
    InstanceStatusChanged {
        service_id: String,
        instance_id: String,
        from: InstanceStatus,
        to: InstanceStatus,
    },
    InstanceRemoved {
        service_id: String,
        instance_id: String,
        reason: RemovalReason,
    },
    SchemaChanged {
        service_id: String,
        schemas_summary: String,
    },
}
