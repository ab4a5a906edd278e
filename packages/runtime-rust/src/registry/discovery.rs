//! Read side of the registry.
//!
//! [`Discovery`] answers lookups from the latest published snapshot without
//! touching the executor, so consumer invocations never wait behind
//! registry writes. [`DiscoveryClient`] is the outbound half: how a node
//! fetches metadata from an instance it has not seen before.

use async_trait::async_trait;
use meshrpc_core::{InstanceStatus, Microservice, MicroserviceInfo, MicroserviceInstance, VersionRule};
use serde::Serialize;

use super::store::{InstanceStore, MicroserviceStore, StoreReader};

// ---------------------------------------------------------------------------
// DiscoveryClient
// ---------------------------------------------------------------------------

/// Fetches metadata directly from a peer instance.
#[async_trait]
pub trait DiscoveryClient: Send + Sync {
    /// Full metadata of the microservice served at `endpoint`.
    async fn get_info(&self, endpoint: &str, service_id: &str) -> anyhow::Result<MicroserviceInfo>;

    /// The instance record served at `endpoint`.
    async fn get_instance(
        &self,
        endpoint: &str,
        service_id: &str,
        instance_id: &str,
    ) -> anyhow::Result<MicroserviceInstance>;
}

/// For a node that never learns about peers it has not been told of.
pub struct NoopDiscoveryClient;

#[async_trait]
impl DiscoveryClient for NoopDiscoveryClient {
    async fn get_info(&self, endpoint: &str, _service_id: &str) -> anyhow::Result<MicroserviceInfo> {
        anyhow::bail!("no discovery client configured; can not reach {endpoint}")
    }

    async fn get_instance(
        &self,
        endpoint: &str,
        _service_id: &str,
        _instance_id: &str,
    ) -> anyhow::Result<MicroserviceInstance> {
        anyhow::bail!("no discovery client configured; can not reach {endpoint}")
    }
}

// ---------------------------------------------------------------------------
// Views
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceView {
    pub instance_id: String,
    pub status: InstanceStatus,
    pub endpoints: Vec<String>,
    pub registered_at_ms: u64,
    pub last_heartbeat_ms: u64,
}

impl From<&InstanceStore> for InstanceView {
    fn from(store: &InstanceStore) -> Self {
        Self {
            instance_id: store.instance_id().to_string(),
            status: store.status(),
            endpoints: store.instance().endpoints.clone(),
            registered_at_ms: store.registered_at_ms(),
            last_heartbeat_ms: store.last_heartbeat_ms(),
        }
    }
}

/// A microservice and its instances, as served by the admin endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceView {
    pub microservice: Microservice,
    pub schemas_summary: String,
    pub instances: Vec<InstanceView>,
}

impl From<&MicroserviceStore> for ServiceView {
    fn from(store: &MicroserviceStore) -> Self {
        Self {
            microservice: store.microservice().clone(),
            schemas_summary: store.schemas_summary().to_string(),
            instances: store.instances().map(|i| InstanceView::from(i.as_ref())).collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

/// Lock-free lookups over the registry snapshot.
///
/// Microservices whose last instance went away stay in the store (the
/// schema guard needs them) but are invisible here.
#[derive(Clone)]
pub struct Discovery {
    reader: StoreReader,
}

impl Discovery {
    #[must_use]
    pub fn new(reader: StoreReader) -> Self {
        Self { reader }
    }

    #[must_use]
    pub fn find_instance(&self, instance_id: &str) -> Option<MicroserviceInstance> {
        self.reader
            .load()
            .instance(instance_id)
            .map(|i| i.instance().clone())
    }

    /// Instances of `app_id/service_name` across every version the rule
    /// selects. Order follows version, then instance id.
    #[must_use]
    pub fn find_service_instances(
        &self,
        app_id: &str,
        service_name: &str,
        rule: &VersionRule,
    ) -> Vec<MicroserviceInstance> {
        let directory = self.reader.load();
        let mut candidates: Vec<_> = directory
            .microservices()
            .filter(|ms| ms.has_instances())
            .filter(|ms| {
                let m = ms.microservice();
                m.app_id == app_id && m.service_name == service_name
            })
            .cloned()
            .collect();
        candidates.sort_by_key(|ms| ms.microservice().version);

        rule.select(&candidates, |ms| ms.microservice().version)
            .into_iter()
            .flat_map(|ms| ms.instances().map(|i| i.instance().clone()))
            .collect()
    }

    /// Contract text of one schema.
    #[must_use]
    pub fn get_schema(&self, service_id: &str, schema_id: &str) -> Option<String> {
        self.reader
            .load()
            .microservice(service_id)
            .and_then(|ms| ms.schemas_by_id().get(schema_id).cloned())
    }

    /// Microservices with at least one instance.
    #[must_use]
    pub fn microservices(&self) -> Vec<Microservice> {
        self.reader
            .load()
            .microservices()
            .filter(|ms| ms.has_instances())
            .map(|ms| ms.microservice().clone())
            .collect()
    }

    #[must_use]
    pub fn instance_count(&self) -> usize {
        self.reader.load().instance_count()
    }

    /// Every visible microservice, ordered by service id.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ServiceView> {
        let mut views: Vec<_> = self
            .reader
            .load()
            .microservices()
            .filter(|ms| ms.has_instances())
            .map(|ms| ServiceView::from(ms.as_ref()))
            .collect();
        views.sort_by(|a, b| a.microservice.service_id.cmp(&b.microservice.service_id));
        views
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
