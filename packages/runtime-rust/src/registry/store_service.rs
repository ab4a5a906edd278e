//! Registry mutation rules.
//!
//! `StoreService` turns peer messages into store mutations: upsert on
//! register (fetching metadata for instances never seen before), removal
//! on unregister, eviction of instances that stopped heartbeating, and the
//! schema-change guard.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use meshrpc_core::{MicroserviceInfo, RegisterRequest, UnregisterRequest};
use tokio::sync::broadcast;
use tracing::{info, warn};

use super::discovery::DiscoveryClient;
use super::store::{InstanceStore, MicroserviceStore, Store};
use super::{RegistryError, RegistryEvent, RemovalReason};

const EVENT_CAPACITY: usize = 256;
const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

pub struct StoreService {
    store: Store,
    client: Arc<dyn DiscoveryClient>,
    events: broadcast::Sender<RegistryEvent>,
    fetch_timeout: Duration,
}

impl StoreService {
    #[must_use]
    pub fn new(store: Store, client: Arc<dyn DiscoveryClient>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            store,
            client,
            events,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
        }
    }

    /// Upper bound for one metadata fetch from a newly seen peer. Fetches
    /// run on the sequencing task, so a hung peer must not hold it.
    #[must_use]
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    #[must_use]
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Sender side of the change feed; subscribe before handing the
    /// service to the executor.
    #[must_use]
    pub fn events(&self) -> broadcast::Sender<RegistryEvent> {
        self.events.clone()
    }

    fn emit(&self, event: RegistryEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    // -----------------------------------------------------------------------
    // Register / heartbeat
    // -----------------------------------------------------------------------

    /// Applies a register message: adds an unknown instance, or refreshes
    /// a known one (status change plus heartbeat).
    ///
    /// # Errors
    ///
    /// - `NoEndpoint` if an unknown instance reports no endpoint
    /// - `SchemaConflict` if the schema summary changed while the
    ///   microservice still has live instances
    /// - `Discovery` if fetching metadata from the instance fails or does
    ///   not answer within the fetch timeout
    pub async fn register(&mut self, request: &RegisterRequest) -> Result<Arc<InstanceStore>, RegistryError> {
        let Some(existing) = self.store.find_instance(&request.instance_id) else {
            return self.add_instance(request).await;
        };

        let mut current = existing;
        if current.status() != request.status {
            let from = current.status();
            if let Some(updated) = self
                .store
                .update_instance_status(&request.instance_id, request.status)
            {
                info!(
                    service_id = %request.service_id,
                    instance_id = %request.instance_id,
                    from = %from,
                    to = %request.status,
                    "instance status changed"
                );
                self.emit(RegistryEvent::InstanceStatusChanged {
                    service_id: updated.service_id().to_string(),
                    instance_id: request.instance_id.clone(),
                    from,
                    to: request.status,
                });
                current = updated;
            }
        }
        self.store.heartbeat(&request.instance_id);
        Ok(current)
    }

    async fn add_instance(&mut self, request: &RegisterRequest) -> Result<Arc<InstanceStore>, RegistryError> {
        let endpoint = request
            .select_first_endpoint()
            .ok_or_else(|| RegistryError::NoEndpoint {
                instance_id: request.instance_id.clone(),
            })?
            .to_string();

        let mut instance = match self.store.find_microservice(&request.service_id) {
            None => {
                let info = self
                    .fetch(&endpoint, self.client.get_info(&endpoint, &request.service_id))
                    .await?;
                check_identity(&endpoint, request, &info)?;
                self.store.add_microservice(
                    info.microservice,
                    info.schemas_by_id,
                    &request.schemas_summary,
                );
                info.instance
            }
            Some(microservice) => {
                self.check_schema_summary(&microservice, request)?;
                let instance = self
                    .fetch(
                        &endpoint,
                        self.client
                            .get_instance(&endpoint, &request.service_id, &request.instance_id),
                    )
                    .await?;
                if instance.instance_id != request.instance_id {
                    return Err(RegistryError::Discovery {
                        endpoint,
                        message: format!("endpoint reports instance {}", instance.instance_id),
                    });
                }
                instance
            }
        };
        // The request is newer than whatever the peer served.
        instance.status = request.status;
        instance.service_id.clone_from(&request.service_id);

        let added = self
            .store
            .add_instance(instance)
            .ok_or_else(|| RegistryError::Discovery {
                endpoint: endpoint.clone(),
                message: format!("microservice {} vanished", request.service_id),
            })?;
        info!(
            service_id = %request.service_id,
            instance_id = %request.instance_id,
            endpoint = %endpoint,
            "instance registered"
        );
        self.emit(RegistryEvent::InstanceRegistered {
            service_id: request.service_id.clone(),
            instance_id: request.instance_id.clone(),
        });
        Ok(added)
    }

    async fn fetch<T>(
        &self,
        endpoint: &str,
        request: impl Future<Output = anyhow::Result<T>>,
    ) -> Result<T, RegistryError> {
        match tokio::time::timeout(self.fetch_timeout, request).await {
            Ok(result) => result.map_err(|e| discovery_error(endpoint, &e)),
            Err(_) => Err(RegistryError::Discovery {
                endpoint: endpoint.to_string(),
                message: format!("no answer within {}ms", self.fetch_timeout.as_millis()),
            }),
        }
    }

    fn check_schema_summary(
        &mut self,
        microservice: &MicroserviceStore,
        request: &RegisterRequest,
    ) -> Result<(), RegistryError> {
        if !microservice.is_schema_changed(&request.schemas_summary) {
            return Ok(());
        }
        if microservice.has_instances() {
            return Err(RegistryError::SchemaConflict {
                service_id: request.service_id.clone(),
                instance_count: microservice.instance_count(),
            });
        }

        self.store
            .set_schemas_summary(&request.service_id, &request.schemas_summary);
        warn!(
            service_id = %request.service_id,
            instance_id = %request.instance_id,
            "schemas changed without a version change; only acceptable during development"
        );
        self.emit(RegistryEvent::SchemaChanged {
            service_id: request.service_id.clone(),
            schemas_summary: request.schemas_summary.clone(),
        });
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Unregister / sweep
    // -----------------------------------------------------------------------

    /// Removes an instance. Unknown instances are ignored.
    pub fn unregister(&mut self, request: &UnregisterRequest) -> Option<Arc<InstanceStore>> {
        self.remove(&request.service_id, &request.instance_id, RemovalReason::Unregistered)
    }

    /// Evicts every instance whose last heartbeat is older than `timeout`.
    pub fn delete_dead_instances(&mut self, timeout: Duration) -> Vec<Arc<InstanceStore>> {
        let dead = self.store.find_dead_instances(timeout);
        dead.iter()
            .filter_map(|instance| {
                self.remove(
                    instance.service_id(),
                    instance.instance_id(),
                    RemovalReason::Expired,
                )
            })
            .collect()
    }

    fn remove(
        &mut self,
        service_id: &str,
        instance_id: &str,
        reason: RemovalReason,
    ) -> Option<Arc<InstanceStore>> {
        let removed = self.store.delete_instance(service_id, instance_id)?;
        info!(
            service_id = %removed.service_id(),
            instance_id = %instance_id,
            reason = ?reason,
            "instance removed"
        );
        self.emit(RegistryEvent::InstanceRemoved {
            service_id: removed.service_id().to_string(),
            instance_id: instance_id.to_string(),
            reason,
        });
        Some(removed)
    }

    // -----------------------------------------------------------------------
    // Self
    // -----------------------------------------------------------------------

    /// Records this process's own microservice and instance. Self metadata
    /// is authoritative: no fetch and no schema guard.
    pub fn register_self(
        &mut self,
        info: &MicroserviceInfo,
        schemas_summary: &str,
    ) -> Option<Arc<InstanceStore>> {
        let known = self
            .store
            .find_microservice(&info.microservice.service_id)
            .is_some_and(|ms| !ms.is_schema_changed(schemas_summary));
        if !known {
            self.store.add_microservice(
                info.microservice.clone(),
                info.schemas_by_id.clone(),
                schemas_summary,
            );
        }

        let instance_id = &info.instance.instance_id;
        let existing = self.store.find_instance(instance_id);
        if let Some(current) = &existing {
            if current.instance().endpoints == info.instance.endpoints {
                let mut current = Arc::clone(current);
                let from = current.status();
                if from != info.instance.status {
                    if let Some(updated) = self
                        .store
                        .update_instance_status(instance_id, info.instance.status)
                    {
                        self.emit(RegistryEvent::InstanceStatusChanged {
                            service_id: info.microservice.service_id.clone(),
                            instance_id: instance_id.clone(),
                            from,
                            to: info.instance.status,
                        });
                        current = updated;
                    }
                }
                self.store.heartbeat(instance_id);
                return Some(current);
            }
        }

        let added = self.store.add_instance(info.instance.clone());
        if existing.is_none() && added.is_some() {
            self.emit(RegistryEvent::InstanceRegistered {
                service_id: info.microservice.service_id.clone(),
                instance_id: instance_id.clone(),
            });
        }
        added
    }
}

fn discovery_error(endpoint: &str, error: &anyhow::Error) -> RegistryError {
    RegistryError::Discovery {
        endpoint: endpoint.to_string(),
        message: format!("{error:#}"),
    }
}

fn check_identity(
    endpoint: &str,
    request: &RegisterRequest,
    info: &MicroserviceInfo,
) -> Result<(), RegistryError> {
    if info.microservice.service_id != request.service_id {
        return Err(RegistryError::Discovery {
            endpoint: endpoint.to_string(),
            message: format!("endpoint serves {}", info.microservice.service_id),
        });
    }
    if info.instance.instance_id != request.instance_id {
        return Err(RegistryError::Discovery {
            endpoint: endpoint.to_string(),
            message: format!("endpoint reports instance {}", info.instance.instance_id),
        });
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use meshrpc_core::{
        InstanceStatus, ManualClock, Microservice, MicroserviceInstance, Version, VersionRule,
    };
    use parking_lot::Mutex;

    use super::*;
    use crate::registry::Discovery;

    /// Serves whatever instances were seeded, keyed by endpoint.
    #[derive(Default)]
    pub(crate) struct FakeClient {
        peers: Mutex<BTreeMap<String, MicroserviceInfo>>,
        pub(crate) calls: AtomicU32,
    }

    impl FakeClient {
        pub(crate) fn seed(&self, endpoint: &str, info: MicroserviceInfo) {
            self.peers.lock().insert(endpoint.to_string(), info);
        }
    }

    #[async_trait]
    impl DiscoveryClient for FakeClient {
        async fn get_info(&self, endpoint: &str, _service_id: &str) -> anyhow::Result<MicroserviceInfo> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.peers
                .lock()
                .get(endpoint)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("connection refused"))
        }

        async fn get_instance(
            &self,
            endpoint: &str,
            service_id: &str,
            _instance_id: &str,
        ) -> anyhow::Result<MicroserviceInstance> {
            Ok(self.get_info(endpoint, service_id).await?.instance)
        }
    }

    /// A peer that accepts the connection and never answers.
    pub(crate) struct HangingClient;

    #[async_trait]
    impl DiscoveryClient for HangingClient {
        async fn get_info(&self, _endpoint: &str, _service_id: &str) -> anyhow::Result<MicroserviceInfo> {
            std::future::pending().await
        }

        async fn get_instance(
            &self,
            _endpoint: &str,
            _service_id: &str,
            _instance_id: &str,
        ) -> anyhow::Result<MicroserviceInstance> {
            std::future::pending().await
        }
    }

    pub(crate) fn microservice() -> Microservice {
        Microservice::new("app", "orders", Version::new(1, 0, 0))
    }

    pub(crate) fn endpoint(id: &str) -> String {
        format!("rest://{id}.local:8080")
    }

    pub(crate) fn info(id: &str) -> MicroserviceInfo {
        MicroserviceInfo {
            microservice: microservice(),
            schemas_by_id: BTreeMap::from([("OrderApi".to_string(), "contract".to_string())]),
            instance: MicroserviceInstance {
                service_id: microservice().service_id,
                instance_id: id.to_string(),
                status: InstanceStatus::Up,
                endpoints: vec![endpoint(id)],
                host_name: format!("{id}.local"),
                properties: BTreeMap::new(),
            },
        }
    }

    pub(crate) fn request(id: &str, summary: &str, status: InstanceStatus) -> RegisterRequest {
        RegisterRequest {
            app_id: "app".to_string(),
            service_id: microservice().service_id,
            instance_id: id.to_string(),
            cross_app_allowed: false,
            schemas_summary: summary.to_string(),
            status,
            endpoints: vec![endpoint(id)],
        }
    }

    struct Fixture {
        service: StoreService,
        client: Arc<FakeClient>,
        clock: Arc<ManualClock>,
        events: broadcast::Receiver<RegistryEvent>,
    }

    fn fixture(ids: &[&str]) -> Fixture {
        let client = Arc::new(FakeClient::default());
        for id in ids {
            client.seed(&endpoint(id), info(id));
        }
        let clock = Arc::new(ManualClock::new(0));
        let service = StoreService::new(Store::new(clock.clone()), client.clone());
        let events = service.events().subscribe();
        Fixture {
            service,
            client,
            clock,
            events,
        }
    }

    #[tokio::test]
    async fn first_register_fetches_metadata() {
        let mut f = fixture(&["i1"]);
        let added = f
            .service
            .register(&request("i1", "s1", InstanceStatus::Up))
            .await
            .unwrap();

        assert_eq!(added.instance().host_name, "i1.local");
        assert_eq!(f.client.calls.load(Ordering::SeqCst), 1);
        let ms = f
            .service
            .store()
            .find_microservice(&microservice().service_id)
            .unwrap();
        assert_eq!(ms.schemas_summary(), "s1");
        assert_eq!(ms.schemas_by_id()["OrderApi"], "contract");
        assert_eq!(
            f.events.try_recv().unwrap(),
            RegistryEvent::InstanceRegistered {
                service_id: microservice().service_id,
                instance_id: "i1".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn repeated_register_is_a_heartbeat() {
        let mut f = fixture(&["i1"]);
        let req = request("i1", "s1", InstanceStatus::Up);
        f.service.register(&req).await.unwrap();
        f.clock.advance(5_000);

        let again = f.service.register(&req).await.unwrap();
        assert_eq!(again.last_heartbeat_ms(), 5_000);
        assert_eq!(f.client.calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.service.store().reader().load().instance_count(), 1);
    }

    #[tokio::test]
    async fn status_change_is_applied_and_announced() {
        let mut f = fixture(&["i1"]);
        f.service
            .register(&request("i1", "s1", InstanceStatus::Up))
            .await
            .unwrap();
        let _ = f.events.try_recv();

        let down = f
            .service
            .register(&request("i1", "s1", InstanceStatus::Down))
            .await
            .unwrap();
        assert_eq!(down.status(), InstanceStatus::Down);
        assert!(matches!(
            f.events.try_recv().unwrap(),
            RegistryEvent::InstanceStatusChanged {
                from: InstanceStatus::Up,
                to: InstanceStatus::Down,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn register_without_endpoint_fails() {
        let mut f = fixture(&[]);
        let mut req = request("i1", "s1", InstanceStatus::Up);
        req.endpoints.clear();
        assert_eq!(
            f.service.register(&req).await.unwrap_err(),
            RegistryError::NoEndpoint {
                instance_id: "i1".to_string()
            }
        );
    }

    #[tokio::test]
    async fn unreachable_peer_is_discovery_error() {
        let mut f = fixture(&[]);
        let err = f
            .service
            .register(&request("i1", "s1", InstanceStatus::Up))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Discovery { .. }));
        assert!(f.service.store().find_instance("i1").is_none());
    }

    #[tokio::test]
    async fn schema_change_with_live_instances_is_rejected() {
        let mut f = fixture(&["i1", "i2"]);
        f.service
            .register(&request("i1", "s1", InstanceStatus::Up))
            .await
            .unwrap();

        let err = f
            .service
            .register(&request("i2", "s2", InstanceStatus::Up))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            RegistryError::SchemaConflict {
                service_id: microservice().service_id,
                instance_count: 1,
            }
        );
        assert!(err.to_string().contains("has 1 existing instances"));

        let store = f.service.store();
        assert!(store.find_instance("i1").is_some());
        assert!(store.find_instance("i2").is_none());
        assert_eq!(
            store
                .find_microservice(&microservice().service_id)
                .unwrap()
                .schemas_summary(),
            "s1"
        );
    }

    #[tokio::test]
    async fn schema_change_without_instances_is_accepted() {
        let mut f = fixture(&["i1", "i2"]);
        f.service
            .register(&request("i1", "s1", InstanceStatus::Up))
            .await
            .unwrap();
        f.service.unregister(&UnregisterRequest {
            service_id: microservice().service_id,
            instance_id: "i1".to_string(),
        });
        while f.events.try_recv().is_ok() {}

        f.service
            .register(&request("i2", "s2", InstanceStatus::Up))
            .await
            .unwrap();
        let ms = f
            .service
            .store()
            .find_microservice(&microservice().service_id)
            .unwrap();
        assert_eq!(ms.schemas_summary(), "s2");
        assert_eq!(
            f.events.try_recv().unwrap(),
            RegistryEvent::SchemaChanged {
                service_id: microservice().service_id,
                schemas_summary: "s2".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn unregister_unknown_is_noop() {
        let mut f = fixture(&[]);
        assert!(f
            .service
            .unregister(&UnregisterRequest {
                service_id: "nope".to_string(),
                instance_id: "nope".to_string(),
            })
            .is_none());
        assert!(f.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn sweep_evicts_only_stale_instances() {
        let mut f = fixture(&["old", "fresh"]);
        f.service
            .register(&request("old", "s1", InstanceStatus::Up))
            .await
            .unwrap();
        f.clock.advance(80_000);
        f.service
            .register(&request("fresh", "s1", InstanceStatus::Up))
            .await
            .unwrap();
        f.clock.advance(20_000);

        let removed = f.service.delete_dead_instances(Duration::from_secs(90));
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].instance_id(), "old");
        assert!(f.service.store().find_instance("fresh").is_some());
    }

    #[tokio::test]
    async fn second_sweep_removes_nothing() {
        let mut f = fixture(&["i1"]);
        f.service
            .register(&request("i1", "s1", InstanceStatus::Up))
            .await
            .unwrap();
        f.clock.advance(100_000);

        assert_eq!(f.service.delete_dead_instances(Duration::from_secs(90)).len(), 1);
        assert!(f.service.delete_dead_instances(Duration::from_secs(90)).is_empty());
        assert_eq!(f.service.store().reader().load().instance_count(), 0);
    }

    #[tokio::test]
    async fn heartbeat_after_eviction_brings_instance_back() {
        let mut f = fixture(&["i1"]);
        let req = request("i1", "s1", InstanceStatus::Up);
        f.service.register(&req).await.unwrap();
        f.clock.advance(100_000);
        assert_eq!(f.service.delete_dead_instances(Duration::from_secs(90)).len(), 1);
        assert!(f.service.store().find_instance("i1").is_none());

        let back = f.service.register(&req).await.unwrap();
        assert_eq!(back.status(), InstanceStatus::Up);
        assert_eq!(back.last_heartbeat_ms(), 100_000);
        assert_eq!(f.client.calls.load(Ordering::SeqCst), 2);
        assert!(f.service.store().find_instance("i1").is_some());
    }

    #[tokio::test]
    async fn silent_instance_drops_out_of_discovery() {
        let mut f = fixture(&["i1"]);
        let discovery = Discovery::new(f.service.store().reader());
        let timeout = Duration::from_secs(5);

        f.service
            .register(&request("i1", "s1", InstanceStatus::Starting))
            .await
            .unwrap();
        f.clock.advance(2_000);
        f.service
            .register(&request("i1", "s1", InstanceStatus::Up))
            .await
            .unwrap();
        assert_eq!(
            discovery
                .find_service_instances("app", "orders", &VersionRule::ALL)
                .len(),
            1
        );

        // Exactly at the timeout the instance still counts as alive.
        f.clock.advance(5_000);
        assert!(f.service.delete_dead_instances(timeout).is_empty());

        f.clock.advance(1);
        let removed = f.service.delete_dead_instances(timeout);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].instance_id(), "i1");
        assert!(discovery
            .find_service_instances("app", "orders", &VersionRule::ALL)
            .is_empty());
    }

    #[tokio::test]
    async fn hung_peer_fetch_times_out() {
        let clock = Arc::new(ManualClock::new(0));
        let mut service = StoreService::new(Store::new(clock), Arc::new(HangingClient))
            .with_fetch_timeout(Duration::from_millis(50));

        let err = tokio::time::timeout(
            Duration::from_secs(2),
            service.register(&request("i1", "s1", InstanceStatus::Up)),
        )
        .await
        .expect("fetch must be bounded")
        .unwrap_err();
        assert!(
            matches!(&err, RegistryError::Discovery { message, .. } if message.contains("no answer within 50ms"))
        );
        assert!(service.store().find_instance("i1").is_none());
    }

    #[tokio::test]
    async fn register_self_needs_no_fetch() {
        let mut f = fixture(&[]);
        let mut me = info("me");
        let added = f.service.register_self(&me, "s1").unwrap();
        assert_eq!(added.status(), InstanceStatus::Up);
        assert_eq!(f.client.calls.load(Ordering::SeqCst), 0);

        me.instance.status = InstanceStatus::Down;
        let updated = f.service.register_self(&me, "s1").unwrap();
        assert_eq!(updated.status(), InstanceStatus::Down);
        assert_eq!(f.service.store().reader().load().instance_count(), 1);
    }
}
