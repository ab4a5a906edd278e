//! In-memory registry store.
//!
//! The directory of known microservices and instances is copy-on-write:
//! each mutation builds a new [`Directory`] and publishes it with a single
//! atomic swap, so readers holding a [`StoreReader`] always see a complete
//! snapshot without taking a lock. Mutations go through `&mut Store`,
//! which only the registry executor holds.
//!
//! Heartbeat timestamps are the one exception: they live in an atomic on
//! the shared [`InstanceStore`] and are bumped in place.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use meshrpc_core::{ClockSource, InstanceStatus, Microservice, MicroserviceInstance};

// ---------------------------------------------------------------------------
// InstanceStore
// ---------------------------------------------------------------------------

/// A registered instance plus its liveness bookkeeping.
#[derive(Debug)]
pub struct InstanceStore {
    instance: MicroserviceInstance,
    registered_at_ms: u64,
    last_heartbeat_ms: AtomicU64,
}

impl InstanceStore {
    fn new(instance: MicroserviceInstance, now: u64) -> Self {
        Self {
            instance,
            registered_at_ms: now,
            last_heartbeat_ms: AtomicU64::new(now),
        }
    }

    fn with_status(&self, status: InstanceStatus) -> Self {
        let mut instance = self.instance.clone();
        instance.status = status;
        Self {
            instance,
            registered_at_ms: self.registered_at_ms,
            last_heartbeat_ms: AtomicU64::new(self.last_heartbeat_ms()),
        }
    }

    #[must_use]
    pub fn instance(&self) -> &MicroserviceInstance {
        &self.instance
    }

    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance.instance_id
    }

    #[must_use]
    pub fn service_id(&self) -> &str {
        &self.instance.service_id
    }

    #[must_use]
    pub fn status(&self) -> InstanceStatus {
        self.instance.status
    }

    #[must_use]
    pub fn registered_at_ms(&self) -> u64 {
        self.registered_at_ms
    }

    #[must_use]
    pub fn last_heartbeat_ms(&self) -> u64 {
        self.last_heartbeat_ms.load(Ordering::Acquire)
    }

    fn touch(&self, now: u64) {
        self.last_heartbeat_ms.fetch_max(now, Ordering::AcqRel);
    }

    /// `true` once the last heartbeat is older than `timeout`.
    #[must_use]
    pub fn is_dead(&self, now: u64, timeout: Duration) -> bool {
        #[allow(clippy::cast_possible_truncation)]
        let timeout_ms = timeout.as_millis() as u64;
        now.saturating_sub(self.last_heartbeat_ms()) > timeout_ms
    }
}

// ---------------------------------------------------------------------------
// MicroserviceStore
// ---------------------------------------------------------------------------

/// A known microservice, its contracts, and its live instances.
///
/// Kept after its last instance is removed so a later registration can be
/// checked against the previously seen schema summary.
#[derive(Debug, Clone)]
pub struct MicroserviceStore {
    microservice: Microservice,
    schemas_by_id: BTreeMap<String, String>,
    schemas_summary: String,
    instances: BTreeMap<String, Arc<InstanceStore>>,
}

impl MicroserviceStore {
    #[must_use]
    pub fn microservice(&self) -> &Microservice {
        &self.microservice
    }

    #[must_use]
    pub fn schemas_by_id(&self) -> &BTreeMap<String, String> {
        &self.schemas_by_id
    }

    #[must_use]
    pub fn schemas_summary(&self) -> &str {
        &self.schemas_summary
    }

    #[must_use]
    pub fn is_schema_changed(&self, schemas_summary: &str) -> bool {
        self.schemas_summary != schemas_summary
    }

    pub fn instances(&self) -> impl Iterator<Item = &Arc<InstanceStore>> {
        self.instances.values()
    }

    #[must_use]
    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    #[must_use]
    pub fn has_instances(&self) -> bool {
        !self.instances.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Directory
// ---------------------------------------------------------------------------

/// One immutable snapshot of the registry.
#[derive(Debug, Clone, Default)]
pub struct Directory {
    microservices: HashMap<String, Arc<MicroserviceStore>>,
    instances: HashMap<String, Arc<InstanceStore>>,
}

impl Directory {
    #[must_use]
    pub fn microservice(&self, service_id: &str) -> Option<&Arc<MicroserviceStore>> {
        self.microservices.get(service_id)
    }

    #[must_use]
    pub fn instance(&self, instance_id: &str) -> Option<&Arc<InstanceStore>> {
        self.instances.get(instance_id)
    }

    pub fn microservices(&self) -> impl Iterator<Item = &Arc<MicroserviceStore>> {
        self.microservices.values()
    }

    #[must_use]
    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    fn update_microservice(&mut self, service_id: &str, f: impl FnOnce(&mut MicroserviceStore)) -> bool {
        let Some(current) = self.microservices.get(service_id) else {
            return false;
        };
        let mut next = MicroserviceStore::clone(current);
        f(&mut next);
        self.microservices
            .insert(service_id.to_string(), Arc::new(next));
        true
    }
}

// ---------------------------------------------------------------------------
// Store / StoreReader
// ---------------------------------------------------------------------------

/// Lock-free read handle onto the current registry snapshot.
#[derive(Clone)]
pub struct StoreReader {
    snapshot: Arc<ArcSwap<Directory>>,
}

impl StoreReader {
    #[must_use]
    pub fn load(&self) -> Arc<Directory> {
        self.snapshot.load_full()
    }
}

/// Owner of the registry snapshot. Not `Clone`: exactly one writer.
pub struct Store {
    snapshot: Arc<ArcSwap<Directory>>,
    clock: Arc<dyn ClockSource>,
}

impl Store {
    #[must_use]
    pub fn new(clock: Arc<dyn ClockSource>) -> Self {
        Self {
            snapshot: Arc::new(ArcSwap::from_pointee(Directory::default())),
            clock,
        }
    }

    #[must_use]
    pub fn reader(&self) -> StoreReader {
        StoreReader {
            snapshot: Arc::clone(&self.snapshot),
        }
    }

    #[must_use]
    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    #[must_use]
    pub fn find_microservice(&self, service_id: &str) -> Option<Arc<MicroserviceStore>> {
        self.snapshot.load().microservice(service_id).cloned()
    }

    #[must_use]
    pub fn find_instance(&self, instance_id: &str) -> Option<Arc<InstanceStore>> {
        self.snapshot.load().instance(instance_id).cloned()
    }

    fn update<R>(&mut self, f: impl FnOnce(&mut Directory) -> R) -> R {
        let mut next = Directory::clone(&self.snapshot.load());
        let result = f(&mut next);
        self.snapshot.store(Arc::new(next));
        result
    }

    /// Adds (or replaces the metadata of) a microservice, keeping any
    /// instances it already has.
    pub fn add_microservice(
        &mut self,
        microservice: Microservice,
        schemas_by_id: BTreeMap<String, String>,
        schemas_summary: &str,
    ) -> Arc<MicroserviceStore> {
        self.update(|dir| {
            let instances = dir
                .microservices
                .get(&microservice.service_id)
                .map(|ms| ms.instances.clone())
                .unwrap_or_default();
            let store = Arc::new(MicroserviceStore {
                microservice,
                schemas_by_id,
                schemas_summary: schemas_summary.to_string(),
                instances,
            });
            dir.microservices
                .insert(store.microservice.service_id.clone(), Arc::clone(&store));
            store
        })
    }

    /// Replaces the schema summary of a known microservice.
    pub fn set_schemas_summary(&mut self, service_id: &str, schemas_summary: &str) -> bool {
        self.update(|dir| {
            dir.update_microservice(service_id, |ms| {
                ms.schemas_summary = schemas_summary.to_string();
            })
        })
    }

    /// Adds or replaces an instance of a known microservice. Returns `None`
    /// if the microservice is unknown.
    pub fn add_instance(&mut self, instance: MicroserviceInstance) -> Option<Arc<InstanceStore>> {
        let now = self.clock.now();
        self.update(|dir| {
            let store = Arc::new(InstanceStore::new(instance, now));
            let known = dir.update_microservice(store.service_id(), |ms| {
                ms.instances
                    .insert(store.instance_id().to_string(), Arc::clone(&store));
            });
            if !known {
                return None;
            }
            dir.instances
                .insert(store.instance_id().to_string(), Arc::clone(&store));
            Some(store)
        })
    }

    /// Changes an instance's status, keeping its heartbeat.
    pub fn update_instance_status(
        &mut self,
        instance_id: &str,
        status: InstanceStatus,
    ) -> Option<Arc<InstanceStore>> {
        self.update(|dir| {
            let current = dir.instances.get(instance_id)?;
            let next = Arc::new(current.with_status(status));
            dir.update_microservice(next.service_id(), |ms| {
                ms.instances
                    .insert(instance_id.to_string(), Arc::clone(&next));
            });
            dir.instances.insert(instance_id.to_string(), Arc::clone(&next));
            Some(next)
        })
    }

    /// Records a heartbeat. Returns `false` for an unknown instance.
    pub fn heartbeat(&mut self, instance_id: &str) -> bool {
        let now = self.clock.now();
        match self.find_instance(instance_id) {
            Some(instance) => {
                instance.touch(now);
                true
            }
            None => false,
        }
    }

    /// Removes an instance. The microservice record is kept.
    pub fn delete_instance(&mut self, service_id: &str, instance_id: &str) -> Option<Arc<InstanceStore>> {
        self.update(|dir| {
            let removed = dir.instances.remove(instance_id)?;
            let owner = if removed.service_id() == service_id {
                service_id
            } else {
                removed.service_id()
            };
            dir.update_microservice(owner, |ms| {
                ms.instances.remove(instance_id);
            });
            Some(removed)
        })
    }

    #[must_use]
    pub fn find_dead_instances(&self, timeout: Duration) -> Vec<Arc<InstanceStore>> {
        let now = self.clock.now();
        self.snapshot
            .load()
            .instances
            .values()
            .filter(|i| i.is_dead(now, timeout))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use meshrpc_core::{ManualClock, Version};

    use super::*;

    fn microservice() -> Microservice {
        Microservice::new("app", "orders", Version::new(1, 0, 0))
    }

    fn instance(id: &str) -> MicroserviceInstance {
        MicroserviceInstance {
            service_id: microservice().service_id,
            instance_id: id.to_string(),
            status: InstanceStatus::Up,
            endpoints: vec!["rest://10.0.0.1:8080".to_string()],
            host_name: String::new(),
            properties: BTreeMap::new(),
        }
    }

    fn store() -> (Store, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000));
        (Store::new(clock.clone()), clock)
    }

    #[test]
    fn add_instance_requires_microservice() {
        let (mut store, _) = store();
        assert!(store.add_instance(instance("i1")).is_none());

        store.add_microservice(microservice(), BTreeMap::new(), "s1");
        let added = store.add_instance(instance("i1")).unwrap();
        assert_eq!(added.registered_at_ms(), 1_000);
        assert_eq!(
            store
                .find_microservice(&microservice().service_id)
                .unwrap()
                .instance_count(),
            1
        );
    }

    #[test]
    fn readers_keep_their_snapshot() {
        let (mut store, _) = store();
        let reader = store.reader();
        store.add_microservice(microservice(), BTreeMap::new(), "s1");

        let before = reader.load();
        store.add_instance(instance("i1"));
        let after = reader.load();

        assert_eq!(before.instance_count(), 0);
        assert_eq!(after.instance_count(), 1);
    }

    #[test]
    fn status_update_keeps_heartbeat() {
        let (mut store, clock) = store();
        store.add_microservice(microservice(), BTreeMap::new(), "s1");
        store.add_instance(instance("i1"));
        clock.advance(500);
        assert!(store.heartbeat("i1"));

        let updated = store
            .update_instance_status("i1", InstanceStatus::Down)
            .unwrap();
        assert_eq!(updated.status(), InstanceStatus::Down);
        assert_eq!(updated.last_heartbeat_ms(), 1_500);
        assert_eq!(
            store.find_instance("i1").unwrap().status(),
            InstanceStatus::Down
        );
    }

    #[test]
    fn delete_keeps_microservice_shell() {
        let (mut store, _) = store();
        store.add_microservice(microservice(), BTreeMap::new(), "s1");
        store.add_instance(instance("i1"));

        let removed = store
            .delete_instance(&microservice().service_id, "i1")
            .unwrap();
        assert_eq!(removed.instance_id(), "i1");
        assert!(store.find_instance("i1").is_none());

        let ms = store.find_microservice(&microservice().service_id).unwrap();
        assert!(!ms.has_instances());
        assert_eq!(ms.schemas_summary(), "s1");
        assert!(store.delete_instance(&microservice().service_id, "i1").is_none());
    }

    #[test]
    fn dead_instances_are_found_by_heartbeat_age() {
        let (mut store, clock) = store();
        store.add_microservice(microservice(), BTreeMap::new(), "s1");
        store.add_instance(instance("old"));
        clock.advance(60_000);
        store.add_instance(instance("fresh"));
        clock.advance(40_000);

        let dead: Vec<String> = store
            .find_dead_instances(Duration::from_secs(90))
            .iter()
            .map(|i| i.instance_id().to_string())
            .collect();
        assert_eq!(dead, vec!["old".to_string()]);
    }

    #[test]
    fn re_adding_microservice_keeps_instances() {
        let (mut store, _) = store();
        store.add_microservice(microservice(), BTreeMap::new(), "s1");
        store.add_instance(instance("i1"));
        let ms = store.add_microservice(microservice(), BTreeMap::new(), "s2");
        assert_eq!(ms.instance_count(), 1);
        assert_eq!(ms.schemas_summary(), "s2");
    }
}
