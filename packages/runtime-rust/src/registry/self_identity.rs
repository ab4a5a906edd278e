//! This process's own microservice and instance.
//!
//! Schemas, endpoints and properties are filled in during startup and
//! frozen once the instance goes UP; after that only the status changes.
//! Every accessor returns an owned snapshot.

use std::collections::BTreeMap;

use meshrpc_core::{
    schemas_summary, InstanceStatus, Microservice, MicroserviceInfo, MicroserviceInstance,
    RegisterRequest, UnregisterRequest,
};
use parking_lot::RwLock;

use super::RegistryError;

struct Identity {
    microservice: Microservice,
    instance: MicroserviceInstance,
    schemas_by_id: BTreeMap<String, String>,
    sealed: bool,
}

pub struct SelfIdentity {
    inner: RwLock<Identity>,
}

impl SelfIdentity {
    /// Creates a STARTING identity. A random instance id is assigned when
    /// none is given.
    #[must_use]
    pub fn new(microservice: Microservice, instance_id: Option<String>) -> Self {
        let instance = MicroserviceInstance {
            service_id: microservice.service_id.clone(),
            instance_id: instance_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            status: InstanceStatus::Starting,
            endpoints: Vec::new(),
            host_name: "localhost".to_string(),
            properties: BTreeMap::new(),
        };
        Self {
            inner: RwLock::new(Identity {
                microservice,
                instance,
                schemas_by_id: BTreeMap::new(),
                sealed: false,
            }),
        }
    }

    fn mutate<R>(
        &self,
        what: &str,
        f: impl FnOnce(&mut Identity) -> Result<R, RegistryError>,
    ) -> Result<R, RegistryError> {
        let mut identity = self.inner.write();
        if identity.sealed {
            return Err(RegistryError::SelfSealed(what.to_string()));
        }
        f(&mut identity)
    }

    /// # Errors
    ///
    /// `DuplicateSchema` if the id is taken, `SelfSealed` once UP.
    pub fn add_schema(&self, schema_id: &str, contract: &str) -> Result<(), RegistryError> {
        self.mutate(&format!("schema {schema_id}"), |identity| {
            if identity.schemas_by_id.contains_key(schema_id) {
                return Err(RegistryError::DuplicateSchema(schema_id.to_string()));
            }
            identity
                .schemas_by_id
                .insert(schema_id.to_string(), contract.to_string());
            identity.microservice.schemas.push(schema_id.to_string());
            Ok(())
        })
    }

    /// Adds a published endpoint; repeats are ignored.
    ///
    /// # Errors
    ///
    /// `SelfSealed` once UP.
    pub fn add_endpoint(&self, endpoint: &str) -> Result<(), RegistryError> {
        self.mutate(&format!("endpoint {endpoint}"), |identity| {
            let endpoints = &mut identity.instance.endpoints;
            if !endpoints.iter().any(|e| e == endpoint) {
                endpoints.push(endpoint.to_string());
            }
            Ok(())
        })
    }

    /// # Errors
    ///
    /// `SelfSealed` once UP.
    pub fn add_property(&self, key: &str, value: &str) -> Result<(), RegistryError> {
        self.mutate(&format!("property {key}"), |identity| {
            identity
                .instance
                .properties
                .insert(key.to_string(), value.to_string());
            Ok(())
        })
    }

    pub fn set_host_name(&self, host_name: &str) {
        self.inner.write().instance.host_name = host_name.to_string();
    }

    /// Changes the instance status. Reaching UP seals the identity.
    pub fn set_status(&self, status: InstanceStatus) {
        let mut identity = self.inner.write();
        identity.instance.status = status;
        if status == InstanceStatus::Up {
            identity.sealed = true;
        }
    }

    /// Back to STARTING with no schemas or endpoints, ready for another
    /// startup. Instance id and properties are kept.
    pub fn reset_for_restart(&self) {
        let mut identity = self.inner.write();
        identity.sealed = false;
        identity.instance.status = InstanceStatus::Starting;
        identity.instance.endpoints.clear();
        identity.schemas_by_id.clear();
        identity.microservice.schemas.clear();
    }

    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.inner.read().sealed
    }

    #[must_use]
    pub fn status(&self) -> InstanceStatus {
        self.inner.read().instance.status
    }

    #[must_use]
    pub fn instance_id(&self) -> String {
        self.inner.read().instance.instance_id.clone()
    }

    #[must_use]
    pub fn service_id(&self) -> String {
        self.inner.read().microservice.service_id.clone()
    }

    #[must_use]
    pub fn microservice(&self) -> Microservice {
        self.inner.read().microservice.clone()
    }

    #[must_use]
    pub fn instance(&self) -> MicroserviceInstance {
        self.inner.read().instance.clone()
    }

    #[must_use]
    pub fn endpoints(&self) -> Vec<String> {
        self.inner.read().instance.endpoints.clone()
    }

    #[must_use]
    pub fn schemas_by_id(&self) -> BTreeMap<String, String> {
        self.inner.read().schemas_by_id.clone()
    }

    #[must_use]
    pub fn schemas_summary(&self) -> String {
        schemas_summary(&self.inner.read().schemas_by_id)
    }

    /// What a peer fetches when it first hears of this instance.
    #[must_use]
    pub fn microservice_info(&self) -> MicroserviceInfo {
        let identity = self.inner.read();
        MicroserviceInfo {
            microservice: identity.microservice.clone(),
            schemas_by_id: identity.schemas_by_id.clone(),
            instance: identity.instance.clone(),
        }
    }

    #[must_use]
    pub fn register_request(&self) -> RegisterRequest {
        let identity = self.inner.read();
        RegisterRequest {
            app_id: identity.microservice.app_id.clone(),
            service_id: identity.microservice.service_id.clone(),
            instance_id: identity.instance.instance_id.clone(),
            cross_app_allowed: false,
            schemas_summary: schemas_summary(&identity.schemas_by_id),
            status: identity.instance.status,
            endpoints: identity.instance.endpoints.clone(),
        }
    }

    #[must_use]
    pub fn unregister_request(&self) -> UnregisterRequest {
        let identity = self.inner.read();
        UnregisterRequest {
            service_id: identity.microservice.service_id.clone(),
            instance_id: identity.instance.instance_id.clone(),
        }
    }
}

impl std::fmt::Debug for SelfIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let identity = self.inner.read();
        f.debug_struct("SelfIdentity")
            .field("service_id", &identity.microservice.service_id)
            .field("instance_id", &identity.instance.instance_id)
            .field("status", &identity.instance.status)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use meshrpc_core::Version;

    use super::*;

    fn identity() -> SelfIdentity {
        SelfIdentity::new(
            Microservice::new("app", "orders", Version::new(1, 0, 0)),
            Some("i-1".to_string()),
        )
    }

    #[test]
    fn generated_instance_ids_are_unique() {
        let ms = Microservice::new("app", "orders", Version::new(1, 0, 0));
        let a = SelfIdentity::new(ms.clone(), None);
        let b = SelfIdentity::new(ms, None);
        assert_ne!(a.instance_id(), b.instance_id());
        assert_eq!(a.status(), InstanceStatus::Starting);
    }

    #[test]
    fn duplicate_schema_is_rejected() {
        let me = identity();
        me.add_schema("OrderApi", "v1").unwrap();
        assert_eq!(
            me.add_schema("OrderApi", "v2").unwrap_err(),
            RegistryError::DuplicateSchema("OrderApi".to_string())
        );
        assert_eq!(me.microservice().schemas, vec!["OrderApi".to_string()]);
    }

    #[test]
    fn up_seals_the_identity() {
        let me = identity();
        me.add_schema("OrderApi", "v1").unwrap();
        me.add_endpoint("loopback://node:1").unwrap();
        me.set_status(InstanceStatus::Up);

        assert!(me.is_sealed());
        assert!(matches!(
            me.add_schema("Other", "x"),
            Err(RegistryError::SelfSealed(_))
        ));
        assert!(me.add_endpoint("loopback://node:2").is_err());
        assert!(me.add_property("zone", "a").is_err());

        // Status still moves.
        me.set_status(InstanceStatus::Down);
        assert_eq!(me.status(), InstanceStatus::Down);
        assert!(me.is_sealed());
    }

    #[test]
    fn register_request_reflects_identity() {
        let me = identity();
        me.add_schema("OrderApi", "v1").unwrap();
        me.add_endpoint("loopback://node:1").unwrap();
        me.add_endpoint("loopback://node:1").unwrap();

        let request = me.register_request();
        assert_eq!(request.instance_id, "i-1");
        assert_eq!(request.service_id, "app:orders:1.0.0");
        assert_eq!(request.endpoints, vec!["loopback://node:1".to_string()]);
        assert_eq!(request.schemas_summary, schemas_summary(&me.schemas_by_id()));
        assert_eq!(request.status, InstanceStatus::Starting);

        let info = me.microservice_info();
        assert_eq!(info.instance.instance_id, "i-1");
        assert_eq!(info.schemas_by_id["OrderApi"], "v1");
        assert_eq!(me.unregister_request().instance_id, "i-1");
    }

    #[test]
    fn reset_allows_a_fresh_startup() {
        let me = identity();
        me.add_property("zone", "a").unwrap();
        me.add_schema("OrderApi", "v1").unwrap();
        me.add_endpoint("loopback://node:1").unwrap();
        me.set_status(InstanceStatus::Up);

        me.reset_for_restart();
        assert!(!me.is_sealed());
        assert_eq!(me.status(), InstanceStatus::Starting);
        assert!(me.endpoints().is_empty());
        me.add_schema("OrderApi", "v1").unwrap();
        assert_eq!(me.instance_id(), "i-1");
        assert_eq!(me.instance().properties["zone"], "a");
    }
}
