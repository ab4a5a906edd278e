//! What an engine serves and what it calls.
//!
//! Producer providers contribute schemas (a contract plus the operations
//! behind it); consumer providers contribute references to remote
//! microservices. Both run once per startup. [`MicroserviceMeta`] holds the
//! result for the lifetime of one run.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::invocation::{OperationMeta, ProducerOperation, ReferenceConfig};

// ---------------------------------------------------------------------------
// Producer side
// ---------------------------------------------------------------------------

/// One served schema: its contract text and the operations implementing it.
#[derive(Clone)]
pub struct ProducerSchema {
    schema_id: String,
    contract: String,
    operations: BTreeMap<String, Arc<dyn ProducerOperation>>,
}

impl ProducerSchema {
    #[must_use]
    pub fn new(schema_id: impl Into<String>, contract: impl Into<String>) -> Self {
        Self {
            schema_id: schema_id.into(),
            contract: contract.into(),
            operations: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn operation(mut self, operation_id: impl Into<String>, operation: impl ProducerOperation) -> Self {
        self.operations.insert(operation_id.into(), Arc::new(operation));
        self
    }

    #[must_use]
    pub fn schema_id(&self) -> &str {
        &self.schema_id
    }

    #[must_use]
    pub fn contract(&self) -> &str {
        &self.contract
    }

    pub fn operations(&self) -> impl Iterator<Item = (&str, &Arc<dyn ProducerOperation>)> {
        self.operations.iter().map(|(id, op)| (id.as_str(), op))
    }
}

#[async_trait]
pub trait ProducerProvider: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn init(&self) -> anyhow::Result<Vec<ProducerSchema>>;
}

/// Serves a fixed set of schemas.
pub struct StaticProducerProvider {
    name: String,
    schemas: Vec<ProducerSchema>,
}

impl StaticProducerProvider {
    #[must_use]
    pub fn new(name: impl Into<String>, schemas: Vec<ProducerSchema>) -> Self {
        Self {
            name: name.into(),
            schemas,
        }
    }
}

#[async_trait]
impl ProducerProvider for StaticProducerProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn init(&self) -> anyhow::Result<Vec<ProducerSchema>> {
        Ok(self.schemas.clone())
    }
}

// ---------------------------------------------------------------------------
// Consumer side
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ConsumerProvider: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// References this provider's callers will use.
    async fn init(&self) -> anyhow::Result<Vec<ReferenceConfig>>;
}

/// Declares a fixed set of references.
pub struct StaticConsumerProvider {
    name: String,
    references: Vec<ReferenceConfig>,
}

impl StaticConsumerProvider {
    #[must_use]
    pub fn new(name: impl Into<String>, references: Vec<ReferenceConfig>) -> Self {
        Self {
            name: name.into(),
            references,
        }
    }
}

#[async_trait]
impl ConsumerProvider for StaticConsumerProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn init(&self) -> anyhow::Result<Vec<ReferenceConfig>> {
        Ok(self.references.clone())
    }
}

// ---------------------------------------------------------------------------
// Shared resources
// ---------------------------------------------------------------------------

/// Infrastructure released at the end of shutdown, after the drain.
#[async_trait]
pub trait SharedResource: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn close(&self) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// MicroserviceMeta
// ---------------------------------------------------------------------------

/// Operations served and references declared during the current run.
#[derive(Default)]
pub struct MicroserviceMeta {
    operations: DashMap<(String, String), Arc<OperationMeta>>,
    references: DashMap<String, ReferenceConfig>,
}

impl MicroserviceMeta {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_schema(&self, microservice_name: &str, schema: &ProducerSchema) {
        for (operation_id, operation) in schema.operations() {
            let meta = OperationMeta::producer(
                microservice_name,
                schema.schema_id(),
                operation_id,
                Arc::clone(operation),
            );
            self.operations.insert(
                (schema.schema_id().to_string(), operation_id.to_string()),
                Arc::new(meta),
            );
        }
    }

    #[must_use]
    pub fn operation(&self, schema_id: &str, operation_id: &str) -> Option<Arc<OperationMeta>> {
        self.operations
            .get(&(schema_id.to_string(), operation_id.to_string()))
            .map(|entry| Arc::clone(entry.value()))
    }

    #[must_use]
    pub fn operation_count(&self) -> usize {
        self.operations.len()
    }

    /// Later declarations for the same microservice replace earlier ones.
    pub fn add_reference(&self, reference: ReferenceConfig) {
        self.references
            .insert(reference.microservice_name.clone(), reference);
    }

    #[must_use]
    pub fn reference(&self, microservice_name: &str) -> Option<ReferenceConfig> {
        self.references
            .get(microservice_name)
            .map(|entry| entry.value().clone())
    }

    pub fn clear(&self) {
        self.operations.clear();
        self.references.clear();
    }
}
