use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::response::InvocationError;
use super::Invocation;

// ---------------------------------------------------------------------------
// ProducerOperation
// ---------------------------------------------------------------------------

/// Business logic behind one producer operation.
#[async_trait]
pub trait ProducerOperation: Send + Sync + 'static {
    async fn invoke(&self, invocation: &Invocation) -> Result<Value, InvocationError>;
}

/// Adapts an async closure over the call arguments into a [`ProducerOperation`].
pub struct FnOperation<F>(pub F);

#[async_trait]
impl<F, Fut> ProducerOperation for FnOperation<F>
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, InvocationError>> + Send + 'static,
{
    async fn invoke(&self, invocation: &Invocation) -> Result<Value, InvocationError> {
        (self.0)(invocation.arguments().to_vec()).await
    }
}

// ---------------------------------------------------------------------------
// OperationMeta
// ---------------------------------------------------------------------------

/// Static description of an operation: where it lives and, on the producer
/// side, the code that runs it.
#[derive(Clone)]
pub struct OperationMeta {
    microservice_name: String,
    schema_id: String,
    operation_id: String,
    producer: Option<Arc<dyn ProducerOperation>>,
}

impl OperationMeta {
    /// Metadata for an operation called on a remote microservice.
    #[must_use]
    pub fn consumer(
        microservice_name: impl Into<String>,
        schema_id: impl Into<String>,
        operation_id: impl Into<String>,
    ) -> Self {
        Self {
            microservice_name: microservice_name.into(),
            schema_id: schema_id.into(),
            operation_id: operation_id.into(),
            producer: None,
        }
    }

    /// Metadata for an operation this process serves.
    #[must_use]
    pub fn producer(
        microservice_name: impl Into<String>,
        schema_id: impl Into<String>,
        operation_id: impl Into<String>,
        operation: Arc<dyn ProducerOperation>,
    ) -> Self {
        Self {
            producer: Some(operation),
            ..Self::consumer(microservice_name, schema_id, operation_id)
        }
    }

    #[must_use]
    pub fn microservice_name(&self) -> &str {
        &self.microservice_name
    }

    #[must_use]
    pub fn schema_id(&self) -> &str {
        &self.schema_id
    }

    #[must_use]
    pub fn operation_id(&self) -> &str {
        &self.operation_id
    }

    /// `microservice.schema.operation`, used in logs and error messages.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!(
            "{}.{}.{}",
            self.microservice_name, self.schema_id, self.operation_id
        )
    }

    #[must_use]
    pub fn producer_operation(&self) -> Option<&Arc<dyn ProducerOperation>> {
        self.producer.as_ref()
    }
}

impl fmt::Debug for OperationMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationMeta")
            .field("qualified_name", &self.qualified_name())
            .field("has_producer", &self.producer.is_some())
            .finish()
    }
}
