//! Handlers every engine installs unless configured otherwise.
//!
//! Consumer chains end in `load-balance` then `transport`; producer chains
//! consist of `producer-operation`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use meshrpc_core::{Address, InstanceStatus};
use tracing::debug;

use super::Handler;
use crate::invocation::{Invocation, InvocationError, Responder, Response};
use crate::registry::Discovery;
use crate::transport::TransportManager;

// ---------------------------------------------------------------------------
// LoadBalanceHandler
// ---------------------------------------------------------------------------

/// Picks a target endpoint for consumer invocations, round-robin over the
/// UP instances that expose an endpoint some local transport can reach.
pub struct LoadBalanceHandler {
    discovery: Discovery,
    transports: Arc<TransportManager>,
    counter: AtomicUsize,
}

impl LoadBalanceHandler {
    #[must_use]
    pub fn new(discovery: Discovery, transports: Arc<TransportManager>) -> Self {
        Self {
            discovery,
            transports,
            counter: AtomicUsize::new(0),
        }
    }

    fn candidates(&self, invocation: &Invocation) -> Vec<Address> {
        let Some(reference) = invocation.reference() else {
            return Vec::new();
        };
        self.discovery
            .find_service_instances(
                &reference.app_id,
                &reference.microservice_name,
                &reference.version_rule,
            )
            .into_iter()
            .filter(|instance| instance.status == InstanceStatus::Up)
            .filter_map(|instance| {
                instance.endpoints.iter().find_map(|raw| {
                    let address = Address::parse(raw).ok()?;
                    let wanted = reference
                        .transport
                        .as_deref()
                        .map_or(true, |t| t == address.scheme);
                    (wanted && self.transports.get(&address.scheme).is_some()).then_some(address)
                })
            })
            .collect()
    }
}

#[async_trait]
impl Handler for LoadBalanceHandler {
    fn name(&self) -> &'static str {
        "load-balance"
    }

    async fn handle(&self, invocation: &mut Invocation, responder: &Responder) -> anyhow::Result<()> {
        if invocation.endpoint().is_none() {
            let candidates = self.candidates(invocation);
            if candidates.is_empty() {
                let target = invocation
                    .reference()
                    .map_or_else(|| "<no reference>".to_string(), |r| {
                        format!("{}/{}@{}", r.app_id, r.microservice_name, r.version_rule)
                    });
                responder.respond(Response::fail(InvocationError::ServiceUnavailable(format!(
                    "no available instance of {target}"
                ))));
                return Ok(());
            }
            let index = self.counter.fetch_add(1, Ordering::Relaxed) % candidates.len();
            let chosen = candidates[index].clone();
            debug!(invocation_id = invocation.id(), endpoint = %chosen, "endpoint selected");
            invocation.set_endpoint(chosen);
        }
        invocation.next(responder).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// TransportHandler
// ---------------------------------------------------------------------------

/// Terminal consumer handler: hands the invocation to the transport that
/// owns the selected endpoint's scheme.
pub struct TransportHandler {
    transports: Arc<TransportManager>,
}

impl TransportHandler {
    #[must_use]
    pub fn new(transports: Arc<TransportManager>) -> Self {
        Self { transports }
    }
}

#[async_trait]
impl Handler for TransportHandler {
    fn name(&self) -> &'static str {
        "transport"
    }

    async fn handle(&self, invocation: &mut Invocation, responder: &Responder) -> anyhow::Result<()> {
        let Some(scheme) = invocation.transport_name().map(str::to_string) else {
            return Err(InvocationError::BadRequest(
                "endpoint is empty; is load balancing configured in the consumer chain?".to_string(),
            )
            .into());
        };
        let Some(transport) = self.transports.get(&scheme) else {
            return Err(InvocationError::BadRequest(format!("no transport for scheme {scheme}")).into());
        };

        invocation.on_start_execution();
        transport
            .send(invocation, responder.clone())
            .await
            .map_err(|e| InvocationError::Transport(format!("{e:#}")))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ProducerOperationHandler
// ---------------------------------------------------------------------------

/// Terminal producer handler: runs the business operation.
pub struct ProducerOperationHandler;

#[async_trait]
impl Handler for ProducerOperationHandler {
    fn name(&self) -> &'static str {
        "producer-operation"
    }

    async fn handle(&self, invocation: &mut Invocation, responder: &Responder) -> anyhow::Result<()> {
        let Some(operation) = invocation.operation().producer_operation().cloned() else {
            responder.respond(Response::fail(InvocationError::NotFound(
                invocation.operation().qualified_name(),
            )));
            return Ok(());
        };

        invocation.on_business_start();
        let result = operation.invoke(invocation).await;
        invocation.on_business_finish();

        responder.respond(Response::from_result(result));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use meshrpc_core::{ManualClock, Microservice, MicroserviceInfo, MicroserviceInstance, Version};
    use serde_json::{json, Value};

    use super::*;
    use crate::handler::{run_chain, HandlerChain};
    use crate::invocation::{FnOperation, InvocationKind, OperationMeta, ReferenceConfig};
    use crate::registry::{NoopDiscoveryClient, Store, StoreService};
    use crate::transport::tests::EchoTransport;

    fn seeded_discovery(instances: &[(&str, InstanceStatus, &str)]) -> Discovery {
        let clock = Arc::new(ManualClock::new(0));
        let store = Store::new(clock);
        let discovery = Discovery::new(store.reader());
        let mut service = StoreService::new(store, Arc::new(NoopDiscoveryClient));

        let microservice = Microservice::new("app", "orders", Version::new(1, 0, 0));
        for (id, status, endpoint) in instances {
            let instance = MicroserviceInstance {
                service_id: microservice.service_id.clone(),
                instance_id: (*id).to_string(),
                status: *status,
                endpoints: vec![(*endpoint).to_string()],
                host_name: String::new(),
                properties: BTreeMap::new(),
            };
            let info = MicroserviceInfo {
                microservice: microservice.clone(),
                schemas_by_id: BTreeMap::new(),
                instance,
            };
            service.register_self(&info, "summary");
        }
        discovery
    }

    fn consumer_invocation(chain: HandlerChain) -> Invocation {
        Invocation::new(
            InvocationKind::Consumer,
            Arc::new(OperationMeta::consumer("orders", "OrderApi", "get")),
            Arc::new(chain),
            vec![json!("hello")],
        )
        .with_reference(ReferenceConfig::new("app", "orders"))
    }

    fn transports() -> Arc<TransportManager> {
        let manager = TransportManager::new();
        manager.register(Arc::new(EchoTransport::new("echo")));
        Arc::new(manager)
    }

    #[tokio::test]
    async fn round_robins_over_up_instances() {
        let discovery = seeded_discovery(&[
            ("i1", InstanceStatus::Up, "echo://10.0.0.1:1"),
            ("i2", InstanceStatus::Up, "echo://10.0.0.2:1"),
            ("i3", InstanceStatus::Down, "echo://10.0.0.3:1"),
        ]);
        let transports = transports();
        let chain = HandlerChain::builder()
            .handler(LoadBalanceHandler::new(discovery, transports.clone()))
            .handler(TransportHandler::new(transports))
            .build()
            .unwrap();

        let mut hosts = Vec::new();
        for _ in 0..4 {
            let resp = run_chain(consumer_invocation(chain.clone())).await;
            let value = resp.into_result().unwrap();
            hosts.push(value["endpoint"].as_str().unwrap().to_string());
        }
        assert_ne!(hosts[0], hosts[1]);
        assert_eq!(hosts[0], hosts[2]);
        assert!(hosts.iter().all(|h| !h.contains("10.0.0.3")));
    }

    #[tokio::test]
    async fn no_instance_short_circuits_with_unavailable() {
        let discovery = seeded_discovery(&[("i1", InstanceStatus::Up, "rest://10.0.0.1:1")]);
        let transports = transports();
        let chain = HandlerChain::builder()
            .handler(LoadBalanceHandler::new(discovery, transports.clone()))
            .handler(TransportHandler::new(transports))
            .build()
            .unwrap();

        // The only instance speaks a scheme no local transport handles.
        let resp = run_chain(consumer_invocation(chain)).await;
        assert_eq!(resp.status(), 503);
    }

    #[tokio::test]
    async fn transport_without_endpoint_is_bad_request() {
        let chain = HandlerChain::builder()
            .handler(TransportHandler::new(transports()))
            .build()
            .unwrap();
        let resp = run_chain(consumer_invocation(chain)).await;
        assert_eq!(resp.status(), 400);
    }

    #[tokio::test]
    async fn producer_runs_operation() {
        let op = Arc::new(FnOperation(|args: Vec<Value>| async move {
            Ok::<_, InvocationError>(json!({ "echo": args }))
        }));
        let chain = HandlerChain::builder()
            .handler(ProducerOperationHandler)
            .build()
            .unwrap();
        let inv = Invocation::new(
            InvocationKind::Producer,
            Arc::new(OperationMeta::producer("orders", "OrderApi", "echo", op)),
            Arc::new(chain),
            vec![json!(1), json!(2)],
        );

        let resp = run_chain(inv).await;
        assert_eq!(resp.into_result().unwrap(), json!({ "echo": [1, 2] }));
    }

    #[tokio::test]
    async fn producer_business_error_is_delivered() {
        let op = Arc::new(FnOperation(|_args: Vec<Value>| async move {
            Err::<Value, _>(InvocationError::Producer {
                status: 409,
                message: "already exists".to_string(),
            })
        }));
        let chain = HandlerChain::builder()
            .handler(ProducerOperationHandler)
            .build()
            .unwrap();
        let inv = Invocation::new(
            InvocationKind::Producer,
            Arc::new(OperationMeta::producer("orders", "OrderApi", "create", op)),
            Arc::new(chain),
            Vec::new(),
        );
        assert_eq!(run_chain(inv).await.status(), 409);
    }

    #[tokio::test]
    async fn unknown_operation_is_not_found() {
        let chain = HandlerChain::builder()
            .handler(ProducerOperationHandler)
            .build()
            .unwrap();
        let inv = Invocation::new(
            InvocationKind::Producer,
            Arc::new(OperationMeta::consumer("orders", "OrderApi", "missing")),
            Arc::new(chain),
            Vec::new(),
        );
        let resp = run_chain(inv).await;
        assert_eq!(resp.status(), 404);
    }
}
