//! In-process network.
//!
//! Engines sharing one [`LoopbackNetwork`] reach each other through
//! `loopback://host:port` endpoints without sockets. Registry traffic is
//! pushed through the msgpack codec and failed responses through their
//! wire form, so behaviour matches a real transport.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use meshrpc_core::{Address, MicroserviceInfo, MicroserviceInstance, RegistryMessage};
use tracing::debug;

use super::{InboundEndpoint, InboundRequest, Transport};
use crate::invocation::{Invocation, InvocationError, Responder, Response};
use crate::registry::{DiscoveryClient, RegistryPublisher};

pub const LOOPBACK_SCHEME: &str = "loopback";

/// Shared switchboard of every bound loopback endpoint.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    peers: Arc<DashMap<String, Arc<dyn InboundEndpoint>>>,
}

impl LoopbackNetwork {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport that will bind `loopback://host:port` on init.
    #[must_use]
    pub fn transport(&self, host: &str, port: u16) -> LoopbackTransport {
        LoopbackTransport {
            network: self.clone(),
            address: Address {
                scheme: LOOPBACK_SCHEME.to_string(),
                host: host.to_string(),
                port,
                query: std::collections::BTreeMap::new(),
            },
        }
    }

    /// A publisher that pushes registry messages to every peer except `own`.
    #[must_use]
    pub fn publisher(&self, own: &Address) -> LoopbackPublisher {
        LoopbackPublisher {
            network: self.clone(),
            own: own.socket_addr(),
        }
    }

    #[must_use]
    pub fn discovery_client(&self) -> LoopbackDiscoveryClient {
        LoopbackDiscoveryClient {
            network: self.clone(),
        }
    }

    #[must_use]
    pub fn bound(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.peers.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    fn bind(&self, address: &Address, inbound: Arc<dyn InboundEndpoint>) -> anyhow::Result<()> {
        let key = address.socket_addr();
        match self.peers.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(e) => {
                anyhow::bail!("loopback address {} already bound", e.key())
            }
            dashmap::mapref::entry::Entry::Vacant(e) => {
                e.insert(inbound);
                Ok(())
            }
        }
    }

    fn unbind(&self, address: &Address) {
        self.peers.remove(&address.socket_addr());
    }

    fn peer(&self, endpoint: &str) -> anyhow::Result<Arc<dyn InboundEndpoint>> {
        let address = Address::parse(endpoint)?;
        self.peers
            .get(&address.socket_addr())
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| anyhow::anyhow!("connection refused: {endpoint}"))
    }
}

// ---------------------------------------------------------------------------
// LoopbackTransport
// ---------------------------------------------------------------------------

pub struct LoopbackTransport {
    network: LoopbackNetwork,
    address: Address,
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn name(&self) -> &str {
        LOOPBACK_SCHEME
    }

    async fn init(&self, inbound: Arc<dyn InboundEndpoint>) -> anyhow::Result<()> {
        self.network.bind(&self.address, inbound)
    }

    fn endpoint(&self) -> Option<Address> {
        Some(self.address.clone())
    }

    async fn send(&self, invocation: &Invocation, responder: Responder) -> anyhow::Result<()> {
        let endpoint = invocation
            .endpoint()
            .ok_or_else(|| anyhow::anyhow!("invocation has no endpoint"))?
            .clone();
        let peer = self.network.peer(&endpoint.to_string())?;
        let request = InboundRequest {
            endpoint,
            schema_id: invocation.operation().schema_id().to_string(),
            operation_id: invocation.operation().operation_id().to_string(),
            arguments: invocation.arguments().to_vec(),
            trace_id: invocation.trace_id().map(str::to_string),
        };
        debug!(invocation_id = invocation.id(), endpoint = %request.endpoint, "loopback send");

        tokio::spawn(async move {
            let response = peer.handle_invocation(request).await;
            responder.respond(over_the_wire(response));
        });
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.network.unbind(&self.address);
        Ok(())
    }
}

/// Failed responses lose their in-process error type on a real wire; only
/// the status code and message survive.
fn over_the_wire(response: Response) -> Response {
    match response.error_body() {
        Some(body) => Response::fail(InvocationError::from_body(&body)),
        None => response,
    }
}

// ---------------------------------------------------------------------------
// Registry plumbing
// ---------------------------------------------------------------------------

/// Broadcasts registry messages to every other bound peer.
pub struct LoopbackPublisher {
    network: LoopbackNetwork,
    own: String,
}

#[async_trait]
impl RegistryPublisher for LoopbackPublisher {
    async fn publish(&self, message: &RegistryMessage) -> anyhow::Result<()> {
        let bytes = message.to_msgpack()?;
        let peers: Vec<(String, Arc<dyn InboundEndpoint>)> = self
            .network
            .peers
            .iter()
            .filter(|e| *e.key() != self.own)
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();

        let mut failed = Vec::new();
        for (key, peer) in peers {
            let decoded = RegistryMessage::from_msgpack(&bytes)?;
            if let Err(e) = peer.receive_registry_message(decoded).await {
                failed.push(format!("{key}: {e:#}"));
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("publish failed for {}", failed.join(", "))
        }
    }
}

/// Fetches metadata straight from the peer bound at an endpoint.
pub struct LoopbackDiscoveryClient {
    network: LoopbackNetwork,
}

#[async_trait]
impl DiscoveryClient for LoopbackDiscoveryClient {
    async fn get_info(&self, endpoint: &str, service_id: &str) -> anyhow::Result<MicroserviceInfo> {
        let info = self.network.peer(endpoint)?.microservice_info();
        if info.microservice.service_id != service_id {
            anyhow::bail!(
                "{endpoint} serves {}, not {service_id}",
                info.microservice.service_id
            );
        }
        Ok(info)
    }

    async fn get_instance(
        &self,
        endpoint: &str,
        service_id: &str,
        instance_id: &str,
    ) -> anyhow::Result<MicroserviceInstance> {
        let instance = self.get_info(endpoint, service_id).await?.instance;
        if instance.instance_id != instance_id {
            anyhow::bail!("{endpoint} is instance {}, not {instance_id}", instance.instance_id);
        }
        Ok(instance)
    }
}
