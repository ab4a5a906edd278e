//! Transport contract and the manager that owns every transport.
//!
//! A transport owns one endpoint scheme. At startup it binds its local
//! endpoint and learns which [`InboundEndpoint`] to hand inbound traffic
//! to; the endpoint it publishes is what peers use to reach us.

pub mod loopback;

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use meshrpc_core::{Address, AddressError, MicroserviceInfo, RegistryMessage};
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{info, warn};

pub use loopback::{LoopbackNetwork, LoopbackTransport, LOOPBACK_SCHEME};

use crate::invocation::{Invocation, Responder, Response};

// ---------------------------------------------------------------------------
// Inbound side
// ---------------------------------------------------------------------------

/// A producer call as it arrives off the wire.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    /// Local endpoint the request arrived on.
    pub endpoint: Address,
    pub schema_id: String,
    pub operation_id: String,
    pub arguments: Vec<Value>,
    pub trace_id: Option<String>,
}

/// What a transport delivers inbound traffic to. Implemented by the engine.
#[async_trait]
pub trait InboundEndpoint: Send + Sync + 'static {
    /// Serves a producer invocation.
    async fn handle_invocation(&self, request: InboundRequest) -> Response;

    /// Applies a registry message pushed by a peer.
    async fn receive_registry_message(&self, message: RegistryMessage) -> anyhow::Result<()>;

    /// Identity and contracts of this process, served to peers that have
    /// not seen our microservice yet.
    fn microservice_info(&self) -> MicroserviceInfo;
}

// ---------------------------------------------------------------------------
// Transport trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Endpoint scheme this transport owns, e.g. `"rest"`.
    fn name(&self) -> &str;

    /// Binds the local endpoint and starts accepting inbound traffic.
    async fn init(&self, inbound: Arc<dyn InboundEndpoint>) -> anyhow::Result<()>;

    /// Parses an endpoint string of this transport's scheme.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint is malformed.
    fn parse_address(&self, endpoint: &str) -> Result<Address, AddressError> {
        Address::parse(endpoint)
    }

    /// Locally bound endpoint, if any.
    fn endpoint(&self) -> Option<Address>;

    /// Endpoint advertised to peers. Defaults to the bound endpoint.
    fn publish_endpoint(&self) -> Option<Address> {
        self.endpoint()
    }

    /// Sends the invocation to its resolved endpoint and arranges for the
    /// responder to be completed at most once. May return before the
    /// response arrives.
    async fn send(&self, invocation: &Invocation, responder: Responder) -> anyhow::Result<()>;

    /// Releases the local endpoint.
    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// TransportManager
// ---------------------------------------------------------------------------

/// Owns the transports of one engine, keyed by scheme.
///
/// Transports are initialized in registration order and closed in reverse.
pub struct TransportManager {
    by_name: DashMap<String, Arc<dyn Transport>>,
    order: RwLock<Vec<String>>,
}

impl TransportManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            by_name: DashMap::new(),
            order: RwLock::new(Vec::new()),
        }
    }

    /// Registers a transport. A later transport with the same scheme
    /// replaces the earlier one.
    pub fn register(&self, transport: Arc<dyn Transport>) {
        let name = transport.name().to_string();
        if self.by_name.insert(name.clone(), transport).is_some() {
            warn!(transport = %name, "transport replaced");
        } else {
            self.order.write().push(name);
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Transport>> {
        self.by_name.get(name).map(|entry| Arc::clone(entry.value()))
    }

    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.order.read().clone()
    }

    /// Initializes every transport in registration order and returns the
    /// endpoints they publish.
    ///
    /// # Errors
    ///
    /// Returns the first transport initialization error.
    pub async fn init_all(&self, inbound: &Arc<dyn InboundEndpoint>) -> anyhow::Result<Vec<Address>> {
        let mut published = Vec::new();
        for name in self.names() {
            let Some(transport) = self.get(&name) else {
                continue;
            };
            transport
                .init(Arc::clone(inbound))
                .await
                .map_err(|e| e.context(format!("transport {name} failed to start")))?;
            if let Some(endpoint) = transport.publish_endpoint() {
                info!(transport = %name, endpoint = %endpoint, "transport started");
                published.push(endpoint);
            }
        }
        Ok(published)
    }

    /// Closes every transport in reverse registration order. Failures are
    /// logged and do not stop the remaining transports from closing.
    pub async fn close_all(&self) {
        for name in self.names().iter().rev() {
            if let Some(transport) = self.get(name) {
                if let Err(e) = transport.close().await {
                    warn!(transport = %name, error = %e, "transport close failed");
                }
            }
        }
    }
}

impl Default for TransportManager {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use serde_json::json;

    use super::*;

    /// Answers every invocation with the endpoint it was sent to.
    pub(crate) struct EchoTransport {
        scheme: &'static str,
        pub(crate) closed: AtomicU32,
        log: Option<Arc<parking_lot::Mutex<Vec<String>>>>,
    }

    impl EchoTransport {
        pub(crate) fn new(scheme: &'static str) -> Self {
            Self {
                scheme,
                closed: AtomicU32::new(0),
                log: None,
            }
        }

        pub(crate) fn logged(scheme: &'static str, log: Arc<parking_lot::Mutex<Vec<String>>>) -> Self {
            Self {
                log: Some(log),
                ..Self::new(scheme)
            }
        }

        fn record(&self, event: &str) {
            if let Some(log) = &self.log {
                log.lock().push(format!("{event}:{}", self.scheme));
            }
        }
    }

    #[async_trait]
    impl Transport for EchoTransport {
        fn name(&self) -> &str {
            self.scheme
        }

        async fn init(&self, _inbound: Arc<dyn InboundEndpoint>) -> anyhow::Result<()> {
            self.record("init");
            Ok(())
        }

        fn endpoint(&self) -> Option<Address> {
            Address::parse(&format!("{}://127.0.0.1:9000", self.scheme)).ok()
        }

        async fn send(&self, invocation: &Invocation, responder: Responder) -> anyhow::Result<()> {
            let endpoint = invocation
                .endpoint()
                .map(ToString::to_string)
                .unwrap_or_default();
            responder.respond(Response::ok(json!({
                "endpoint": endpoint,
                "args": invocation.arguments(),
            })));
            Ok(())
        }

        async fn close(&self) -> anyhow::Result<()> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            self.record("close");
            Ok(())
        }
    }

    struct NullInbound;

    #[async_trait]
    impl InboundEndpoint for NullInbound {
        async fn handle_invocation(&self, _request: InboundRequest) -> Response {
            Response::ok(json!(null))
        }

        async fn receive_registry_message(&self, _message: RegistryMessage) -> anyhow::Result<()> {
            Ok(())
        }

        fn microservice_info(&self) -> MicroserviceInfo {
            unimplemented!("not used by these tests")
        }
    }

    #[tokio::test]
    async fn init_in_order_close_in_reverse() {
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let manager = TransportManager::new();
        manager.register(Arc::new(EchoTransport::logged("rest", log.clone())));
        manager.register(Arc::new(EchoTransport::logged("highway", log.clone())));

        let inbound: Arc<dyn InboundEndpoint> = Arc::new(NullInbound);
        let published = manager.init_all(&inbound).await.unwrap();
        assert_eq!(published.len(), 2);
        assert_eq!(published[0].scheme, "rest");

        manager.close_all().await;
        assert_eq!(
            *log.lock(),
            vec!["init:rest", "init:highway", "close:highway", "close:rest"]
        );
    }

    #[test]
    fn same_scheme_replaces() {
        let manager = TransportManager::new();
        manager.register(Arc::new(EchoTransport::new("rest")));
        manager.register(Arc::new(EchoTransport::new("rest")));
        assert_eq!(manager.names(), vec!["rest".to_string()]);
        assert!(manager.get("rest").is_some());
        assert!(manager.get("highway").is_none());
    }
}
