//! The engine: one per process, passed around as a cheap handle.
//!
//! It owns the handler chains, the transports, the local registry and the
//! lifecycle state machine:
//!
//! ```text
//! DOWN --run--> STARTING --ok--> UP --destroy--> STOPPING --> DOWN
//!                   \--error--> (teardown) --> FAILED
//! ```
//!
//! `run()` and `destroy()` serialize on one async mutex. Startup steps run
//! in a fixed order and the first failure aborts the rest; shutdown steps
//! each swallow their own failure so the later ones still run.

pub mod lifecycle;
pub mod provider;
pub mod state;
pub mod tracker;

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use arc_swap::{ArcSwap, ArcSwapOption};
use async_trait::async_trait;
use meshrpc_core::{ClockSource, InstanceStatus, Microservice, MicroserviceInfo, RegistryMessage, SystemClock};
use serde_json::Value;
use tokio::sync::{broadcast, watch, Mutex};
use tower::ServiceExt;
use tracing::{debug, error, info, warn};

pub use lifecycle::{LifecycleEvent, LifecycleListener, ListenerRegistry};
pub use provider::{
    ConsumerProvider, MicroserviceMeta, ProducerProvider, ProducerSchema, SharedResource,
    StaticConsumerProvider, StaticProducerProvider,
};
pub use state::EngineState;
pub use tracker::{InvocationGuard, InvocationTracker};

use crate::config::EngineConfig;
use crate::dispatch::{build_invocation_pipeline, AdmissionLayer, InvocationDispatcher};
use crate::handler::builtin::{LoadBalanceHandler, ProducerOperationHandler, TransportHandler};
use crate::handler::chains::{ChainConfig, ChainScope, ChainSet};
use crate::handler::Handler;
use crate::invocation::{
    Invocation, InvocationError, InvocationKind, OperationMeta, ReferenceConfig, Response,
};
use crate::registry::{
    Discovery, DiscoveryClient, MessageExecutor, NoopDiscoveryClient, NoopPublisher,
    RegistrationManager, RegistryEvent, RegistryPublisher, SelfIdentity, Store, StoreService,
};
use crate::transport::{InboundEndpoint, InboundRequest, Transport, TransportManager};

// ---------------------------------------------------------------------------
// EngineError
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("engine startup failed during {step}: {source:#}")]
    Startup {
        step: &'static str,
        #[source]
        source: anyhow::Error,
    },
    #[error("engine is {0} and will not become UP")]
    NotStarting(EngineState),
    #[error("engine not UP after {timeout_ms} ms (state {state})")]
    WaitTimeout { timeout_ms: u64, state: EngineState },
}

fn startup<E: Into<anyhow::Error>>(step: &'static str) -> impl FnOnce(E) -> EngineError {
    move |e| EngineError::Startup {
        step,
        source: e.into(),
    }
}

fn unavailable(state: EngineState) -> InvocationError {
    InvocationError::ServiceUnavailable(format!(
        "The request is rejected. Cannot process the request due to STATUS = {state}"
    ))
}

// ---------------------------------------------------------------------------
// EngineBuilder
// ---------------------------------------------------------------------------

pub struct EngineBuilder {
    config: EngineConfig,
    microservice: Microservice,
    instance_id: Option<String>,
    properties: Vec<(String, String)>,
    transports: Vec<Arc<dyn Transport>>,
    chains: ChainConfig,
    producer_providers: Vec<Arc<dyn ProducerProvider>>,
    consumer_providers: Vec<Arc<dyn ConsumerProvider>>,
    listeners: Vec<Arc<dyn LifecycleListener>>,
    resources: Vec<Arc<dyn SharedResource>>,
    discovery_client: Option<Arc<dyn DiscoveryClient>>,
    publisher: Option<Arc<dyn RegistryPublisher>>,
    clock: Option<Arc<dyn ClockSource>>,
}

impl EngineBuilder {
    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Fixes the instance id; a random one is generated otherwise.
    #[must_use]
    pub fn instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    #[must_use]
    pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn transport(mut self, transport: impl Transport) -> Self {
        self.transports.push(Arc::new(transport));
        self
    }

    /// Replaces the chain for `kind` in `scope`. Without a declaration,
    /// consumers use `load-balance, transport` and producers use
    /// `producer-operation`.
    #[must_use]
    pub fn chain(mut self, kind: InvocationKind, scope: ChainScope, handlers: Vec<Arc<dyn Handler>>) -> Self {
        self.chains.declare(kind, scope, handlers);
        self
    }

    #[must_use]
    pub fn producer_provider(mut self, provider: impl ProducerProvider) -> Self {
        self.producer_providers.push(Arc::new(provider));
        self
    }

    #[must_use]
    pub fn consumer_provider(mut self, provider: impl ConsumerProvider) -> Self {
        self.consumer_providers.push(Arc::new(provider));
        self
    }

    #[must_use]
    pub fn listener(mut self, listener: Arc<dyn LifecycleListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    #[must_use]
    pub fn resource(mut self, resource: Arc<dyn SharedResource>) -> Self {
        self.resources.push(resource);
        self
    }

    #[must_use]
    pub fn discovery_client(mut self, client: Arc<dyn DiscoveryClient>) -> Self {
        self.discovery_client = Some(client);
        self
    }

    #[must_use]
    pub fn publisher(mut self, publisher: Arc<dyn RegistryPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn ClockSource>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Assembles the engine in the DOWN state and starts its registry
    /// executor. Must be called from within a tokio runtime.
    #[must_use]
    pub fn build(self) -> Engine {
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let client = self
            .discovery_client
            .unwrap_or_else(|| Arc::new(NoopDiscoveryClient));
        let publisher = self.publisher.unwrap_or_else(|| Arc::new(NoopPublisher));

        let store = Store::new(clock);
        let discovery = Discovery::new(store.reader());
        let service = StoreService::new(store, client)
            .with_fetch_timeout(self.config.discovery_fetch_timeout());
        let registry_events = service.events();
        let executor = Arc::new(
            MessageExecutor::builder(service)
                .with_default_handlers()
                .start(self.config.executor_capacity),
        );

        let app_id = self.microservice.app_id.clone();
        let microservice_name = self.microservice.service_name.clone();
        let identity = Arc::new(SelfIdentity::new(self.microservice, self.instance_id));
        let registration =
            RegistrationManager::new(Arc::clone(&identity), Arc::clone(&executor), publisher, &self.config);

        let transports = Arc::new(TransportManager::new());
        for transport in self.transports {
            transports.register(transport);
        }

        let listeners = ListenerRegistry::new();
        for listener in self.listeners {
            listeners.add(listener);
        }

        let (state_tx, _) = watch::channel(EngineState::Down);
        let admission = AdmissionLayer::new(
            usize::try_from(self.config.max_concurrent_invocations).unwrap_or(usize::MAX),
        );

        Engine {
            inner: Arc::new(EngineInner {
                config: self.config,
                app_id,
                microservice_name,
                properties: self.properties,
                state: ArcSwap::from_pointee(EngineState::Down),
                state_tx,
                lifecycle: Mutex::new(()),
                identity,
                transports,
                chain_config: self.chains,
                chains: ArcSwapOption::empty(),
                producer_providers: self.producer_providers,
                consumer_providers: self.consumer_providers,
                meta: MicroserviceMeta::new(),
                listeners,
                resources: self.resources,
                discovery,
                executor,
                registration,
                registry_events,
                tracker: InvocationTracker::new(),
                admission,
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

struct EngineInner {
    config: EngineConfig,
    app_id: String,
    microservice_name: String,
    properties: Vec<(String, String)>,
    state: ArcSwap<EngineState>,
    state_tx: watch::Sender<EngineState>,
    lifecycle: Mutex<()>,
    identity: Arc<SelfIdentity>,
    transports: Arc<TransportManager>,
    chain_config: ChainConfig,
    chains: ArcSwapOption<ChainSet>,
    producer_providers: Vec<Arc<dyn ProducerProvider>>,
    consumer_providers: Vec<Arc<dyn ConsumerProvider>>,
    meta: MicroserviceMeta,
    listeners: ListenerRegistry,
    resources: Vec<Arc<dyn SharedResource>>,
    discovery: Discovery,
    executor: Arc<MessageExecutor>,
    registration: RegistrationManager,
    registry_events: broadcast::Sender<RegistryEvent>,
    tracker: InvocationTracker,
    admission: AdmissionLayer,
}

/// Handle to the engine. Clones share the same engine.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    #[must_use]
    pub fn builder(microservice: Microservice) -> EngineBuilder {
        EngineBuilder {
            config: EngineConfig::default(),
            microservice,
            instance_id: None,
            properties: Vec::new(),
            transports: Vec::new(),
            chains: ChainConfig::default(),
            producer_providers: Vec::new(),
            consumer_providers: Vec::new(),
            listeners: Vec::new(),
            resources: Vec::new(),
            discovery_client: None,
            publisher: None,
            clock: None,
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    #[must_use]
    pub fn state(&self) -> EngineState {
        **self.inner.state.load()
    }

    /// Receiver notified on every state transition.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<EngineState> {
        self.inner.state_tx.subscribe()
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn identity(&self) -> &Arc<SelfIdentity> {
        &self.inner.identity
    }

    #[must_use]
    pub fn microservice_name(&self) -> &str {
        &self.inner.microservice_name
    }

    #[must_use]
    pub fn discovery(&self) -> &Discovery {
        &self.inner.discovery
    }

    #[must_use]
    pub fn registry_events(&self) -> broadcast::Receiver<RegistryEvent> {
        self.inner.registry_events.subscribe()
    }

    #[must_use]
    pub fn transports(&self) -> &Arc<TransportManager> {
        &self.inner.transports
    }

    #[must_use]
    pub fn tracker(&self) -> &InvocationTracker {
        &self.inner.tracker
    }

    /// Engine-wide invocation limit and its rejection count.
    #[must_use]
    pub fn admission(&self) -> &AdmissionLayer {
        &self.inner.admission
    }

    pub fn add_listener(&self, listener: Arc<dyn LifecycleListener>) {
        self.inner.listeners.add(listener);
    }

    /// Pushes a heartbeat to peers now instead of at the next tick.
    /// Returns `false` outside of `run`..`destroy`.
    pub async fn heartbeat_now(&self) -> bool {
        self.inner.registration.heartbeat_now().await
    }

    fn set_state(&self, next: EngineState) {
        let previous = **self.inner.state.load();
        self.inner.state.store(Arc::new(next));
        self.inner.state_tx.send_replace(next);
        if previous != next {
            info!(from = %previous, to = %next, "engine state changed");
        }
    }

    // -----------------------------------------------------------------------
    // Readiness
    // -----------------------------------------------------------------------

    /// # Errors
    ///
    /// `ServiceUnavailable` unless the engine is UP.
    pub fn ensure_status_up(&self) -> Result<(), InvocationError> {
        match self.state() {
            EngineState::Up => Ok(()),
            state => Err(unavailable(state)),
        }
    }

    /// [`wait_status_up_for`](Self::wait_status_up_for) with the configured
    /// timeout.
    ///
    /// # Errors
    ///
    /// See `wait_status_up_for`.
    pub async fn wait_status_up(&self) -> Result<(), EngineError> {
        self.wait_status_up_for(Duration::from_millis(self.inner.config.wait_up_timeout_ms))
            .await
    }

    /// Waits until the engine is UP.
    ///
    /// # Errors
    ///
    /// `NotStarting` if the engine is (or becomes) DOWN or FAILED,
    /// `WaitTimeout` if it is still not UP after `timeout`.
    pub async fn wait_status_up_for(&self, timeout: Duration) -> Result<(), EngineError> {
        let mut rx = self.subscribe_state();
        let wait = async {
            loop {
                let state = *rx.borrow_and_update();
                if state == EngineState::Up {
                    return Ok(());
                }
                if state.is_terminal() {
                    return Err(EngineError::NotStarting(state));
                }
                if rx.changed().await.is_err() {
                    return Err(EngineError::NotStarting(self.state()));
                }
            }
        };
        #[allow(clippy::cast_possible_truncation)]
        let timeout_ms = timeout.as_millis() as u64;
        tokio::time::timeout(timeout, wait)
            .await
            .unwrap_or_else(|_| {
                Err(EngineError::WaitTimeout {
                    timeout_ms,
                    state: self.state(),
                })
            })
    }

    // -----------------------------------------------------------------------
    // Startup
    // -----------------------------------------------------------------------

    /// Starts the engine. Does nothing unless the engine is DOWN.
    ///
    /// # Errors
    ///
    /// The first failing startup step. The engine has been torn down and
    /// is FAILED when this returns an error.
    pub async fn run(&self) -> Result<(), EngineError> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        let state = self.state();
        if state != EngineState::Down {
            debug!(state = %state, "run ignored; engine is not DOWN");
            return Ok(());
        }

        let started = Instant::now();
        self.set_state(EngineState::Starting);
        match self.start_up().await {
            Ok(()) => {
                self.log_boot_summary(started.elapsed());
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "engine startup failed; tearing down");
                self.shut_down().await;
                self.set_state(EngineState::Failed);
                Err(e)
            }
        }
    }

    async fn broadcast(&self, event: LifecycleEvent) -> Result<(), EngineError> {
        self.inner
            .listeners
            .broadcast_unsafe(event, self)
            .await
            .map_err(startup(event.as_str()))
    }

    async fn start_up(&self) -> Result<(), EngineError> {
        let inner = &self.inner;
        inner.identity.reset_for_restart();
        inner.meta.clear();

        self.broadcast(LifecycleEvent::BeforeFilter).await?;
        let chains = inner
            .chain_config
            .build(self.default_consumer_chain(), vec![Arc::new(ProducerOperationHandler)])
            .map_err(startup("handler chains"))?;
        inner.chains.store(Some(Arc::new(chains)));
        self.broadcast(LifecycleEvent::AfterFilter).await?;

        for (key, value) in &inner.properties {
            inner
                .identity
                .add_property(key, value)
                .map_err(startup("microservice metadata"))?;
        }

        self.broadcast(LifecycleEvent::BeforeProducerProvider).await?;
        for provider in &inner.producer_providers {
            let schemas = provider
                .init()
                .await
                .map_err(|e| e.context(format!("producer provider {}", provider.name())))
                .map_err(startup("producer providers"))?;
            for schema in schemas {
                inner
                    .identity
                    .add_schema(schema.schema_id(), schema.contract())
                    .map_err(startup("producer providers"))?;
                inner.meta.add_schema(&inner.microservice_name, &schema);
            }
        }
        self.broadcast(LifecycleEvent::AfterProducerProvider).await?;

        self.broadcast(LifecycleEvent::BeforeConsumerProvider).await?;
        for provider in &inner.consumer_providers {
            let references = provider
                .init()
                .await
                .map_err(|e| e.context(format!("consumer provider {}", provider.name())))
                .map_err(startup("consumer providers"))?;
            for reference in references {
                inner.meta.add_reference(reference);
            }
        }
        self.broadcast(LifecycleEvent::AfterConsumerProvider).await?;

        self.broadcast(LifecycleEvent::BeforeTransport).await?;
        let inbound: Arc<dyn InboundEndpoint> = Arc::new(EngineInbound {
            engine: Arc::downgrade(&self.inner),
            identity: Arc::clone(&inner.identity),
        });
        let endpoints = inner
            .transports
            .init_all(&inbound)
            .await
            .map_err(startup("transports"))?;
        for endpoint in endpoints {
            inner
                .identity
                .add_endpoint(&endpoint.to_string())
                .map_err(startup("transports"))?;
        }
        self.broadcast(LifecycleEvent::AfterTransport).await?;

        self.broadcast(LifecycleEvent::BeforeRegistry).await?;
        inner.registration.run().await.map_err(startup("registry"))?;
        inner
            .registration
            .update_status(InstanceStatus::Up)
            .await
            .map_err(startup("registry"))?;
        self.set_state(EngineState::Up);
        self.broadcast(LifecycleEvent::AfterRegistry).await?;
        Ok(())
    }

    fn default_consumer_chain(&self) -> Vec<Arc<dyn Handler>> {
        let inner = &self.inner;
        vec![
            Arc::new(LoadBalanceHandler::new(
                inner.discovery.clone(),
                Arc::clone(&inner.transports),
            )),
            Arc::new(TransportHandler::new(Arc::clone(&inner.transports))),
        ]
    }

    fn log_boot_summary(&self, elapsed: Duration) {
        let identity = &self.inner.identity;
        let schemas: Vec<String> = identity.schemas_by_id().into_keys().collect();
        info!(
            service_id = %identity.service_id(),
            instance_id = %identity.instance_id(),
            endpoints = ?identity.endpoints(),
            schemas = ?schemas,
            operations = self.inner.meta.operation_count(),
            transports = ?self.inner.transports.names(),
            elapsed_ms = elapsed.as_millis(),
            state = %self.state(),
            "engine is UP"
        );
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Stops the engine and releases everything it holds. Does nothing
    /// unless the engine is UP or STARTING. Never fails: each step logs its
    /// own error and the next step runs anyway.
    pub async fn destroy(&self) {
        let _lifecycle = self.inner.lifecycle.lock().await;
        let state = self.state();
        if !matches!(state, EngineState::Up | EngineState::Starting) {
            debug!(state = %state, "destroy ignored; engine is not running");
            return;
        }
        self.shut_down().await;
        self.set_state(EngineState::Down);
        info!("engine destroyed");
    }

    async fn shut_down(&self) {
        let inner = &self.inner;
        let config = &inner.config;

        // Peers stop routing here before anything is torn down.
        if inner.identity.status() == InstanceStatus::Up {
            if let Err(e) = inner.registration.update_status(InstanceStatus::Down).await {
                warn!(error = %e, "failed to publish DOWN status");
            }
        }
        if config.turn_down_wait_secs > 0 {
            info!(
                seconds = config.turn_down_wait_secs,
                "waiting for peers to observe DOWN status"
            );
            tokio::time::sleep(Duration::from_secs(config.turn_down_wait_secs)).await;
        }

        inner
            .listeners
            .broadcast_safe(LifecycleEvent::BeforeClose, self)
            .await;
        self.set_state(EngineState::Stopping);

        if let Err(e) = inner.registration.destroy().await {
            warn!(error = %e, "failed to unregister");
        }

        let drained = inner
            .tracker
            .wait_for_drain(config.drain_timeout(), config.drain_poll_interval())
            .await;
        if drained {
            debug!("all invocations finished");
        }

        inner.transports.close_all().await;
        for resource in inner.resources.iter().rev() {
            if let Err(e) = resource.close().await {
                warn!(resource = resource.name(), error = %format!("{e:#}"), "failed to close resource");
            }
        }

        inner
            .listeners
            .broadcast_safe(LifecycleEvent::AfterClose, self)
            .await;
    }

    // -----------------------------------------------------------------------
    // Invocations
    // -----------------------------------------------------------------------

    fn chains(&self) -> Result<Arc<ChainSet>, InvocationError> {
        self.inner
            .chains
            .load_full()
            .ok_or_else(|| unavailable(self.state()))
    }

    /// The declared reference to `microservice_name`, or one in this
    /// engine's application accepting any version.
    #[must_use]
    pub fn reference(&self, microservice_name: &str) -> ReferenceConfig {
        self.inner
            .meta
            .reference(microservice_name)
            .unwrap_or_else(|| ReferenceConfig::new(self.inner.app_id.clone(), microservice_name))
    }

    /// Builds a consumer invocation against `reference`.
    ///
    /// # Errors
    ///
    /// `ServiceUnavailable` unless the engine is UP.
    pub fn consumer_invocation(
        &self,
        reference: ReferenceConfig,
        schema_id: &str,
        operation_id: &str,
        arguments: Vec<Value>,
    ) -> Result<Invocation, InvocationError> {
        self.ensure_status_up()?;
        let chain = self
            .chains()?
            .lookup(InvocationKind::Consumer, &reference.microservice_name);
        let operation = Arc::new(OperationMeta::consumer(
            reference.microservice_name.clone(),
            schema_id,
            operation_id,
        ));
        Ok(Invocation::new(InvocationKind::Consumer, operation, chain, arguments)
            .with_reference(reference)
            .with_timeout_ms(self.inner.config.invocation_timeout_ms))
    }

    /// Runs an invocation through the dispatch pipeline. Always answers;
    /// every failure arrives as an error response.
    pub async fn invoke(&self, invocation: Invocation) -> Response {
        if invocation.is_consumer() {
            if let Err(e) = self.ensure_status_up() {
                return Response::fail(e);
            }
        }
        self.dispatch(invocation).await
    }

    /// Calls `schema_id.operation_id` on `microservice_name`.
    ///
    /// # Errors
    ///
    /// Whatever the call failed with.
    pub async fn call(
        &self,
        microservice_name: &str,
        schema_id: &str,
        operation_id: &str,
        arguments: Vec<Value>,
    ) -> Result<Value, InvocationError> {
        let invocation = self.consumer_invocation(
            self.reference(microservice_name),
            schema_id,
            operation_id,
            arguments,
        )?;
        self.invoke(invocation).await.into_result()
    }

    /// Serves a call that arrived on one of our transports. Accepted while
    /// UP, and while STOPPING so callers that picked us before the DOWN
    /// status spread still get an answer.
    pub async fn handle_producer(&self, request: InboundRequest) -> Response {
        let state = self.state();
        if !matches!(state, EngineState::Up | EngineState::Stopping) {
            return Response::fail(unavailable(state));
        }
        let Some(operation) = self
            .inner
            .meta
            .operation(&request.schema_id, &request.operation_id)
        else {
            return Response::fail(InvocationError::NotFound(format!(
                "{}.{}.{}",
                self.inner.microservice_name, request.schema_id, request.operation_id
            )));
        };
        let chains = match self.chains() {
            Ok(chains) => chains,
            Err(e) => return Response::fail(e),
        };
        let chain = chains.lookup(InvocationKind::Producer, &self.inner.microservice_name);
        let invocation = Invocation::new(InvocationKind::Producer, operation, chain, request.arguments)
            .with_endpoint(request.endpoint)
            .with_trace_id(request.trace_id)
            .with_timeout_ms(self.inner.config.invocation_timeout_ms);
        self.dispatch(invocation).await
    }

    async fn dispatch(&self, mut invocation: Invocation) -> Response {
        invocation.attach_guard(self.inner.tracker.track());
        invocation.on_start();
        let pipeline = build_invocation_pipeline(InvocationDispatcher, &self.inner.admission);
        match pipeline.oneshot(invocation).await {
            Ok(response) => response,
            Err(e) => {
                debug!(error = %e, "invocation rejected by dispatch pipeline");
                Response::fail(e)
            }
        }
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("microservice", &self.inner.microservice_name)
            .field("state", &self.state())
            .field("in_flight", &self.inner.tracker.in_flight())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Inbound adapter
// ---------------------------------------------------------------------------

/// What transports hold. Weak, so a bound transport does not keep a
/// dropped engine alive.
struct EngineInbound {
    engine: Weak<EngineInner>,
    identity: Arc<SelfIdentity>,
}

impl EngineInbound {
    fn engine(&self) -> Option<Engine> {
        self.engine.upgrade().map(|inner| Engine { inner })
    }
}

#[async_trait]
impl InboundEndpoint for EngineInbound {
    async fn handle_invocation(&self, request: InboundRequest) -> Response {
        match self.engine() {
            Some(engine) => engine.handle_producer(request).await,
            None => Response::fail(unavailable(EngineState::Down)),
        }
    }

    async fn receive_registry_message(&self, message: RegistryMessage) -> anyhow::Result<()> {
        let engine = self
            .engine()
            .ok_or_else(|| anyhow::anyhow!("engine is gone"))?;
        engine.inner.executor.submit(message).await?;
        Ok(())
    }

    fn microservice_info(&self) -> MicroserviceInfo {
        self.identity.microservice_info()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
