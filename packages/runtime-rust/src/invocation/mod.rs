//! A single in-flight call and the cursor that walks it through its
//! handler chain.
//!
//! An [`Invocation`] is created per call by the engine, driven through the
//! chain by [`run_chain`](crate::handler::run_chain), and completed exactly
//! once through its [`Responder`].

pub mod operation;
pub mod responder;
pub mod response;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use meshrpc_core::{Address, VersionRule};
use serde_json::Value;
use tracing::debug;

pub use operation::{FnOperation, OperationMeta, ProducerOperation};
pub use responder::Responder;
pub use response::{ErrorBody, InvocationError, Response};

use crate::engine::tracker::InvocationGuard;
use crate::handler::{HandlerChain, HandlerFailure};

/// Context key carrying the distributed trace id.
pub const TRACE_ID_KEY: &str = "x-trace-id";

static NEXT_INVOCATION_ID: AtomicU64 = AtomicU64::new(1);

// ---------------------------------------------------------------------------
// InvocationKind / ReferenceConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvocationKind {
    /// Outbound call to a remote microservice.
    Consumer,
    /// Inbound call served by this process.
    Producer,
}

impl InvocationKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Consumer => "consumer",
            Self::Producer => "producer",
        }
    }
}

/// Which remote microservice a consumer invocation targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceConfig {
    pub app_id: String,
    pub microservice_name: String,
    pub version_rule: VersionRule,
    /// Restricts endpoint selection to one transport scheme.
    pub transport: Option<String>,
}

impl ReferenceConfig {
    #[must_use]
    pub fn new(app_id: impl Into<String>, microservice_name: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            microservice_name: microservice_name.into(),
            version_rule: VersionRule::ALL,
            transport: None,
        }
    }

    #[must_use]
    pub fn with_version_rule(mut self, rule: VersionRule) -> Self {
        self.version_rule = rule;
        self
    }

    #[must_use]
    pub fn with_transport(mut self, transport: impl Into<String>) -> Self {
        self.transport = Some(transport.into());
        self
    }
}

// ---------------------------------------------------------------------------
// StageTrace
// ---------------------------------------------------------------------------

/// Timestamps of the stages an invocation passed through.
#[derive(Debug, Clone)]
pub struct StageTrace {
    pub created: Instant,
    pub started: Option<Instant>,
    pub execution_started: Option<Instant>,
    pub business_started: Option<Instant>,
    pub business_finished: Option<Instant>,
    pub finished: Option<Instant>,
}

impl StageTrace {
    fn new() -> Self {
        Self {
            created: Instant::now(),
            started: None,
            execution_started: None,
            business_started: None,
            business_finished: None,
            finished: None,
        }
    }

    /// Total time from start to finish, when both are recorded.
    #[must_use]
    pub fn total(&self) -> Option<Duration> {
        Some(self.finished?.duration_since(self.started.unwrap_or(self.created)))
    }

    #[must_use]
    pub fn business(&self) -> Option<Duration> {
        Some(self.business_finished?.duration_since(self.business_started?))
    }
}

// ---------------------------------------------------------------------------
// Invocation
// ---------------------------------------------------------------------------

/// One call travelling through a handler chain.
pub struct Invocation {
    id: u64,
    kind: InvocationKind,
    operation: Arc<OperationMeta>,
    arguments: Vec<Value>,
    context: HashMap<String, Value>,
    chain: Arc<HandlerChain>,
    cursor: usize,
    reference: Option<ReferenceConfig>,
    endpoint: Option<Address>,
    trace_id: Option<String>,
    timeout_ms: u64,
    sync: bool,
    stages: StageTrace,
    guard: Option<InvocationGuard>,
}

impl Invocation {
    /// Creates an invocation positioned before the first handler of `chain`.
    #[must_use]
    pub fn new(
        kind: InvocationKind,
        operation: Arc<OperationMeta>,
        chain: Arc<HandlerChain>,
        arguments: Vec<Value>,
    ) -> Self {
        Self {
            id: NEXT_INVOCATION_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            operation,
            arguments,
            context: HashMap::new(),
            chain,
            cursor: 0,
            reference: None,
            endpoint: None,
            trace_id: None,
            timeout_ms: 30_000,
            sync: true,
            stages: StageTrace::new(),
            guard: None,
        }
    }

    #[must_use]
    pub fn with_reference(mut self, reference: ReferenceConfig) -> Self {
        self.reference = Some(reference);
        self
    }

    #[must_use]
    pub fn with_endpoint(mut self, endpoint: Address) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    #[must_use]
    pub fn with_trace_id(mut self, trace_id: Option<String>) -> Self {
        self.trace_id = trace_id;
        self
    }

    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub(crate) fn attach_guard(&mut self, guard: InvocationGuard) {
        self.guard = Some(guard);
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn kind(&self) -> InvocationKind {
        self.kind
    }

    #[must_use]
    pub fn is_consumer(&self) -> bool {
        self.kind == InvocationKind::Consumer
    }

    #[must_use]
    pub fn operation(&self) -> &Arc<OperationMeta> {
        &self.operation
    }

    #[must_use]
    pub fn arguments(&self) -> &[Value] {
        &self.arguments
    }

    #[must_use]
    pub fn reference(&self) -> Option<&ReferenceConfig> {
        self.reference.as_ref()
    }

    /// The resolved target address, once a handler has picked one.
    #[must_use]
    pub fn endpoint(&self) -> Option<&Address> {
        self.endpoint.as_ref()
    }

    pub fn set_endpoint(&mut self, endpoint: Address) {
        self.endpoint = Some(endpoint);
    }

    /// Scheme of the resolved endpoint.
    #[must_use]
    pub fn transport_name(&self) -> Option<&str> {
        self.endpoint.as_ref().map(|e| e.scheme.as_str())
    }

    /// Handler-local context shared by every handler of this invocation.
    #[must_use]
    pub fn context(&self) -> &HashMap<String, Value> {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut HashMap<String, Value> {
        &mut self.context
    }

    /// Index of the next handler to run.
    #[must_use]
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    #[must_use]
    pub fn chain(&self) -> &Arc<HandlerChain> {
        &self.chain
    }

    #[must_use]
    pub fn trace_id(&self) -> Option<&str> {
        self.trace_id.as_deref()
    }

    #[must_use]
    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    /// Whether the caller is waiting on the response rather than
    /// registering a callback.
    #[must_use]
    pub fn is_sync(&self) -> bool {
        self.sync
    }

    pub fn set_sync(&mut self, sync: bool) {
        self.sync = sync;
    }

    #[must_use]
    pub fn stages(&self) -> &StageTrace {
        &self.stages
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.stages.finished.is_some()
    }

    /// `"<KIND> <transport> <microservice>.<schema>.<operation>"`, with
    /// `-` for a transport that is not resolved yet.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!(
            "{} {} {}",
            self.kind.as_str().to_ascii_uppercase(),
            self.transport_name().unwrap_or("-"),
            self.operation.qualified_name()
        )
    }

    /// Marks the invocation started and settles its trace id: the one set
    /// explicitly, else one carried in the context, else a fresh one.
    pub fn on_start(&mut self) {
        if self.trace_id.is_none() {
            let carried = self
                .context
                .get(TRACE_ID_KEY)
                .and_then(Value::as_str)
                .map(str::to_string);
            self.trace_id = Some(carried.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()));
        }
        if let Some(trace_id) = &self.trace_id {
            self.context
                .insert(TRACE_ID_KEY.to_string(), Value::String(trace_id.clone()));
        }
        self.stages.started = Some(Instant::now());
    }

    pub fn on_start_execution(&mut self) {
        self.stages.execution_started = Some(Instant::now());
    }

    pub fn on_business_start(&mut self) {
        self.stages.business_started = Some(Instant::now());
    }

    pub fn on_business_finish(&mut self) {
        self.stages.business_finished = Some(Instant::now());
    }

    /// Records completion. Only the first call has any effect.
    pub fn on_finish(&mut self, response: &Response) {
        if self.is_finished() {
            return;
        }
        self.stages.finished = Some(Instant::now());
        #[allow(clippy::cast_possible_truncation)]
        let elapsed_ms = self.stages.total().map_or(0, |d| d.as_millis() as u64);
        debug!(
            invocation_id = self.id,
            kind = self.kind.as_str(),
            operation = %self.operation.qualified_name(),
            status = response.status(),
            elapsed_ms,
            "invocation finished"
        );
        self.guard.take();
    }

    /// Runs the handler at the cursor and advances past it.
    ///
    /// The cursor only ever moves forward. Calling `next` after the last
    /// handler yields a bad-request failure instead of running anything.
    ///
    /// # Errors
    ///
    /// Returns the failure raised by the handler (or by a handler further
    /// down the chain), tagged with the name of the handler that raised it.
    pub async fn next(&mut self, responder: &Responder) -> Result<(), HandlerFailure> {
        let Some(handler) = self.chain.get(self.cursor).cloned() else {
            return Err(HandlerFailure::new(
                "chain",
                InvocationError::BadRequest(format!(
                    "handler chain exhausted after {} handlers without a response",
                    self.chain.len()
                )),
            ));
        };
        self.cursor += 1;

        match handler.handle(self, responder).await {
            Ok(()) => Ok(()),
            Err(error) => match error.downcast::<HandlerFailure>() {
                Ok(inner) => Err(inner),
                Err(error) => Err(HandlerFailure::new(handler.name(), error)),
            },
        }
    }
}

impl std::fmt::Debug for Invocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invocation")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("operation", &self.operation.qualified_name())
            .field("cursor", &self.cursor)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::engine::tracker::InvocationTracker;
    use crate::handler::tests::{Record, Terminal};

    fn invocation_with(chain: HandlerChain) -> Invocation {
        Invocation::new(
            InvocationKind::Producer,
            Arc::new(OperationMeta::consumer("orders", "OrderApi", "create")),
            Arc::new(chain),
            vec![json!(1)],
        )
    }

    #[test]
    fn ids_are_unique() {
        let chain = HandlerChain::builder().handler(Terminal).build().unwrap();
        let a = invocation_with(chain.clone());
        let b = invocation_with(chain);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn on_start_assigns_trace_id_once() {
        let chain = HandlerChain::builder().handler(Terminal).build().unwrap();
        let mut inv = invocation_with(chain);
        assert!(inv.trace_id().is_none());
        inv.on_start();
        let first = inv.trace_id().unwrap().to_string();
        inv.on_start();
        assert_eq!(inv.trace_id().unwrap(), first);
        assert_eq!(inv.context()[TRACE_ID_KEY], json!(first));
    }

    #[test]
    fn trace_id_is_taken_from_context() {
        let chain = HandlerChain::builder().handler(Terminal).build().unwrap();
        let mut inv = invocation_with(chain);
        inv.context_mut()
            .insert(TRACE_ID_KEY.to_string(), json!("trace-7"));
        inv.on_start();
        assert_eq!(inv.trace_id(), Some("trace-7"));
    }

    #[test]
    fn qualified_name_includes_kind_and_transport() {
        let chain = HandlerChain::builder().handler(Terminal).build().unwrap();
        let mut inv = invocation_with(chain);
        assert_eq!(inv.qualified_name(), "PRODUCER - orders.OrderApi.create");
        inv.set_endpoint(Address::parse("loopback://node:1").unwrap());
        assert_eq!(
            inv.qualified_name(),
            "PRODUCER loopback orders.OrderApi.create"
        );
    }

    #[test]
    fn propagated_trace_id_is_kept() {
        let chain = HandlerChain::builder().handler(Terminal).build().unwrap();
        let mut inv = invocation_with(chain).with_trace_id(Some("abc".to_string()));
        inv.on_start();
        assert_eq!(inv.trace_id(), Some("abc"));
    }

    #[test]
    fn on_finish_is_idempotent_and_releases_guard() {
        let tracker = InvocationTracker::new();
        let chain = HandlerChain::builder().handler(Terminal).build().unwrap();
        let mut inv = invocation_with(chain);
        inv.attach_guard(tracker.track());
        inv.on_start();
        assert_eq!(tracker.in_flight(), 1);

        inv.on_finish(&Response::ok(json!(null)));
        let finished_at = inv.stages().finished;
        inv.on_finish(&Response::fail(InvocationError::Overloaded));

        assert_eq!(inv.stages().finished, finished_at);
        assert_eq!(tracker.in_flight(), 0);
        assert_eq!(tracker.finished(), 1);
    }

    #[tokio::test]
    async fn next_past_the_end_is_bad_request() {
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let chain = HandlerChain::builder()
            .handler(Record::new("a", log))
            .build()
            .unwrap();
        let mut inv = invocation_with(chain);
        let (responder, _rx) = Responder::channel(inv.id());

        let failure = inv.next(&responder).await.unwrap_err();
        assert_eq!(failure.to_invocation_error().status_code(), 400);
        assert_eq!(inv.cursor(), 1);
    }
}
