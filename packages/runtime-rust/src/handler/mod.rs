//! Handler chains.
//!
//! A chain is an ordered, immutable list of [`Handler`]s built once at
//! startup. Each handler decides whether to pass the invocation on (by
//! calling [`Invocation::next`]), answer it directly through the
//! [`Responder`], or fail. [`run_chain`] drives a chain and guarantees the
//! caller receives exactly one [`Response`].

pub mod builtin;
pub mod chains;

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use tracing::{error, warn};

pub use builtin::{LoadBalanceHandler, ProducerOperationHandler, TransportHandler};
pub use chains::{ChainConfig, ChainScope, ChainSet};

use crate::invocation::{Invocation, InvocationError, Responder, Response};

// ---------------------------------------------------------------------------
// Handler trait
// ---------------------------------------------------------------------------

/// One step of a handler chain.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Stable name used in logs and fault attribution.
    fn name(&self) -> &'static str;

    /// Processes the invocation.
    ///
    /// Pass it on with `invocation.next(responder).await?`, or short-circuit
    /// with `responder.respond(..)` and return `Ok(())`. Returning an error
    /// whose root is an [`InvocationError`] surfaces that error unchanged;
    /// any other error becomes a handler fault.
    async fn handle(&self, invocation: &mut Invocation, responder: &Responder)
        -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// HandlerFailure
// ---------------------------------------------------------------------------

/// An error raised inside a chain, tagged with the handler that raised it.
#[derive(Debug, thiserror::Error)]
#[error("handler {handler} failed: {error:#}")]
pub struct HandlerFailure {
    handler: &'static str,
    error: anyhow::Error,
}

impl HandlerFailure {
    pub fn new(handler: &'static str, error: impl Into<anyhow::Error>) -> Self {
        Self {
            handler,
            error: error.into(),
        }
    }

    #[must_use]
    pub fn handler(&self) -> &'static str {
        self.handler
    }

    /// The structured error the caller receives for this failure.
    #[must_use]
    pub fn to_invocation_error(&self) -> InvocationError {
        self.error
            .downcast_ref::<InvocationError>()
            .cloned()
            .unwrap_or_else(|| InvocationError::HandlerFault {
                handler: self.handler.to_string(),
                message: format!("{:#}", self.error),
            })
    }
}

// ---------------------------------------------------------------------------
// HandlerChain
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainBuildError {
    #[error("handler chain must contain at least one handler")]
    Empty,
    #[error("handler {0} appears more than once in the chain")]
    Duplicate(&'static str),
}

/// Immutable, validated sequence of handlers.
#[derive(Clone)]
pub struct HandlerChain {
    handlers: Vec<Arc<dyn Handler>>,
}

impl HandlerChain {
    #[must_use]
    pub fn builder() -> HandlerChainBuilder {
        HandlerChainBuilder::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Always `false` for a built chain; present for API symmetry with `len`.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Arc<dyn Handler>> {
        self.handlers.get(index)
    }

    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.handlers.iter().map(|h| h.name()).collect()
    }
}

impl fmt::Debug for HandlerChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// Collects handlers in order and validates them into a [`HandlerChain`].
#[derive(Default)]
pub struct HandlerChainBuilder {
    handlers: Vec<Arc<dyn Handler>>,
}

impl HandlerChainBuilder {
    #[must_use]
    pub fn handler(mut self, handler: impl Handler) -> Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    #[must_use]
    pub fn shared(mut self, handler: Arc<dyn Handler>) -> Self {
        self.handlers.push(handler);
        self
    }

    #[must_use]
    pub fn handlers(mut self, handlers: impl IntoIterator<Item = Arc<dyn Handler>>) -> Self {
        self.handlers.extend(handlers);
        self
    }

    /// Validates and freezes the chain.
    ///
    /// # Errors
    ///
    /// Returns `ChainBuildError::Empty` for an empty chain and
    /// `ChainBuildError::Duplicate` if two handlers share a name.
    pub fn build(self) -> Result<HandlerChain, ChainBuildError> {
        if self.handlers.is_empty() {
            return Err(ChainBuildError::Empty);
        }
        let mut seen = std::collections::HashSet::new();
        for handler in &self.handlers {
            if !seen.insert(handler.name()) {
                return Err(ChainBuildError::Duplicate(handler.name()));
            }
        }
        Ok(HandlerChain {
            handlers: self.handlers,
        })
    }
}

// ---------------------------------------------------------------------------
// Chain driver
// ---------------------------------------------------------------------------

/// Drives `invocation` through its chain and returns its single response.
///
/// Failures (returned errors and panics alike) become an error response if
/// nothing was delivered yet, and are only logged otherwise. A chain that
/// finishes without anyone responding yields a bad-request response.
pub async fn run_chain(mut invocation: Invocation) -> Response {
    let (responder, rx) = Responder::channel(invocation.id());
    invocation.on_start_execution();

    let outcome = AssertUnwindSafe(invocation.next(&responder))
        .catch_unwind()
        .await;

    let failure = match outcome {
        Ok(Ok(())) => None,
        Ok(Err(failure)) => Some((failure.handler(), failure.to_invocation_error())),
        Err(panic) => {
            let handler = invocation
                .cursor()
                .checked_sub(1)
                .and_then(|i| invocation.chain().get(i))
                .map_or("chain", |h| h.name());
            let message = panic_message(panic.as_ref());
            Some((
                handler,
                InvocationError::HandlerFault {
                    handler: handler.to_string(),
                    message,
                },
            ))
        }
    };

    if let Some((handler, err)) = failure {
        if responder.is_responded() {
            warn!(
                invocation_id = invocation.id(),
                handler,
                error = %err,
                "handler failed after the response was delivered"
            );
        } else {
            error!(
                invocation_id = invocation.id(),
                handler,
                operation = %invocation.operation().qualified_name(),
                error = %err,
                "handler failed"
            );
            responder.respond(Response::fail(err));
        }
    }

    // Release our handle so an abandoned chain closes the channel.
    drop(responder);
    let response = rx.await.unwrap_or_else(|_| {
        Response::fail(InvocationError::BadRequest(
            "handler chain completed without producing a response".to_string(),
        ))
    });
    invocation.on_finish(&response);
    response
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use parking_lot::Mutex;
    use proptest::prelude::*;
    use serde_json::{json, Value};

    use super::*;
    use crate::invocation::{InvocationKind, OperationMeta};

    /// Records its name and the cursor it saw, then passes the invocation on.
    pub(crate) struct Record {
        name: &'static str,
        log: Arc<Mutex<Vec<(String, usize)>>>,
    }

    impl Record {
        pub(crate) fn new(name: &'static str, log: Arc<Mutex<Vec<(String, usize)>>>) -> Self {
            Self { name, log }
        }
    }

    #[async_trait]
    impl Handler for Record {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn handle(
            &self,
            invocation: &mut Invocation,
            responder: &Responder,
        ) -> anyhow::Result<()> {
            self.log
                .lock()
                .push((self.name.to_string(), invocation.cursor()));
            invocation.next(responder).await?;
            Ok(())
        }
    }

    /// Answers with the invocation's first argument.
    pub(crate) struct Terminal;

    #[async_trait]
    impl Handler for Terminal {
        fn name(&self) -> &'static str {
            "terminal"
        }

        async fn handle(
            &self,
            invocation: &mut Invocation,
            responder: &Responder,
        ) -> anyhow::Result<()> {
            let value = invocation.arguments().first().cloned().unwrap_or(Value::Null);
            responder.respond(Response::ok(value));
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl Handler for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn handle(&self, _: &mut Invocation, _: &Responder) -> anyhow::Result<()> {
            anyhow::bail!("disk on fire")
        }
    }

    struct Rejecting;

    #[async_trait]
    impl Handler for Rejecting {
        fn name(&self) -> &'static str {
            "rejecting"
        }

        async fn handle(&self, _: &mut Invocation, _: &Responder) -> anyhow::Result<()> {
            Err(InvocationError::BadRequest("missing field".to_string()).into())
        }
    }

    struct Panicking;

    #[async_trait]
    impl Handler for Panicking {
        fn name(&self) -> &'static str {
            "panicking"
        }

        async fn handle(&self, _: &mut Invocation, _: &Responder) -> anyhow::Result<()> {
            panic!("unexpected state")
        }
    }

    /// Responds, then fails.
    struct RespondThenFail;

    #[async_trait]
    impl Handler for RespondThenFail {
        fn name(&self) -> &'static str {
            "respond-then-fail"
        }

        async fn handle(&self, _: &mut Invocation, responder: &Responder) -> anyhow::Result<()> {
            responder.respond(Response::ok(json!("first")));
            anyhow::bail!("late failure")
        }
    }

    /// Returns without responding or passing on.
    struct Silent;

    #[async_trait]
    impl Handler for Silent {
        fn name(&self) -> &'static str {
            "silent"
        }

        async fn handle(&self, _: &mut Invocation, _: &Responder) -> anyhow::Result<()> {
            Ok(())
        }
    }

    /// Responds from a spawned task after the handler has returned.
    struct Deferred;

    #[async_trait]
    impl Handler for Deferred {
        fn name(&self) -> &'static str {
            "deferred"
        }

        async fn handle(&self, _: &mut Invocation, responder: &Responder) -> anyhow::Result<()> {
            let responder = responder.clone();
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                responder.respond(Response::ok(json!("later")));
            });
            Ok(())
        }
    }

    pub(crate) fn invocation(chain: HandlerChain) -> Invocation {
        Invocation::new(
            InvocationKind::Producer,
            Arc::new(OperationMeta::consumer("orders", "OrderApi", "create")),
            Arc::new(chain),
            vec![json!("payload")],
        )
    }

    fn log() -> Arc<Mutex<Vec<(String, usize)>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[test]
    fn empty_chain_is_rejected() {
        assert_eq!(
            HandlerChain::builder().build().unwrap_err(),
            ChainBuildError::Empty
        );
    }

    #[test]
    fn duplicate_handler_names_are_rejected() {
        let err = HandlerChain::builder()
            .handler(Terminal)
            .handler(Terminal)
            .build()
            .unwrap_err();
        assert_eq!(err, ChainBuildError::Duplicate("terminal"));
    }

    #[tokio::test]
    async fn handlers_run_in_order() {
        let log = log();
        let chain = HandlerChain::builder()
            .handler(Record::new("a", log.clone()))
            .handler(Record::new("b", log.clone()))
            .handler(Terminal)
            .build()
            .unwrap();

        let resp = run_chain(invocation(chain)).await;
        assert_eq!(resp.into_result().unwrap(), json!("payload"));
        assert_eq!(
            *log.lock(),
            vec![("a".to_string(), 1), ("b".to_string(), 2)]
        );
    }

    #[tokio::test]
    async fn short_circuit_skips_later_handlers() {
        let log = log();
        let chain = HandlerChain::builder()
            .handler(Terminal)
            .handler(Record::new("never", log.clone()))
            .build()
            .unwrap();

        let resp = run_chain(invocation(chain)).await;
        assert!(resp.is_ok());
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn handler_error_becomes_single_fault_response() {
        let log = log();
        let chain = HandlerChain::builder()
            .handler(Record::new("a", log.clone()))
            .handler(Failing)
            .build()
            .unwrap();

        let resp = run_chain(invocation(chain)).await;
        assert_eq!(resp.status(), 500);
        match resp.into_result().unwrap_err() {
            InvocationError::HandlerFault { handler, message } => {
                assert_eq!(handler, "failing");
                assert!(message.contains("disk on fire"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn typed_error_keeps_its_category() {
        let chain = HandlerChain::builder().handler(Rejecting).build().unwrap();
        let resp = run_chain(invocation(chain)).await;
        assert_eq!(resp.status(), 400);
    }

    #[tokio::test]
    async fn panic_becomes_fault_response() {
        let chain = HandlerChain::builder()
            .handler(Record::new("a", log()))
            .handler(Panicking)
            .build()
            .unwrap();

        let resp = run_chain(invocation(chain)).await;
        match resp.into_result().unwrap_err() {
            InvocationError::HandlerFault { handler, message } => {
                assert_eq!(handler, "panicking");
                assert!(message.contains("unexpected state"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn failure_after_response_is_not_delivered_twice() {
        let chain = HandlerChain::builder()
            .handler(RespondThenFail)
            .build()
            .unwrap();
        let resp = run_chain(invocation(chain)).await;
        assert_eq!(resp.into_result().unwrap(), json!("first"));
    }

    #[tokio::test]
    async fn chain_without_response_is_bad_request() {
        let chain = HandlerChain::builder().handler(Silent).build().unwrap();
        let resp = run_chain(invocation(chain)).await;
        assert_eq!(resp.status(), 400);
    }

    #[tokio::test]
    async fn exhausted_chain_is_bad_request() {
        let chain = HandlerChain::builder()
            .handler(Record::new("only", log()))
            .build()
            .unwrap();
        let resp = run_chain(invocation(chain)).await;
        assert_eq!(resp.status(), 400);
    }

    #[tokio::test]
    async fn response_may_arrive_after_handler_returns() {
        let chain = HandlerChain::builder().handler(Deferred).build().unwrap();
        let resp = run_chain(invocation(chain)).await;
        assert_eq!(resp.into_result().unwrap(), json!("later"));
    }

    proptest! {
        #[test]
        fn cursor_is_strictly_increasing(depth in 1usize..12) {
            const NAMES: [&str; 12] = [
                "h0", "h1", "h2", "h3", "h4", "h5", "h6", "h7", "h8", "h9", "h10", "h11",
            ];
            let log = log();
            let mut builder = HandlerChain::builder();
            for name in NAMES.into_iter().take(depth) {
                builder = builder.handler(Record::new(name, log.clone()));
            }
            let chain = builder.handler(Terminal).build().unwrap();

            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let resp = rt.block_on(run_chain(invocation(chain)));
            prop_assert!(resp.is_ok());

            let cursors: Vec<usize> = log.lock().iter().map(|(_, c)| *c).collect();
            prop_assert_eq!(cursors.len(), depth);
            for pair in cursors.windows(2) {
                prop_assert!(pair[1] > pair[0]);
            }
        }
    }
}
