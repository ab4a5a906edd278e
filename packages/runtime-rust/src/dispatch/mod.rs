//! Tower pipeline every invocation is dispatched through.
//!
//! - [`admission`]: Engine-wide concurrency limit, rejects over capacity
//! - [`timeout`]: Per-invocation timeout enforcement
//! - [`metrics`]: Timing, outcome and counters per invocation
//! - [`pipeline`]: Composes all layers around the [`InvocationDispatcher`]

pub mod admission;
pub mod metrics;
pub mod pipeline;
pub mod timeout;

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tower::Service;

pub use admission::AdmissionLayer;
pub use metrics::MetricsLayer;
pub use pipeline::build_invocation_pipeline;
pub use timeout::TimeoutLayer;

use crate::handler::run_chain;
use crate::invocation::{Invocation, InvocationError, Response};

/// Boxed future shared by every layer of the pipeline.
pub type DispatchFuture = Pin<Box<dyn Future<Output = Result<Response, InvocationError>> + Send>>;

/// Innermost service: drives the invocation through its handler chain.
///
/// Never fails on its own; chain failures arrive as error responses.
#[derive(Debug, Clone, Copy, Default)]
pub struct InvocationDispatcher;

impl Service<Invocation> for InvocationDispatcher {
    type Response = Response;
    type Error = InvocationError;
    type Future = DispatchFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, invocation: Invocation) -> Self::Future {
        Box::pin(async move { Ok(run_chain(invocation).await) })
    }
}
