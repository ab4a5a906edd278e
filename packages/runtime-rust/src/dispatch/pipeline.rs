//! Pipeline composition: combines all middleware layers into a single service stack.

use tower::ServiceBuilder;

use super::admission::AdmissionLayer;
use super::metrics::MetricsLayer;
use super::timeout::TimeoutLayer;
use super::{DispatchFuture, InvocationDispatcher};
use crate::invocation::{Invocation, InvocationError, Response};

/// Wraps the dispatcher with the middleware layers.
///
/// Layer order (outermost to innermost):
/// 1. `AdmissionLayer` -- reject when the engine is at capacity, before any work
/// 2. `TimeoutLayer` -- enforce per-invocation timeouts
/// 3. `MetricsLayer` -- record timing and outcome (closest to the chain)
///
/// `admission` is passed in rather than built here so that its slots are
/// shared by every pipeline the engine builds.
#[must_use]
pub fn build_invocation_pipeline(
    dispatcher: InvocationDispatcher,
    admission: &AdmissionLayer,
) -> impl tower::Service<Invocation, Response = Response, Error = InvocationError, Future = DispatchFuture>
       + Send {
    ServiceBuilder::new()
        .layer(admission.clone())
        .layer(TimeoutLayer)
        .layer(MetricsLayer)
        .service(dispatcher)
}
