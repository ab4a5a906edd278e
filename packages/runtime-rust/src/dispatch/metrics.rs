//! Metrics middleware for invocations.
//!
//! Wraps each invocation in an `invocation` span that records duration and
//! outcome, and feeds the `meshrpc_invocations_total` counter and
//! `meshrpc_invocation_duration_seconds` histogram.

use std::task::{Context, Poll};
use std::time::Instant;

use tower::{Layer, Service};
use tracing::{info_span, Instrument};

use super::DispatchFuture;
use crate::invocation::{Invocation, InvocationError, Response};

#[derive(Debug, Clone, Copy)]
pub struct MetricsLayer;

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService { inner }
    }
}

#[derive(Debug, Clone)]
pub struct MetricsService<S> {
    inner: S,
}

impl<S> Service<Invocation> for MetricsService<S>
where
    S: Service<Invocation, Response = Response, Error = InvocationError> + Send,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = InvocationError;
    type Future = DispatchFuture;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, invocation: Invocation) -> Self::Future {
        let kind = invocation.kind().as_str();
        let span = info_span!(
            "invocation",
            invocation_id = invocation.id(),
            kind,
            operation = %invocation.operation().qualified_name(),
            trace_id = invocation.trace_id().unwrap_or_default(),
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        let fut = self.inner.call(invocation);

        Box::pin(
            async move {
                let start = Instant::now();
                let result = fut.await;
                let elapsed = start.elapsed();

                let outcome = match &result {
                    Ok(response) if response.is_ok() => "ok",
                    Ok(_) => "error",
                    Err(_) => "rejected",
                };

                #[allow(clippy::cast_possible_truncation)]
                let duration_ms = elapsed.as_millis() as u64;
                tracing::Span::current().record("duration_ms", duration_ms);
                tracing::Span::current().record("outcome", outcome);
                tracing::debug!(duration_ms, outcome, "invocation complete");

                metrics::counter!("meshrpc_invocations_total", "kind" => kind, "outcome" => outcome)
                    .increment(1);
                metrics::histogram!("meshrpc_invocation_duration_seconds", "kind" => kind)
                    .record(elapsed.as_secs_f64());

                result
            }
            .instrument(span),
        )
    }
}
