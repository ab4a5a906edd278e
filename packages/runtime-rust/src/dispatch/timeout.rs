//! Timeout middleware for invocations.
//!
//! Fails invocations that exceed their `timeout_ms` with
//! `InvocationError::Timeout`. The timed-out invocation is dropped, which
//! releases its drain guard.

use std::task::{Context, Poll};
use std::time::Duration;

use tower::{Layer, Service};

use super::DispatchFuture;
use crate::invocation::{Invocation, InvocationError, Response};

/// Reads the timeout from each invocation, so calls can differ.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutLayer;

impl<S> Layer<S> for TimeoutLayer {
    type Service = TimeoutService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TimeoutService { inner }
    }
}

#[derive(Debug, Clone)]
pub struct TimeoutService<S> {
    inner: S,
}

impl<S> Service<Invocation> for TimeoutService<S>
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
        let timeout_ms = invocation.timeout_ms();
        let fut = self.inner.call(invocation);
        Box::pin(async move {
            match tokio::time::timeout(Duration::from_millis(timeout_ms), fut).await {
                Ok(result) => result,
                Err(_elapsed) => Err(InvocationError::Timeout { timeout_ms }),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use tower::ServiceExt;

    use super::*;
    use crate::dispatch::tests::invocation;
    use crate::dispatch::InvocationDispatcher;
    use crate::engine::tracker::InvocationTracker;

    #[tokio::test]
    async fn completes_within_timeout() {
        let svc = TimeoutLayer.layer(InvocationDispatcher);
        let resp = svc
            .oneshot(invocation(Duration::from_millis(10), 1_000))
            .await
            .unwrap();
        assert_eq!(resp.into_result().unwrap(), "done");
    }

    #[tokio::test(start_paused = true)]
    async fn exceeds_timeout_returns_error_and_releases_guard() {
        let tracker = InvocationTracker::new();
        let mut slow = invocation(Duration::from_millis(200), 50);
        slow.attach_guard(tracker.track());

        let err = TimeoutLayer
            .layer(InvocationDispatcher)
            .oneshot(slow)
            .await
            .unwrap_err();
        assert_eq!(err, InvocationError::Timeout { timeout_ms: 50 });
        assert_eq!(err.status_code(), 408);
        assert_eq!(tracker.in_flight(), 0);
    }
}
