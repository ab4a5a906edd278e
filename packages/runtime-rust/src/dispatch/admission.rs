//! Admission control for invocations.
//!
//! The engine admits at most `max_concurrent_invocations` invocations at a
//! time, producer and consumer side together. An invocation arriving over
//! the limit is answered `Overloaded` (503) straight away instead of
//! waiting; the slot is released when its dispatch future completes or is
//! dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::Semaphore;
use tower::{Layer, Service};
use tracing::warn;

use super::DispatchFuture;
use crate::invocation::{Invocation, InvocationError, Response};

#[derive(Debug)]
struct Slots {
    permits: Semaphore,
    limit: usize,
    rejected: AtomicU64,
}

/// Engine-wide invocation limit. Clones share their slots, so every
/// pipeline built from one layer counts against the same limit.
#[derive(Debug, Clone)]
pub struct AdmissionLayer {
    slots: Arc<Slots>,
}

impl AdmissionLayer {
    #[must_use]
    pub fn new(limit: usize) -> Self {
        let limit = limit.min(Semaphore::MAX_PERMITS);
        Self {
            slots: Arc::new(Slots {
                permits: Semaphore::new(limit),
                limit,
                rejected: AtomicU64::new(0),
            }),
        }
    }

    #[must_use]
    pub fn limit(&self) -> usize {
        self.slots.limit
    }

    /// Slots held by admitted invocations that have not finished yet.
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.slots
            .limit
            .saturating_sub(self.slots.permits.available_permits())
    }

    /// Invocations turned away since the engine was built.
    #[must_use]
    pub fn rejected(&self) -> u64 {
        self.slots.rejected.load(Ordering::Relaxed)
    }
}

impl<S> Layer<S> for AdmissionLayer {
    type Service = AdmissionService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AdmissionService {
            inner,
            slots: Arc::clone(&self.slots),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AdmissionService<S> {
    inner: S,
    slots: Arc<Slots>,
}

impl<S> Service<Invocation> for AdmissionService<S>
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
        let slots = Arc::clone(&self.slots);
        let Ok(slot) = slots.permits.try_acquire() else {
            let rejected = self.slots.rejected.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(
                invocation_id = invocation.id(),
                operation = %invocation.qualified_name(),
                limit = self.slots.limit,
                rejected,
                "invocation rejected, engine at capacity"
            );
            return Box::pin(async { Err(InvocationError::Overloaded) });
        };
        // The slot is returned by hand once the inner future settles.
        slot.forget();

        let release = Release(slots);
        let fut = self.inner.call(invocation);
        Box::pin(async move {
            let _release = release;
            fut.await
        })
    }
}

/// Gives one slot back when dropped, including on cancellation.
struct Release(Arc<Slots>);

impl Drop for Release {
    fn drop(&mut self) {
        self.0.permits.add_permits(1);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
