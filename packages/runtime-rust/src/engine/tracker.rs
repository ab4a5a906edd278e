//! In-flight invocation accounting for the shutdown drain.
//!
//! Every invocation holds an [`InvocationGuard`] from creation until its
//! response is recorded. The guard counts the invocation as finished when
//! dropped, so a caller that abandons its future still lets the drain end.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

#[derive(Debug, Default)]
struct Counters {
    started: AtomicU64,
    finished: AtomicU64,
}

#[derive(Debug, Clone, Default)]
pub struct InvocationTracker {
    counters: Arc<Counters>,
}

impl InvocationTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one invocation as started until the guard is dropped.
    #[must_use]
    pub fn track(&self) -> InvocationGuard {
        self.counters.started.fetch_add(1, Ordering::AcqRel);
        InvocationGuard {
            counters: Arc::clone(&self.counters),
        }
    }

    #[must_use]
    pub fn started(&self) -> u64 {
        self.counters.started.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn finished(&self) -> u64 {
        self.counters.finished.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn in_flight(&self) -> u64 {
        // Read finished first so a concurrent finish can't make this negative.
        let finished = self.finished();
        self.started().saturating_sub(finished)
    }

    /// Polls every `poll` until nothing is in flight, giving up after
    /// `timeout`. Returns `true` if everything finished.
    pub async fn wait_for_drain(&self, timeout: Duration, poll: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let in_flight = self.in_flight();
            if in_flight == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    in_flight,
                    timeout_ms = timeout.as_millis(),
                    "invocations still running after drain timeout; closing anyway"
                );
                return false;
            }
            info!(in_flight, "waiting for invocations to finish");
            tokio::time::sleep(poll.max(Duration::from_millis(1))).await;
        }
    }
}

/// Marks its invocation finished when dropped.
#[derive(Debug)]
pub struct InvocationGuard {
    counters: Arc<Counters>,
}

impl Drop for InvocationGuard {
    fn drop(&mut self) {
        self.counters.finished.fetch_add(1, Ordering::AcqRel);
    }
}
