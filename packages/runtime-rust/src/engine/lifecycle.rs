//! Lifecycle events and the listeners that observe them.
//!
//! Startup events go through [`ListenerRegistry::broadcast_unsafe`]: the
//! first listener error aborts the boot. Close events go through
//! [`ListenerRegistry::broadcast_safe`]: errors are logged and every
//! listener still runs.

use std::fmt;
use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, error};

use super::Engine;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    BeforeFilter,
    AfterFilter,
    BeforeProducerProvider,
    AfterProducerProvider,
    BeforeConsumerProvider,
    AfterConsumerProvider,
    BeforeTransport,
    AfterTransport,
    BeforeRegistry,
    AfterRegistry,
    BeforeClose,
    AfterClose,
}

impl LifecycleEvent {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BeforeFilter => "BEFORE_FILTER",
            Self::AfterFilter => "AFTER_FILTER",
            Self::BeforeProducerProvider => "BEFORE_PRODUCER_PROVIDER",
            Self::AfterProducerProvider => "AFTER_PRODUCER_PROVIDER",
            Self::BeforeConsumerProvider => "BEFORE_CONSUMER_PROVIDER",
            Self::AfterConsumerProvider => "AFTER_CONSUMER_PROVIDER",
            Self::BeforeTransport => "BEFORE_TRANSPORT",
            Self::AfterTransport => "AFTER_TRANSPORT",
            Self::BeforeRegistry => "BEFORE_REGISTRY",
            Self::AfterRegistry => "AFTER_REGISTRY",
            Self::BeforeClose => "BEFORE_CLOSE",
            Self::AfterClose => "AFTER_CLOSE",
        }
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observes engine lifecycle events.
#[async_trait]
pub trait LifecycleListener: Send + Sync + 'static {
    /// Lower runs first. Ties keep registration order.
    fn order(&self) -> i32 {
        0
    }

    fn name(&self) -> &str;

    async fn on_event(&self, event: LifecycleEvent, engine: &Engine) -> anyhow::Result<()>;
}

#[derive(Default)]
pub struct ListenerRegistry {
    listeners: RwLock<Vec<Arc<dyn LifecycleListener>>>,
}

impl ListenerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<dyn LifecycleListener>) {
        let mut listeners = self.listeners.write();
        listeners.push(listener);
        // Stable: equal orders stay in registration order.
        listeners.sort_by_key(|l| l.order());
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    fn snapshot(&self) -> Vec<Arc<dyn LifecycleListener>> {
        self.listeners.read().clone()
    }

    /// Delivers `event` in order, stopping at the first failure.
    ///
    /// # Errors
    ///
    /// The failing listener's error, with its name and the event attached.
    pub async fn broadcast_unsafe(&self, event: LifecycleEvent, engine: &Engine) -> anyhow::Result<()> {
        debug!(event = %event, "lifecycle event");
        for listener in self.snapshot() {
            listener
                .on_event(event, engine)
                .await
                .with_context(|| format!("listener {} failed on {event}", listener.name()))?;
        }
        Ok(())
    }

    /// Delivers `event` to every listener, logging failures.
    pub async fn broadcast_safe(&self, event: LifecycleEvent, engine: &Engine) {
        debug!(event = %event, "lifecycle event");
        for listener in self.snapshot() {
            if let Err(e) = listener.on_event(event, engine).await {
                error!(
                    listener = listener.name(),
                    event = %event,
                    error = %format!("{e:#}"),
                    "lifecycle listener failed"
                );
            }
        }
    }
}
