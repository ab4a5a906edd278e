//! Per-microservice chain selection.
//!
//! Chains are keyed by `(microservice, kind)`: consumer chains by the
//! target microservice, producer chains by the local one. A `Default`
//! scope entry replaces the built-in chain for every microservice without
//! its own entry.

use std::collections::HashMap;
use std::sync::Arc;

use super::{ChainBuildError, Handler, HandlerChain};
use crate::invocation::InvocationKind;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChainScope {
    Default,
    Microservice(String),
}

#[derive(Clone)]
struct ChainEntry {
    kind: InvocationKind,
    scope: ChainScope,
    handlers: Vec<Arc<dyn Handler>>,
}

/// Unvalidated chain declarations collected by the engine builder.
#[derive(Clone, Default)]
pub struct ChainConfig {
    entries: Vec<ChainEntry>,
}

impl ChainConfig {
    /// Declares the handlers for `kind` in `scope`. A later declaration for
    /// the same key replaces an earlier one.
    pub fn declare(&mut self, kind: InvocationKind, scope: ChainScope, handlers: Vec<Arc<dyn Handler>>) {
        self.entries
            .retain(|e| !(e.kind == kind && e.scope == scope));
        self.entries.push(ChainEntry {
            kind,
            scope,
            handlers,
        });
    }

    /// Validates every declared chain.
    ///
    /// `consumer_default` and `producer_default` are used for kinds that
    /// have no `Default` scope declaration.
    ///
    /// # Errors
    ///
    /// Returns the first chain that fails validation.
    pub fn build(
        &self,
        consumer_default: Vec<Arc<dyn Handler>>,
        producer_default: Vec<Arc<dyn Handler>>,
    ) -> Result<ChainSet, ChainBuildError> {
        let mut set = ChainSet {
            consumer_default: Arc::new(self.default_chain(InvocationKind::Consumer, consumer_default)?),
            producer_default: Arc::new(self.default_chain(InvocationKind::Producer, producer_default)?),
            scoped: HashMap::new(),
        };

        for entry in &self.entries {
            if let ChainScope::Microservice(name) = &entry.scope {
                let chain = HandlerChain::builder()
                    .handlers(entry.handlers.iter().cloned())
                    .build()?;
                set.scoped.insert((entry.kind, name.clone()), Arc::new(chain));
            }
        }
        Ok(set)
    }

    fn default_chain(
        &self,
        kind: InvocationKind,
        fallback: Vec<Arc<dyn Handler>>,
    ) -> Result<HandlerChain, ChainBuildError> {
        let handlers = self
            .entries
            .iter()
            .find(|e| e.kind == kind && e.scope == ChainScope::Default)
            .map_or(fallback, |e| e.handlers.clone());
        HandlerChain::builder().handlers(handlers).build()
    }
}

/// Validated chains, frozen after startup.
#[derive(Debug)]
pub struct ChainSet {
    consumer_default: Arc<HandlerChain>,
    producer_default: Arc<HandlerChain>,
    scoped: HashMap<(InvocationKind, String), Arc<HandlerChain>>,
}

impl ChainSet {
    #[must_use]
    pub fn lookup(&self, kind: InvocationKind, microservice: &str) -> Arc<HandlerChain> {
        if let Some(chain) = self.scoped.get(&(kind, microservice.to_string())) {
            return Arc::clone(chain);
        }
        match kind {
            InvocationKind::Consumer => Arc::clone(&self.consumer_default),
            InvocationKind::Producer => Arc::clone(&self.producer_default),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::tests::{Record, Terminal};

    fn terminal() -> Vec<Arc<dyn Handler>> {
        vec![Arc::new(Terminal)]
    }

    #[test]
    fn falls_back_to_builtin_defaults() {
        let set = ChainConfig::default().build(terminal(), terminal()).unwrap();
        assert_eq!(
            set.lookup(InvocationKind::Consumer, "orders").names(),
            vec!["terminal"]
        );
    }

    #[test]
    fn scoped_chain_wins_over_default() {
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut config = ChainConfig::default();
        config.declare(
            InvocationKind::Consumer,
            ChainScope::Microservice("orders".to_string()),
            vec![Arc::new(Record::new("audit", log)), Arc::new(Terminal)],
        );
        let set = config.build(terminal(), terminal()).unwrap();

        assert_eq!(
            set.lookup(InvocationKind::Consumer, "orders").names(),
            vec!["audit", "terminal"]
        );
        assert_eq!(
            set.lookup(InvocationKind::Consumer, "billing").names(),
            vec!["terminal"]
        );
        assert_eq!(
            set.lookup(InvocationKind::Producer, "orders").names(),
            vec!["terminal"]
        );
    }

    #[test]
    fn invalid_declaration_fails_the_build() {
        let mut config = ChainConfig::default();
        config.declare(InvocationKind::Producer, ChainScope::Default, Vec::new());
        assert_eq!(
            config.build(terminal(), terminal()).unwrap_err(),
            ChainBuildError::Empty
        );
    }
}
