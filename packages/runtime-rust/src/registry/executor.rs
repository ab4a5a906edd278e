//! Sequenced registry mutations.
//!
//! Every change to the store goes through one [`BackgroundWorker`]: peer
//! messages, self registration and the dead-instance sweep are applied
//! strictly one at a time in submission order, so handlers never see a
//! half-applied update. Reads bypass the executor entirely.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use meshrpc_core::{MessageType, MicroserviceInfo, RegistryMessage};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

use super::store_service::StoreService;
use super::RegistryError;
use crate::handler::panic_message;
use crate::worker::{BackgroundRunnable, BackgroundWorker};

// ---------------------------------------------------------------------------
// MessageHandler
// ---------------------------------------------------------------------------

/// Applies one message type to the store.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(
        &self,
        service: &mut StoreService,
        message: RegistryMessage,
    ) -> Result<(), RegistryError>;
}

pub struct RegisterHandler;

#[async_trait]
impl MessageHandler for RegisterHandler {
    async fn handle(
        &self,
        service: &mut StoreService,
        message: RegistryMessage,
    ) -> Result<(), RegistryError> {
        let RegistryMessage::Register(request) = message else {
            return Err(RegistryError::NoHandler(message.message_type()));
        };
        service.register(&request).await.map(|_| ())
    }
}

pub struct UnregisterHandler;

#[async_trait]
impl MessageHandler for UnregisterHandler {
    async fn handle(
        &self,
        service: &mut StoreService,
        message: RegistryMessage,
    ) -> Result<(), RegistryError> {
        let RegistryMessage::Unregister(request) = message else {
            return Err(RegistryError::NoHandler(message.message_type()));
        };
        service.unregister(&request);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

type Reply<T> = oneshot::Sender<T>;

pub enum RegistryTask {
    Message {
        message: RegistryMessage,
        reply: Option<Reply<Result<(), RegistryError>>>,
    },
    RegisterSelf {
        info: Box<MicroserviceInfo>,
        schemas_summary: String,
        reply: Reply<bool>,
    },
    SweepDeadInstances {
        timeout: Duration,
        reply: Reply<usize>,
    },
}

pub struct RegistryRunnable {
    service: StoreService,
    handlers: HashMap<MessageType, Arc<dyn MessageHandler>>,
}

#[async_trait]
impl BackgroundRunnable for RegistryRunnable {
    type Task = RegistryTask;

    async fn run(&mut self, task: RegistryTask) {
        match task {
            RegistryTask::Message { message, reply } => {
                let message_type = message.message_type();
                let instance_id = message.instance_id().to_string();
                let result = match self.handlers.get(&message_type).cloned() {
                    Some(handler) => {
                        // A panicking handler fails its message, not the task.
                        AssertUnwindSafe(handler.handle(&mut self.service, message))
                            .catch_unwind()
                            .await
                            .unwrap_or_else(|panic| {
                                Err(RegistryError::HandlerPanicked {
                                    message_type,
                                    message: panic_message(panic.as_ref()),
                                })
                            })
                    }
                    None => Err(RegistryError::NoHandler(message_type)),
                };
                if let Err(e) = &result {
                    warn!(
                        message_type = %message_type,
                        instance_id = %instance_id,
                        error = %e,
                        "registry message rejected"
                    );
                }
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            RegistryTask::RegisterSelf {
                info,
                schemas_summary,
                reply,
            } => {
                let stored = self.service.register_self(&info, &schemas_summary);
                let _ = reply.send(stored.is_some());
            }
            RegistryTask::SweepDeadInstances { timeout, reply } => {
                let removed = self.service.delete_dead_instances(timeout);
                if !removed.is_empty() {
                    debug!(count = removed.len(), "swept dead instances");
                }
                let _ = reply.send(removed.len());
            }
        }
    }

    async fn shutdown(&mut self) {
        debug!("registry executor stopped");
    }
}

// ---------------------------------------------------------------------------
// MessageExecutor
// ---------------------------------------------------------------------------

pub struct MessageExecutorBuilder {
    service: StoreService,
    handlers: HashMap<MessageType, Arc<dyn MessageHandler>>,
}

impl MessageExecutorBuilder {
    /// Routes `message_type` to `handler`, replacing any earlier one.
    #[must_use]
    pub fn handler(mut self, message_type: MessageType, handler: impl MessageHandler) -> Self {
        self.handlers.insert(message_type, Arc::new(handler));
        self
    }

    /// `REGISTER` and `UNREGISTER` handlers.
    #[must_use]
    pub fn with_default_handlers(self) -> Self {
        self.handler(MessageType::Register, RegisterHandler)
            .handler(MessageType::Unregister, UnregisterHandler)
    }

    /// Spawns the executor. Must be called from within a tokio runtime.
    #[must_use]
    pub fn start(self, capacity: usize) -> MessageExecutor {
        let runnable = RegistryRunnable {
            service: self.service,
            handlers: self.handlers,
        };
        let worker = BackgroundWorker::start(runnable, capacity, None);
        MessageExecutor {
            worker: Mutex::new(Some(worker)),
        }
    }
}

/// Handle to the registry's single mutation task.
pub struct MessageExecutor {
    worker: Mutex<Option<BackgroundWorker<RegistryRunnable>>>,
}

impl MessageExecutor {
    #[must_use]
    pub fn builder(service: StoreService) -> MessageExecutorBuilder {
        MessageExecutorBuilder {
            service,
            handlers: HashMap::new(),
        }
    }

    async fn send(&self, task: RegistryTask) -> Result<(), RegistryError> {
        let tx = self
            .worker
            .lock()
            .await
            .as_ref()
            .and_then(BackgroundWorker::sender)
            .ok_or(RegistryError::ExecutorStopped)?;
        tx.send(task)
            .await
            .map_err(|_| RegistryError::ExecutorStopped)
    }

    /// Queues a message without waiting for it to be applied.
    ///
    /// # Errors
    ///
    /// `ExecutorStopped` if the executor is gone.
    pub async fn submit(&self, message: RegistryMessage) -> Result<(), RegistryError> {
        self.send(RegistryTask::Message {
            message,
            reply: None,
        })
        .await
    }

    /// Queues a message and waits for the outcome of applying it.
    ///
    /// # Errors
    ///
    /// The handler's error, `NoHandler` for an unrouted message type, or
    /// `ExecutorStopped`.
    pub async fn execute(&self, message: RegistryMessage) -> Result<(), RegistryError> {
        let (reply, rx) = oneshot::channel();
        self.send(RegistryTask::Message {
            message,
            reply: Some(reply),
        })
        .await?;
        rx.await.map_err(|_| RegistryError::ExecutorStopped)?
    }

    /// Records this process's own instance. Returns `false` if the store
    /// refused it.
    ///
    /// # Errors
    ///
    /// `ExecutorStopped` if the executor is gone.
    pub async fn register_self(
        &self,
        info: MicroserviceInfo,
        schemas_summary: String,
    ) -> Result<bool, RegistryError> {
        let (reply, rx) = oneshot::channel();
        self.send(RegistryTask::RegisterSelf {
            info: Box::new(info),
            schemas_summary,
            reply,
        })
        .await?;
        rx.await.map_err(|_| RegistryError::ExecutorStopped)
    }

    /// Evicts instances silent for longer than `timeout`; returns how many.
    ///
    /// # Errors
    ///
    /// `ExecutorStopped` if the executor is gone.
    pub async fn sweep(&self, timeout: Duration) -> Result<usize, RegistryError> {
        let (reply, rx) = oneshot::channel();
        self.send(RegistryTask::SweepDeadInstances { timeout, reply })
            .await?;
        rx.await.map_err(|_| RegistryError::ExecutorStopped)
    }

    pub async fn is_running(&self) -> bool {
        self.worker
            .lock()
            .await
            .as_ref()
            .is_some_and(BackgroundWorker::is_running)
    }

    /// Stops the worker. Queued tasks are dropped and their callers see
    /// `ExecutorStopped`.
    pub async fn stop(&self) {
        if let Some(mut worker) = self.worker.lock().await.take() {
            worker.stop().await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
