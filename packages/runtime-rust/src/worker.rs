//! Background worker for sequential and periodic tasks.
//!
//! A `BackgroundWorker<R>` owns a single tokio task that processes tasks
//! from an mpsc channel one at a time through a `BackgroundRunnable`, with
//! an optional periodic tick. Everything the runnable owns is therefore
//! touched by exactly one task.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

// ---------------------------------------------------------------------------
// BackgroundRunnable trait
// ---------------------------------------------------------------------------

/// Task handler executed by `BackgroundWorker`.
#[async_trait]
pub trait BackgroundRunnable: Send + 'static {
    /// The type of task this runnable processes.
    type Task: Send + 'static;

    /// Process a single task.
    async fn run(&mut self, task: Self::Task);

    /// Called on each tick interval. Default is a no-op.
    async fn on_tick(&mut self) {}

    /// Called once when the worker is shutting down. Default is a no-op.
    async fn shutdown(&mut self) {}
}

// ---------------------------------------------------------------------------
// BackgroundWorker
// ---------------------------------------------------------------------------

/// Handle to a running background worker.
///
/// The spawned task:
/// 1. Receives tasks on the mpsc channel and runs them in arrival order
/// 2. Calls `on_tick()` at the configured interval, if any
/// 3. Calls `shutdown()` when stopped or when every sender is dropped
pub struct BackgroundWorker<R: BackgroundRunnable> {
    tx: Option<mpsc::Sender<R::Task>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl<R: BackgroundRunnable> BackgroundWorker<R> {
    /// Spawns the worker task. Must be called from within a tokio runtime.
    ///
    /// With `tick_interval` set, the first tick fires one interval after
    /// start, not immediately.
    pub fn start(mut runnable: R, capacity: usize, tick_interval: Option<Duration>) -> Self {
        let (tx, mut rx) = mpsc::channel::<R::Task>(capacity.max(1));
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let ticking = tick_interval.is_some();
            let mut ticker =
                tokio::time::interval(tick_interval.unwrap_or(Duration::from_secs(3600)));
            // Skip the first immediate tick so on_tick doesn't fire at startup.
            ticker.tick().await;

            loop {
                tokio::select! {
                    task = rx.recv() => {
                        match task {
                            Some(t) => runnable.run(t).await,
                            None => break, // Every sender dropped.
                        }
                    }
                    _ = ticker.tick(), if ticking => {
                        runnable.on_tick().await;
                    }
                    _ = &mut shutdown_rx => {
                        break;
                    }
                }
            }

            runnable.shutdown().await;
        });

        Self {
            tx: Some(tx),
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    /// Submit a task to the worker, waiting for queue capacity.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker has been stopped.
    pub async fn submit(&self, task: R::Task) -> anyhow::Result<()> {
        match &self.tx {
            Some(tx) => tx
                .send(task)
                .await
                .map_err(|_| anyhow::anyhow!("worker channel closed")),
            None => Err(anyhow::anyhow!("worker not running")),
        }
    }

    /// A sender that feeds this worker, for handles that outlive `&self`.
    #[must_use]
    pub fn sender(&self) -> Option<mpsc::Sender<R::Task>> {
        self.tx.clone()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the worker, waiting for the current task and `shutdown()` to
    /// complete. Tasks still queued are dropped.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    struct CountingRunnable {
        run_count: Arc<AtomicU32>,
        tick_count: Arc<AtomicU32>,
        shutdown_called: Arc<AtomicU32>,
        seen: Arc<parking_lot::Mutex<Vec<u32>>>,
    }

    impl CountingRunnable {
        fn new() -> Self {
            Self {
                run_count: Arc::new(AtomicU32::new(0)),
                tick_count: Arc::new(AtomicU32::new(0)),
                shutdown_called: Arc::new(AtomicU32::new(0)),
                seen: Arc::new(parking_lot::Mutex::new(Vec::new())),
            }
        }
    }

    #[async_trait]
    impl BackgroundRunnable for CountingRunnable {
        type Task = u32;

        async fn run(&mut self, task: u32) {
            // Yield mid-task: a second task must still not interleave.
            tokio::task::yield_now().await;
            self.seen.lock().push(task);
            self.run_count.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_tick(&mut self) {
            self.tick_count.fetch_add(1, Ordering::SeqCst);
        }

        async fn shutdown(&mut self) {
            self.shutdown_called.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn tasks_run_in_submission_order() {
        let runnable = CountingRunnable::new();
        let seen = runnable.seen.clone();
        let shutdown_called = runnable.shutdown_called.clone();

        let mut worker = BackgroundWorker::start(runnable, 16, None);
        for i in 0..10 {
            worker.submit(i).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*seen.lock(), (0..10).collect::<Vec<_>>());

        worker.stop().await;
        assert_eq!(shutdown_called.load(Ordering::SeqCst), 1);
        assert!(!worker.is_running());
    }

    #[tokio::test]
    async fn tick_fires_periodically() {
        let runnable = CountingRunnable::new();
        let tick_count = runnable.tick_count.clone();

        let mut worker = BackgroundWorker::start(runnable, 16, Some(Duration::from_millis(20)));
        tokio::time::sleep(Duration::from_millis(100)).await;
        worker.stop().await;

        assert!(tick_count.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn no_ticks_without_interval() {
        let runnable = CountingRunnable::new();
        let tick_count = runnable.tick_count.clone();

        let mut worker = BackgroundWorker::start(runnable, 16, None);
        tokio::time::sleep(Duration::from_millis(50)).await;
        worker.stop().await;

        assert_eq!(tick_count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn submit_after_stop_returns_error() {
        let mut worker = BackgroundWorker::start(CountingRunnable::new(), 16, None);
        let sender = worker.sender().unwrap();
        worker.stop().await;

        assert!(worker.submit(1).await.is_err());
        assert!(sender.send(2).await.is_err());
    }

    #[tokio::test]
    async fn dropping_every_sender_ends_the_worker() {
        let runnable = CountingRunnable::new();
        let shutdown_called = runnable.shutdown_called.clone();
        let worker = BackgroundWorker::start(runnable, 16, None);
        let BackgroundWorker { tx, handle, .. } = worker;
        drop(tx);
        handle.unwrap().await.unwrap();
        assert_eq!(shutdown_called.load(Ordering::SeqCst), 1);
    }
}
