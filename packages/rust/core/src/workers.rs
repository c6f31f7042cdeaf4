//! Bounded worker pool for batch runs.
//!
//! [`WorkerPool::submit_batch`] runs one task per work item with at most
//! `workers` in flight and streams results back in completion order. On
//! cancellation it stops starting items, gives in-flight items a grace
//! period to finish, and then aborts them; aborting drops their futures, so
//! any session lease they hold goes back to the pool.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use dealdriver_shared::{DealDriverError, Result, WorkItem};

/// One finished (or cancelled) item.
#[derive(Debug)]
pub struct BatchEvent<T> {
    pub item: WorkItem,
    pub result: Result<T>,
    /// Items reported so far, including this one.
    pub completed: usize,
    pub total: usize,
}

/// Completion-ordered results of a batch.
pub struct BatchStream<T> {
    rx: mpsc::Receiver<BatchEvent<T>>,
    driver: JoinHandle<()>,
}

impl<T> BatchStream<T> {
    /// Next result, or `None` once every item has been reported.
    pub async fn next(&mut self) -> Option<BatchEvent<T>> {
        self.rx.recv().await
    }

    /// Drain the stream.
    pub async fn collect(mut self) -> Vec<BatchEvent<T>> {
        let mut events = Vec::new();
        while let Some(event) = self.next().await {
            events.push(event);
        }
        events
    }
}

impl<T> Drop for BatchStream<T> {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

/// Runs per-item tasks with bounded concurrency.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    workers: usize,
    grace_period: Duration,
}

impl WorkerPool {
    pub fn new(workers: usize, grace_period: Duration) -> Self {
        Self {
            workers: workers.max(1),
            grace_period,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run `task` for every item. Results arrive in completion order; items
    /// that never started or were abandoned after the grace period are
    /// reported with [`DealDriverError::Cancelled`].
    pub fn submit_batch<T, F, Fut>(
        &self,
        items: Vec<WorkItem>,
        cancel: CancellationToken,
        task: F,
    ) -> BatchStream<T>
    where
        T: Send + 'static,
        F: Fn(WorkItem, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(self.workers * 2);
        let driver = Driver {
            workers: self.workers,
            grace_period: self.grace_period,
            total: items.len(),
            completed: 0,
            tx,
        };
        let handle = tokio::spawn(driver.run(items, cancel, Arc::new(task)));
        BatchStream { rx, driver: handle }
    }
}

struct Driver<T> {
    workers: usize,
    grace_period: Duration,
    total: usize,
    completed: usize,
    tx: mpsc::Sender<BatchEvent<T>>,
}

impl<T: Send + 'static> Driver<T> {
    async fn run<F, Fut>(mut self, items: Vec<WorkItem>, cancel: CancellationToken, task: Arc<F>)
    where
        F: Fn(WorkItem, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let mut pending = items.into_iter();
        let mut running = JoinSet::new();
        let mut in_flight = HashMap::new();

        loop {
            while running.len() < self.workers && !cancel.is_cancelled() {
                let Some(item) = pending.next() else { break };
                let task = task.clone();
                let token = cancel.clone();
                let run_item = item.clone();
                let handle = running.spawn(async move { task(run_item, token).await });
                in_flight.insert(handle.id(), item);
            }
            if running.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(joined) = running.join_next_with_id() => {
                    self.finish(joined, &mut in_flight).await;
                }
            }
        }

        if !cancel.is_cancelled() {
            return;
        }

        // Grace period for in-flight items, then abandon the rest.
        if !running.is_empty() {
            debug!(in_flight = running.len(), grace = ?self.grace_period, "waiting for in-flight items");
            let deadline = tokio::time::Instant::now() + self.grace_period;
            loop {
                match tokio::time::timeout_at(deadline, running.join_next_with_id()).await {
                    Ok(Some(joined)) => self.finish(joined, &mut in_flight).await,
                    Ok(None) => break,
                    Err(_) => {
                        warn!(abandoned = running.len(), "grace period elapsed, abandoning items");
                        break;
                    }
                }
            }
            running.shutdown().await;
        }

        let abandoned: Vec<WorkItem> = in_flight.into_values().collect();
        for item in abandoned.into_iter().chain(pending) {
            self.emit(item, Err(DealDriverError::Cancelled)).await;
        }
    }

    async fn finish(
        &mut self,
        joined: std::result::Result<(tokio::task::Id, Result<T>), tokio::task::JoinError>,
        in_flight: &mut HashMap<tokio::task::Id, WorkItem>,
    ) {
        let (id, result) = match joined {
            Ok((id, result)) => (id, result),
            Err(e) => {
                let id = e.id();
                let result = if e.is_cancelled() {
                    Err(DealDriverError::Cancelled)
                } else {
                    Err(DealDriverError::Storage(format!("worker task panicked: {e}")))
                };
                (id, result)
            }
        };
        if let Some(item) = in_flight.remove(&id) {
            self.emit(item, result).await;
        }
    }

    async fn emit(&mut self, item: WorkItem, result: Result<T>) {
        self.completed += 1;
        let event = BatchEvent {
            item,
            result,
            completed: self.completed,
            total: self.total,
        };
        // A dropped receiver means nobody is listening anymore.
        let _ = self.tx.send(event).await;
    }
}
