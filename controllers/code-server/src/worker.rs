//! Reconcile worker pool.
//!
//! `max_concurrency` workers drain the shared work queue. Failed reconciles
//! are re-queued with exponential backoff per key. Once a key has failed
//! `max_reconcile_retries` times in a row the failure is recorded on its
//! status; retries continue at the backoff ceiling until one succeeds.

use crate::backoff::ExponentialBackoff;
use crate::config::Options;
use crate::error::ControllerError;
use crate::reconciler::{ReconcileOutcome, Reconciler};
use crate::request::{ReconcileReason, ReconcileRequest, ResourceKey};
use crate::workqueue::WorkQueue;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

pub type RequestQueue = WorkQueue<ResourceKey, ReconcileRequest>;

/// Fixed-size pool of reconcile workers.
pub struct WorkerPool {
    queue: Arc<RequestQueue>,
    reconciler: Arc<Reconciler>,
    options: Arc<Options>,
    /// Consecutive failures per resource
    backoffs: Mutex<HashMap<ResourceKey, ExponentialBackoff>>,
}

impl WorkerPool {
    pub fn new(queue: Arc<RequestQueue>, reconciler: Arc<Reconciler>, options: Arc<Options>) -> Self {
        Self {
            queue,
            reconciler,
            options,
            backoffs: Mutex::new(HashMap::new()),
        }
    }

    /// Run the workers until the queue shuts down; in-flight reconciles finish first.
    pub async fn run(self: Arc<Self>) {
        let mut workers = JoinSet::new();
        for id in 0..self.options.max_concurrency {
            let pool = Arc::clone(&self);
            workers.spawn(async move { pool.work(id).await });
        }
        info!("Started {} reconcile workers", self.options.max_concurrency);

        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                error!("Reconcile worker panicked: {}", e);
            }
        }
        info!("Reconcile workers stopped");
    }

    async fn work(&self, id: usize) {
        while let Some((key, request)) = self.queue.next().await {
            debug!("Worker {} picked up {} ({})", id, key, request.reason);
            self.process(&key, request).await;
            self.queue.done(&key);
        }
    }

    async fn process(&self, key: &ResourceKey, request: ReconcileRequest) {
        match self.reconciler.reconcile(&request).await {
            Ok(outcome) => {
                self.reset_backoff(key);
                if let ReconcileOutcome::RequeueAfter(delay) = outcome {
                    debug!("Requeueing {} in {:?}", key, delay);
                    self.queue
                        .add_after(key.clone(), ReconcileRequest::new(key.clone(), ReconcileReason::Retry), delay);
                }
            }
            Err(e) => self.handle_error(key, &request, e).await,
        }
    }

    async fn handle_error(&self, key: &ResourceKey, request: &ReconcileRequest, err: ControllerError) {
        let transient = err.is_transient();
        let (delay, attempts) = {
            let mut backoffs = self.backoffs.lock().unwrap_or_else(|e| e.into_inner());
            let backoff = backoffs
                .entry(key.clone())
                .or_insert_with(|| ExponentialBackoff::new(self.options.backoff_min, self.options.backoff_max));
            (backoff.next_backoff(), backoff.attempts())
        };

        // A permanent error will not clear on its own; retry it only at the ceiling.
        let (delay, exhausted) = if transient {
            (delay, attempts == self.options.max_reconcile_retries)
        } else {
            (self.options.backoff_max, attempts == 1)
        };

        if exhausted {
            error!(
                "Reconcile of {} failed {} times ({}): {}",
                key, attempts, request.reason, err
            );
            self.record_exhaustion(key, attempts, &err).await;
        } else {
            warn!(
                "Reconcile of {} failed (attempt {}, {}): {}",
                key, attempts, request.reason, err
            );
        }

        debug!("Retrying {} in {:?}", key, delay);
        self.queue.add_after(key.clone(), request.retry(), delay);
    }

    async fn record_exhaustion(&self, key: &ResourceKey, attempts: u32, err: &ControllerError) {
        if let Err(e) = self.reconciler.record_exhaustion(key, attempts, err).await {
            warn!("Failed to record reconcile failure on {}: {}", key, e);
        }
    }

    fn reset_backoff(&self, key: &ResourceKey) {
        self.backoffs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }

    #[cfg(test)]
    fn error_count(&self, key: &ResourceKey) -> u32 {
        self.backoffs
            .lock()
            .unwrap()
            .get(key)
            .map_or(0, ExponentialBackoff::attempts)
    }
}
