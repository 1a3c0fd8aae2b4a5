//! Worker pool draining the shared work queue
//!
//! Each worker pops one key at a time and hands it to the translator. The queue
//! guarantees a key is never in flight on two workers at once.

use crate::apis::ingress::caches::Caches;
use crate::apis::ingress::translator::Translator;
use crate::apis::metrics;
use crate::controller::queue::WorkQueue;
use crate::error::ControllerError;
use common::WorkKey;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// One queue consumer
#[derive(Clone)]
pub struct Worker {
    id: usize,
    queue: Arc<WorkQueue<String>>,
    translator: Translator,
    requeue_limit: u32,
}

impl Worker {
    pub fn new(
        id: usize,
        queue: Arc<WorkQueue<String>>,
        translator: Translator,
        requeue_limit: u32,
    ) -> Self {
        Self {
            id,
            queue,
            translator,
            requeue_limit,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Process items until the queue shuts down
    pub async fn run(self) {
        debug!(worker = self.id, "Worker started");
        while self.process_next().await {}
        debug!(worker = self.id, "Worker stopped");
    }

    /// Handle one item; false once the queue is shut down
    pub async fn process_next(&self) -> bool {
        let Some(raw) = self.queue.get().await else {
            return false;
        };
        self.process(&raw).await;
        self.queue.done(&raw);
        true
    }

    async fn process(&self, raw: &str) {
        let raw_key = raw.to_string();
        let work: WorkKey = match raw.parse() {
            Ok(work) => work,
            Err(e) => {
                error!(worker = self.id, "Dropping malformed key '{}': {}", raw, e);
                self.queue.forget(&raw_key);
                metrics::record_requeue("dropped");
                return;
            }
        };

        let started = Instant::now();
        let result = self
            .translator
            .handle_resource(work.kind, &work.key)
            .await;
        let elapsed = started.elapsed().as_secs_f64();

        match result {
            Ok(()) => {
                self.queue.forget(&raw_key);
                metrics::record_reconciliation(work.kind.as_str(), elapsed, "success");
            }
            Err(e) => {
                metrics::record_reconciliation(work.kind.as_str(), elapsed, "error");
                let requeues = self.queue.num_requeues(&raw_key);
                if requeues < self.requeue_limit {
                    warn!(
                        worker = self.id,
                        "Error handling {} (retry {}/{}): {}",
                        raw,
                        requeues + 1,
                        self.requeue_limit,
                        e
                    );
                    self.queue.add_rate_limited(raw_key);
                    metrics::record_requeue("retried");
                } else {
                    error!(
                        worker = self.id,
                        "Dropping {} after {} retries: {}", raw, requeues, e
                    );
                    self.queue.forget(&raw_key);
                    metrics::record_requeue("dropped");
                }
            }
        }
    }
}

/// Fixed-size pool of workers
pub struct WorkerPool {
    queue: Arc<WorkQueue<String>>,
    translator: Translator,
    caches: Caches,
    workers: usize,
    requeue_limit: u32,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<WorkQueue<String>>,
        translator: Translator,
        caches: Caches,
        workers: usize,
        requeue_limit: u32,
    ) -> Self {
        Self {
            queue,
            translator,
            caches,
            workers,
            requeue_limit,
        }
    }

    /// Wait for cache sync, then run the workers until shutdown
    ///
    /// A cache sync failure is returned and must stop the process.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), ControllerError> {
        if !self.caches.wait_for_cache_sync(&shutdown).await? {
            info!("Shutdown before caches synced");
            self.queue.shut_down();
            return Ok(());
        }

        info!("Starting {} worker(s)", self.workers);
        let handles: Vec<_> = (0..self.workers)
            .map(|id| {
                let worker = Worker::new(
                    id,
                    Arc::clone(&self.queue),
                    self.translator.clone(),
                    self.requeue_limit,
                );
                tokio::spawn(worker.run())
            })
            .collect();

        shutdown.cancelled().await;
        info!("Shutting down work queue");
        self.queue.shut_down();

        for result in join_all(handles).await {
            if let Err(e) = result {
                error!("Worker task failed: {}", e);
            }
        }
        Ok(())
    }
}
