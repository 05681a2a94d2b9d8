use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::future::join_all;
use futures_util::FutureExt;
use log::{debug, error, info, warn};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::queue::{AnalysisQueue, ClaimedEntry, FailOutcome};
use crate::worker::handler::{HandlerError, JobHandler};

pub struct WorkerPool {
    queue: Arc<AnalysisQueue>,
    workers: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl WorkerPool {
    /// Spawns `worker_count` tokio tasks that pull from `queue`.
    ///
    /// A `worker_count` of 0 is treated as 1. Must be called inside a tokio runtime.
    pub fn start(
        queue: Arc<AnalysisQueue>,
        handler: Arc<dyn JobHandler>,
        worker_count: usize,
    ) -> Self {
        let worker_count = worker_count.max(1);
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(worker_count);

        for worker_id in 0..worker_count {
            let worker_queue = Arc::clone(&queue);
            let worker_handler = Arc::clone(&handler);
            let shutdown_flag = Arc::clone(&shutdown);

            let handle = tokio::spawn(async move {
                run_worker(worker_id, worker_queue, worker_handler, shutdown_flag).await;
            });

            workers.push(handle);
        }

        info!("Started {} workers", worker_count);

        Self {
            queue,
            workers,
            shutdown,
        }
    }

    /// Stops claiming new entries. In-flight jobs run to completion.
    pub fn shutdown(&self) {
        info!("Shutting down worker pool...");
        self.shutdown.store(true, Ordering::Release);
    }

    /// Stops claiming and signals every in-flight job to cancel.
    pub fn abort(&self) {
        self.shutdown();
        self.queue.cancel_in_flight();
    }

    pub async fn wait(self) {
        let results = join_all(self.workers).await;

        for (i, result) in results.into_iter().enumerate() {
            if let Err(e) = result {
                error!("Worker {} panicked: {:?}", i, e);
            } else {
                debug!("Worker {} finished", i);
            }
        }

        info!("All workers have stopped");
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }
}

async fn run_worker(
    worker_id: usize,
    queue: Arc<AnalysisQueue>,
    handler: Arc<dyn JobHandler>,
    shutdown: Arc<AtomicBool>,
) {
    debug!("Worker {} started", worker_id);

    loop {
        if shutdown.load(Ordering::Acquire) {
            debug!("Worker {} received shutdown signal", worker_id);
            break;
        }

        match queue.claim() {
            Ok(Some(claimed)) => {
                run_job(worker_id, &queue, handler.as_ref(), claimed).await;
            }
            Ok(None) => {
                if queue.is_closed() {
                    debug!("Worker {} sees a closed queue", worker_id);
                    break;
                }
                queue.wait_for_work().await;
            }
            Err(e) => {
                error!("Worker {} failed to claim work: {}", worker_id, e);
                queue.wait_for_work().await;
            }
        }
    }

    debug!("Worker {} stopped", worker_id);
}

async fn run_job(
    worker_id: usize,
    queue: &AnalysisQueue,
    handler: &dyn JobHandler,
    claimed: ClaimedEntry,
) {
    let ClaimedEntry { entry, token } = claimed;
    let span = tracing::info_span!(
        "analysis",
        job_id = %entry.job_id,
        attempt = entry.attempts,
        worker = worker_id
    );

    debug!(
        "Worker {} processing job {} (attempt {}/{})",
        worker_id, entry.job_id, entry.attempts, entry.max_attempts
    );

    let outcome = AssertUnwindSafe(handler.handle(&entry, token))
        .catch_unwind()
        .instrument(span.clone())
        .await;

    let failure = match outcome {
        Ok(Ok(())) => {
            if let Err(e) = queue.complete(&entry.job_id) {
                error!("Failed to acknowledge job {}: {}", entry.job_id, e);
            }
            return;
        }
        Ok(Err(e)) => e,
        Err(panic) => {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            HandlerError::retryable(format!("handler panicked: {}", reason))
        }
    };

    match queue.fail(&entry, &failure) {
        Ok(FailOutcome::Exhausted) => {
            handler
                .on_exhausted(&entry, &failure)
                .instrument(span)
                .await;
        }
        Ok(FailOutcome::Removed) => {
            debug!("Job {} was cancelled while running", entry.job_id);
        }
        Ok(FailOutcome::Retrying { .. }) | Ok(FailOutcome::Rejected) => {}
        Err(e) => {
            warn!("Failed to record failure of job {}: {}", entry.job_id, e);
        }
    }
}
