//! Durable analysis queue backed by the `queue_entries` table.
//!
//! Delivery is at-least-once: an entry is only removed from circulation when
//! its handler finishes, fails terminally, or the entry is cancelled.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::backoff::RetryPolicy;
use super::types::{
    AnalysisPayload, EnqueueOptions, FailOutcome, QueueEntry, QueueHealth, QueueStats,
};
use super::QueueError;
use crate::config::QueueConfig;
use crate::db::{queue_repo, Database, DatabaseError};
use crate::worker::{HandlerError, JobHandler, WorkerPool};

/// An entry handed to a worker together with its cancellation token.
pub struct ClaimedEntry {
    pub entry: QueueEntry,
    pub token: CancellationToken,
}

pub struct AnalysisQueue {
    db: Database,
    policy: RetryPolicy,
    failed_threshold: u64,
    active_threshold: u64,
    idle_poll: Duration,
    notify: Notify,
    closed: AtomicBool,
    aborting: AtomicBool,
    in_flight: Mutex<HashMap<String, CancellationToken>>,
}

impl AnalysisQueue {
    pub fn new(db: Database, config: &QueueConfig) -> Self {
        Self {
            db,
            policy: RetryPolicy::from_config(config),
            failed_threshold: config.failed_threshold,
            active_threshold: config.active_threshold,
            idle_poll: config.idle_poll(),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            aborting: AtomicBool::new(false),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    fn tokens(&self) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ensure_open(&self) -> Result<(), QueueError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::Unavailable("queue is closed".to_string()));
        }
        Ok(())
    }

    /// Adds one entry keyed by `job_id`.
    ///
    /// Fails with `Duplicate` while a waiting, delayed or active entry holds
    /// the key. A completed or failed entry is replaced.
    pub fn enqueue(
        &self,
        job_id: &str,
        payload: &AnalysisPayload,
        options: EnqueueOptions,
    ) -> Result<(), QueueError> {
        self.ensure_open()?;

        let payload_json = serde_json::to_string(payload)
            .map_err(|e| QueueError::Unavailable(format!("unserializable payload: {}", e)))?;
        let delay = options.delay.unwrap_or_default();
        let available_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());

        let inserted = queue_repo::insert(
            &self.db,
            job_id,
            &payload_json,
            options.priority,
            self.policy.max_attempts,
            available_at,
        )
        .map_err(unavailable)?;
        if !inserted {
            return Err(QueueError::Duplicate(job_id.to_string()));
        }

        debug!(
            "Enqueued job {} (priority {}, delay {:?})",
            job_id, options.priority, delay
        );
        self.notify.notify_one();
        Ok(())
    }

    /// Removes the entry and signals its worker, if any. Idempotent.
    ///
    /// Returns whether a waiting, delayed or active entry was removed.
    pub fn cancel(&self, job_id: &str) -> Result<bool, QueueError> {
        let live = match queue_repo::find(&self.db, job_id)? {
            Some(row) => matches!(row.state.as_str(), "waiting" | "active"),
            None => false,
        };
        queue_repo::delete(&self.db, job_id)?;

        if let Some(token) = self.tokens().remove(job_id) {
            token.cancel();
            debug!("Signalled cancellation to worker holding job {}", job_id);
        }

        Ok(live)
    }

    pub fn get(&self, job_id: &str) -> Result<Option<QueueEntry>, QueueError> {
        queue_repo::find(&self.db, job_id)?
            .map(|row| QueueEntry::from_row(row, Utc::now()))
            .transpose()
    }

    pub fn stats(&self) -> Result<QueueStats, QueueError> {
        let counts = queue_repo::counts(&self.db, Utc::now()).map_err(unavailable)?;
        Ok(counts.into())
    }

    /// Unhealthy when failed or active counts reach their thresholds.
    pub fn health(&self) -> Result<QueueHealth, QueueError> {
        let stats = self.stats()?;
        let mut reasons = Vec::new();
        if stats.failed >= self.failed_threshold {
            reasons.push(format!(
                "{} failed entries (threshold {})",
                stats.failed, self.failed_threshold
            ));
        }
        if stats.active >= self.active_threshold {
            reasons.push(format!(
                "{} active entries (threshold {})",
                stats.active, self.active_threshold
            ));
        }
        if self.is_closed() {
            reasons.push("queue is closed".to_string());
        }

        Ok(QueueHealth {
            healthy: reasons.is_empty(),
            reasons,
            stats,
        })
    }

    /// Claims the next due entry. Returns `None` when idle or closed.
    pub fn claim(&self) -> Result<Option<ClaimedEntry>, QueueError> {
        if self.is_closed() {
            return Ok(None);
        }

        let now = Utc::now();
        let Some(row) = queue_repo::claim_next(&self.db, now)? else {
            return Ok(None);
        };
        let job_id = row.job_id.clone();

        let entry = match QueueEntry::from_row(row, now) {
            Ok(entry) => entry,
            Err(e) => {
                // An undecodable entry can never succeed.
                queue_repo::mark_failed(&self.db, &job_id, &e.to_string())?;
                return Err(e);
            }
        };

        let token = CancellationToken::new();
        self.tokens().insert(job_id, token.clone());
        Ok(Some(ClaimedEntry { entry, token }))
    }

    /// Acknowledges a finished entry.
    pub fn complete(&self, job_id: &str) -> Result<(), QueueError> {
        self.tokens().remove(job_id);
        if !queue_repo::mark_completed(&self.db, job_id)? {
            debug!("Job {} left the queue before completion was recorded", job_id);
        }
        Ok(())
    }

    /// Records a handler failure, scheduling a retry when the policy allows.
    pub fn fail(&self, entry: &QueueEntry, error: &HandlerError) -> Result<FailOutcome, QueueError> {
        self.tokens().remove(&entry.job_id);
        let job_id = entry.job_id.as_str();

        if error.retryable && self.policy.should_retry(entry.attempts) {
            let delay = self.policy.delay_for(entry.attempts);
            let available_at = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            if !queue_repo::schedule_retry(&self.db, job_id, available_at, &error.message)? {
                return Ok(FailOutcome::Removed);
            }
            info!(
                "Job {} failed attempt {}/{}; retrying in {:?}: {}",
                job_id, entry.attempts, entry.max_attempts, delay, error.message
            );
            return Ok(FailOutcome::Retrying { delay });
        }

        if !queue_repo::mark_failed(&self.db, job_id, &error.message)? {
            return Ok(FailOutcome::Removed);
        }

        if error.retryable {
            warn!(
                "Job {} exhausted {} attempts: {}",
                job_id, entry.attempts, error.message
            );
            Ok(FailOutcome::Exhausted)
        } else {
            warn!("Job {} failed permanently: {}", job_id, error.message);
            Ok(FailOutcome::Rejected)
        }
    }

    /// Job ids of entries currently marked active.
    pub fn active_job_ids(&self) -> Result<Vec<String>, QueueError> {
        Ok(queue_repo::list_active(&self.db)?)
    }

    /// Returns entries a dead process left active to `waiting`.
    pub fn recover_stalled(&self) -> Result<usize, QueueError> {
        let recovered = queue_repo::reset_active(&self.db)?;
        if recovered > 0 {
            info!("Recovered {} stalled queue entries", recovered);
            self.notify.notify_waiters();
        }
        Ok(recovered)
    }

    /// Deletes completed entries older than `older_than`.
    pub fn prune_finished(&self, older_than: Duration) -> Result<usize, QueueError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than).unwrap_or_else(|_| chrono::Duration::zero());
        Ok(queue_repo::prune_completed(&self.db, cutoff)?)
    }

    /// Stops accepting and handing out work.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!("Analysis queue closed");
        }
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Fires the token of every in-flight job.
    ///
    /// Unlike `cancel`, the jobs themselves stay live: handlers seeing
    /// `is_aborting` hand them back for another attempt.
    pub fn cancel_in_flight(&self) {
        self.aborting.store(true, Ordering::Release);
        for (job_id, token) in self.tokens().drain() {
            debug!("Aborting in-flight job {}", job_id);
            token.cancel();
        }
    }

    /// Whether in-flight jobs were interrupted by a worker pool abort.
    pub fn is_aborting(&self) -> bool {
        self.aborting.load(Ordering::Acquire)
    }

    /// Sleeps until an enqueue wakes us or the idle tick elapses.
    pub async fn wait_for_work(&self) {
        tokio::select! {
            _ = self.notify.notified() => {}
            _ = tokio::time::sleep(self.idle_poll) => {}
        }
    }

    /// Starts `concurrency` workers pulling from this queue.
    pub fn consume(self: &Arc<Self>, handler: Arc<dyn JobHandler>, concurrency: usize) -> WorkerPool {
        WorkerPool::start(Arc::clone(self), handler, concurrency)
    }
}

fn unavailable(e: DatabaseError) -> QueueError {
    QueueError::Unavailable(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::EntryState;

    fn test_queue() -> AnalysisQueue {
        let config = QueueConfig {
            backoff_base_ms: 10,
            ..Default::default()
        };
        AnalysisQueue::new(Database::open_in_memory().unwrap(), &config)
    }

    fn payload() -> AnalysisPayload {
        AnalysisPayload {
            video_id: "video-1".to_string(),
            confidence_threshold: 0.7,
            frame_interval: 1,
        }
    }

    #[test]
    fn test_enqueue_and_claim() {
        let queue = test_queue();
        queue
            .enqueue("job-1", &payload(), EnqueueOptions::default())
            .unwrap();

        let claimed = queue.claim().unwrap().unwrap();
        assert_eq!(claimed.entry.job_id, "job-1");
        assert_eq!(claimed.entry.payload, payload());
        assert_eq!(claimed.entry.state, EntryState::Active);
        assert_eq!(claimed.entry.attempts, 1);
        assert!(queue.claim().unwrap().is_none());
    }

    #[test]
    fn test_duplicate_enqueue_is_rejected() {
        let queue = test_queue();
        queue
            .enqueue("job-1", &payload(), EnqueueOptions::default())
            .unwrap();
        let err = queue
            .enqueue("job-1", &payload(), EnqueueOptions::default())
            .unwrap_err();
        assert!(matches!(err, QueueError::Duplicate(id) if id == "job-1"));
        assert_eq!(queue.stats().unwrap().waiting, 1);
    }

    #[test]
    fn test_delayed_entry_reports_delayed() {
        let queue = test_queue();
        queue
            .enqueue(
                "job-1",
                &payload(),
                EnqueueOptions {
                    priority: 0,
                    delay: Some(Duration::from_secs(60)),
                },
            )
            .unwrap();

        assert!(queue.claim().unwrap().is_none());
        assert_eq!(queue.get("job-1").unwrap().unwrap().state, EntryState::Delayed);
        let stats = queue.stats().unwrap();
        assert_eq!(stats.delayed, 1);
        assert_eq!(stats.waiting, 0);
    }

    #[test]
    fn test_retryable_failure_backs_off_then_exhausts() {
        let queue = test_queue();
        queue
            .enqueue("job-1", &payload(), EnqueueOptions::default())
            .unwrap();
        let err = HandlerError::retryable("engine unreachable");

        let first = queue.claim().unwrap().unwrap();
        assert_eq!(
            queue.fail(&first.entry, &err).unwrap(),
            FailOutcome::Retrying {
                delay: Duration::from_millis(10)
            }
        );

        std::thread::sleep(Duration::from_millis(20));
        let second = queue.claim().unwrap().unwrap();
        assert_eq!(second.entry.attempts, 2);
        assert_eq!(second.entry.last_error.as_deref(), Some("engine unreachable"));
        assert_eq!(
            queue.fail(&second.entry, &err).unwrap(),
            FailOutcome::Retrying {
                delay: Duration::from_millis(20)
            }
        );

        std::thread::sleep(Duration::from_millis(30));
        let third = queue.claim().unwrap().unwrap();
        assert_eq!(third.entry.attempts, 3);
        assert_eq!(queue.fail(&third.entry, &err).unwrap(), FailOutcome::Exhausted);

        let entry = queue.get("job-1").unwrap().unwrap();
        assert_eq!(entry.state, EntryState::Failed);
        assert_eq!(queue.stats().unwrap().failed, 1);
    }

    #[test]
    fn test_non_retryable_failure_fails_immediately() {
        let queue = test_queue();
        queue
            .enqueue("job-1", &payload(), EnqueueOptions::default())
            .unwrap();
        let claimed = queue.claim().unwrap().unwrap();

        let outcome = queue
            .fail(&claimed.entry, &HandlerError::fatal("remote analysis failed"))
            .unwrap();
        assert_eq!(outcome, FailOutcome::Rejected);
        assert_eq!(queue.get("job-1").unwrap().unwrap().state, EntryState::Failed);
    }

    #[test]
    fn test_failed_entry_can_be_requeued() {
        let queue = test_queue();
        queue
            .enqueue("job-1", &payload(), EnqueueOptions::default())
            .unwrap();
        let claimed = queue.claim().unwrap().unwrap();
        queue
            .fail(&claimed.entry, &HandlerError::fatal("nope"))
            .unwrap();

        queue
            .enqueue("job-1", &payload(), EnqueueOptions::default())
            .unwrap();
        let again = queue.claim().unwrap().unwrap();
        assert_eq!(again.entry.attempts, 1);
    }

    #[test]
    fn test_cancel_active_fires_token_and_is_idempotent() {
        let queue = test_queue();
        queue
            .enqueue("job-1", &payload(), EnqueueOptions::default())
            .unwrap();
        let claimed = queue.claim().unwrap().unwrap();

        assert!(queue.cancel("job-1").unwrap());
        assert!(claimed.token.is_cancelled());
        assert!(queue.get("job-1").unwrap().is_none());

        assert!(!queue.cancel("job-1").unwrap());
        assert_eq!(
            queue
                .fail(&claimed.entry, &HandlerError::retryable("late"))
                .unwrap(),
            FailOutcome::Removed
        );
    }

    #[test]
    fn test_abort_keeps_entry_but_fires_token() {
        let queue = test_queue();
        queue
            .enqueue("job-1", &payload(), EnqueueOptions::default())
            .unwrap();
        let claimed = queue.claim().unwrap().unwrap();

        assert!(!queue.is_aborting());
        queue.cancel("job-2").unwrap();
        assert!(!queue.is_aborting());

        queue.cancel_in_flight();
        assert!(queue.is_aborting());
        assert!(claimed.token.is_cancelled());
        assert_eq!(queue.get("job-1").unwrap().unwrap().state, EntryState::Active);
    }

    #[test]
    fn test_cancel_waiting_entry() {
        let queue = test_queue();
        queue
            .enqueue("job-1", &payload(), EnqueueOptions::default())
            .unwrap();
        assert!(queue.cancel("job-1").unwrap());
        assert!(queue.claim().unwrap().is_none());
    }

    #[test]
    fn test_health_thresholds() {
        let config = QueueConfig {
            failed_threshold: 2,
            active_threshold: 1,
            ..Default::default()
        };
        let queue = AnalysisQueue::new(Database::open_in_memory().unwrap(), &config);
        assert!(queue.health().unwrap().healthy);

        for id in ["a", "b", "c"] {
            queue.enqueue(id, &payload(), EnqueueOptions::default()).unwrap();
        }
        for _ in 0..2 {
            let claimed = queue.claim().unwrap().unwrap();
            queue.fail(&claimed.entry, &HandlerError::fatal("x")).unwrap();
        }
        let health = queue.health().unwrap();
        assert!(!health.healthy);
        assert_eq!(health.reasons.len(), 1);
        assert_eq!(health.stats.failed, 2);

        queue.claim().unwrap().unwrap();
        assert_eq!(queue.health().unwrap().reasons.len(), 2);
    }

    #[test]
    fn test_closed_queue_rejects_and_stops_claiming() {
        let queue = test_queue();
        queue
            .enqueue("job-1", &payload(), EnqueueOptions::default())
            .unwrap();
        queue.close();

        let err = queue
            .enqueue("job-2", &payload(), EnqueueOptions::default())
            .unwrap_err();
        assert!(matches!(err, QueueError::Unavailable(_)));
        assert!(queue.claim().unwrap().is_none());
        assert!(!queue.health().unwrap().healthy);
    }

    #[test]
    fn test_recover_stalled_returns_active_entries() {
        let queue = test_queue();
        queue
            .enqueue("job-1", &payload(), EnqueueOptions::default())
            .unwrap();
        queue.claim().unwrap().unwrap();
        assert_eq!(queue.active_job_ids().unwrap(), vec!["job-1".to_string()]);

        assert_eq!(queue.recover_stalled().unwrap(), 1);
        let again = queue.claim().unwrap().unwrap();
        assert_eq!(again.entry.attempts, 2);
    }

    #[tokio::test]
    async fn test_wait_for_work_wakes_on_enqueue() {
        let queue = Arc::new(AnalysisQueue::new(
            Database::open_in_memory().unwrap(),
            &QueueConfig {
                idle_poll_ms: 60_000,
                ..Default::default()
            },
        ));
        queue
            .enqueue("job-1", &payload(), EnqueueOptions::default())
            .unwrap();

        // The permit stored by enqueue completes the wait immediately.
        tokio::time::timeout(Duration::from_secs(1), queue.wait_for_work())
            .await
            .unwrap();
    }
}
