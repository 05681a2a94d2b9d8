//! Public face of the orchestration core: admission, stop, retry, delete and
//! read-side queries over analyses.
//!
//! Every status change goes through a guarded store transition, so concurrent
//! callers and workers can only ever win or lose a race, never corrupt a job.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::broadcast::JobProgressBroadcaster;
use crate::cache::{self, ResultCache};
use crate::config::{AnalysisDefaults, CacheConfig, Config, PollingConfig};
use crate::db::analysis_repo::{self, AnalysisFilter};
use crate::db::{detection_repo, video_repo, Database, DatabaseError};
use crate::engine::AnalysisEngine;
use crate::error::AnalysisError;
use crate::model::{Analysis, AnalysisStatus, Detection};
use crate::orchestrator::handler::AnalysisHandler;
use crate::queue::{
    AnalysisPayload, AnalysisQueue, EnqueueOptions, QueueError, QueueHealth, QueueStats,
};
use crate::storage::VideoLocator;
use crate::worker::WorkerPool;

/// Caller-supplied parameters for a new analysis. Unset values use the
/// configured defaults.
#[derive(Debug, Clone, Default)]
pub struct AnalysisOptions {
    pub confidence_threshold: Option<f64>,
    pub frame_interval: Option<u32>,
    /// Higher runs first.
    pub priority: i32,
    /// Keeps the job out of the workers' reach for this long.
    pub delay: Option<Duration>,
}

/// Result of an admission request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Admission {
    pub job_id: String,
    pub status: AnalysisStatus,
    /// False when an existing live job for the video was returned.
    pub created: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisSummary {
    pub detection_count: usize,
    pub max_confidence: Option<f64>,
    pub average_confidence: Option<f64>,
    /// `violent_frames / total_frames` once both are known.
    pub violent_frame_ratio: Option<f64>,
}

impl AnalysisSummary {
    pub fn from_parts(analysis: &Analysis, detections: &[Detection]) -> Self {
        let detection_count = detections.len();
        let max_confidence = detections
            .iter()
            .map(|d| d.confidence_score)
            .fold(None, |max: Option<f64>, c| Some(max.map_or(c, |m| m.max(c))));
        let average_confidence = (detection_count > 0).then(|| {
            detections.iter().map(|d| d.confidence_score).sum::<f64>() / detection_count as f64
        });
        let violent_frame_ratio = match (analysis.total_frames, analysis.violent_frames) {
            (Some(total), Some(violent)) if total > 0 => Some(violent as f64 / total as f64),
            _ => None,
        };

        Self {
            detection_count,
            max_confidence,
            average_confidence,
            violent_frame_ratio,
        }
    }
}

/// A job with its detections and a summary of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisReport {
    pub analysis: Analysis,
    pub detections: Vec<Detection>,
    pub summary: AnalysisSummary,
}

/// Lightweight status view served from the cache when possible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub analysis_id: String,
    pub status: AnalysisStatus,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Analysis> for ProgressSnapshot {
    fn from(analysis: &Analysis) -> Self {
        Self {
            analysis_id: analysis.id.clone(),
            status: analysis.status,
            progress: analysis.progress,
            error_message: analysis.error_message.clone(),
            updated_at: analysis.updated_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub healthy: bool,
    pub database: bool,
    pub engine: bool,
    pub queue: Option<QueueHealth>,
    pub reasons: Vec<String>,
}

/// Summary of startup recovery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Interrupted jobs put back in line.
    pub requeued: usize,
    /// Processing jobs with no queue entry, now failed.
    pub failed: usize,
    /// Pending jobs that had lost their queue entry.
    pub reenqueued: usize,
}

/// State shared between the public API and the queue handler.
pub(crate) struct Inner {
    pub(crate) db: Database,
    pub(crate) queue: Arc<AnalysisQueue>,
    pub(crate) engine: Arc<dyn AnalysisEngine>,
    pub(crate) locator: Arc<dyn VideoLocator>,
    pub(crate) cache: Arc<dyn ResultCache>,
    pub(crate) progress: JobProgressBroadcaster,
    pub(crate) polling: PollingConfig,
    pub(crate) cache_config: CacheConfig,
    pub(crate) defaults: AnalysisDefaults,
}

impl Inner {
    /// Rewrites the cached progress snapshot from the store.
    pub(crate) fn refresh_progress_cache(&self, job_id: &str) {
        let key = cache::progress_key(job_id);
        match analysis_repo::find_by_id(&self.db, job_id) {
            Ok(Some(analysis)) => match serde_json::to_value(ProgressSnapshot::from(&analysis)) {
                Ok(value) => self.cache.set(&key, value, self.cache_config.progress_ttl()),
                Err(e) => warn!("Failed to serialize progress of {}: {}", job_id, e),
            },
            Ok(None) => self.cache.delete(&key),
            Err(e) => {
                // A stale snapshot is worse than a miss.
                self.cache.delete(&key);
                warn!("Failed to refresh progress cache for {}: {}", job_id, e);
            }
        }
    }

    pub(crate) fn load_report(&self, job_id: &str) -> Result<Option<AnalysisReport>, DatabaseError> {
        let Some(analysis) = analysis_repo::find_by_id(&self.db, job_id)? else {
            return Ok(None);
        };
        let detections = detection_repo::list_for_analysis(&self.db, job_id)?;
        let summary = AnalysisSummary::from_parts(&analysis, &detections);
        Ok(Some(AnalysisReport {
            analysis,
            detections,
            summary,
        }))
    }

    pub(crate) fn cache_result(&self, job_id: &str) {
        match self.load_report(job_id) {
            Ok(Some(report)) => match serde_json::to_value(&report) {
                Ok(value) => self.cache.set(
                    &cache::result_key(job_id),
                    value,
                    self.cache_config.result_ttl(),
                ),
                Err(e) => warn!("Failed to serialize result of {}: {}", job_id, e),
            },
            Ok(None) => {}
            Err(e) => warn!("Failed to cache result of {}: {}", job_id, e),
        }
    }

    /// Marks a live job failed and publishes the change. Returns whether it moved.
    pub(crate) fn fail_job(&self, job_id: &str, video_id: &str, message: &str) -> bool {
        match analysis_repo::mark_failed(&self.db, job_id, message) {
            Ok(true) => {
                info!("Analysis {} failed: {}", job_id, message);
                self.refresh_progress_cache(job_id);
                self.progress.tracker(job_id, video_id).failed(message);
                true
            }
            Ok(false) => {
                debug!("Analysis {} was no longer live when failing it", job_id);
                false
            }
            Err(e) => {
                warn!("Failed to mark analysis {} failed: {}", job_id, e);
                false
            }
        }
    }

    /// Asks the engine to stop a remote task without waiting for the answer.
    pub(crate) fn spawn_remote_stop(&self, remote_id: &str) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("No runtime to stop remote task {}; leaving it", remote_id);
            return;
        };
        let engine = Arc::clone(&self.engine);
        let remote_id = remote_id.to_string();
        runtime.spawn(async move {
            if let Err(e) = engine.stop_analysis(&remote_id).await {
                debug!("Remote stop of {} failed: {}", remote_id, e);
            }
        });
    }

    pub(crate) fn enqueue(&self, analysis: &Analysis, delay: Option<Duration>) -> Result<(), QueueError> {
        let payload = AnalysisPayload {
            video_id: analysis.video_id.clone(),
            confidence_threshold: analysis.confidence_threshold,
            frame_interval: analysis.frame_interval,
        };
        self.queue.enqueue(
            &analysis.id,
            &payload,
            EnqueueOptions {
                priority: analysis.priority,
                delay,
            },
        )
    }
}

fn queue_error(e: QueueError) -> AnalysisError {
    match e {
        QueueError::Unavailable(msg) => AnalysisError::Transport(msg),
        other => AnalysisError::Queue(other),
    }
}

/// Drives analyses from admission to a terminal state.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        db: Database,
        queue: Arc<AnalysisQueue>,
        engine: Arc<dyn AnalysisEngine>,
        locator: Arc<dyn VideoLocator>,
        cache: Arc<dyn ResultCache>,
        config: &Config,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                db,
                queue,
                engine,
                locator,
                cache,
                progress: JobProgressBroadcaster::default(),
                polling: config.polling.clone(),
                cache_config: config.cache.clone(),
                defaults: config.defaults.clone(),
            }),
        }
    }

    /// Replaces the progress broadcaster. Call before sharing the orchestrator.
    pub fn with_broadcaster(self, progress: JobProgressBroadcaster) -> Self {
        let inner = match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                inner.progress = progress;
                inner
            }
            Err(shared) => Inner {
                db: shared.db.clone(),
                queue: Arc::clone(&shared.queue),
                engine: Arc::clone(&shared.engine),
                locator: Arc::clone(&shared.locator),
                cache: Arc::clone(&shared.cache),
                progress,
                polling: shared.polling.clone(),
                cache_config: shared.cache_config.clone(),
                defaults: shared.defaults.clone(),
            },
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn broadcaster(&self) -> &JobProgressBroadcaster {
        &self.inner.progress
    }

    pub fn queue(&self) -> &Arc<AnalysisQueue> {
        &self.inner.queue
    }

    /// The queue handler that executes analyses.
    pub fn handler(&self) -> Arc<AnalysisHandler> {
        Arc::new(AnalysisHandler::new(Arc::clone(&self.inner)))
    }

    /// Starts `concurrency` workers executing queued analyses.
    pub fn start_workers(&self, concurrency: usize) -> WorkerPool {
        self.inner.queue.consume(self.handler(), concurrency)
    }

    /// Admits an analysis of `video_id`.
    ///
    /// If the video already has a pending or processing job, that job is
    /// returned with `created == false` and nothing is written.
    pub fn start_analysis(
        &self,
        video_id: &str,
        options: AnalysisOptions,
    ) -> Result<Admission, AnalysisError> {
        let threshold = options
            .confidence_threshold
            .unwrap_or(self.inner.defaults.confidence_threshold);
        if !threshold.is_finite() || !(0.0..=1.0).contains(&threshold) {
            return Err(AnalysisError::Validation(format!(
                "confidence threshold must be within [0, 1], got {}",
                threshold
            )));
        }
        let frame_interval = options
            .frame_interval
            .unwrap_or(self.inner.defaults.frame_interval);
        if frame_interval == 0 {
            return Err(AnalysisError::Validation(
                "frame interval must be at least 1".to_string(),
            ));
        }

        let db = &self.inner.db;
        if !video_repo::exists(db, video_id)? {
            return Err(AnalysisError::not_found("video", video_id));
        }

        if let Some(existing) = analysis_repo::find_active_for_video(db, video_id)? {
            debug!(
                "Video {} already has live analysis {}",
                video_id, existing.id
            );
            return Ok(Admission {
                job_id: existing.id,
                status: existing.status,
                created: false,
            });
        }

        let analysis = Analysis::new(video_id, threshold, frame_interval, options.priority);
        match analysis_repo::insert(db, &analysis) {
            Ok(()) => {}
            Err(e) if e.is_unique_violation() => {
                // Lost the race to a concurrent admission.
                return match analysis_repo::find_active_for_video(db, video_id)? {
                    Some(existing) => Ok(Admission {
                        job_id: existing.id,
                        status: existing.status,
                        created: false,
                    }),
                    None => Err(AnalysisError::Conflict(format!(
                        "concurrent admission for video '{}'",
                        video_id
                    ))),
                };
            }
            Err(e) => return Err(e.into()),
        }

        if let Err(e) = self.inner.enqueue(&analysis, options.delay) {
            warn!(
                "Failed to enqueue analysis {}; removing the job: {}",
                analysis.id, e
            );
            if let Err(del) = analysis_repo::delete(db, &analysis.id) {
                warn!("Failed to remove unqueued analysis {}: {}", analysis.id, del);
            }
            return Err(queue_error(e));
        }

        info!(
            "Admitted analysis {} for video {} (threshold {}, interval {}, priority {})",
            analysis.id, video_id, threshold, frame_interval, options.priority
        );
        self.inner.refresh_progress_cache(&analysis.id);
        self.inner.progress.start_job(&analysis.id, video_id);

        Ok(Admission {
            job_id: analysis.id,
            status: AnalysisStatus::Pending,
            created: true,
        })
    }

    /// Cancels a pending or processing analysis.
    ///
    /// Stopping an already cancelled analysis is a no-op.
    pub fn stop_analysis(&self, job_id: &str) -> Result<Analysis, AnalysisError> {
        let db = &self.inner.db;
        let analysis = analysis_repo::find_by_id(db, job_id)?
            .ok_or_else(|| AnalysisError::not_found("analysis", job_id))?;

        match analysis.status {
            AnalysisStatus::Cancelled => return Ok(analysis),
            AnalysisStatus::Completed | AnalysisStatus::Failed => {
                return Err(AnalysisError::InvalidState {
                    id: job_id.to_string(),
                    status: analysis.status,
                    action: "stop",
                });
            }
            AnalysisStatus::Pending | AnalysisStatus::Processing => {}
        }

        // Must precede `queue.cancel`: a woken worker must not find the job processing.
        if !analysis_repo::mark_cancelled(db, job_id)? {
            let current = analysis_repo::find_by_id(db, job_id)?
                .ok_or_else(|| AnalysisError::not_found("analysis", job_id))?;
            if current.status == AnalysisStatus::Cancelled {
                return Ok(current);
            }
            return Err(AnalysisError::InvalidState {
                id: job_id.to_string(),
                status: current.status,
                action: "stop",
            });
        }

        if let Err(e) = self.inner.queue.cancel(job_id) {
            warn!("Failed to remove queue entry of {}: {}", job_id, e);
        }

        let current = analysis_repo::find_by_id(db, job_id)?
            .ok_or_else(|| AnalysisError::not_found("analysis", job_id))?;
        if let Some(remote_id) = current.remote_id.as_deref() {
            self.inner.spawn_remote_stop(remote_id);
        }

        info!("Analysis {} cancelled", job_id);
        self.inner.refresh_progress_cache(job_id);
        self.inner
            .progress
            .tracker(job_id, &current.video_id)
            .cancelled();
        Ok(current)
    }

    /// Re-runs a failed analysis from scratch with its original parameters.
    pub fn retry_analysis(&self, job_id: &str) -> Result<Analysis, AnalysisError> {
        let db = &self.inner.db;
        let analysis = analysis_repo::find_by_id(db, job_id)?
            .ok_or_else(|| AnalysisError::not_found("analysis", job_id))?;

        if analysis.status != AnalysisStatus::Failed {
            return Err(AnalysisError::InvalidState {
                id: job_id.to_string(),
                status: analysis.status,
                action: "retry",
            });
        }

        match analysis_repo::reset_for_retry(db, job_id) {
            Ok(true) => {}
            Ok(false) => {
                let status = analysis_repo::status_of(db, job_id)?
                    .ok_or_else(|| AnalysisError::not_found("analysis", job_id))?;
                return Err(AnalysisError::InvalidState {
                    id: job_id.to_string(),
                    status,
                    action: "retry",
                });
            }
            Err(e) if e.is_unique_violation() => {
                return Err(AnalysisError::Conflict(format!(
                    "video '{}' already has a live analysis",
                    analysis.video_id
                )));
            }
            Err(e) => return Err(e.into()),
        }
        self.inner.cache.delete_prefix(&cache::analysis_prefix(job_id));

        if let Err(e) = self.inner.enqueue(&analysis, None) {
            let message = analysis
                .error_message
                .clone()
                .unwrap_or_else(|| format!("retry could not be queued: {}", e));
            if let Err(restore) = analysis_repo::restore_failed(db, job_id, &message) {
                warn!("Failed to restore failed state of {}: {}", job_id, restore);
            }
            self.inner.refresh_progress_cache(job_id);
            return Err(match e {
                QueueError::Duplicate(_) => AnalysisError::Conflict(format!(
                    "previous attempt of '{}' is still finishing",
                    job_id
                )),
                other => queue_error(other),
            });
        }

        info!("Analysis {} queued for retry", job_id);
        self.inner.refresh_progress_cache(job_id);
        self.inner.progress.start_job(job_id, &analysis.video_id);

        analysis_repo::find_by_id(db, job_id)?
            .ok_or_else(|| AnalysisError::not_found("analysis", job_id))
    }

    /// Deletes an analysis and its detections, cancelling it first if live.
    pub fn delete_analysis(&self, job_id: &str) -> Result<(), AnalysisError> {
        let db = &self.inner.db;
        let analysis = analysis_repo::find_by_id(db, job_id)?
            .ok_or_else(|| AnalysisError::not_found("analysis", job_id))?;

        if analysis.status.is_active() {
            analysis_repo::mark_cancelled(db, job_id)?;
        }
        if let Err(e) = self.inner.queue.cancel(job_id) {
            warn!("Failed to remove queue entry of {}: {}", job_id, e);
        }
        if analysis.status.is_active() {
            let current = analysis_repo::find_by_id(db, job_id)?;
            if let Some(remote_id) = current.and_then(|a| a.remote_id) {
                self.inner.spawn_remote_stop(&remote_id);
            }
        }

        if !analysis_repo::delete(db, job_id)? {
            return Err(AnalysisError::not_found("analysis", job_id));
        }
        let purged = self
            .inner
            .cache
            .delete_prefix(&cache::analysis_prefix(job_id));

        info!(
            "Deleted analysis {} ({} cache entries purged)",
            job_id, purged
        );
        Ok(())
    }

    /// Loads an analysis with its detections from the store.
    pub fn get_analysis(&self, job_id: &str) -> Result<AnalysisReport, AnalysisError> {
        self.inner
            .load_report(job_id)?
            .ok_or_else(|| AnalysisError::not_found("analysis", job_id))
    }

    /// The cached final result of a completed analysis, falling back to the store.
    pub fn get_result(&self, job_id: &str) -> Result<AnalysisReport, AnalysisError> {
        if let Some(value) = self.inner.cache.get(&cache::result_key(job_id)) {
            match serde_json::from_value::<AnalysisReport>(value) {
                Ok(report) => return Ok(report),
                Err(e) => debug!("Ignoring undecodable cached result of {}: {}", job_id, e),
            }
        }
        let report = self.get_analysis(job_id)?;
        if report.analysis.status == AnalysisStatus::Completed {
            self.inner.cache_result(job_id);
        }
        Ok(report)
    }

    pub fn list_analyses(
        &self,
        filter: &AnalysisFilter,
    ) -> Result<(Vec<Analysis>, u64), AnalysisError> {
        Ok(analysis_repo::query(&self.inner.db, filter)?)
    }

    /// Current progress, served from the cache when present.
    pub fn get_progress(&self, job_id: &str) -> Result<ProgressSnapshot, AnalysisError> {
        if let Some(value) = self.inner.cache.get(&cache::progress_key(job_id)) {
            match serde_json::from_value::<ProgressSnapshot>(value) {
                Ok(snapshot) => return Ok(snapshot),
                Err(e) => debug!("Ignoring undecodable progress of {}: {}", job_id, e),
            }
        }

        let analysis = analysis_repo::find_by_id(&self.inner.db, job_id)?
            .ok_or_else(|| AnalysisError::not_found("analysis", job_id))?;
        let snapshot = ProgressSnapshot::from(&analysis);
        if let Ok(value) = serde_json::to_value(&snapshot) {
            self.inner.cache.set(
                &cache::progress_key(job_id),
                value,
                self.inner.cache_config.progress_ttl(),
            );
        }
        Ok(snapshot)
    }

    pub fn get_queue_stats(&self) -> Result<QueueStats, AnalysisError> {
        self.inner.queue.stats().map_err(queue_error)
    }

    /// Queue thresholds plus database and engine reachability.
    pub async fn get_health_status(&self) -> HealthReport {
        let mut reasons = Vec::new();

        let database = match self.inner.db.ping() {
            Ok(()) => true,
            Err(e) => {
                reasons.push(format!("database unreachable: {}", e));
                false
            }
        };

        let queue = match self.inner.queue.health() {
            Ok(health) => {
                reasons.extend(health.reasons.iter().cloned());
                Some(health)
            }
            Err(e) => {
                reasons.push(format!("queue unavailable: {}", e));
                None
            }
        };

        let engine = match self.inner.engine.ping().await {
            Ok(()) => true,
            Err(e) => {
                reasons.push(format!("engine unreachable: {}", e));
                false
            }
        };

        HealthReport {
            healthy: reasons.is_empty(),
            database,
            engine,
            queue,
            reasons,
        }
    }

    /// Repairs state left behind by a crashed worker process.
    ///
    /// Must run before workers start consuming.
    pub fn recover_interrupted(&self) -> Result<RecoveryReport, AnalysisError> {
        super::recovery::recover(&self.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analysis_with(total: Option<u64>, violent: Option<u64>) -> Analysis {
        let mut analysis = Analysis::new("v", 0.7, 1, 0);
        analysis.total_frames = total;
        analysis.violent_frames = violent;
        analysis
    }

    fn detection(confidence: f64) -> Detection {
        Detection {
            timestamp_seconds: 1.0,
            confidence_score: confidence,
            frame_number: 30,
            bounding_boxes: None,
        }
    }

    #[test]
    fn test_summary_of_detections() {
        let analysis = analysis_with(Some(200), Some(2));
        let summary =
            AnalysisSummary::from_parts(&analysis, &[detection(0.8), detection(0.9)]);

        assert_eq!(summary.detection_count, 2);
        assert_eq!(summary.max_confidence, Some(0.9));
        assert!((summary.average_confidence.unwrap() - 0.85).abs() < 1e-9);
        assert_eq!(summary.violent_frame_ratio, Some(0.01));
    }

    #[test]
    fn test_summary_without_detections() {
        let summary = AnalysisSummary::from_parts(&analysis_with(Some(0), Some(0)), &[]);
        assert_eq!(summary.detection_count, 0);
        assert!(summary.max_confidence.is_none());
        assert!(summary.average_confidence.is_none());
        assert!(summary.violent_frame_ratio.is_none());
    }

    #[test]
    fn test_queue_unavailable_maps_to_transport() {
        let err = queue_error(QueueError::Unavailable("closed".to_string()));
        assert!(matches!(err, AnalysisError::Transport(_)));
        let err = queue_error(QueueError::Duplicate("j".to_string()));
        assert!(matches!(err, AnalysisError::Queue(QueueError::Duplicate(_))));
    }
}
