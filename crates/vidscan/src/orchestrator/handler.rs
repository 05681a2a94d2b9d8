//! Queue handler that carries one analysis through the remote engine.

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;

use super::poller::{PollError, PollOutcome, Poller};
use super::service::Inner;
use crate::broadcast::AnalysisPhase;
use crate::db::{analysis_repo, video_repo};
use crate::engine::{RemoteAnalysis, StartRequest};
use crate::model::{Analysis, AnalysisStatus, Detection};
use crate::queue::QueueEntry;
use crate::storage::StorageError;
use crate::worker::{HandlerError, JobHandler};

/// Executes queued analyses.
///
/// Failures before the engine accepted the task are handed back to the queue
/// for retry. Once a remote task exists its failures are final and recorded
/// on the job here.
pub struct AnalysisHandler {
    inner: Arc<Inner>,
    poller: Poller,
}

impl AnalysisHandler {
    pub(crate) fn new(inner: Arc<Inner>) -> Self {
        let poller = Poller::new(Arc::clone(&inner.engine), inner.db.clone(), &inner.polling);
        Self { inner, poller }
    }

    /// Puts an interrupted job back to `pending` and asks for a retry.
    fn revert(&self, job_id: &str, message: String) -> HandlerError {
        match analysis_repo::requeue_interrupted(&self.inner.db, job_id) {
            Ok(true) => self.inner.refresh_progress_cache(job_id),
            Ok(false) => {}
            Err(e) => warn!("Failed to revert analysis {} to pending: {}", job_id, e),
        }
        HandlerError::retryable(message)
    }

    fn fail(&self, analysis: &Analysis, message: &str) -> HandlerError {
        self.inner.fail_job(&analysis.id, &analysis.video_id, message);
        HandlerError::fatal(message)
    }

    async fn start_remote(&self, analysis: &Analysis) -> Result<String, HandlerError> {
        let video = match video_repo::find_by_id(&self.inner.db, &analysis.video_id) {
            Ok(Some(video)) => video,
            Ok(None) => {
                return Err(self.fail(
                    analysis,
                    &format!("video '{}' not found", analysis.video_id),
                ))
            }
            Err(e) => return Err(self.revert(&analysis.id, format!("failed to load video: {}", e))),
        };

        let video_location = match self.inner.locator.locate(&video).await {
            Ok(location) => location,
            Err(e @ StorageError::InvalidKey { .. }) => {
                return Err(self.fail(analysis, &e.to_string()));
            }
            Err(e) => return Err(self.revert(&analysis.id, e.to_string())),
        };

        let request = StartRequest {
            video_location,
            confidence_threshold: analysis.confidence_threshold,
            frame_interval: analysis.frame_interval,
        };
        self.inner.engine.start_analysis(&request).await.map_err(|e| {
            self.revert(
                &analysis.id,
                format!("failed to start remote analysis: {}", e),
            )
        })
    }

    fn finish(&self, analysis: &Analysis, remote: RemoteAnalysis) -> Result<(), HandlerError> {
        let detections: Vec<Detection> = remote
            .detections
            .unwrap_or_default()
            .into_iter()
            .map(Detection::from)
            .collect();
        if let Some(reason) = detections.iter().find_map(|d| d.validate().err()) {
            return Err(self.fail(
                analysis,
                &format!("engine returned an invalid detection: {}", reason),
            ));
        }

        let total_frames = remote.total_frames.unwrap_or(0);
        let violent_frames = remote
            .violent_frames
            .unwrap_or(detections.len() as u64);

        match analysis_repo::complete_with_detections(
            &self.inner.db,
            &analysis.id,
            total_frames,
            violent_frames,
            &detections,
        ) {
            Ok(true) => {
                info!(
                    "Analysis {} completed with {} detections",
                    analysis.id,
                    detections.len()
                );
                self.inner.refresh_progress_cache(&analysis.id);
                self.inner.cache_result(&analysis.id);
                self.inner
                    .progress
                    .tracker(&analysis.id, &analysis.video_id)
                    .completed(detections.len());
                Ok(())
            }
            Ok(false) => {
                debug!(
                    "Analysis {} left processing before its result arrived; discarding",
                    analysis.id
                );
                Ok(())
            }
            // The next attempt finds the job still processing and starts over.
            Err(e) => Err(HandlerError::retryable(format!(
                "failed to store result: {}",
                e
            ))),
        }
    }
}

#[async_trait]
impl JobHandler for AnalysisHandler {
    async fn handle(
        &self,
        entry: &QueueEntry,
        cancel: CancellationToken,
    ) -> Result<(), HandlerError> {
        let db = &self.inner.db;
        let job_id = entry.job_id.as_str();

        let analysis = match analysis_repo::find_by_id(db, job_id) {
            Ok(Some(analysis)) => analysis,
            Ok(None) => {
                debug!("Analysis {} no longer exists; dropping entry", job_id);
                return Ok(());
            }
            Err(e) => return Err(HandlerError::retryable(e.to_string())),
        };

        match analysis.status {
            AnalysisStatus::Pending => {}
            AnalysisStatus::Processing => {
                // Redelivery after an attempt that died mid-flight.
                if let Some(remote_id) = analysis.remote_id.as_deref() {
                    self.inner.spawn_remote_stop(remote_id);
                }
                analysis_repo::requeue_interrupted(db, job_id)
                    .map_err(|e| HandlerError::retryable(e.to_string()))?;
            }
            status => {
                debug!("Analysis {} is {}; nothing to run", job_id, status);
                return Ok(());
            }
        }

        match analysis_repo::mark_processing(db, job_id) {
            Ok(true) => {}
            Ok(false) => {
                debug!("Analysis {} left pending before it could start", job_id);
                return Ok(());
            }
            Err(e) => return Err(HandlerError::retryable(e.to_string())),
        }
        self.inner.refresh_progress_cache(job_id);
        let tracker = self.inner.progress.tracker(job_id, &analysis.video_id);
        tracker.update_phase(AnalysisPhase::Starting, 0, "Starting remote analysis");

        let remote_id = self.start_remote(&analysis).await?;

        match analysis_repo::set_remote_id(db, job_id, &remote_id) {
            Ok(true) => {}
            Ok(false) => {
                debug!(
                    "Analysis {} was stopped while starting; stopping remote task {}",
                    job_id, remote_id
                );
                self.inner.spawn_remote_stop(&remote_id);
                return Ok(());
            }
            Err(e) => {
                self.inner.spawn_remote_stop(&remote_id);
                return Err(self.revert(job_id, format!("failed to record remote task: {}", e)));
            }
        }
        info!("Analysis {} running as remote task {}", job_id, remote_id);
        tracker.update_phase(AnalysisPhase::Analyzing, 0, "Analysis started");

        let outcome = self
            .poller
            .run(job_id, &remote_id, &cancel, |progress| {
                self.inner.refresh_progress_cache(job_id);
                tracker.progress(progress);
            })
            .await;

        match outcome {
            Ok(PollOutcome::Completed(remote)) => self.finish(&analysis, remote),
            Ok(PollOutcome::Abandoned) => {
                self.inner.spawn_remote_stop(&remote_id);
                if !self.inner.queue.is_aborting() {
                    // Stopped or deleted; the job already left processing.
                    return Ok(());
                }
                match analysis_repo::status_of(db, job_id) {
                    Ok(Some(AnalysisStatus::Processing)) => {
                        Err(self.revert(job_id, "worker stopped while polling".to_string()))
                    }
                    _ => Ok(()),
                }
            }
            Err(PollError::Store(e)) => {
                // Local write failed; retry with a fresh remote task.
                self.inner.spawn_remote_stop(&remote_id);
                Err(self.revert(job_id, format!("failed to record progress: {}", e)))
            }
            Err(e) => Err(self.fail(&analysis, &e.to_string())),
        }
    }

    async fn on_exhausted(&self, entry: &QueueEntry, error: &HandlerError) {
        self.inner
            .fail_job(&entry.job_id, &entry.payload.video_id, &error.message);
    }
}
