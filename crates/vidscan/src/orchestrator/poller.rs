//! Status polling for one remote analysis task.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::PollingConfig;
use crate::db::{analysis_repo, Database, DatabaseError};
use crate::engine::{AnalysisEngine, EngineError, RemoteAnalysis, RemoteStatus};
use crate::model::AnalysisStatus;

/// How a poll loop ended without error.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// The engine reported completion.
    Completed(RemoteAnalysis),
    /// The job was cancelled, deleted or otherwise left `processing`.
    Abandoned,
}

#[derive(Error, Debug)]
pub enum PollError {
    /// The engine reported the task failed. Carries its message verbatim.
    #[error("{0}")]
    Remote(String),

    #[error("remote analysis '{0}' no longer exists")]
    NotFound(String),

    #[error("status polling failed {count} times in a row: {last}")]
    TooManyErrors { count: u32, last: String },

    #[error("analysis timed out after {0:?}")]
    TimedOut(Duration),

    #[error(transparent)]
    Store(#[from] DatabaseError),
}

/// Polls the engine on a fixed interval until the task settles.
pub struct Poller {
    engine: Arc<dyn AnalysisEngine>,
    db: Database,
    interval: Duration,
    max_errors: u32,
    max_duration: Option<Duration>,
}

impl Poller {
    pub fn new(engine: Arc<dyn AnalysisEngine>, db: Database, config: &PollingConfig) -> Self {
        Self {
            engine,
            db,
            interval: config.interval(),
            max_errors: config.max_poll_errors,
            max_duration: config.max_duration(),
        }
    }

    /// Polls `remote_id` on behalf of `job_id`.
    ///
    /// Progress increases are written to the store and reported through
    /// `on_progress`. Decreases are ignored.
    pub async fn run<F>(
        &self,
        job_id: &str,
        remote_id: &str,
        cancel: &CancellationToken,
        mut on_progress: F,
    ) -> Result<PollOutcome, PollError>
    where
        F: FnMut(u8) + Send,
    {
        let started = Instant::now();
        let mut last_progress = 0u8;
        let mut consecutive_errors = 0u32;

        loop {
            if cancel.is_cancelled() || !self.still_processing(job_id)? {
                debug!("Stopped polling {}: job is no longer processing", job_id);
                return Ok(PollOutcome::Abandoned);
            }

            match self.engine.get_status(remote_id).await {
                Ok(remote) => {
                    consecutive_errors = 0;
                    match remote.status {
                        RemoteStatus::Completed => return Ok(PollOutcome::Completed(remote)),
                        RemoteStatus::Failed => {
                            let message = remote
                                .error_message
                                .filter(|m| !m.trim().is_empty())
                                .unwrap_or_else(|| "remote analysis failed".to_string());
                            return Err(PollError::Remote(message));
                        }
                        RemoteStatus::Pending | RemoteStatus::Processing | RemoteStatus::Unknown => {
                            let progress = remote.progress();
                            if progress > last_progress {
                                last_progress = progress;
                                if analysis_repo::update_progress(&self.db, job_id, progress)? {
                                    on_progress(progress);
                                }
                            }
                        }
                    }
                }
                Err(EngineError::NotFound(id)) => return Err(PollError::NotFound(id)),
                Err(e) => {
                    consecutive_errors += 1;
                    warn!(
                        "Polling {} for job {} failed ({}/{}): {}",
                        remote_id, job_id, consecutive_errors, self.max_errors, e
                    );
                    if consecutive_errors >= self.max_errors.max(1) {
                        return Err(PollError::TooManyErrors {
                            count: consecutive_errors,
                            last: e.to_string(),
                        });
                    }
                }
            }

            if let Some(limit) = self.max_duration {
                if started.elapsed() >= limit {
                    return Err(PollError::TimedOut(limit));
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Polling of job {} cancelled", job_id);
                    return Ok(PollOutcome::Abandoned);
                }
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }

    fn still_processing(&self, job_id: &str) -> Result<bool, DatabaseError> {
        Ok(analysis_repo::status_of(&self.db, job_id)? == Some(AnalysisStatus::Processing))
    }
}
