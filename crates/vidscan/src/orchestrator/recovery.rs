//! Startup repair of jobs a crashed process left mid-flight.

use std::collections::HashSet;

use log::{info, warn};

use super::service::{Inner, RecoveryReport};
use crate::db::analysis_repo;
use crate::error::AnalysisError;
use crate::model::AnalysisStatus;
use crate::queue::QueueError;

pub(crate) const WORKER_LOST_MESSAGE: &str = "worker lost while processing";

fn has_live_entry(inner: &Inner, job_id: &str) -> Result<bool, QueueError> {
    Ok(inner
        .queue
        .get(job_id)?
        .map_or(false, |entry| entry.state.is_live()))
}

pub(crate) fn recover(inner: &Inner) -> Result<RecoveryReport, AnalysisError> {
    let mut report = RecoveryReport::default();
    let db = &inner.db;

    let interrupted: HashSet<String> = inner.queue.active_job_ids()?.into_iter().collect();
    inner.queue.recover_stalled()?;

    for job_id in &interrupted {
        let Some(analysis) = analysis_repo::find_by_id(db, job_id)? else {
            continue;
        };
        if analysis.status != AnalysisStatus::Processing {
            continue;
        }
        if let Some(remote_id) = analysis.remote_id.as_deref() {
            inner.spawn_remote_stop(remote_id);
        }
        if analysis_repo::requeue_interrupted(db, job_id)? {
            inner.refresh_progress_cache(job_id);
            report.requeued += 1;
        }
    }

    for analysis in analysis_repo::list_by_status(db, AnalysisStatus::Processing)? {
        if has_live_entry(inner, &analysis.id)? {
            continue;
        }
        if let Some(remote_id) = analysis.remote_id.as_deref() {
            inner.spawn_remote_stop(remote_id);
        }
        if inner.fail_job(&analysis.id, &analysis.video_id, WORKER_LOST_MESSAGE) {
            report.failed += 1;
        }
    }

    for analysis in analysis_repo::list_by_status(db, AnalysisStatus::Pending)? {
        if has_live_entry(inner, &analysis.id)? {
            continue;
        }
        match inner.enqueue(&analysis, None) {
            Ok(()) => report.reenqueued += 1,
            Err(e) => warn!("Failed to re-enqueue pending analysis {}: {}", analysis.id, e),
        }
    }

    if report != RecoveryReport::default() {
        info!(
            "Recovery: {} requeued, {} failed, {} re-enqueued",
            report.requeued, report.failed, report.reenqueued
        );
    }
    Ok(report)
}
