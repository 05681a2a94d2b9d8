//! Restart recovery: state a crashed process leaves behind is repaired by the
//! next one before its workers start.

mod common;

use common::{completed, detection, fast_config, wait_until, TestHarness};
use vidscan::db::analysis_repo;
use vidscan::model::AnalysisStatus;
use vidscan::orchestrator::{AnalysisOptions, RecoveryReport};
use vidscan::queue::EntryState;

/// Admits a job and leaves it the way a worker dies mid-poll: entry active,
/// job processing with a remote task recorded.
fn crashed_mid_poll(harness: &TestHarness, storage_key: &str) -> String {
    let video = harness.add_video(storage_key);
    let admission = harness
        .orchestrator
        .start_analysis(&video.id, AnalysisOptions::default())
        .unwrap();
    let claimed = harness.queue.claim().unwrap().expect("entry should be due");
    assert_eq!(claimed.entry.job_id, admission.job_id);
    assert!(analysis_repo::mark_processing(&harness.db, &admission.job_id).unwrap());
    assert!(analysis_repo::set_remote_id(&harness.db, &admission.job_id, "remote-old").unwrap());
    assert!(analysis_repo::update_progress(&harness.db, &admission.job_id, 40).unwrap());
    admission.job_id
}

#[tokio::test]
async fn test_interrupted_job_is_requeued_and_finishes() {
    let crashed = TestHarness::new();
    let job_id = crashed_mid_poll(&crashed, "uploads/a.mp4");

    let restarted = TestHarness::with_database(crashed.db.clone(), fast_config());
    let report = restarted.orchestrator.recover_interrupted().unwrap();
    assert_eq!(
        report,
        RecoveryReport {
            requeued: 1,
            failed: 0,
            reenqueued: 0,
        }
    );

    let analysis = restarted.orchestrator.get_analysis(&job_id).unwrap().analysis;
    assert_eq!(analysis.status, AnalysisStatus::Pending);
    assert_eq!(analysis.progress, 0);
    assert!(analysis.remote_id.is_none());
    let entry = restarted.queue.get(&job_id).unwrap().unwrap();
    assert_eq!(entry.state, EntryState::Waiting);
    assert!(
        wait_until(|| restarted
            .engine
            .stopped()
            .contains(&"remote-old".to_string()))
        .await
    );

    restarted
        .engine
        .script(vec![Ok(completed(20, vec![detection(1.0, 0.9)]))]);
    let pool = restarted.start_workers();
    restarted
        .wait_for_status(&job_id, AnalysisStatus::Completed)
        .await;
    assert_eq!(
        restarted.orchestrator.get_analysis(&job_id).unwrap().detections.len(),
        1
    );

    pool.shutdown();
    pool.wait().await;
}

#[tokio::test]
async fn test_processing_job_without_entry_is_failed() {
    let crashed = TestHarness::new();
    let job_id = crashed_mid_poll(&crashed, "uploads/a.mp4");
    crashed.queue.complete(&job_id).unwrap();

    let restarted = TestHarness::with_database(crashed.db.clone(), fast_config());
    let report = restarted.orchestrator.recover_interrupted().unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.requeued, 0);

    let analysis = restarted.orchestrator.get_analysis(&job_id).unwrap().analysis;
    assert_eq!(analysis.status, AnalysisStatus::Failed);
    assert_eq!(
        analysis.error_message.as_deref(),
        Some("worker lost while processing")
    );
    assert!(analysis.completed_at.is_some());

    // A failed job can be retried by hand.
    let retried = restarted.orchestrator.retry_analysis(&job_id).unwrap();
    assert_eq!(retried.status, AnalysisStatus::Pending);
}

#[tokio::test]
async fn test_pending_job_without_entry_is_reenqueued() {
    let crashed = TestHarness::new();
    let video = crashed.add_video("uploads/a.mp4");
    let admission = crashed
        .orchestrator
        .start_analysis(&video.id, AnalysisOptions::default())
        .unwrap();
    crashed.queue.cancel(&admission.job_id).unwrap();

    let restarted = TestHarness::with_database(crashed.db.clone(), fast_config());
    let report = restarted.orchestrator.recover_interrupted().unwrap();
    assert_eq!(report.reenqueued, 1);
    assert_eq!(restarted.orchestrator.get_queue_stats().unwrap().waiting, 1);

    // Running recovery again finds nothing left to repair.
    let again = restarted.orchestrator.recover_interrupted().unwrap();
    assert_eq!(again, RecoveryReport::default());
}

#[tokio::test]
async fn test_claimed_but_unstarted_entry_goes_back_to_waiting() {
    let crashed = TestHarness::new();
    let video = crashed.add_video("uploads/a.mp4");
    let admission = crashed
        .orchestrator
        .start_analysis(&video.id, AnalysisOptions::default())
        .unwrap();
    crashed.queue.claim().unwrap().expect("entry should be due");

    let restarted = TestHarness::with_database(crashed.db.clone(), fast_config());
    let report = restarted.orchestrator.recover_interrupted().unwrap();
    assert_eq!(report, RecoveryReport::default());

    let entry = restarted.queue.get(&admission.job_id).unwrap().unwrap();
    assert_eq!(entry.state, EntryState::Waiting);
    assert_eq!(restarted.status_of(&admission.job_id), AnalysisStatus::Pending);
}

#[tokio::test]
async fn test_finished_jobs_are_left_alone() {
    let harness = TestHarness::new();
    let video = harness.add_video("uploads/a.mp4");
    let admission = harness
        .orchestrator
        .start_analysis(&video.id, AnalysisOptions::default())
        .unwrap();
    harness.orchestrator.stop_analysis(&admission.job_id).unwrap();

    let report = harness.orchestrator.recover_interrupted().unwrap();
    assert_eq!(report, RecoveryReport::default());
    assert_eq!(harness.status_of(&admission.job_id), AnalysisStatus::Cancelled);
}
