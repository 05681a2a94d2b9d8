//! Admission, validation and introspection through the orchestrator API.

mod common;

use std::collections::HashSet;
use std::time::Duration;

use common::{completed, detection, failed, fast_config, wait_until, TestHarness};
use vidscan::db::analysis_repo::{self, AnalysisFilter};
use vidscan::model::AnalysisStatus;
use vidscan::orchestrator::AnalysisOptions;
use vidscan::AnalysisError;

#[test]
fn test_second_admission_returns_the_live_job() {
    let harness = TestHarness::new();
    let video = harness.add_video("uploads/a.mp4");

    let first = harness
        .orchestrator
        .start_analysis(&video.id, AnalysisOptions::default())
        .unwrap();
    let second = harness
        .orchestrator
        .start_analysis(&video.id, AnalysisOptions::default())
        .unwrap();

    assert!(first.created);
    assert!(!second.created);
    assert_eq!(second.job_id, first.job_id);
    assert_eq!(second.status, AnalysisStatus::Pending);

    let stats = harness.orchestrator.get_queue_stats().unwrap();
    assert_eq!(stats.waiting, 1);
}

#[test]
fn test_concurrent_admissions_create_one_job_per_video() {
    let harness = TestHarness::new();
    let videos: Vec<_> = (0..4)
        .map(|i| harness.add_video(&format!("uploads/{}.mp4", i)))
        .collect();

    let admissions: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..32)
            .map(|i| {
                let orchestrator = harness.orchestrator.clone();
                let video_id = videos[i % videos.len()].id.clone();
                scope.spawn(move || {
                    orchestrator
                        .start_analysis(&video_id, AnalysisOptions::default())
                        .map(|admission| (video_id, admission))
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap().unwrap())
            .collect()
    });

    for video in &videos {
        let ids: HashSet<_> = admissions
            .iter()
            .filter(|(video_id, _)| video_id == &video.id)
            .map(|(_, admission)| admission.job_id.clone())
            .collect();
        assert_eq!(ids.len(), 1, "video {} got several live jobs", video.id);

        let created = admissions
            .iter()
            .filter(|(video_id, admission)| video_id == &video.id && admission.created)
            .count();
        assert_eq!(created, 1);

        let (rows, total) = analysis_repo::query(
            &harness.db,
            &AnalysisFilter {
                video_id: Some(video.id.clone()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(total, 1);
        assert_eq!(rows[0].status, AnalysisStatus::Pending);
    }

    assert_eq!(harness.orchestrator.get_queue_stats().unwrap().waiting, 4);
}

#[test]
fn test_invalid_parameters_are_rejected_without_writes() {
    let harness = TestHarness::new();
    let video = harness.add_video("uploads/a.mp4");

    for options in [
        AnalysisOptions {
            confidence_threshold: Some(1.5),
            ..Default::default()
        },
        AnalysisOptions {
            confidence_threshold: Some(f64::NAN),
            ..Default::default()
        },
        AnalysisOptions {
            frame_interval: Some(0),
            ..Default::default()
        },
    ] {
        let err = harness
            .orchestrator
            .start_analysis(&video.id, options)
            .unwrap_err();
        assert!(matches!(err, AnalysisError::Validation(_)), "{}", err);
    }

    let err = harness
        .orchestrator
        .start_analysis("no-such-video", AnalysisOptions::default())
        .unwrap_err();
    assert_eq!(err.to_string(), "video 'no-such-video' not found");

    let (_, total) = harness
        .orchestrator
        .list_analyses(&AnalysisFilter::default())
        .unwrap();
    assert_eq!(total, 0);
    assert_eq!(harness.orchestrator.get_queue_stats().unwrap().waiting, 0);
}

#[test]
fn test_defaults_apply_to_unset_options() {
    let mut config = fast_config();
    config.defaults.confidence_threshold = 0.55;
    config.defaults.frame_interval = 5;
    let harness = TestHarness::with_config(config);
    let video = harness.add_video("uploads/a.mp4");

    let admission = harness
        .orchestrator
        .start_analysis(&video.id, AnalysisOptions::default())
        .unwrap();

    let report = harness.orchestrator.get_analysis(&admission.job_id).unwrap();
    assert_eq!(report.analysis.confidence_threshold, 0.55);
    assert_eq!(report.analysis.frame_interval, 5);
    assert!(report.detections.is_empty());
    assert!(report.summary.max_confidence.is_none());
}

#[test]
fn test_failed_enqueue_rolls_back_the_job() {
    let harness = TestHarness::new();
    let video = harness.add_video("uploads/a.mp4");
    harness.queue.close();

    let err = harness
        .orchestrator
        .start_analysis(&video.id, AnalysisOptions::default())
        .unwrap_err();
    assert!(matches!(err, AnalysisError::Transport(_)), "{}", err);

    assert!(analysis_repo::find_active_for_video(&harness.db, &video.id)
        .unwrap()
        .is_none());
    let (_, total) = harness
        .orchestrator
        .list_analyses(&AnalysisFilter::default())
        .unwrap();
    assert_eq!(total, 0);
}

#[test]
fn test_unknown_job_operations_report_not_found() {
    let harness = TestHarness::new();

    for result in [
        harness.orchestrator.stop_analysis("missing").map(|_| ()),
        harness.orchestrator.retry_analysis("missing").map(|_| ()),
        harness.orchestrator.delete_analysis("missing"),
        harness.orchestrator.get_analysis("missing").map(|_| ()),
        harness.orchestrator.get_progress("missing").map(|_| ()),
    ] {
        assert!(matches!(result, Err(AnalysisError::NotFound { .. })));
    }
}

#[test]
fn test_delayed_admission_is_counted_as_delayed() {
    let harness = TestHarness::new();
    let video = harness.add_video("uploads/a.mp4");

    harness
        .orchestrator
        .start_analysis(
            &video.id,
            AnalysisOptions {
                delay: Some(Duration::from_secs(60)),
                ..Default::default()
            },
        )
        .unwrap();

    let stats = harness.orchestrator.get_queue_stats().unwrap();
    assert_eq!(stats.delayed, 1);
    assert_eq!(stats.waiting, 0);
}

#[tokio::test]
async fn test_higher_priority_runs_first() {
    let mut config = fast_config();
    config.queue.concurrency = 1;
    let harness = TestHarness::with_config(config);
    let low = harness.add_video("uploads/low.mp4");
    let high = harness.add_video("uploads/high.mp4");
    harness
        .engine
        .script(vec![Ok(completed(10, vec![detection(0.1, 0.9)]))]);

    let low_job = harness
        .orchestrator
        .start_analysis(&low.id, AnalysisOptions::default())
        .unwrap();
    harness
        .orchestrator
        .start_analysis(
            &high.id,
            AnalysisOptions {
                priority: 10,
                ..Default::default()
            },
        )
        .unwrap();

    let pool = harness.start_workers();
    harness
        .wait_for_status(&low_job.job_id, AnalysisStatus::Completed)
        .await;

    let started = harness.engine.started();
    assert_eq!(started.len(), 2);
    assert!(started[0].video_location.ends_with("uploads/high.mp4"));
    assert!(started[1].video_location.ends_with("uploads/low.mp4"));

    pool.shutdown();
    pool.wait().await;
}

#[tokio::test]
async fn test_list_filters_by_status() {
    let harness = TestHarness::new();
    let ok = harness.add_video("uploads/ok.mp4");
    let pending = harness.add_video("uploads/pending.mp4");

    let cancelled = harness
        .orchestrator
        .start_analysis(&ok.id, AnalysisOptions::default())
        .unwrap();
    harness.orchestrator.stop_analysis(&cancelled.job_id).unwrap();
    harness
        .orchestrator
        .start_analysis(&pending.id, AnalysisOptions::default())
        .unwrap();

    let (rows, total) = harness
        .orchestrator
        .list_analyses(&AnalysisFilter {
            status: Some(AnalysisStatus::Cancelled),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(total, 1);
    assert_eq!(rows[0].id, cancelled.job_id);

    let (_, total) = harness
        .orchestrator
        .list_analyses(&AnalysisFilter::default())
        .unwrap();
    assert_eq!(total, 2);
}

#[tokio::test]
async fn test_health_reflects_engine_and_queue_thresholds() {
    let mut config = fast_config();
    config.queue.failed_threshold = 1;
    let harness = TestHarness::with_config(config);

    let health = harness.orchestrator.get_health_status().await;
    assert!(health.healthy, "{:?}", health.reasons);
    assert!(health.database);
    assert!(health.engine);

    harness.engine.set_unreachable(true);
    let health = harness.orchestrator.get_health_status().await;
    assert!(!health.healthy);
    assert!(!health.engine);
    assert!(health.reasons.iter().any(|r| r.contains("engine unreachable")));
    harness.engine.set_unreachable(false);

    let video = harness.add_video("uploads/bad.mp4");
    harness.engine.script(vec![Ok(failed("decode error"))]);
    harness
        .orchestrator
        .start_analysis(&video.id, AnalysisOptions::default())
        .unwrap();
    let pool = harness.start_workers();
    assert!(wait_until(|| harness.queue.stats().unwrap().failed == 1).await);

    let health = harness.orchestrator.get_health_status().await;
    assert!(!health.healthy);
    assert!(health.engine);
    let queue = health.queue.unwrap();
    assert!(!queue.healthy);
    assert_eq!(queue.stats.failed, 1);

    pool.shutdown();
    pool.wait().await;
}
