//! Test harness for orchestrator integration tests.
//!
//! `TestHarness` wires a real store, queue and cache to a `ScriptedEngine`
//! whose status responses are fed from a script, with timings shrunk to
//! milliseconds so full lifecycles finish quickly.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use vidscan::cache::MemoryCache;
use vidscan::config::{Config, PollingConfig, QueueConfig};
use vidscan::db::{video_repo, Database};
use vidscan::engine::{
    AnalysisEngine, EngineError, RemoteAnalysis, RemoteDetection, RemoteStatus, StartRequest,
};
use vidscan::model::{AnalysisStatus, Video};
use vidscan::queue::{AnalysisQueue, EntryState};
use vidscan::storage::UrlVideoLocator;
use vidscan::worker::WorkerPool;
use vidscan::Orchestrator;

pub const STORAGE_URL: &str = "http://storage.test/videos";

/// Engine double. `get_status` pops scripted responses in order; the last
/// successful response repeats once the script runs dry.
#[derive(Default)]
pub struct ScriptedEngine {
    script: Mutex<VecDeque<Result<RemoteAnalysis, EngineError>>>,
    start_failures: AtomicUsize,
    started: Mutex<Vec<StartRequest>>,
    stopped: Mutex<Vec<String>>,
    polls: AtomicUsize,
    unreachable: AtomicBool,
}

impl ScriptedEngine {
    pub fn script(&self, responses: Vec<Result<RemoteAnalysis, EngineError>>) {
        *self.script.lock().unwrap() = responses.into();
    }

    /// Makes the next `count` start calls fail with a transport error.
    pub fn fail_starts(&self, count: usize) {
        self.start_failures.store(count, Ordering::SeqCst);
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn started(&self) -> Vec<StartRequest> {
        self.started.lock().unwrap().clone()
    }

    pub fn start_count(&self) -> usize {
        self.started.lock().unwrap().len()
    }

    pub fn stopped(&self) -> Vec<String> {
        self.stopped.lock().unwrap().clone()
    }

    pub fn poll_count(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AnalysisEngine for ScriptedEngine {
    async fn start_analysis(&self, request: &StartRequest) -> Result<String, EngineError> {
        let remaining = self.start_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.start_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(EngineError::Transport("connection refused".to_string()));
        }
        let mut started = self.started.lock().unwrap();
        started.push(request.clone());
        Ok(format!("remote-{}", started.len()))
    }

    async fn get_status(&self, _remote_id: &str) -> Result<RemoteAnalysis, EngineError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let mut script = self.script.lock().unwrap();
        match script.len() {
            0 => Ok(processing(0)),
            1 => match script.front() {
                Some(Ok(last)) => Ok(last.clone()),
                _ => script.pop_front().unwrap_or_else(|| Ok(processing(0))),
            },
            _ => script.pop_front().unwrap_or_else(|| Ok(processing(0))),
        }
    }

    async fn stop_analysis(&self, remote_id: &str) -> Result<(), EngineError> {
        self.stopped.lock().unwrap().push(remote_id.to_string());
        Ok(())
    }

    async fn ping(&self) -> Result<(), EngineError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(EngineError::Transport("connection refused".to_string()));
        }
        Ok(())
    }
}

pub fn processing(progress: u8) -> RemoteAnalysis {
    RemoteAnalysis {
        status: RemoteStatus::Processing,
        progress,
        total_frames: None,
        violent_frames: None,
        detections: None,
        error_message: None,
    }
}

pub fn detection(timestamp_seconds: f64, confidence_score: f64) -> RemoteDetection {
    RemoteDetection {
        timestamp_seconds,
        confidence_score,
        frame_number: (timestamp_seconds * 30.0) as u64,
        bounding_boxes: None,
    }
}

pub fn completed(total_frames: u64, detections: Vec<RemoteDetection>) -> RemoteAnalysis {
    RemoteAnalysis {
        status: RemoteStatus::Completed,
        progress: 100,
        total_frames: Some(total_frames),
        violent_frames: Some(detections.len() as u64),
        detections: Some(detections),
        error_message: None,
    }
}

pub fn failed(message: &str) -> RemoteAnalysis {
    RemoteAnalysis {
        status: RemoteStatus::Failed,
        progress: 0,
        total_frames: None,
        violent_frames: None,
        detections: None,
        error_message: Some(message.to_string()),
    }
}

/// Defaults with every interval cut down for tests.
pub fn fast_config() -> Config {
    let mut config = Config::default();
    config.storage.base_url = STORAGE_URL.to_string();
    config.queue = QueueConfig {
        concurrency: 2,
        backoff_base_ms: 10,
        idle_poll_ms: 10,
        ..QueueConfig::default()
    };
    config.polling = PollingConfig {
        interval_ms: 10,
        max_poll_errors: 3,
        max_duration_secs: 0,
    };
    config
}

pub struct TestHarness {
    pub db: Database,
    pub config: Config,
    pub engine: Arc<ScriptedEngine>,
    pub cache: Arc<MemoryCache>,
    pub queue: Arc<AnalysisQueue>,
    pub orchestrator: Orchestrator,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(fast_config())
    }

    pub fn with_config(config: Config) -> Self {
        Self::with_database(
            Database::open_in_memory().expect("Failed to create test database"),
            config,
        )
    }

    /// Builds a fresh orchestrator over an existing database, as a restarted
    /// process would.
    pub fn with_database(db: Database, config: Config) -> Self {
        let engine = Arc::new(ScriptedEngine::default());
        let cache = Arc::new(MemoryCache::from_config(&config.cache));
        let queue = Arc::new(AnalysisQueue::new(db.clone(), &config.queue));
        let locator = Arc::new(UrlVideoLocator::from_config(&config.storage));
        let orchestrator = Orchestrator::new(
            db.clone(),
            Arc::clone(&queue),
            engine.clone(),
            locator,
            cache.clone(),
            &config,
        );

        Self {
            db,
            config,
            engine,
            cache,
            queue,
            orchestrator,
        }
    }

    pub fn add_video(&self, storage_key: &str) -> Video {
        let video = Video::new(storage_key, storage_key);
        video_repo::insert(&self.db, &video).expect("Failed to insert video");
        video
    }

    pub fn start_workers(&self) -> WorkerPool {
        self.orchestrator
            .start_workers(self.config.queue.concurrency)
    }

    pub fn status_of(&self, job_id: &str) -> AnalysisStatus {
        self.orchestrator
            .get_analysis(job_id)
            .expect("analysis should exist")
            .analysis
            .status
    }

    pub async fn wait_for_status(&self, job_id: &str, status: AnalysisStatus) {
        let reached = wait_until(|| self.status_of(job_id) == status).await;
        assert!(
            reached,
            "analysis {} never reached {}, still {}",
            job_id,
            status,
            self.status_of(job_id)
        );
    }
}

impl TestHarness {
    /// Waits until the queue has settled the job's entry into `state`.
    pub async fn wait_for_entry(&self, job_id: &str, state: EntryState) {
        let reached = wait_until(|| {
            self.queue
                .get(job_id)
                .ok()
                .flatten()
                .map_or(false, |entry| entry.state == state)
        })
        .await;
        assert!(reached, "queue entry {} never reached {:?}", job_id, state);
    }
}

/// Polls `check` every 10ms for up to five seconds.
pub async fn wait_until<F: FnMut() -> bool>(mut check: F) -> bool {
    for _ in 0..500 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
