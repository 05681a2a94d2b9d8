//! Analysis progress broadcaster for real-time status streaming.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::model::AnalysisStatus;

/// Phase of analysis processing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisPhase {
    Queued,
    Starting,
    Analyzing,
    Completed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for AnalysisPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AnalysisPhase::Queued => write!(f, "Queued"),
            AnalysisPhase::Starting => write!(f, "Starting remote analysis"),
            AnalysisPhase::Analyzing => write!(f, "Analyzing"),
            AnalysisPhase::Completed => write!(f, "Completed"),
            AnalysisPhase::Failed => write!(f, "Failed"),
            AnalysisPhase::Cancelled => write!(f, "Cancelled"),
        }
    }
}

impl AnalysisPhase {
    fn status(&self) -> AnalysisStatus {
        match self {
            AnalysisPhase::Queued => AnalysisStatus::Pending,
            AnalysisPhase::Starting | AnalysisPhase::Analyzing => AnalysisStatus::Processing,
            AnalysisPhase::Completed => AnalysisStatus::Completed,
            AnalysisPhase::Failed => AnalysisStatus::Failed,
            AnalysisPhase::Cancelled => AnalysisStatus::Cancelled,
        }
    }
}

/// Progress event for one analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisProgressEvent {
    pub analysis_id: String,
    pub video_id: String,
    pub phase: AnalysisPhase,
    pub status: AnalysisStatus,
    /// 0-100.
    pub progress: u8,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    /// Number of detections (set on completion).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detection_count: Option<usize>,
    /// Error message (set on failure).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AnalysisProgressEvent {
    pub fn new(
        analysis_id: &str,
        video_id: &str,
        phase: AnalysisPhase,
        progress: u8,
        message: &str,
    ) -> Self {
        Self {
            analysis_id: analysis_id.to_string(),
            video_id: video_id.to_string(),
            phase,
            status: phase.status(),
            progress: progress.min(100),
            message: message.to_string(),
            timestamp: Utc::now(),
            detection_count: None,
            error: None,
        }
    }

    pub fn completed(analysis_id: &str, video_id: &str, detection_count: usize) -> Self {
        let mut event = Self::new(
            analysis_id,
            video_id,
            AnalysisPhase::Completed,
            100,
            "Analysis completed successfully",
        );
        event.detection_count = Some(detection_count);
        event
    }

    pub fn failed(analysis_id: &str, video_id: &str, error: &str) -> Self {
        let mut event = Self::new(analysis_id, video_id, AnalysisPhase::Failed, 0, "Analysis failed");
        event.error = Some(error.to_string());
        event
    }
}

/// Broadcasts analysis progress events to any number of subscribers.
#[derive(Clone)]
pub struct JobProgressBroadcaster {
    sender: Arc<broadcast::Sender<AnalysisProgressEvent>>,
}

impl JobProgressBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Sends a progress event to all subscribers.
    pub fn send(&self, event: AnalysisProgressEvent) {
        // No active receivers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AnalysisProgressEvent> {
        self.sender.subscribe()
    }

    /// Creates a tracker for one analysis without emitting anything.
    pub fn tracker(&self, analysis_id: &str, video_id: &str) -> JobProgressTracker {
        JobProgressTracker::new(analysis_id, video_id, Arc::clone(&self.sender))
    }

    /// Creates a tracker and emits the initial queued event.
    pub fn start_job(&self, analysis_id: &str, video_id: &str) -> JobProgressTracker {
        let tracker = self.tracker(analysis_id, video_id);
        tracker.update_phase(AnalysisPhase::Queued, 0, "Analysis queued");
        tracker
    }
}

impl Default for JobProgressBroadcaster {
    fn default() -> Self {
        Self::new(100)
    }
}

/// Emits events for a single analysis.
pub struct JobProgressTracker {
    analysis_id: String,
    video_id: String,
    sender: Arc<broadcast::Sender<AnalysisProgressEvent>>,
}

impl JobProgressTracker {
    pub fn new(
        analysis_id: &str,
        video_id: &str,
        sender: Arc<broadcast::Sender<AnalysisProgressEvent>>,
    ) -> Self {
        Self {
            analysis_id: analysis_id.to_string(),
            video_id: video_id.to_string(),
            sender,
        }
    }

    pub fn update_phase(&self, phase: AnalysisPhase, progress: u8, message: &str) {
        let event =
            AnalysisProgressEvent::new(&self.analysis_id, &self.video_id, phase, progress, message);
        let _ = self.sender.send(event);
    }

    pub fn progress(&self, progress: u8) {
        self.update_phase(
            AnalysisPhase::Analyzing,
            progress,
            &format!("Analysis {}% complete", progress.min(100)),
        );
    }

    pub fn completed(&self, detection_count: usize) {
        let event =
            AnalysisProgressEvent::completed(&self.analysis_id, &self.video_id, detection_count);
        let _ = self.sender.send(event);
    }

    pub fn failed(&self, error: &str) {
        let event = AnalysisProgressEvent::failed(&self.analysis_id, &self.video_id, error);
        let _ = self.sender.send(event);
    }

    pub fn cancelled(&self) {
        self.update_phase(AnalysisPhase::Cancelled, 0, "Analysis cancelled");
    }
}
