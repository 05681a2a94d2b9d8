//! Wire types of the analysis engine's HTTP API.

use serde::{Deserialize, Serialize};

use crate::model::{BoundingBox, Detection};

/// Body of `POST /analysis/start`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartRequest {
    pub video_location: String,
    pub confidence_threshold: f64,
    pub frame_interval: u32,
}

/// Response of `POST /analysis/start`. Extra fields are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartResponse {
    pub analysis_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    /// A status this client does not know; polled like a running task.
    #[serde(other)]
    Unknown,
}

impl RemoteStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RemoteStatus::Completed | RemoteStatus::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteDetection {
    pub timestamp_seconds: f64,
    pub confidence_score: f64,
    pub frame_number: u64,
    #[serde(default)]
    pub bounding_boxes: Option<Vec<BoundingBox>>,
}

impl From<RemoteDetection> for Detection {
    fn from(d: RemoteDetection) -> Self {
        Detection {
            timestamp_seconds: d.timestamp_seconds,
            confidence_score: d.confidence_score,
            frame_number: d.frame_number,
            bounding_boxes: d.bounding_boxes,
        }
    }
}

/// Response of `GET /analysis/{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteAnalysis {
    pub status: RemoteStatus,
    #[serde(default)]
    pub progress: u8,
    #[serde(default)]
    pub total_frames: Option<u64>,
    #[serde(default)]
    pub violent_frames: Option<u64>,
    #[serde(default)]
    pub detections: Option<Vec<RemoteDetection>>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl RemoteAnalysis {
    /// Progress clamped to 0-100.
    pub fn progress(&self) -> u8 {
        self.progress.min(100)
    }
}
