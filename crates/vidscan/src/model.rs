//! Domain types shared by the store, the orchestrator and its callers.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of an analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl AnalysisStatus {
    /// Statuses that count toward the one-live-analysis-per-video rule.
    pub const ACTIVE: [AnalysisStatus; 2] = [AnalysisStatus::Pending, AnalysisStatus::Processing];

    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisStatus::Pending => "pending",
            AnalysisStatus::Processing => "processing",
            AnalysisStatus::Completed => "completed",
            AnalysisStatus::Failed => "failed",
            AnalysisStatus::Cancelled => "cancelled",
        }
    }

    /// Returns true for `completed`, `failed` and `cancelled`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AnalysisStatus::Completed | AnalysisStatus::Failed | AnalysisStatus::Cancelled
        )
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for AnalysisStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnalysisStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(AnalysisStatus::Pending),
            "processing" => Ok(AnalysisStatus::Processing),
            "completed" => Ok(AnalysisStatus::Completed),
            "failed" => Ok(AnalysisStatus::Failed),
            "cancelled" => Ok(AnalysisStatus::Cancelled),
            other => Err(format!("unknown analysis status '{}'", other)),
        }
    }
}

/// One violence-detection run over one video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Analysis {
    pub id: String,
    pub video_id: String,
    pub status: AnalysisStatus,
    /// 0-100, only meaningful while processing or once completed.
    pub progress: u8,
    pub confidence_threshold: f64,
    pub frame_interval: u32,
    pub priority: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_frames: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub violent_frames: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Task id assigned by the analysis engine.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Analysis {
    /// Creates a fresh `pending` analysis with a new UUID.
    pub fn new(video_id: &str, confidence_threshold: f64, frame_interval: u32, priority: i32) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            video_id: video_id.to_string(),
            status: AnalysisStatus::Pending,
            progress: 0,
            confidence_threshold,
            frame_interval,
            priority,
            total_frames: None,
            violent_frames: None,
            error_message: None,
            remote_id: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }
}

/// A region reported by the engine for a detection, kept as the JSON object it
/// arrived as. The engine does not fix its keys.
pub type BoundingBox = serde_json::Map<String, serde_json::Value>;

/// A timestamped violent-content finding of a completed analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Detection {
    pub timestamp_seconds: f64,
    pub confidence_score: f64,
    pub frame_number: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounding_boxes: Option<Vec<BoundingBox>>,
}

impl Detection {
    /// Checks the value ranges the store relies on.
    pub fn validate(&self) -> Result<(), String> {
        if !self.timestamp_seconds.is_finite() || self.timestamp_seconds < 0.0 {
            return Err(format!(
                "detection timestamp {} is negative or not finite",
                self.timestamp_seconds
            ));
        }
        if !(0.0..=1.0).contains(&self.confidence_score) {
            return Err(format!(
                "detection confidence {} is outside [0, 1]",
                self.confidence_score
            ));
        }
        Ok(())
    }
}

/// A video known to the surrounding application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Video {
    pub id: String,
    pub title: String,
    /// Key used by the storage collaborator to locate the file.
    pub storage_key: String,
    pub created_at: DateTime<Utc>,
}

impl Video {
    pub fn new(title: &str, storage_key: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.to_string(),
            storage_key: storage_key.to_string(),
            created_at: Utc::now(),
        }
    }
}
