use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::QueueError;
use crate::db::queue_repo::{QueueCounts, QueueRow};
use crate::db::DatabaseError;

/// Parameters a worker needs to start one analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisPayload {
    pub video_id: String,
    pub confidence_threshold: f64,
    pub frame_interval: u32,
}

#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Higher runs first.
    pub priority: i32,
    /// Not claimable before `now + delay`.
    pub delay: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
}

impl EntryState {
    fn from_stored(state: &str, available_at: DateTime<Utc>, now: DateTime<Utc>) -> Option<Self> {
        match state {
            "waiting" if available_at > now => Some(EntryState::Delayed),
            "waiting" => Some(EntryState::Waiting),
            "active" => Some(EntryState::Active),
            "completed" => Some(EntryState::Completed),
            "failed" => Some(EntryState::Failed),
            _ => None,
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(
            self,
            EntryState::Waiting | EntryState::Delayed | EntryState::Active
        )
    }
}

/// A queue entry as seen by handlers and introspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub job_id: String,
    pub payload: AnalysisPayload,
    pub priority: i32,
    pub state: EntryState,
    /// Attempts started so far, including the current one while active.
    pub attempts: u32,
    pub max_attempts: u32,
    pub available_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl QueueEntry {
    pub(crate) fn from_row(row: QueueRow, now: DateTime<Utc>) -> Result<Self, QueueError> {
        let state = EntryState::from_stored(&row.state, row.available_at, now).ok_or_else(|| {
            DatabaseError::CorruptRow {
                table: "queue_entries",
                reason: format!("unknown state '{}'", row.state),
            }
        })?;
        let payload: AnalysisPayload =
            serde_json::from_str(&row.payload).map_err(|e| DatabaseError::CorruptRow {
                table: "queue_entries",
                reason: format!("bad payload for '{}': {}", row.job_id, e),
            })?;

        Ok(Self {
            job_id: row.job_id,
            payload,
            priority: row.priority,
            state,
            attempts: row.attempts,
            max_attempts: row.max_attempts,
            available_at: row.available_at,
            last_error: row.last_error,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
}

impl From<QueueCounts> for QueueStats {
    fn from(c: QueueCounts) -> Self {
        Self {
            waiting: c.waiting,
            active: c.active,
            completed: c.completed,
            failed: c.failed,
            delayed: c.delayed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueHealth {
    pub healthy: bool,
    /// Empty when healthy.
    pub reasons: Vec<String>,
    pub stats: QueueStats,
}

/// What happened to an entry after its handler failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Re-scheduled after the given backoff.
    Retrying { delay: Duration },
    /// Out of attempts; the entry is now `failed`.
    Exhausted,
    /// Non-retryable error; the entry is now `failed`.
    Rejected,
    /// The entry was cancelled while the handler ran.
    Removed,
}
