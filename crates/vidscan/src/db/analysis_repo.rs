//! Analysis repository: CRUD and guarded state transitions for `analyses`.
//!
//! Every transition is a single `UPDATE ... WHERE status IN (...)`, so the
//! returned `bool` tells the caller whether the row was actually in a state
//! that allowed the move. Callers never read-modify-write status.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{
    detection_repo, format_timestamp, parse_optional_timestamp, parse_timestamp, Database,
    DatabaseError,
};
use crate::model::{Analysis, AnalysisStatus, Detection};

/// A raw analysis row from the database.
#[derive(Debug, Clone)]
struct AnalysisRow {
    id: String,
    video_id: String,
    status: String,
    progress: i64,
    confidence_threshold: f64,
    frame_interval: i64,
    priority: i64,
    total_frames: Option<i64>,
    violent_frames: Option<i64>,
    error_message: Option<String>,
    remote_id: Option<String>,
    created_at: String,
    updated_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
}

impl AnalysisRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            video_id: row.get("video_id")?,
            status: row.get("status")?,
            progress: row.get("progress")?,
            confidence_threshold: row.get("confidence_threshold")?,
            frame_interval: row.get("frame_interval")?,
            priority: row.get("priority")?,
            total_frames: row.get("total_frames")?,
            violent_frames: row.get("violent_frames")?,
            error_message: row.get("error_message")?,
            remote_id: row.get("remote_id")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
            started_at: row.get("started_at")?,
            completed_at: row.get("completed_at")?,
        })
    }

    fn into_analysis(self) -> Result<Analysis, DatabaseError> {
        let status = self
            .status
            .parse::<AnalysisStatus>()
            .map_err(|reason| DatabaseError::CorruptRow {
                table: "analyses",
                reason,
            })?;

        Ok(Analysis {
            status,
            progress: self.progress.clamp(0, 100) as u8,
            confidence_threshold: self.confidence_threshold,
            frame_interval: self.frame_interval.max(1) as u32,
            priority: self.priority as i32,
            total_frames: self.total_frames.map(|v| v.max(0) as u64),
            violent_frames: self.violent_frames.map(|v| v.max(0) as u64),
            created_at: parse_timestamp("analyses", &self.created_at)?,
            updated_at: parse_timestamp("analyses", &self.updated_at)?,
            started_at: parse_optional_timestamp("analyses", self.started_at)?,
            completed_at: parse_optional_timestamp("analyses", self.completed_at)?,
            id: self.id,
            video_id: self.video_id,
            error_message: self.error_message,
            remote_id: self.remote_id,
        })
    }
}

/// Query filter parameters for analysis listing.
#[derive(Debug, Default, Clone)]
pub struct AnalysisFilter {
    pub status: Option<AnalysisStatus>,
    pub video_id: Option<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

fn now() -> String {
    format_timestamp(Utc::now())
}

/// Inserts a new analysis row.
///
/// Fails with `DatabaseError::UniqueViolation` when the video already has a
/// pending or processing analysis.
pub fn insert(db: &Database, analysis: &Analysis) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO analyses (id, video_id, status, progress, confidence_threshold,
             frame_interval, priority, total_frames, violent_frames, error_message, remote_id,
             created_at, updated_at, started_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                analysis.id,
                analysis.video_id,
                analysis.status.as_str(),
                analysis.progress,
                analysis.confidence_threshold,
                analysis.frame_interval,
                analysis.priority,
                analysis.total_frames.map(|v| v as i64),
                analysis.violent_frames.map(|v| v as i64),
                analysis.error_message,
                analysis.remote_id,
                format_timestamp(analysis.created_at),
                format_timestamp(analysis.updated_at),
                analysis.started_at.map(format_timestamp),
                analysis.completed_at.map(format_timestamp),
            ],
        )
        .map_err(DatabaseError::from_write)?;
        Ok(())
    })
}

fn find_in(conn: &Connection, id: &str) -> Result<Option<Analysis>, DatabaseError> {
    conn.query_row(
        "SELECT * FROM analyses WHERE id = ?1",
        params![id],
        AnalysisRow::from_row,
    )
    .optional()?
    .map(AnalysisRow::into_analysis)
    .transpose()
}

/// Finds an analysis by its ID.
pub fn find_by_id(db: &Database, id: &str) -> Result<Option<Analysis>, DatabaseError> {
    db.with_conn(|conn| find_in(conn, id))
}

/// Returns the status of an analysis without loading the whole row.
pub fn status_of(db: &Database, id: &str) -> Result<Option<AnalysisStatus>, DatabaseError> {
    db.with_conn(|conn| {
        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM analyses WHERE id = ?1",
                params![id],
                |r| r.get(0),
            )
            .optional()?;
        status
            .map(|s| {
                s.parse::<AnalysisStatus>()
                    .map_err(|reason| DatabaseError::CorruptRow {
                        table: "analyses",
                        reason,
                    })
            })
            .transpose()
    })
}

/// Finds the pending or processing analysis for a video, if any.
pub fn find_active_for_video(
    db: &Database,
    video_id: &str,
) -> Result<Option<Analysis>, DatabaseError> {
    db.with_conn(|conn| {
        conn.query_row(
            "SELECT * FROM analyses WHERE video_id = ?1 AND status IN ('pending', 'processing')
             ORDER BY created_at DESC LIMIT 1",
            params![video_id],
            AnalysisRow::from_row,
        )
        .optional()?
        .map(AnalysisRow::into_analysis)
        .transpose()
    })
}

/// Queries analyses with filters, returning (rows, total_count).
pub fn query(
    db: &Database,
    filter: &AnalysisFilter,
) -> Result<(Vec<Analysis>, u64), DatabaseError> {
    db.with_conn(|conn| {
        let mut conditions = Vec::new();
        let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(status) = filter.status {
            conditions.push(format!("status = ?{}", param_values.len() + 1));
            param_values.push(Box::new(status.as_str()));
        }
        if let Some(ref video_id) = filter.video_id {
            conditions.push(format!("video_id = ?{}", param_values.len() + 1));
            param_values.push(Box::new(video_id.clone()));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let count_sql = format!("SELECT COUNT(*) FROM analyses {}", where_clause);
        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();
        let total: u64 = conn.query_row(&count_sql, params_ref.as_slice(), |r| r.get(0))?;

        let limit = filter.limit.unwrap_or(100) as i64;
        let offset = filter.offset.unwrap_or(0) as i64;
        param_values.push(Box::new(limit));
        param_values.push(Box::new(offset));
        let query_sql = format!(
            "SELECT * FROM analyses {} ORDER BY created_at DESC LIMIT ?{} OFFSET ?{}",
            where_clause,
            param_values.len() - 1,
            param_values.len()
        );

        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&query_sql)?;
        let rows = stmt
            .query_map(params_ref.as_slice(), AnalysisRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        let analyses = rows
            .into_iter()
            .map(AnalysisRow::into_analysis)
            .collect::<Result<Vec<_>, _>>()?;

        Ok((analyses, total))
    })
}

/// Returns every analysis currently in `status`, oldest first.
pub fn list_by_status(
    db: &Database,
    status: AnalysisStatus,
) -> Result<Vec<Analysis>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt =
            conn.prepare("SELECT * FROM analyses WHERE status = ?1 ORDER BY created_at ASC")?;
        let rows = stmt
            .query_map(params![status.as_str()], AnalysisRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(AnalysisRow::into_analysis).collect()
    })
}

/// `pending -> processing`, resetting progress and stamping `started_at`.
pub fn mark_processing(db: &Database, id: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let ts = now();
        let changed = conn.execute(
            "UPDATE analyses SET status = 'processing', progress = 0, started_at = ?2,
             updated_at = ?2 WHERE id = ?1 AND status = 'pending'",
            params![id, ts],
        )?;
        Ok(changed == 1)
    })
}

/// Records the engine's task id on a processing analysis.
pub fn set_remote_id(db: &Database, id: &str, remote_id: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE analyses SET remote_id = ?2, updated_at = ?3
             WHERE id = ?1 AND status = 'processing'",
            params![id, remote_id, now()],
        )?;
        Ok(changed == 1)
    })
}

/// Raises progress on a processing analysis. Never lowers it.
pub fn update_progress(db: &Database, id: &str, progress: u8) -> Result<bool, DatabaseError> {
    let progress = progress.min(100);
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE analyses SET progress = ?2, updated_at = ?3
             WHERE id = ?1 AND status = 'processing' AND progress < ?2",
            params![id, progress, now()],
        )?;
        Ok(changed == 1)
    })
}

/// Moves a live analysis to `failed` with the given message.
///
/// Accepts `pending` as well as `processing` because queue retries can be
/// exhausted before a worker ever got the job into `processing`.
pub fn mark_failed(db: &Database, id: &str, message: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let ts = now();
        let changed = conn.execute(
            "UPDATE analyses SET status = 'failed', error_message = ?2, completed_at = ?3,
             updated_at = ?3 WHERE id = ?1 AND status IN ('pending', 'processing')",
            params![id, message, ts],
        )?;
        Ok(changed == 1)
    })
}

/// Moves a live analysis to `cancelled`.
pub fn mark_cancelled(db: &Database, id: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let ts = now();
        let changed = conn.execute(
            "UPDATE analyses SET status = 'cancelled', completed_at = ?2, updated_at = ?2
             WHERE id = ?1 AND status IN ('pending', 'processing')",
            params![id, ts],
        )?;
        Ok(changed == 1)
    })
}

/// Atomically completes a processing analysis and stores its detections.
///
/// Returns `false` (and writes nothing) if the analysis left `processing`
/// in the meantime, e.g. because it was cancelled.
pub fn complete_with_detections(
    db: &Database,
    id: &str,
    total_frames: u64,
    violent_frames: u64,
    detections: &[Detection],
) -> Result<bool, DatabaseError> {
    db.with_transaction(|tx| {
        let ts = now();
        let changed = tx.execute(
            "UPDATE analyses SET status = 'completed', progress = 100, total_frames = ?2,
             violent_frames = ?3, error_message = NULL, completed_at = ?4, updated_at = ?4
             WHERE id = ?1 AND status = 'processing'",
            params![id, total_frames as i64, violent_frames as i64, ts],
        )?;
        if changed == 0 {
            return Ok(false);
        }
        detection_repo::insert_all(tx, id, detections)?;
        Ok(true)
    })
}

/// `failed -> pending`: clears the previous run and deletes its detections.
///
/// Fails with `UniqueViolation` if another live analysis now exists for the video.
pub fn reset_for_retry(db: &Database, id: &str) -> Result<bool, DatabaseError> {
    db.with_transaction(|tx| {
        let changed = tx
            .execute(
                "UPDATE analyses SET status = 'pending', progress = 0, error_message = NULL,
                 total_frames = NULL, violent_frames = NULL, remote_id = NULL,
                 started_at = NULL, completed_at = NULL, updated_at = ?2
                 WHERE id = ?1 AND status = 'failed'",
                params![id, now()],
            )
            .map_err(DatabaseError::from_write)?;
        if changed == 0 {
            return Ok(false);
        }
        detection_repo::delete_for_analysis(tx, id)?;
        Ok(true)
    })
}

/// `pending -> failed` rollback used when a retry could not be re-enqueued.
pub fn restore_failed(db: &Database, id: &str, message: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let ts = now();
        let changed = conn.execute(
            "UPDATE analyses SET status = 'failed', error_message = ?2, completed_at = ?3,
             updated_at = ?3 WHERE id = ?1 AND status = 'pending'",
            params![id, message, ts],
        )?;
        Ok(changed == 1)
    })
}

/// `processing -> pending` for work interrupted by a dead worker.
pub fn requeue_interrupted(db: &Database, id: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE analyses SET status = 'pending', progress = 0, remote_id = NULL,
             started_at = NULL, updated_at = ?2 WHERE id = ?1 AND status = 'processing'",
            params![id, now()],
        )?;
        Ok(changed == 1)
    })
}

/// Deletes an analysis. Detections go with it through the foreign key cascade.
pub fn delete(db: &Database, id: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute("DELETE FROM analyses WHERE id = ?1", params![id])?;
        Ok(changed == 1)
    })
}
