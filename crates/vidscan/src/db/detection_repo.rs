//! Detection repository: bulk writes and reads for `violence_detections`.
//!
//! Writes take a plain `&Connection` so they can run inside the transaction
//! that completes or resets the owning analysis.

use rusqlite::{params, Connection};

use super::{Database, DatabaseError};
use crate::model::{BoundingBox, Detection};

/// Inserts all detections for an analysis.
pub fn insert_all(
    conn: &Connection,
    analysis_id: &str,
    detections: &[Detection],
) -> Result<(), DatabaseError> {
    let mut stmt = conn.prepare(
        "INSERT INTO violence_detections
         (analysis_id, timestamp_seconds, confidence_score, frame_number, bounding_boxes)
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )?;
    for detection in detections {
        let boxes = match &detection.bounding_boxes {
            Some(boxes) => Some(serde_json::to_string(boxes).map_err(|e| {
                DatabaseError::CorruptRow {
                    table: "violence_detections",
                    reason: format!("unserializable bounding boxes: {}", e),
                }
            })?),
            None => None,
        };
        stmt.execute(params![
            analysis_id,
            detection.timestamp_seconds,
            detection.confidence_score,
            detection.frame_number as i64,
            boxes,
        ])?;
    }
    Ok(())
}

/// Deletes all detections of an analysis, returning how many were removed.
pub fn delete_for_analysis(conn: &Connection, analysis_id: &str) -> Result<usize, DatabaseError> {
    Ok(conn.execute(
        "DELETE FROM violence_detections WHERE analysis_id = ?1",
        params![analysis_id],
    )?)
}

/// Lists detections of an analysis in timeline order.
pub fn list_for_analysis(db: &Database, analysis_id: &str) -> Result<Vec<Detection>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT timestamp_seconds, confidence_score, frame_number, bounding_boxes
             FROM violence_detections WHERE analysis_id = ?1
             ORDER BY timestamp_seconds ASC, id ASC",
        )?;
        let rows = stmt
            .query_map(params![analysis_id], |row| {
                Ok((
                    row.get::<_, f64>(0)?,
                    row.get::<_, f64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(timestamp_seconds, confidence_score, frame_number, boxes)| {
                let bounding_boxes = boxes
                    .map(|json| serde_json::from_str::<Vec<BoundingBox>>(&json))
                    .transpose()
                    .map_err(|e| DatabaseError::CorruptRow {
                        table: "violence_detections",
                        reason: format!("bad bounding_boxes JSON: {}", e),
                    })?;
                Ok(Detection {
                    timestamp_seconds,
                    confidence_score,
                    frame_number: frame_number.max(0) as u64,
                    bounding_boxes,
                })
            })
            .collect()
    })
}

/// Counts detections of an analysis.
pub fn count_for_analysis(db: &Database, analysis_id: &str) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM violence_detections WHERE analysis_id = ?1",
            params![analysis_id],
            |r| r.get(0),
        )?;
        Ok(count)
    })
}
