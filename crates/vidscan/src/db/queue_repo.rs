//! Queue entry repository: durable backing store for the analysis queue.
//!
//! Claims run inside a transaction under the connection mutex, so two
//! workers can never receive the same entry.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::{format_timestamp, parse_timestamp, Database, DatabaseError};

/// A raw queue row. `state` is one of `waiting`, `active`, `completed`, `failed`.
#[derive(Debug, Clone)]
pub struct QueueRow {
    pub job_id: String,
    pub payload: String,
    pub priority: i32,
    pub state: String,
    pub attempts: u32,
    pub max_attempts: u32,
    pub available_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-state counts; `delayed` is the subset of waiting rows not yet due.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct QueueCounts {
    pub waiting: u64,
    pub delayed: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

struct QueueRowRaw {
    job_id: String,
    payload: String,
    priority: i64,
    state: String,
    attempts: i64,
    max_attempts: i64,
    available_at: String,
    last_error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl QueueRowRaw {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            job_id: row.get("job_id")?,
            payload: row.get("payload")?,
            priority: row.get("priority")?,
            state: row.get("state")?,
            attempts: row.get("attempts")?,
            max_attempts: row.get("max_attempts")?,
            available_at: row.get("available_at")?,
            last_error: row.get("last_error")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    fn into_row(self) -> Result<QueueRow, DatabaseError> {
        Ok(QueueRow {
            priority: self.priority as i32,
            attempts: self.attempts.max(0) as u32,
            max_attempts: self.max_attempts.max(1) as u32,
            available_at: parse_timestamp("queue_entries", &self.available_at)?,
            created_at: parse_timestamp("queue_entries", &self.created_at)?,
            updated_at: parse_timestamp("queue_entries", &self.updated_at)?,
            job_id: self.job_id,
            payload: self.payload,
            state: self.state,
            last_error: self.last_error,
        })
    }
}

/// Inserts a waiting entry, replacing a terminal entry with the same key.
///
/// Returns `false` when a waiting or active entry already holds the key.
pub fn insert(
    db: &Database,
    job_id: &str,
    payload: &str,
    priority: i32,
    max_attempts: u32,
    available_at: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let now = format_timestamp(Utc::now());
        let changed = conn.execute(
            "INSERT INTO queue_entries
             (job_id, payload, priority, state, attempts, max_attempts, available_at,
              last_error, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'waiting', 0, ?4, ?5, NULL, ?6, ?6)
             ON CONFLICT(job_id) DO UPDATE SET
                payload = excluded.payload,
                priority = excluded.priority,
                state = 'waiting',
                attempts = 0,
                max_attempts = excluded.max_attempts,
                available_at = excluded.available_at,
                last_error = NULL,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at
             WHERE queue_entries.state IN ('completed', 'failed')",
            params![
                job_id,
                payload,
                priority,
                max_attempts,
                format_timestamp(available_at),
                now
            ],
        )?;
        Ok(changed == 1)
    })
}

/// Claims the most urgent due entry, marking it active and counting the attempt.
pub fn claim_next(db: &Database, now: DateTime<Utc>) -> Result<Option<QueueRow>, DatabaseError> {
    db.with_transaction(|tx| {
        let now_str = format_timestamp(now);
        let raw = tx
            .query_row(
                "SELECT * FROM queue_entries
                 WHERE state = 'waiting' AND available_at <= ?1
                 ORDER BY priority DESC, available_at ASC, created_at ASC
                 LIMIT 1",
                params![now_str],
                QueueRowRaw::from_row,
            )
            .optional()?;

        let Some(raw) = raw else {
            return Ok(None);
        };

        tx.execute(
            "UPDATE queue_entries SET state = 'active', attempts = attempts + 1, updated_at = ?2
             WHERE job_id = ?1",
            params![raw.job_id, now_str],
        )?;

        let mut row = raw.into_row()?;
        row.state = "active".to_string();
        row.attempts += 1;
        row.updated_at = now;
        Ok(Some(row))
    })
}

pub fn find(db: &Database, job_id: &str) -> Result<Option<QueueRow>, DatabaseError> {
    db.with_conn(|conn| {
        conn.query_row(
            "SELECT * FROM queue_entries WHERE job_id = ?1",
            params![job_id],
            QueueRowRaw::from_row,
        )
        .optional()?
        .map(QueueRowRaw::into_row)
        .transpose()
    })
}

/// `active -> completed`.
pub fn mark_completed(db: &Database, job_id: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE queue_entries SET state = 'completed', last_error = NULL, updated_at = ?2
             WHERE job_id = ?1 AND state = 'active'",
            params![job_id, format_timestamp(Utc::now())],
        )?;
        Ok(changed == 1)
    })
}

/// `active -> waiting`, due again at `available_at`.
pub fn schedule_retry(
    db: &Database,
    job_id: &str,
    available_at: DateTime<Utc>,
    error: &str,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE queue_entries SET state = 'waiting', available_at = ?2, last_error = ?3,
             updated_at = ?4 WHERE job_id = ?1 AND state = 'active'",
            params![
                job_id,
                format_timestamp(available_at),
                error,
                format_timestamp(Utc::now())
            ],
        )?;
        Ok(changed == 1)
    })
}

/// `active -> failed`.
pub fn mark_failed(db: &Database, job_id: &str, error: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE queue_entries SET state = 'failed', last_error = ?2, updated_at = ?3
             WHERE job_id = ?1 AND state = 'active'",
            params![job_id, error, format_timestamp(Utc::now())],
        )?;
        Ok(changed == 1)
    })
}

/// Removes an entry regardless of state.
pub fn delete(db: &Database, job_id: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "DELETE FROM queue_entries WHERE job_id = ?1",
            params![job_id],
        )?;
        Ok(changed == 1)
    })
}

pub fn counts(db: &Database, now: DateTime<Utc>) -> Result<QueueCounts, DatabaseError> {
    db.with_conn(|conn| {
        let now_str = format_timestamp(now);
        let counts = conn.query_row(
            "SELECT
                COALESCE(SUM(CASE WHEN state = 'waiting' AND available_at <= ?1 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN state = 'waiting' AND available_at > ?1 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN state = 'active' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN state = 'completed' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN state = 'failed' THEN 1 ELSE 0 END), 0)
             FROM queue_entries",
            params![now_str],
            |r| {
                Ok(QueueCounts {
                    waiting: r.get(0)?,
                    delayed: r.get(1)?,
                    active: r.get(2)?,
                    completed: r.get(3)?,
                    failed: r.get(4)?,
                })
            },
        )?;
        Ok(counts)
    })
}

/// Job ids of entries currently `active`.
pub fn list_active(db: &Database) -> Result<Vec<String>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt =
            conn.prepare("SELECT job_id FROM queue_entries WHERE state = 'active'")?;
        let ids = stmt
            .query_map([], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    })
}

/// Puts entries left `active` by a dead process back to `waiting`.
///
/// The interrupted attempt is not refunded.
pub fn reset_active(db: &Database) -> Result<usize, DatabaseError> {
    db.with_conn(|conn| {
        let now = format_timestamp(Utc::now());
        Ok(conn.execute(
            "UPDATE queue_entries SET state = 'waiting', available_at = ?1, updated_at = ?1
             WHERE state = 'active'",
            params![now],
        )?)
    })
}

/// Deletes completed entries last touched before `cutoff`.
pub fn prune_completed(db: &Database, cutoff: DateTime<Utc>) -> Result<usize, DatabaseError> {
    db.with_conn(|conn| {
        Ok(conn.execute(
            "DELETE FROM queue_entries WHERE state = 'completed' AND updated_at < ?1",
            params![format_timestamp(cutoff)],
        )?)
    })
}
