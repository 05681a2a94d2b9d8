//! Schema migrations for the analysis store.
//!
//! SQL lives in `db/sql/`, one file per version. Applied versions are
//! recorded in `_migrations`; ADD COLUMN steps are skipped when the column
//! is already there.

use rusqlite::Connection;

use super::error::DatabaseError;

/// A single migration definition.
struct Migration {
    version: u32,
    description: &'static str,
    sql: &'static str,
    kind: MigrationKind,
}

enum MigrationKind {
    /// Execute the SQL directly.
    Standard,
    /// ALTER TABLE ADD COLUMN, skipped if the column already exists.
    AddColumn {
        table: &'static str,
        column: &'static str,
    },
}

/// All migrations in order. Each is applied at most once.
const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "create_videos_table",
        sql: include_str!("sql/001_create_videos.sql"),
        kind: MigrationKind::Standard,
    },
    Migration {
        version: 2,
        description: "create_analyses_table",
        sql: include_str!("sql/002_create_analyses.sql"),
        kind: MigrationKind::Standard,
    },
    Migration {
        version: 3,
        description: "create_violence_detections_table",
        sql: include_str!("sql/003_create_violence_detections.sql"),
        kind: MigrationKind::Standard,
    },
    Migration {
        version: 4,
        description: "create_queue_entries_table",
        sql: include_str!("sql/004_create_queue_entries.sql"),
        kind: MigrationKind::Standard,
    },
    Migration {
        version: 5,
        description: "add_remote_id_to_analyses",
        sql: include_str!("sql/005_add_remote_id.sql"),
        kind: MigrationKind::AddColumn {
            table: "analyses",
            column: "remote_id",
        },
    },
];

/// Applies every migration newer than the recorded version. Each one runs in
/// its own transaction together with its `_migrations` row.
pub fn run_all(conn: &mut Connection) -> Result<(), DatabaseError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )?;

    let applied: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM _migrations",
        [],
        |r| r.get(0),
    )?;

    for migration in MIGRATIONS.iter().filter(|m| m.version > applied) {
        let tx = conn.transaction()?;
        let skip = match migration.kind {
            MigrationKind::AddColumn { table, column } => column_exists(&tx, table, column)?,
            MigrationKind::Standard => false,
        };

        if skip {
            log::info!(
                "Migration v{} ({}) already reflected in schema",
                migration.version,
                migration.description
            );
        } else {
            log::info!("Applying migration v{}: {}", migration.version, migration.description);
            tx.execute_batch(migration.sql)
                .map_err(|e| DatabaseError::Migration {
                    version: migration.version,
                    reason: e.to_string(),
                })?;
        }

        tx.execute(
            "INSERT INTO _migrations (version, description) VALUES (?1, ?2)",
            rusqlite::params![migration.version, migration.description],
        )?;
        tx.commit()?;
    }

    Ok(())
}

/// Checks whether a column exists on a table using `PRAGMA table_info`.
fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool, DatabaseError> {
    // Only alphanumeric identifiers and underscores are allowed.
    if !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(DatabaseError::Migration {
            version: 0,
            reason: format!("Invalid table name: {}", table),
        });
    }
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let exists = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .any(|r| r.map(|name| name == column).unwrap_or(false));
    Ok(exists)
}
