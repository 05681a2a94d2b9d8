//! Video repository: the minimal slice of the `videos` table the core needs.

use rusqlite::{params, OptionalExtension, Row};

use super::{format_timestamp, parse_timestamp, Database, DatabaseError};
use crate::model::Video;

/// A raw video row from the database.
#[derive(Debug, Clone)]
struct VideoRow {
    id: String,
    title: String,
    storage_key: String,
    created_at: String,
}

impl VideoRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            title: row.get("title")?,
            storage_key: row.get("storage_key")?,
            created_at: row.get("created_at")?,
        })
    }

    fn into_video(self) -> Result<Video, DatabaseError> {
        Ok(Video {
            created_at: parse_timestamp("videos", &self.created_at)?,
            id: self.id,
            title: self.title,
            storage_key: self.storage_key,
        })
    }
}

/// Inserts a video row.
pub fn insert(db: &Database, video: &Video) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO videos (id, title, storage_key, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                video.id,
                video.title,
                video.storage_key,
                format_timestamp(video.created_at)
            ],
        )
        .map_err(DatabaseError::from_write)?;
        Ok(())
    })
}

/// Finds a video by its ID.
pub fn find_by_id(db: &Database, id: &str) -> Result<Option<Video>, DatabaseError> {
    db.with_conn(|conn| {
        conn.query_row(
            "SELECT * FROM videos WHERE id = ?1",
            params![id],
            VideoRow::from_row,
        )
        .optional()?
        .map(VideoRow::into_video)
        .transpose()
    })
}

/// Returns true if a video with this ID exists.
pub fn exists(db: &Database, id: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let count: u32 = conn.query_row(
            "SELECT COUNT(*) FROM videos WHERE id = ?1",
            params![id],
            |r| r.get(0),
        )?;
        Ok(count > 0)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_find() {
        let db = Database::open_in_memory().unwrap();
        let video = Video::new("Parking lot", "uploads/parking.mp4");
        insert(&db, &video).unwrap();

        let found = find_by_id(&db, &video.id).unwrap().unwrap();
        assert_eq!(found.title, "Parking lot");
        assert_eq!(found.storage_key, "uploads/parking.mp4");
        assert_eq!(found.created_at.timestamp(), video.created_at.timestamp());
        assert!(exists(&db, &video.id).unwrap());
    }

    #[test]
    fn test_find_nonexistent() {
        let db = Database::open_in_memory().unwrap();
        assert!(find_by_id(&db, "missing").unwrap().is_none());
        assert!(!exists(&db, "missing").unwrap());
    }

    #[test]
    fn test_duplicate_id_is_unique_violation() {
        let db = Database::open_in_memory().unwrap();
        let video = Video::new("a", "k");
        insert(&db, &video).unwrap();
        let err = insert(&db, &video).unwrap_err();
        assert!(err.is_unique_violation());
    }
}
