use thiserror::Error;

use crate::db::DatabaseError;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Queue unavailable: {0}")]
    Unavailable(String),

    #[error("Job '{0}' is already queued")]
    Duplicate(String),

    #[error("Queue storage error: {0}")]
    Database(#[from] DatabaseError),
}
