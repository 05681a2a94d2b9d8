use std::path::PathBuf;
use thiserror::Error;

use crate::model::AnalysisStatus;

#[derive(Error, Debug)]
pub enum VidscanError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Analysis error: {0}")]
    Analysis(#[from] AnalysisError),

    #[error("Queue error: {0}")]
    Queue(#[from] crate::queue::QueueError),

    #[error("Engine error: {0}")]
    Engine(#[from] crate::engine::EngineError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Logging setup failed: {0}")]
    Logging(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Schema validation failed: {errors}")]
    SchemaValidation { errors: String },
}

/// Errors surfaced by the orchestrator's public operations.
#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    #[error("Cannot {action} analysis '{id}' in state '{status}'")]
    InvalidState {
        id: String,
        status: AnalysisStatus,
        action: &'static str,
    },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Remote analysis failed: {0}")]
    RemoteAnalysis(String),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Queue error: {0}")]
    Queue(#[from] crate::queue::QueueError),
}

impl AnalysisError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        AnalysisError::NotFound {
            kind,
            id: id.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, VidscanError>;
