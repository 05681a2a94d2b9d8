use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    /// The engine does not know the task (HTTP 404).
    #[error("Remote analysis '{0}' not found")]
    NotFound(String),

    #[error("Engine returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Engine unreachable: {0}")]
    Transport(String),

    #[error("Failed to decode engine response: {0}")]
    Decode(String),
}

impl EngineError {
    /// Whether repeating the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            EngineError::Transport(_) => true,
            EngineError::Status { status, .. } => *status >= 500 || *status == 429,
            EngineError::NotFound(_) | EngineError::Decode(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(EngineError::Transport("refused".into()).is_transient());
        assert!(EngineError::Status {
            status: 503,
            body: String::new()
        }
        .is_transient());
        assert!(!EngineError::Status {
            status: 400,
            body: String::new()
        }
        .is_transient());
        assert!(!EngineError::NotFound("r-1".into()).is_transient());
    }
}
