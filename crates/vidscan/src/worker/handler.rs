use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::queue::QueueEntry;

/// Failure reported by a [`JobHandler`].
///
/// `retryable` failures go back to the queue with backoff; others fail the
/// entry immediately.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
    pub retryable: bool,
}

impl HandlerError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

/// Processes queue entries on behalf of the worker pool.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Runs one attempt. `cancel` fires when the entry is cancelled or the pool aborts.
    async fn handle(&self, entry: &QueueEntry, cancel: CancellationToken)
        -> Result<(), HandlerError>;

    /// Called once when a retryable failure used up the last attempt.
    async fn on_exhausted(&self, _entry: &QueueEntry, _error: &HandlerError) {}
}
