//! Durable, priority-ordered analysis queue.

pub mod analysis_queue;
pub mod backoff;
pub mod error;
pub mod types;

pub use analysis_queue::{AnalysisQueue, ClaimedEntry};
pub use backoff::RetryPolicy;
pub use error::QueueError;
pub use types::{
    AnalysisPayload, EnqueueOptions, EntryState, FailOutcome, QueueEntry, QueueHealth, QueueStats,
};
