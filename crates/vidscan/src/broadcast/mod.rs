//! Broadcasting of analysis progress for real-time subscribers.

pub mod job_progress;

pub use job_progress::{
    AnalysisPhase, AnalysisProgressEvent, JobProgressBroadcaster, JobProgressTracker,
};
