//! Job orchestration: admission, execution, polling and recovery of analyses.

pub mod handler;
pub mod poller;
mod recovery;
pub mod service;

pub use handler::AnalysisHandler;
pub use poller::{PollError, PollOutcome, Poller};
pub use service::{
    Admission, AnalysisOptions, AnalysisReport, AnalysisSummary, HealthReport, Orchestrator,
    ProgressSnapshot, RecoveryReport,
};
