//! Client side of the remote analysis engine protocol.

pub mod client;
pub mod error;
pub mod types;

pub use client::{AnalysisEngine, HttpEngineClient};
pub use error::EngineError;
pub use types::{RemoteAnalysis, RemoteDetection, RemoteStatus, StartRequest, StartResponse};
