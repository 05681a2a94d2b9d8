pub mod broadcast;
pub mod cache;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod logging;
pub mod model;
pub mod orchestrator;
pub mod queue;
pub mod storage;
pub mod worker;

pub use broadcast::{AnalysisProgressEvent, JobProgressBroadcaster};
pub use cache::{MemoryCache, ResultCache};
pub use config::{load_config, Config};
pub use db::Database;
pub use engine::{AnalysisEngine, HttpEngineClient};
pub use error::{AnalysisError, ConfigError, Result, VidscanError};
pub use logging::init_logging;
pub use model::{Analysis, AnalysisStatus, Detection, Video};
pub use orchestrator::{AnalysisOptions, AnalysisReport, Orchestrator};
pub use queue::{AnalysisQueue, QueueStats};
pub use storage::{UrlVideoLocator, VideoLocator};
pub use worker::{HandlerError, JobHandler, WorkerPool};
