pub mod handler;
pub mod pool;

pub use handler::{HandlerError, JobHandler};
pub use pool::WorkerPool;
