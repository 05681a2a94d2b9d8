//! Resolution of stored videos to locations the analysis engine can fetch.

pub mod locator;

pub use locator::{StorageError, UrlVideoLocator, VideoLocator};
