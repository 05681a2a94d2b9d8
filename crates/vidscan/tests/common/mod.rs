//! Shared test utilities for vidscan integration tests.

pub mod harness;

pub use harness::*;
