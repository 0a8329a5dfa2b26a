//! Configuration types and errors for pipewatch.
//!
//! This crate holds the pieces shared by the watcher library and the CLI:
//!
//! - [`WatchConfig`] - which directories to watch and the coalescing latency
//! - [`ConfigError`] - failures while loading or validating configuration

#![deny(clippy::all)]
#![warn(missing_docs)]

pub mod config;
pub mod error;

pub use config::{DEFAULT_LATENCY_SECS, WatchConfig, latency_to_duration};
pub use error::ConfigError;
