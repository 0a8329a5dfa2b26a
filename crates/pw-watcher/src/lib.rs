//! Directory change notification over a framed pipe.
//!
//! This crate reports changes inside a set of watched directories to a
//! per-watcher handler. Notification backends deliver batches of changed
//! paths on threads they own; this crate moves each batch across an OS pipe
//! to one consumer thread, so handlers never run on a backend thread.
//!
//! # Overview
//!
//! - [`Watcher`] owns zero or one native stream and moves between INERT and
//!   RUNNING with idempotent `start()`/`stop()`
//! - [`EventChannel`] is the pipe plus the consumer thread that decodes frames
//!   and dispatches them by watcher identity
//! - [`Backend`] is the seam to the notification facility; [`NotifyBackend`]
//!   watches the filesystem, [`ManualBackend`] is driven by the caller
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                 Backend Thread (notify debouncer)                │
//! │  ┌──────────────────┐    ┌────────────────┐    ┌──────────────┐  │
//! │  │ NativeStream     │ -> │ StreamContext  │ -> │ frame::encode│  │
//! │  │ (latency window) │    │ ::deliver()    │    │ + write_all  │  │
//! │  └──────────────────┘    └────────────────┘    └──────┬───────┘  │
//! └───────────────────────────────────────────────────────│──────────┘
//!                                                         │
//!                                      OS pipe (framed)   │
//!                                                         ▼
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                 Consumer Thread (EventChannel)                   │
//! │  ┌──────────────────┐    ┌────────────────┐                      │
//! │  │ FrameReader      │ -> │ handlers[id]   │ -> ChangeHandler     │
//! │  │ (length-delim.)  │    │ (FxHashMap)    │                      │
//! │  └──────────────────┘    └────────────────┘                      │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Wire Format
//!
//! Each batch is one frame: the watcher identity as a native-endian `usize`,
//! the payload length as a native-endian `i64`, then the paths joined by
//! `\n`. See [`frame`] for details.
//!
//! # Crate Dependencies
//!
//! ```text
//! pw-cli ──► pw-watcher ──► pw-core
//! ```
//!
//! # Usage
//!
//! ## Synchronous Handler
//!
//! ```no_run
//! use pw_core::WatchConfig;
//! use pw_watcher::{ChangeBatch, watch};
//!
//! # fn main() -> Result<(), pw_watcher::WatchError> {
//! let config = WatchConfig::new(["/tmp/watch"]).with_latency(0.1);
//! let mut watcher = watch(&config, |batch: ChangeBatch| {
//!     println!("Detected change in: {:?}", batch.paths());
//! })?;
//!
//! // Later: pick up a new directory list.
//! watcher.set_directories(["/tmp/other"])?.restart()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Async Consumer
//!
//! ```no_run
//! use pw_core::WatchConfig;
//! use pw_watcher::{forwarding_handler, watch};
//!
//! # async fn example() -> Result<(), pw_watcher::WatchError> {
//! let (handler, mut changes) = forwarding_handler(64);
//! let _watcher = watch(&WatchConfig::new(["/tmp/watch"]), handler)?;
//!
//! while let Some(batch) = changes.recv().await {
//!     for path in &batch {
//!         println!("Changed: {path}");
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Error Handling
//!
//! The crate uses [`WatchError`] for all error cases:
//!
//! ```
//! use pw_watcher::WatchError;
//!
//! fn handle_watch_error(err: WatchError) {
//!     if err.is_fatal() {
//!         eprintln!("Fatal watcher error: {err}");
//!     } else {
//!         eprintln!("Warning: {err}");
//!     }
//! }
//! ```

#![deny(clippy::all)]
#![warn(missing_docs)]

pub mod backend;
pub mod channel;
pub mod error;
pub mod events;
pub mod frame;
pub mod handler;
pub mod watcher;

// Re-export error types
pub use error::WatchError;
pub use frame::FrameError;

// Re-export event types
pub use events::{ChangeBatch, WatcherId};

// Re-export channel and handler types
pub use channel::{EventChannel, LoopHandle, WriteEnd};
pub use handler::{ChangeHandler, ForwardingHandler, forwarding_handler};

// Re-export backend types
pub use backend::{
    Backend, ManualBackend, NativeStream, NotifyBackend, StreamContext, StreamInfo, StreamRequest,
};

// Re-export watcher types
pub use watcher::{Watcher, watch};
