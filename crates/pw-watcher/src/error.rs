//! Error types for the pw-watcher crate.
//!
//! This module provides the [`WatchError`] type for errors that can occur
//! while configuring, starting or running a watcher.

use std::fmt::Display;

use pw_core::ConfigError;

use crate::frame::FrameError;

/// Errors that can occur during watching.
///
/// # Error Recovery Strategy
///
/// - **Invalid argument** ([`WatchError::InvalidArgument`]): Recoverable - fix the input and retry
/// - **Type mismatch** ([`WatchError::TypeMismatch`]): Recoverable - pass UTF-8 paths
/// - **Backend failure** ([`WatchError::BackendFailure`]): Recoverable - the watcher stays inert
/// - **Configuration** ([`WatchError::Config`]): Recoverable - fix the configuration
/// - **Frame** ([`WatchError::Frame`]): Recoverable - the offending batch was not written
/// - **Channel closed** ([`WatchError::ChannelClosed`]): Fatal - events can no longer be delivered
/// - **I/O errors** ([`WatchError::Io`]): Fatal - pipe or thread creation failed
///
/// # Examples
///
/// ```
/// use pw_watcher::WatchError;
///
/// let err = WatchError::no_directories();
/// assert!(err.is_recoverable());
/// assert_eq!(err.to_string(), "invalid argument: no directories to watch");
/// ```
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    /// An argument was rejected before any backend call was made.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A value of the wrong shape was supplied, such as a non-UTF-8 directory.
    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    /// The notification backend failed to create or start a stream.
    ///
    /// The watcher is left inert.
    #[error("event stream backend failed: {0}")]
    BackendFailure(String),

    /// The event channel can no longer carry frames.
    ///
    /// Either the consumer side is gone or the byte stream lost frame
    /// alignment.
    #[error("event channel closed")]
    ChannelClosed,

    /// A configuration value failed validation.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A change batch could not be framed.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WatchError {
    /// Creates the error returned when `start()` is called without directories.
    #[inline]
    pub fn no_directories() -> Self {
        Self::InvalidArgument("no directories to watch".to_owned())
    }

    /// Creates a [`WatchError::BackendFailure`] from any displayable cause.
    #[inline]
    pub fn backend(cause: impl Display) -> Self {
        Self::BackendFailure(cause.to_string())
    }

    /// Returns `true` if this error is recoverable (the caller may retry).
    #[inline]
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        !matches!(self, Self::ChannelClosed | Self::Io(_))
    }

    /// Returns `true` if this error is fatal for event delivery.
    #[inline]
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !self.is_recoverable()
    }
}
