//! The seam between watchers and a change-notification backend.
//!
//! A backend turns a set of directories into a *native stream*: a
//! registration that, once scheduled and started, invokes a callback on a
//! backend-owned thread with batches of changed paths. The callback is
//! represented by a [`StreamContext`], which carries the watcher identity
//! across the backend boundary and frames each batch onto the watcher's
//! event channel.
//!
//! A stream binds its directories and context at creation and cannot be
//! changed afterwards; restarting a watch means releasing the stream and
//! creating a new one.
//!
//! Two backends ship with the crate:
//!
//! - [`NotifyBackend`] - real filesystem events via `notify`, debounced by
//!   `notify-debouncer-mini` using the watcher latency
//! - [`ManualBackend`] - streams driven by [`ManualBackend::fire`], for tests
//!   and hosts that source events themselves

mod manual;
mod native;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use smallvec::SmallVec;

use crate::channel::{EventChannel, LoopHandle};
use crate::error::WatchError;
use crate::events::WatcherId;
use crate::frame;

pub use manual::{ManualBackend, StreamInfo};
pub use native::NotifyBackend;

/// Parameters for creating a native stream.
///
/// Streams always report events that happen after creation ("since now").
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRequest {
    /// Directories to watch, in the backend's native path form.
    pub paths: Vec<PathBuf>,
    /// Coalescing window.
    pub latency: Duration,
}

/// The callback context bound to a native stream.
///
/// Holds the identity of the owning watcher and the channel its frames go
/// to. It never references the watcher itself, so the backend thread cannot
/// observe watcher state.
#[derive(Debug, Clone)]
pub struct StreamContext {
    watcher: WatcherId,
    channel: Arc<EventChannel>,
}

impl StreamContext {
    pub(crate) const fn new(watcher: WatcherId, channel: Arc<EventChannel>) -> Self {
        Self { watcher, channel }
    }

    /// Returns the identity of the watcher that owns the stream.
    #[inline]
    #[must_use]
    pub const fn watcher(&self) -> WatcherId {
        self.watcher
    }

    /// Frames one backend batch and writes it to the event channel.
    ///
    /// This is the stream callback. It never waits for the consumer, although
    /// the write itself blocks while the pipe is full. Paths that cannot be
    /// framed (empty, or containing `\n`) are dropped with a warning; if none
    /// remain nothing is written. Returns `true` if a frame was written.
    pub fn deliver<S: AsRef<str>>(&self, paths: &[S]) -> bool {
        let framable: SmallVec<[&str; 8]> = paths
            .iter()
            .map(AsRef::<str>::as_ref)
            .filter(|path| match frame::check_path(path) {
                Ok(()) => true,
                Err(reason) => {
                    tracing::warn!(watcher = %self.watcher, path = ?path, reason, "Dropping path from change batch");
                    false
                }
            })
            .collect();

        if framable.is_empty() {
            tracing::trace!(watcher = %self.watcher, "Change batch had no framable paths");
            return false;
        }

        match self.channel.send(self.watcher, &framable) {
            Ok(()) => true,
            Err(error) => {
                tracing::debug!(watcher = %self.watcher, error = %error, "Change batch not delivered");
                false
            }
        }
    }
}

/// A change-notification backend.
pub trait Backend: Send + Sync + 'static {
    /// Creates a native stream for the requested directories.
    ///
    /// The stream is inert until scheduled and started. `context` must be
    /// invoked for every batch the stream produces.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::BackendFailure`] if the backend cannot create the
    /// stream.
    fn create(
        &self,
        request: StreamRequest,
        context: StreamContext,
    ) -> Result<Box<dyn NativeStream>, WatchError>;
}

/// A native notification registration.
///
/// Watchers drive these in a fixed order: `schedule`, `start`, and on
/// teardown `stop`, `invalidate`, `release`.
pub trait NativeStream: Send {
    /// Associates the stream with the loop its events are routed to.
    fn schedule(&mut self, run_loop: LoopHandle);

    /// Begins delivering events.
    fn start(&mut self) -> Result<(), WatchError>;

    /// Stops delivering events.
    fn stop(&mut self);

    /// Detaches the stream from its loop; no callback may run afterwards.
    fn invalidate(&mut self);

    /// Frees the stream.
    fn release(self: Box<Self>);
}
