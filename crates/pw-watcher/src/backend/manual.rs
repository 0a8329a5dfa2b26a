//! An in-process backend whose streams are driven by the caller.
//!
//! [`ManualBackend`] records every stream it creates together with its
//! lifecycle state, and [`ManualBackend::fire`] plays the part of the OS
//! invoking a stream callback. Whichever thread calls `fire` stands in for the
//! backend thread.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use super::{Backend, NativeStream, StreamContext, StreamRequest};
use crate::channel::LoopHandle;
use crate::error::WatchError;
use crate::events::WatcherId;

/// Snapshot of a stream created by a [`ManualBackend`].
#[derive(Debug, Clone, PartialEq)]
pub struct StreamInfo {
    /// Watcher identity bound into the stream's context.
    pub watcher: WatcherId,
    /// Directories the stream was created for.
    pub paths: Vec<PathBuf>,
    /// Requested coalescing window.
    pub latency: Duration,
    /// Loop the stream was scheduled on, if any.
    pub scheduled_on: Option<LoopHandle>,
    /// Whether the stream is currently started.
    pub started: bool,
    /// Whether the stream has been invalidated.
    pub invalidated: bool,
}

#[derive(Debug)]
struct StreamEntry {
    context: StreamContext,
    info: StreamInfo,
}

#[derive(Debug, Default)]
struct ManualState {
    streams: FxHashMap<u64, StreamEntry>,
    next_stream: u64,
    created: usize,
    fail_next: Option<String>,
}

/// Backend for tests and hosts that produce change batches themselves.
///
/// Cloning shares the underlying state, so a test can keep one clone to
/// inspect and fire streams while watchers own another.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use pw_core::WatchConfig;
/// use pw_watcher::{ChangeBatch, EventChannel, ManualBackend, Watcher};
///
/// # fn main() -> Result<(), pw_watcher::WatchError> {
/// let backend = ManualBackend::new();
/// let mut watcher = Watcher::new(
///     EventChannel::new()?,
///     Arc::new(backend.clone()),
///     &WatchConfig::new(["/tmp/watch"]),
///     |_batch: ChangeBatch| {},
/// )?;
///
/// watcher.start()?;
/// assert!(backend.fire(watcher.id(), &["/tmp/watch/a.txt"]));
///
/// watcher.stop();
/// assert!(!backend.fire(watcher.id(), &["/tmp/watch/b.txt"]));
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct ManualBackend {
    state: Arc<Mutex<ManualState>>,
}

impl ManualBackend {
    /// Creates a backend with no streams.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next [`Backend::create`] call fail with the given reason.
    pub fn fail_next_create(&self, reason: impl Into<String>) {
        self.state.lock().fail_next = Some(reason.into());
    }

    /// Invokes the callback of the started stream owned by `watcher`.
    ///
    /// Returns `true` if a frame was written. Returns `false` if the watcher
    /// has no started stream or no path in the batch could be framed.
    pub fn fire<S: AsRef<str>>(&self, watcher: WatcherId, paths: &[S]) -> bool {
        let context = {
            let state = self.state.lock();
            state
                .streams
                .values()
                .find(|entry| {
                    entry.info.watcher == watcher && entry.info.started && !entry.info.invalidated
                })
                .map(|entry| entry.context.clone())
        };

        // Deliver outside the lock; the pipe write may block.
        match context {
            Some(context) => context.deliver(paths),
            None => {
                tracing::trace!(watcher = %watcher, "No started stream to fire");
                false
            }
        }
    }

    /// Returns the state of the live stream owned by `watcher`, if any.
    #[must_use]
    pub fn stream(&self, watcher: WatcherId) -> Option<StreamInfo> {
        self.state
            .lock()
            .streams
            .values()
            .find(|entry| entry.info.watcher == watcher)
            .map(|entry| entry.info.clone())
    }

    /// Returns the number of streams created and not yet released.
    #[must_use]
    pub fn live_streams(&self) -> usize {
        self.state.lock().streams.len()
    }

    /// Returns the number of streams created over the backend's lifetime.
    #[must_use]
    pub fn streams_created(&self) -> usize {
        self.state.lock().created
    }

    fn update(&self, stream: u64, apply: impl FnOnce(&mut StreamInfo)) {
        if let Some(entry) = self.state.lock().streams.get_mut(&stream) {
            apply(&mut entry.info);
        }
    }
}

impl Backend for ManualBackend {
    fn create(
        &self,
        request: StreamRequest,
        context: StreamContext,
    ) -> Result<Box<dyn NativeStream>, WatchError> {
        let mut state = self.state.lock();
        if let Some(reason) = state.fail_next.take() {
            return Err(WatchError::BackendFailure(reason));
        }

        let id = state.next_stream;
        state.next_stream += 1;
        state.created += 1;
        let info = StreamInfo {
            watcher: context.watcher(),
            paths: request.paths,
            latency: request.latency,
            scheduled_on: None,
            started: false,
            invalidated: false,
        };
        state.streams.insert(id, StreamEntry { context, info });

        Ok(Box::new(ManualStream {
            id,
            backend: self.clone(),
        }))
    }
}

struct ManualStream {
    id: u64,
    backend: ManualBackend,
}

impl NativeStream for ManualStream {
    fn schedule(&mut self, run_loop: LoopHandle) {
        self.backend.update(self.id, |info| info.scheduled_on = Some(run_loop));
    }

    fn start(&mut self) -> Result<(), WatchError> {
        self.backend.update(self.id, |info| info.started = true);
        Ok(())
    }

    fn stop(&mut self) {
        self.backend.update(self.id, |info| info.started = false);
    }

    fn invalidate(&mut self) {
        self.backend.update(self.id, |info| info.invalidated = true);
    }

    fn release(self: Box<Self>) {
        self.backend.state.lock().streams.remove(&self.id);
    }
}
