//! The watcher lifecycle.
//!
//! A [`Watcher`] is either INERT (no native stream) or RUNNING (exactly one
//! native stream, scheduled on its channel's loop and started).
//!
//! ```text
//!            start()                      stop() / drop
//!   INERT ─────────────────► RUNNING ───────────────────► INERT
//!     ▲  create ─► schedule ─► start     stop ─► invalidate ─► release
//!     └──────────────── restart() = stop() + start() ─────────┘
//! ```
//!
//! Both transitions are idempotent. A stream binds its directories, latency
//! and channel at creation, so reconfiguration takes effect on the next
//! `start()`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use pw_core::{WatchConfig, latency_to_duration};

use crate::backend::{Backend, NativeStream, NotifyBackend, StreamContext, StreamRequest};
use crate::channel::{EventChannel, LoopHandle};
use crate::error::WatchError;
use crate::events::WatcherId;
use crate::handler::ChangeHandler;

/// Owns a native stream and tears it down on every exit path.
///
/// Dropping the guard stops, invalidates and releases the stream, in that
/// order. A stream that failed to start is torn down the same way.
struct ActiveStream {
    native: Option<Box<dyn NativeStream>>,
}

impl ActiveStream {
    fn new(native: Box<dyn NativeStream>) -> Self {
        Self {
            native: Some(native),
        }
    }

    fn schedule(&mut self, run_loop: LoopHandle) {
        if let Some(native) = self.native.as_mut() {
            native.schedule(run_loop);
        }
    }

    fn start(&mut self) -> Result<(), WatchError> {
        match self.native.as_mut() {
            Some(native) => native.start(),
            None => Ok(()),
        }
    }
}

impl Drop for ActiveStream {
    fn drop(&mut self) {
        if let Some(mut native) = self.native.take() {
            native.stop();
            native.invalidate();
            native.release();
        }
    }
}

/// Watches a set of directories and reports changes to one handler.
///
/// Changes are framed by the backend callback onto the watcher's
/// [`EventChannel`] and handed to the handler on the channel's consumer
/// thread, never on the backend thread.
///
/// # Examples
///
/// ```no_run
/// use pw_core::WatchConfig;
/// use pw_watcher::{ChangeBatch, Watcher};
///
/// # fn main() -> Result<(), pw_watcher::WatchError> {
/// let config = WatchConfig::new(["/tmp/watch"]).with_latency(0.1);
/// let mut watcher = Watcher::with_notify(&config, |batch: ChangeBatch| {
///     println!("Detected change in: {:?}", batch.paths());
/// })?;
///
/// watcher.start()?;
/// assert!(watcher.is_running());
///
/// watcher.stop();
/// assert!(!watcher.is_running());
/// # Ok(())
/// # }
/// ```
pub struct Watcher {
    id: WatcherId,
    directories: Vec<Utf8PathBuf>,
    /// Seconds; always non-negative and finite.
    latency: f64,
    /// Present iff RUNNING.
    stream: Option<ActiveStream>,
    channel: Arc<EventChannel>,
    backend: Arc<dyn Backend>,
    handler: Arc<dyn ChangeHandler>,
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("id", &self.id)
            .field("directories", &self.directories)
            .field("latency", &self.latency)
            .field("is_running", &self.is_running())
            .field("run_loop", &self.channel.loop_handle())
            .finish_non_exhaustive()
    }
}

impl Watcher {
    /// Creates an inert watcher and registers its handler with `channel`.
    ///
    /// Directories are taken from `config` as given; only the latency is
    /// checked here.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::InvalidArgument`] if the latency is negative or
    /// not finite.
    pub fn new<H: ChangeHandler>(
        channel: Arc<EventChannel>,
        backend: Arc<dyn Backend>,
        config: &WatchConfig,
        handler: H,
    ) -> Result<Self, WatchError> {
        check_latency(config.latency)?;

        let handler: Arc<dyn ChangeHandler> = Arc::new(handler);
        let id = channel.register(Arc::clone(&handler));

        tracing::debug!(
            watcher = %id,
            directories = config.directories.len(),
            latency = config.latency,
            "Watcher created"
        );

        Ok(Self {
            id,
            directories: config.directories.clone(),
            latency: config.latency,
            stream: None,
            channel,
            backend,
            handler,
        })
    }

    /// Creates an inert watcher on the process-wide channel using the
    /// filesystem backend.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::Io`] if the global channel cannot be created, or
    /// [`WatchError::InvalidArgument`] for a bad latency.
    pub fn with_notify<H: ChangeHandler>(
        config: &WatchConfig,
        handler: H,
    ) -> Result<Self, WatchError> {
        Self::new(EventChannel::global()?, Arc::new(NotifyBackend), config, handler)
    }

    /// Starts watching. Does nothing if the watcher is already running.
    ///
    /// Creates a stream for the current directories and latency, schedules
    /// it on the channel's loop, starts it, and starts the channel's consumer
    /// thread if it is not running yet. On failure the watcher stays inert
    /// and any partially created stream is released.
    ///
    /// # Errors
    ///
    /// - [`WatchError::InvalidArgument`] if there are no directories
    /// - [`WatchError::ChannelClosed`] if the channel can no longer carry frames
    /// - [`WatchError::BackendFailure`] if the stream cannot be created or started
    /// - [`WatchError::Io`] if the consumer thread cannot be spawned
    pub fn start(&mut self) -> Result<&mut Self, WatchError> {
        if self.stream.is_some() {
            return Ok(self);
        }
        if self.directories.is_empty() {
            return Err(WatchError::no_directories());
        }
        self.channel.check()?;

        let request = StreamRequest {
            paths: self
                .directories
                .iter()
                .map(|dir| dir.as_std_path().to_path_buf())
                .collect(),
            latency: check_latency(self.latency)?,
        };
        let context = StreamContext::new(self.id, Arc::clone(&self.channel));

        let mut stream = ActiveStream::new(self.backend.create(request, context)?);
        stream.schedule(self.channel.loop_handle());
        stream.start()?;

        if !self.channel.is_running() {
            self.channel.signal_start()?;
        }

        self.stream = Some(stream);
        tracing::info!(
            watcher = %self.id,
            directories = self.directories.len(),
            run_loop = self.channel.loop_handle().id(),
            "Watcher started"
        );
        Ok(self)
    }

    /// Stops watching. Does nothing if the watcher is not running.
    ///
    /// Frames the backend already wrote are still dispatched to the handler.
    pub fn stop(&mut self) -> &mut Self {
        if let Some(stream) = self.stream.take() {
            drop(stream);
            tracing::info!(watcher = %self.id, "Watcher stopped");
        }
        self
    }

    /// Stops, then starts with the current directories and latency.
    ///
    /// # Errors
    ///
    /// Same as [`Watcher::start`]; the watcher is left inert on error.
    pub fn restart(&mut self) -> Result<&mut Self, WatchError> {
        self.stop();
        self.start()
    }

    /// Returns `true` while a stream is held.
    #[inline]
    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.stream.is_some()
    }

    /// Replaces the watched directories. Takes effect on the next start.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::TypeMismatch`] if any path is not valid UTF-8.
    /// The directory list is left unchanged in that case.
    pub fn set_directories<I, P>(&mut self, directories: I) -> Result<&mut Self, WatchError>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let directories = directories
            .into_iter()
            .map(|dir| {
                let dir = dir.as_ref();
                Utf8Path::from_path(dir)
                    .map(Utf8Path::to_path_buf)
                    .ok_or_else(|| {
                        WatchError::TypeMismatch(format!(
                            "directories must be given as UTF-8 paths, got {}",
                            dir.display()
                        ))
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        self.directories = directories;
        Ok(self)
    }

    /// Sets the latency in seconds. Takes effect on the next start.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::InvalidArgument`] if `latency` is negative or not
    /// finite.
    pub fn set_latency(&mut self, latency: f64) -> Result<&mut Self, WatchError> {
        check_latency(latency)?;
        self.latency = latency;
        Ok(self)
    }

    /// Moves the watcher to another channel.
    ///
    /// The watcher stops, leaves its current channel and registers with the
    /// new one under a new identity. It is restarted if it was running.
    ///
    /// # Errors
    ///
    /// Same as [`Watcher::start`] when a restart is attempted.
    pub fn rebind(&mut self, channel: Arc<EventChannel>) -> Result<&mut Self, WatchError> {
        let was_running = self.is_running();
        self.stop();

        let previous = self.id;
        self.channel.deregister(previous);
        self.id = channel.register(Arc::clone(&self.handler));
        self.channel = channel;

        tracing::debug!(
            previous = %previous,
            watcher = %self.id,
            run_loop = self.channel.loop_handle().id(),
            "Watcher rebound"
        );

        if was_running {
            self.start()?;
        }
        Ok(self)
    }

    /// Returns the identity frames for this watcher carry.
    #[inline]
    #[must_use]
    pub const fn id(&self) -> WatcherId {
        self.id
    }

    /// Returns the watched directories.
    #[inline]
    #[must_use]
    pub fn directories(&self) -> &[Utf8PathBuf] {
        &self.directories
    }

    /// Returns the latency in seconds.
    #[inline]
    #[must_use]
    pub const fn latency(&self) -> f64 {
        self.latency
    }

    /// Returns the channel the watcher's events route through.
    #[inline]
    #[must_use]
    pub const fn channel(&self) -> &Arc<EventChannel> {
        &self.channel
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.stop();
        self.channel.deregister(self.id);
    }
}

/// Creates a watcher on the process-wide channel and starts it.
///
/// # Errors
///
/// Any error from [`Watcher::with_notify`] or [`Watcher::start`].
///
/// # Examples
///
/// ```no_run
/// use pw_core::WatchConfig;
/// use pw_watcher::{ChangeBatch, watch};
///
/// # fn main() -> Result<(), pw_watcher::WatchError> {
/// let _watcher = watch(&WatchConfig::new(["/tmp"]), |batch: ChangeBatch| {
///     println!("{} paths changed", batch.len());
/// })?;
/// # Ok(())
/// # }
/// ```
pub fn watch<H: ChangeHandler>(config: &WatchConfig, handler: H) -> Result<Watcher, WatchError> {
    let mut watcher = Watcher::with_notify(config, handler)?;
    watcher.start()?;
    Ok(watcher)
}

fn check_latency(latency: f64) -> Result<Duration, WatchError> {
    latency_to_duration(latency).map_err(|e| WatchError::InvalidArgument(e.to_string()))
}
