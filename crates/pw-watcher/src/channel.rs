//! The event channel: an OS pipe plus the thread that drains it.
//!
//! Backend callbacks run on threads this crate does not control. They must
//! return quickly and must never touch handler state directly, so each batch
//! is framed (see [`crate::frame`]) and written to the write end of a pipe.
//! A dedicated consumer thread reads frames off the other end, decodes them
//! and invokes the handler registered for the frame's watcher identity.
//!
//! ```text
//! backend thread(s)                         consumer thread
//! ┌──────────────────┐   frame bytes   ┌───────────────────────────┐
//! │ StreamContext    │ ──────────────► │ FrameReader ─► dispatch   │
//! │  ::deliver()     │    (pipe)       │   handlers[watcher_id]    │
//! └──────────────────┘                 └───────────────────────────┘
//! ```
//!
//! The consumer thread is started lazily by [`EventChannel::signal_start`],
//! exactly once per channel, and runs until every write end is gone.

use std::io::{BufReader, PipeReader, PipeWriter, Write};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;

use parking_lot::{Mutex, MutexGuard, RwLock};
use rustc_hash::FxHashMap;

use crate::error::WatchError;
use crate::events::{ChangeBatch, WatcherId};
use crate::frame::{self, Frame, FrameReader};
use crate::handler::ChangeHandler;

/// Exclusive access to the write end of a channel's pipe.
///
/// Holding the guard keeps other writers out, so everything written through
/// it lands contiguously in the pipe.
pub type WriteEnd<'a> = MutexGuard<'a, PipeWriter>;

static NEXT_LOOP: AtomicU64 = AtomicU64::new(1);
static GLOBAL: OnceLock<Arc<EventChannel>> = OnceLock::new();

/// Identifies the consumer loop of one [`EventChannel`].
///
/// Backends receive it when a stream is scheduled, so they know which loop
/// the stream's events are routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LoopHandle(u64);

impl LoopHandle {
    /// Returns the numeric id of the loop.
    #[inline]
    #[must_use]
    pub const fn id(self) -> u64 {
        self.0
    }
}

/// State shared between the channel and its consumer thread.
#[derive(Default)]
struct Shared {
    handlers: RwLock<FxHashMap<WatcherId, Arc<dyn ChangeHandler>>>,
    running: AtomicBool,
    closed: AtomicBool,
}

/// A pipe-backed mailbox from backend threads to one consumer thread.
///
/// Watchers hold an `Arc<EventChannel>`; any number of watchers may share one
/// channel. Frames from one writer are dispatched in write order. Frames from
/// different watchers interleave at frame granularity.
///
/// # Examples
///
/// ```
/// use pw_watcher::EventChannel;
///
/// # fn main() -> Result<(), pw_watcher::WatchError> {
/// let channel = EventChannel::new()?;
/// assert!(!channel.is_running());
///
/// channel.signal_start()?;
/// assert!(channel.is_running());
/// # Ok(())
/// # }
/// ```
pub struct EventChannel {
    writer: Mutex<PipeWriter>,
    /// Taken by the consumer thread when it starts.
    reader: Mutex<Option<PipeReader>>,
    shared: Arc<Shared>,
    loop_handle: LoopHandle,
    next_id: AtomicUsize,
}

impl std::fmt::Debug for EventChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventChannel")
            .field("loop_handle", &self.loop_handle)
            .field("is_running", &self.is_running())
            .field("is_closed", &self.is_closed())
            .field("handlers", &self.handler_count())
            .finish_non_exhaustive()
    }
}

impl EventChannel {
    /// Creates a channel with a fresh pipe. The consumer thread is not started.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::Io`] if the pipe cannot be created.
    pub fn new() -> Result<Arc<Self>, WatchError> {
        let (reader, writer) = std::io::pipe()?;
        let loop_handle = LoopHandle(NEXT_LOOP.fetch_add(1, Ordering::Relaxed));

        tracing::debug!(run_loop = loop_handle.id(), "Event channel created");

        Ok(Arc::new(Self {
            writer: Mutex::new(writer),
            reader: Mutex::new(Some(reader)),
            shared: Arc::new(Shared::default()),
            loop_handle,
            next_id: AtomicUsize::new(1),
        }))
    }

    /// Returns the process-wide channel, creating it on first use.
    pub fn global() -> Result<Arc<Self>, WatchError> {
        if let Some(channel) = GLOBAL.get() {
            return Ok(Arc::clone(channel));
        }
        let channel = Self::new()?;
        Ok(Arc::clone(GLOBAL.get_or_init(|| channel)))
    }

    /// Returns the handle streams are scheduled onto.
    #[inline]
    #[must_use]
    pub const fn loop_handle(&self) -> LoopHandle {
        self.loop_handle
    }

    /// Locks and returns the write end of the pipe.
    pub fn write_end(&self) -> WriteEnd<'_> {
        self.writer.lock()
    }

    /// Returns `true` while the consumer thread is pumping the pipe.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Returns `true` once the channel can no longer carry frames.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Reports [`WatchError::ChannelClosed`] if the channel is closed.
    pub fn check(&self) -> Result<(), WatchError> {
        if self.is_closed() {
            return Err(WatchError::ChannelClosed);
        }
        Ok(())
    }

    /// Starts the consumer thread if it has not been started yet.
    ///
    /// Only the first call spawns a thread; later calls return immediately.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::Io`] if the thread cannot be spawned. The channel
    /// is closed in that case, since its read end went with the failed spawn.
    pub fn signal_start(&self) -> Result<(), WatchError> {
        let Some(reader) = self.reader.lock().take() else {
            return Ok(());
        };

        let shared = Arc::clone(&self.shared);
        let run_loop = self.loop_handle.id();
        self.shared.running.store(true, Ordering::Release);

        let spawned = thread::Builder::new()
            .name(format!("pipewatch-loop-{run_loop}"))
            .spawn(move || run_pump_loop(reader, &shared, run_loop));

        if let Err(error) = spawned {
            self.shared.running.store(false, Ordering::Release);
            self.shared.closed.store(true, Ordering::Release);
            tracing::error!(run_loop, error = %error, "Failed to spawn event channel thread");
            return Err(WatchError::Io(error));
        }

        tracing::debug!(run_loop, "Event channel thread started");
        Ok(())
    }

    /// Registers a handler and returns the identity frames must carry to
    /// reach it.
    pub fn register(&self, handler: Arc<dyn ChangeHandler>) -> WatcherId {
        let id = WatcherId::from_raw(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.shared.handlers.write().insert(id, handler);
        tracing::trace!(watcher = %id, run_loop = self.loop_handle.id(), "Handler registered");
        id
    }

    /// Removes a handler. Frames still queued for it are discarded on arrival.
    pub fn deregister(&self, id: WatcherId) {
        if self.shared.handlers.write().remove(&id).is_some() {
            tracing::trace!(watcher = %id, run_loop = self.loop_handle.id(), "Handler deregistered");
        }
    }

    /// Returns `true` if a handler is registered for `id`.
    #[must_use]
    pub fn is_registered(&self, id: WatcherId) -> bool {
        self.shared.handlers.read().contains_key(&id)
    }

    /// Returns the number of registered handlers.
    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.shared.handlers.read().len()
    }

    /// Frames a batch and writes it to the pipe as one contiguous unit.
    ///
    /// Blocks while the pipe is full. A failed write may leave a partial frame
    /// behind, after which the stream cannot be trusted, so the channel is
    /// closed.
    pub(crate) fn send<S: AsRef<str>>(&self, watcher: WatcherId, paths: &[S]) -> Result<(), WatchError> {
        let bytes = frame::encode(watcher, paths)?;

        let mut writer = self.write_end();
        // Checked under the lock so no writer follows a partial frame.
        self.check()?;
        if let Err(error) = writer.write_all(&bytes) {
            self.shared.closed.store(true, Ordering::Release);
            tracing::error!(
                watcher = %watcher,
                run_loop = self.loop_handle.id(),
                error = %error,
                "Failed to write frame, closing event channel"
            );
            return Err(WatchError::ChannelClosed);
        }

        tracing::trace!(watcher = %watcher, paths = paths.len(), bytes = bytes.len(), "Frame written");
        Ok(())
    }
}

/// Reads and dispatches frames until the stream ends or loses alignment.
fn run_pump_loop(reader: PipeReader, shared: &Shared, run_loop: u64) {
    let mut frames = FrameReader::new(BufReader::new(reader));

    loop {
        match frames.read_frame() {
            Ok(Some(frame)) => dispatch(shared, &frame),
            Ok(None) => {
                tracing::debug!(run_loop, "Event channel writer closed, stopping");
                break;
            }
            Err(error) => {
                shared.closed.store(true, Ordering::Release);
                tracing::error!(run_loop, error = %error, "Event channel stream corrupted, stopping");
                break;
            }
        }
    }

    shared.running.store(false, Ordering::Release);
}

/// Hands one frame to the handler registered for its watcher.
fn dispatch(shared: &Shared, frame: &Frame) {
    let paths = match frame.paths() {
        Ok(paths) => paths,
        Err(error) => {
            tracing::warn!(watcher = %frame.watcher, error = %error, "Skipping undecodable frame");
            return;
        }
    };
    if paths.is_empty() {
        tracing::trace!(watcher = %frame.watcher, "Skipping empty frame");
        return;
    }

    let Some(handler) = shared.handlers.read().get(&frame.watcher).map(Arc::clone) else {
        tracing::debug!(watcher = %frame.watcher, "No handler registered, dropping frame");
        return;
    };

    let batch = ChangeBatch::new(frame.watcher, paths.iter().copied());
    if panic::catch_unwind(AssertUnwindSafe(|| handler.on_change(batch))).is_err() {
        tracing::error!(watcher = %frame.watcher, "Change handler panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn collecting_handler() -> (Arc<dyn ChangeHandler>, mpsc::Receiver<ChangeBatch>) {
        let (tx, rx) = mpsc::channel();
        let handler: Arc<dyn ChangeHandler> = Arc::new(move |batch: ChangeBatch| {
            let _ = tx.send(batch);
        });
        (handler, rx)
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + TIMEOUT;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    fn paths_of(batch: &ChangeBatch) -> Vec<&str> {
        batch.iter().map(camino::Utf8Path::as_str).collect()
    }

    #[test]
    fn test_send_and_dispatch() {
        let channel = EventChannel::new().unwrap();
        let (handler, rx) = collecting_handler();
        let id = channel.register(handler);

        channel.signal_start().unwrap();
        channel.send(id, &["/tmp/watch/a.txt", "/tmp/watch/b.txt"]).unwrap();

        let batch = rx.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(batch.watcher, id);
        assert_eq!(paths_of(&batch), vec!["/tmp/watch/a.txt", "/tmp/watch/b.txt"]);
    }

    #[test]
    fn test_frames_written_before_start_are_queued() {
        let channel = EventChannel::new().unwrap();
        let (handler, rx) = collecting_handler();
        let id = channel.register(handler);

        channel.send(id, &["/early"]).unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

        channel.signal_start().unwrap();
        let batch = rx.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(paths_of(&batch), vec!["/early"]);
    }

    #[test]
    fn test_signal_start_is_idempotent() {
        let channel = EventChannel::new().unwrap();
        channel.signal_start().unwrap();
        channel.signal_start().unwrap();
        assert!(channel.is_running());
        assert!(!channel.is_closed());
    }

    #[test]
    fn test_unregistered_frames_are_skipped() {
        let channel = EventChannel::new().unwrap();
        let (handler, rx) = collecting_handler();
        let id = channel.register(handler);
        let gone = channel.register(Arc::new(|_batch: ChangeBatch| {}));
        channel.deregister(gone);
        assert!(!channel.is_registered(gone));

        channel.signal_start().unwrap();
        channel.send(gone, &["/orphan"]).unwrap();
        channel.send(id, &["/kept"]).unwrap();

        let batch = rx.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(paths_of(&batch), vec!["/kept"]);
        assert_eq!(channel.handler_count(), 1);
    }

    #[test]
    fn test_empty_payload_is_not_dispatched() {
        let channel = EventChannel::new().unwrap();
        let (handler, rx) = collecting_handler();
        let id = channel.register(handler);
        channel.signal_start().unwrap();

        {
            let mut writer = channel.write_end();
            writer.write_all(&id.as_raw().to_ne_bytes()).unwrap();
            writer.write_all(&0i64.to_ne_bytes()).unwrap();
        }
        channel.send(id, &["/after-empty"]).unwrap();

        let batch = rx.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(paths_of(&batch), vec!["/after-empty"]);
    }

    #[test]
    fn test_corrupt_length_closes_channel() {
        let channel = EventChannel::new().unwrap();
        let (handler, _rx) = collecting_handler();
        let id = channel.register(handler);
        channel.signal_start().unwrap();

        {
            let mut writer = channel.write_end();
            writer.write_all(&id.as_raw().to_ne_bytes()).unwrap();
            writer.write_all(&(-7i64).to_ne_bytes()).unwrap();
        }

        assert!(wait_until(|| channel.is_closed()));
        assert!(wait_until(|| !channel.is_running()));
        assert!(matches!(channel.send(id, &["/late"]), Err(WatchError::ChannelClosed)));
        assert!(matches!(channel.check(), Err(WatchError::ChannelClosed)));
    }

    #[test]
    fn test_panicking_handler_does_not_stop_the_loop() {
        let channel = EventChannel::new().unwrap();
        let boom = channel.register(Arc::new(|_batch: ChangeBatch| {
            std::panic::panic_any("handler failure");
        }));
        let (handler, rx) = collecting_handler();
        let id = channel.register(handler);
        channel.signal_start().unwrap();

        channel.send(boom, &["/explodes"]).unwrap();
        channel.send(id, &["/survives"]).unwrap();

        let batch = rx.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(paths_of(&batch), vec!["/survives"]);
        assert!(channel.is_running());
    }

    #[test]
    fn test_concurrent_writers_never_interleave_frames() {
        let channel = EventChannel::new().unwrap();
        let (handler_a, rx_a) = collecting_handler();
        let (handler_b, rx_b) = collecting_handler();
        let a = channel.register(handler_a);
        let b = channel.register(handler_b);
        channel.signal_start().unwrap();

        let writers: Vec<_> = [(a, "/a"), (b, "/b")]
            .into_iter()
            .map(|(id, prefix)| {
                let channel = Arc::clone(&channel);
                thread::spawn(move || {
                    for i in 0..200 {
                        let first = format!("{prefix}/{i}/first");
                        let second = format!("{prefix}/{i}/second");
                        channel.send(id, &[first, second]).unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        for (rx, id, prefix) in [(rx_a, a, "/a"), (rx_b, b, "/b")] {
            for i in 0..200 {
                let batch = rx.recv_timeout(TIMEOUT).unwrap();
                assert_eq!(batch.watcher, id);
                assert_eq!(
                    paths_of(&batch),
                    vec![format!("{prefix}/{i}/first"), format!("{prefix}/{i}/second")]
                );
            }
        }
    }

    #[test]
    fn test_global_channel_is_shared() {
        let first = EventChannel::global().unwrap();
        let second = EventChannel::global().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.loop_handle(), second.loop_handle());
    }

    #[test]
    fn test_loop_handles_are_distinct() {
        let a = EventChannel::new().unwrap();
        let b = EventChannel::new().unwrap();
        assert_ne!(a.loop_handle(), b.loop_handle());
    }
}
