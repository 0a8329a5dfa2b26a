//! Filesystem backend built on `notify` and `notify-debouncer-mini`.
//!
//! The debouncer runs its own thread and collects raw `notify` events for
//! one latency window, then hands the batch to our callback. That thread is
//! the backend thread: the callback only converts paths and frames them onto
//! the event channel.
//!
//! ```text
//! RecommendedWatcher ─► Debouncer (latency window) ─► StreamContext::deliver ─► pipe
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use camino::Utf8PathBuf;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use notify_debouncer_mini::{DebounceEventResult, Debouncer, new_debouncer};

use super::{Backend, NativeStream, StreamContext, StreamRequest};
use crate::channel::LoopHandle;
use crate::error::WatchError;

/// Shortest debounce window handed to the debouncer.
///
/// The debouncer polls at a fraction of its timeout, so a zero latency would
/// spin.
const MIN_DEBOUNCE: Duration = Duration::from_millis(10);

/// Backend delivering real filesystem changes.
///
/// Each watched directory is watched recursively. Non-UTF-8 paths reported
/// by the OS are skipped with a warning.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use pw_core::WatchConfig;
/// use pw_watcher::{ChangeBatch, EventChannel, NotifyBackend, Watcher};
///
/// # fn main() -> Result<(), pw_watcher::WatchError> {
/// let mut watcher = Watcher::new(
///     EventChannel::global()?,
///     Arc::new(NotifyBackend),
///     &WatchConfig::new(["/tmp"]).with_latency(0.2),
///     |batch: ChangeBatch| println!("{:?}", batch.paths()),
/// )?;
/// watcher.start()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct NotifyBackend;

impl Backend for NotifyBackend {
    fn create(
        &self,
        request: StreamRequest,
        context: StreamContext,
    ) -> Result<Box<dyn NativeStream>, WatchError> {
        let live = Arc::new(AtomicBool::new(true));
        let callback_live = Arc::clone(&live);
        let watcher = context.watcher();
        let timeout = request.latency.max(MIN_DEBOUNCE);

        let debouncer = new_debouncer(timeout, move |res: DebounceEventResult| {
            if !callback_live.load(Ordering::Acquire) {
                return;
            }
            match res {
                Ok(events) => {
                    let paths: Vec<String> = events
                        .into_iter()
                        .filter_map(|event| match Utf8PathBuf::try_from(event.path) {
                            Ok(path) => Some(path.into_string()),
                            Err(e) => {
                                let invalid_path = e.into_path_buf();
                                tracing::warn!(
                                    path = %invalid_path.display(),
                                    "Skipping non-UTF-8 path in change batch"
                                );
                                None
                            }
                        })
                        .collect();
                    if !paths.is_empty() {
                        context.deliver(&paths);
                    }
                }
                Err(error) => tracing::warn!(error = %error, "Debouncer error"),
            }
        })
        .map_err(WatchError::backend)?;

        tracing::debug!(watcher = %watcher, timeout = ?timeout, "Notify stream created");

        Ok(Box::new(NotifyStream {
            debouncer,
            paths: request.paths,
            watched: Vec::new(),
            live,
            run_loop: None,
        }))
    }
}

struct NotifyStream {
    debouncer: Debouncer<RecommendedWatcher>,
    paths: Vec<PathBuf>,
    /// Paths currently registered with the OS watcher.
    watched: Vec<PathBuf>,
    /// Cleared on invalidation; batches already in flight are then discarded.
    live: Arc<AtomicBool>,
    run_loop: Option<LoopHandle>,
}

impl NativeStream for NotifyStream {
    fn schedule(&mut self, run_loop: LoopHandle) {
        self.run_loop = Some(run_loop);
    }

    fn start(&mut self) -> Result<(), WatchError> {
        for path in &self.paths {
            if self.watched.contains(path) {
                continue;
            }
            self.debouncer
                .watcher()
                .watch(path, RecursiveMode::Recursive)
                .map_err(WatchError::backend)?;
            self.watched.push(path.clone());
        }

        tracing::debug!(
            paths = self.watched.len(),
            run_loop = self.run_loop.map(LoopHandle::id),
            "Notify stream started"
        );
        Ok(())
    }

    fn stop(&mut self) {
        for path in self.watched.drain(..) {
            if let Err(error) = self.debouncer.watcher().unwatch(&path) {
                tracing::debug!(path = %path.display(), error = %error, "Failed to unwatch path");
            }
        }
    }

    fn invalidate(&mut self) {
        self.live.store(false, Ordering::Release);
        self.run_loop = None;
    }

    fn release(self: Box<Self>) {
        // Dropping the debouncer stops its thread.
        drop(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::EventChannel;
    use crate::events::ChangeBatch;
    use crate::watcher::Watcher;
    use pw_core::WatchConfig;
    use std::sync::mpsc;
    use tempfile::TempDir;

    fn create_temp_dir() -> TempDir {
        TempDir::new().expect("Failed to create temp directory")
    }

    #[test]
    fn test_notify_watcher_starts_and_stops() {
        let temp_dir = create_temp_dir();
        let dir = Utf8PathBuf::from_path_buf(temp_dir.path().to_path_buf()).expect("Invalid path");

        let channel = EventChannel::new().expect("Failed to create channel");
        let mut watcher = Watcher::new(
            channel,
            Arc::new(NotifyBackend),
            &WatchConfig::new([dir]).with_latency(0.05),
            |_batch: ChangeBatch| {},
        )
        .expect("Failed to create watcher");

        watcher.start().expect("Failed to start watcher");
        assert!(watcher.is_running());
        watcher.stop();
        assert!(!watcher.is_running());
    }

    #[test]
    fn test_notify_missing_directory_is_backend_failure() {
        let channel = EventChannel::new().expect("Failed to create channel");
        let mut watcher = Watcher::new(
            channel,
            Arc::new(NotifyBackend),
            &WatchConfig::new(["/nonexistent/path/that/does/not/exist"]),
            |_batch: ChangeBatch| {},
        )
        .expect("Failed to create watcher");

        match watcher.start() {
            Err(WatchError::BackendFailure(_)) => {}
            other => panic!("Expected BackendFailure, got {other:?}"),
        }
        assert!(!watcher.is_running());
    }

    #[test]
    fn test_notify_watcher_receives_events() {
        let temp_dir = create_temp_dir();
        let dir = Utf8PathBuf::from_path_buf(temp_dir.path().to_path_buf()).expect("Invalid path");

        let (tx, rx) = mpsc::channel();
        let channel = EventChannel::new().expect("Failed to create channel");
        let mut watcher = Watcher::new(
            channel,
            Arc::new(NotifyBackend),
            &WatchConfig::new([dir]).with_latency(0.05),
            move |batch: ChangeBatch| {
                let _ = tx.send(batch);
            },
        )
        .expect("Failed to create watcher");
        watcher.start().expect("Failed to start watcher");

        std::fs::write(temp_dir.path().join("test.txt"), "hello").expect("Failed to write file");

        let batch = rx.recv_timeout(Duration::from_secs(2));
        watcher.stop();

        // Timing-dependent on some CI filesystems, so only check what arrived.
        if let Ok(batch) = batch {
            assert!(batch.iter().any(|p| p.as_str().contains("test.txt")));
        }
    }
}
