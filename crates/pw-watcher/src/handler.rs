//! Change handlers invoked on the event channel's consumer thread.
//!
//! Every watcher owns one [`ChangeHandler`]. The channel thread calls it once
//! per decoded frame, in the order frames were written. A slow handler delays
//! draining of the pipe, which in turn slows the backend callback writing into
//! it, so handlers should hand heavy work off elsewhere.
//!
//! # Examples
//!
//! ```
//! use pw_watcher::{ChangeBatch, ChangeHandler};
//!
//! // Any `Fn(ChangeBatch)` closure is a handler.
//! let handler = |batch: ChangeBatch| {
//!     for path in &batch {
//!         let _ = path;
//!     }
//! };
//!
//! fn assert_handler<H: ChangeHandler>(_: &H) {}
//! assert_handler(&handler);
//! ```

use tokio::sync::mpsc;

use crate::events::ChangeBatch;

/// Receives the change batches decoded for one watcher.
///
/// # Thread Safety
///
/// Handlers must be [`Send`] and [`Sync`] because they are registered with a
/// channel whose consumer thread may outlive the code that created them.
pub trait ChangeHandler: Send + Sync + 'static {
    /// Called with every non-empty batch decoded for the watcher.
    fn on_change(&self, batch: ChangeBatch);
}

impl<F> ChangeHandler for F
where
    F: Fn(ChangeBatch) + Send + Sync + 'static,
{
    #[inline]
    fn on_change(&self, batch: ChangeBatch) {
        self(batch);
    }
}

/// A handler that forwards batches into a bounded tokio channel.
///
/// This bridges the consumer thread to async code. When the channel is full
/// the consumer thread waits for room, which propagates backpressure to the
/// backend in the same way a slow synchronous handler would.
///
/// Build one with [`forwarding_handler`].
#[derive(Debug, Clone)]
pub struct ForwardingHandler {
    tx: mpsc::Sender<ChangeBatch>,
}

impl ChangeHandler for ForwardingHandler {
    fn on_change(&self, batch: ChangeBatch) {
        // The consumer thread is a plain OS thread, never a runtime worker.
        if self.tx.blocking_send(batch).is_err() {
            tracing::debug!("Change receiver dropped, discarding batch");
        }
    }
}

/// Creates a [`ForwardingHandler`] and the receiver it feeds.
///
/// A `capacity` of zero is raised to one.
///
/// # Examples
///
/// ```no_run
/// use pw_watcher::{forwarding_handler, watch};
/// use pw_core::WatchConfig;
///
/// # async fn example() -> Result<(), pw_watcher::WatchError> {
/// let (handler, mut changes) = forwarding_handler(64);
/// let _watcher = watch(&WatchConfig::new(["/tmp"]), handler)?;
///
/// while let Some(batch) = changes.recv().await {
///     println!("{} paths changed", batch.len());
/// }
/// # Ok(())
/// # }
/// ```
pub fn forwarding_handler(capacity: usize) -> (ForwardingHandler, mpsc::Receiver<ChangeBatch>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (ForwardingHandler { tx }, rx)
}
