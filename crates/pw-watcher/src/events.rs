//! Event types delivered to change handlers.
//!
//! # Event Flow
//!
//! ```text
//! backend batch (backend thread)
//!        │
//!        ▼
//!   frame written to pipe
//!        │
//!        ▼
//!   frame decoded (channel thread)
//!        │
//!        ▼
//!   ChangeBatch handed to the watcher's handler
//! ```

use std::fmt;
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use smallvec::SmallVec;

/// Opaque token identifying a watcher on an event channel.
///
/// The token is pointer-width and travels through the pipe in place of a
/// reference to the watcher. It is minted by
/// [`EventChannel::register`](crate::EventChannel::register) and is only
/// meaningful for the channel that minted it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatcherId(usize);

impl WatcherId {
    /// Rebuilds an identity from its wire representation.
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    /// Returns the wire representation of this identity.
    #[inline]
    #[must_use]
    pub const fn as_raw(self) -> usize {
        self.0
    }
}

impl fmt::Display for WatcherId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "watcher#{}", self.0)
    }
}

/// One decoded frame: the paths a backend reported together.
///
/// Paths keep the order and duplicates the backend delivered them in.
///
/// # Memory Efficiency
///
/// Uses [`SmallVec`] with inline storage for up to 8 paths, avoiding heap
/// allocation for the common case of small batches.
///
/// # Examples
///
/// ```
/// use pw_watcher::{ChangeBatch, WatcherId};
///
/// let batch = ChangeBatch::new(WatcherId::from_raw(1), ["/tmp/watch/a.txt", "/tmp/watch/b.txt"]);
/// assert_eq!(batch.len(), 2);
/// assert_eq!(batch.paths()[0].as_str(), "/tmp/watch/a.txt");
/// ```
#[derive(Debug, Clone)]
pub struct ChangeBatch {
    /// The watcher whose stream produced this batch.
    pub watcher: WatcherId,

    /// The changed paths, in delivery order.
    pub paths: SmallVec<[Utf8PathBuf; 8]>,

    /// When the consumer thread decoded this batch.
    pub received_at: Instant,
}

impl ChangeBatch {
    /// Creates a batch for the given watcher.
    ///
    /// The `received_at` timestamp is set to the current instant.
    #[must_use]
    pub fn new<I, P>(watcher: WatcherId, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Utf8PathBuf>,
    {
        Self {
            watcher,
            paths: paths.into_iter().map(Into::into).collect(),
            received_at: Instant::now(),
        }
    }

    /// Returns the paths as a slice.
    #[inline]
    #[must_use]
    pub fn paths(&self) -> &[Utf8PathBuf] {
        &self.paths
    }

    /// Returns the number of paths in this batch.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    /// Returns `true` if the batch contains no paths.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Returns an iterator over the paths.
    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = &Utf8Path> {
        self.paths.iter().map(Utf8PathBuf::as_path)
    }

    /// Returns the unique paths in this batch, sorted.
    ///
    /// Useful when a handler only cares which paths changed, not how often.
    #[must_use]
    pub fn unique_paths(&self) -> Vec<&Utf8Path> {
        let mut paths: Vec<&Utf8Path> = self.iter().collect();
        paths.sort_unstable();
        paths.dedup();
        paths
    }
}

impl IntoIterator for ChangeBatch {
    type Item = Utf8PathBuf;
    type IntoIter = smallvec::IntoIter<[Utf8PathBuf; 8]>;

    fn into_iter(self) -> Self::IntoIter {
        self.paths.into_iter()
    }
}

impl<'a> IntoIterator for &'a ChangeBatch {
    type Item = &'a Utf8PathBuf;
    type IntoIter = std::slice::Iter<'a, Utf8PathBuf>;

    fn into_iter(self) -> Self::IntoIter {
        self.paths.iter()
    }
}
