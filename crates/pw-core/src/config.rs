//! Configuration structures for pipewatch.
//!
//! [`WatchConfig`] describes one watch session: the directories handed to the
//! notification backend and the latency (coalescing window) it is asked to
//! honour. It implements [`Default`] and deserializes with missing fields
//! falling back to the defaults, so a JSON file only needs the keys it changes.

use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default coalescing window, in seconds.
pub const DEFAULT_LATENCY_SECS: f64 = 0.5;

/// Configuration for a single watcher.
///
/// # Examples
///
/// ```
/// use pw_core::WatchConfig;
///
/// let config = WatchConfig::new(["/tmp/watch"]).with_latency(0.1);
/// assert_eq!(config.directories.len(), 1);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Absolute paths of the directories to watch, in order.
    pub directories: Vec<Utf8PathBuf>,

    /// Coalescing window requested from the backend, in seconds.
    ///
    /// Changes that happen within this window are delivered as one batch.
    pub latency: f64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            directories: Vec::new(),
            latency: DEFAULT_LATENCY_SECS,
        }
    }
}

impl WatchConfig {
    /// Creates a configuration for the given directories with the default latency.
    #[must_use]
    pub fn new<I, P>(directories: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Utf8PathBuf>,
    {
        Self {
            directories: directories.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Sets the latency in seconds.
    #[must_use]
    pub fn with_latency(mut self, latency: f64) -> Self {
        self.latency = latency;
        self
    }

    /// Returns the latency as a [`Duration`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidOption`] if the latency is negative,
    /// NaN, or too large to represent.
    pub fn latency_duration(&self) -> Result<Duration, ConfigError> {
        latency_to_duration(self.latency)
    }

    /// Checks the latency and that every directory is absolute.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.latency_duration()?;

        if let Some(path) = self.directories.iter().find(|p| !p.is_absolute()) {
            return Err(ConfigError::InvalidDirectory {
                path: path.clone(),
                reason: "directory must be an absolute path".to_owned(),
            });
        }

        Ok(())
    }

    /// Parses a configuration from a JSON string.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Reads and parses a JSON configuration file.
    pub fn load(path: &Utf8Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }
}

/// Converts a latency in seconds to a [`Duration`], rejecting negative and
/// non-finite values.
pub fn latency_to_duration(latency: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(latency).map_err(|_| ConfigError::invalid_latency(latency))
}
