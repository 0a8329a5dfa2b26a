//! Error types for the pw-core crate.
//!
//! This module provides the [`ConfigError`] type for configuration-related
//! errors that can occur across the workspace.

use camino::Utf8PathBuf;

/// Errors that can occur during configuration loading and validation.
///
/// # Examples
///
/// ```
/// use pw_core::ConfigError;
///
/// let error = ConfigError::InvalidOption {
///     option: "latency".to_owned(),
///     reason: "must not be negative".to_owned(),
/// };
/// assert!(error.to_string().contains("latency"));
/// ```
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A directory entry is not usable as a watch root.
    #[error("invalid directory '{path}': {reason}")]
    InvalidDirectory {
        /// The offending directory.
        path: Utf8PathBuf,
        /// Explanation of why the directory was rejected.
        reason: String,
    },

    /// A configuration option has an invalid value.
    #[error("invalid configuration option '{option}': {reason}")]
    InvalidOption {
        /// The name of the invalid option.
        option: String,
        /// Explanation of why the option is invalid.
        reason: String,
    },

    /// An I/O error occurred while reading configuration.
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

impl ConfigError {
    /// Creates a [`ConfigError::InvalidOption`] for the latency setting.
    pub(crate) fn invalid_latency(latency: f64) -> Self {
        Self::InvalidOption {
            option: "latency".to_owned(),
            reason: format!("{latency} is not a non-negative number of seconds"),
        }
    }
}
