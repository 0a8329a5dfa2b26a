//! CLI entry point for pipewatch.
//!
//! Watches one or more directories and prints each batch of changed paths
//! as it is reported.
//!
//! # Usage
//!
//! ```bash
//! pipewatch [OPTIONS] [DIRECTORIES]...
//!
//! # Watch the current directory
//! pipewatch
//!
//! # Watch two directories with a 100ms coalescing window
//! pipewatch --latency 0.1 ./src ./tests
//!
//! # Start from a JSON configuration file
//! pipewatch --config pipewatch.json
//! ```

#![deny(clippy::all)]
#![warn(missing_docs)]

use std::io::Write;

use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use pw_core::WatchConfig;
use pw_watcher::{ChangeBatch, Watcher};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

// =============================================================================
// CLI ARGUMENT TYPES
// =============================================================================

/// Print changes inside watched directories as they happen.
#[derive(Parser)]
#[command(name = "pipewatch", version, about, long_about = None)]
struct Cli {
    /// Directories to watch.
    ///
    /// Defaults to the directories in `--config`, or the current directory.
    directories: Vec<Utf8PathBuf>,

    /// Coalescing window in seconds.
    ///
    /// Overrides the latency from `--config`. Defaults to 0.5.
    #[arg(short, long, env = "PIPEWATCH_LATENCY")]
    latency: Option<f64>,

    /// Path to a JSON configuration file.
    #[arg(short, long, env = "PIPEWATCH_CONFIG")]
    config: Option<Utf8PathBuf>,

    /// Print the resolved configuration as JSON and exit.
    #[arg(long)]
    print_config: bool,

    /// Enable verbose logging (debug level).
    #[arg(short, long)]
    verbose: bool,

    /// Disable colored output.
    #[arg(long)]
    no_color: bool,
}

// =============================================================================
// INITIALIZATION FUNCTIONS
// =============================================================================

/// Initializes the tracing subscriber for logging.
///
/// Respects the `RUST_LOG` environment variable if set. Otherwise, uses
/// `debug` level if `--verbose` is set, or `info` level by default.
/// Logs go to stderr so stdout carries only change reports.
fn init_tracing(verbose: bool, no_color: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if verbose { "debug" } else { "info" };
        EnvFilter::new(format!("{level},mio=warn,notify=warn"))
    });

    // Check if colors should be disabled (flag or NO_COLOR env var)
    let use_ansi = !no_color && std::env::var("NO_COLOR").is_err();

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(false)
                .with_ansi(use_ansi)
                .with_writer(std::io::stderr),
        )
        .with(filter)
        .init();
}

/// Builds a [`WatchConfig`] from CLI arguments.
///
/// Starts from `--config` (or the defaults), then applies the positional
/// directories and `--latency`. Every directory is resolved to an absolute
/// path, relative to `cwd`.
///
/// # Errors
///
/// Returns an error if the configuration file cannot be read, a directory
/// does not exist or isn't a directory, or the result fails validation.
fn build_config(cli: &Cli, cwd: &Utf8Path) -> color_eyre::Result<WatchConfig> {
    let mut config = match &cli.config {
        Some(path) => WatchConfig::load(path)
            .map_err(|e| color_eyre::eyre::eyre!("Failed to load {path}: {e}"))?,
        None => WatchConfig::default(),
    };

    if !cli.directories.is_empty() {
        config.directories.clone_from(&cli.directories);
    }
    if config.directories.is_empty() {
        config.directories.push(cwd.to_path_buf());
    }
    if let Some(latency) = cli.latency {
        config.latency = latency;
    }

    config.directories = config
        .directories
        .iter()
        .map(|dir| resolve_dir(&cwd.join(dir)))
        .collect::<color_eyre::Result<_>>()?;

    config.validate()?;
    Ok(config)
}

fn resolve_dir(path: &Utf8Path) -> color_eyre::Result<Utf8PathBuf> {
    if !path.exists() {
        return Err(color_eyre::eyre::eyre!("Path does not exist: {path}"));
    }
    if !path.is_dir() {
        return Err(color_eyre::eyre::eyre!("Path is not a directory: {path}"));
    }
    Ok(path.canonicalize_utf8()?)
}

// =============================================================================
// COMMAND IMPLEMENTATIONS
// =============================================================================

/// Prints one change batch to stdout.
fn print_batch(batch: &ChangeBatch) {
    let paths: Vec<&str> = batch.iter().map(Utf8Path::as_str).collect();

    let stdout = std::io::stdout();
    let mut handle = stdout.lock();
    let _ = writeln!(handle, "Detected change in: {paths:?}");
    let _ = handle.flush();
}

/// Watches until interrupted.
///
/// # Errors
///
/// Returns an error if the watcher cannot be started or signal handling
/// fails.
async fn run_watch(config: &WatchConfig) -> color_eyre::Result<()> {
    let mut watcher = Watcher::with_notify(config, |batch: ChangeBatch| print_batch(&batch))?;
    watcher.start()?;

    info!(
        directories = ?config.directories,
        latency = config.latency,
        "Watching for changes, press Ctrl-C to stop"
    );

    // Handle SIGTERM for graceful shutdown on Unix
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }

    watcher.stop();
    info!("Stopped watching");
    Ok(())
}

// =============================================================================
// MAIN ENTRY POINT
// =============================================================================

/// Application entry point.
#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    // 1. Install color-eyre FIRST (before any potential panics)
    color_eyre::install()?;

    // 2. Parse CLI arguments
    let cli = Cli::parse();

    // 3. Initialize tracing (handles --no-color for log output)
    init_tracing(cli.verbose, cli.no_color);

    // 4. Resolve configuration
    let cwd = Utf8PathBuf::try_from(std::env::current_dir()?)?;
    let config = build_config(&cli, &cwd)?;

    if cli.print_config {
        let stdout = std::io::stdout();
        let mut handle = stdout.lock();
        writeln!(handle, "{}", serde_json::to_string_pretty(&config)?)?;
        return Ok(());
    }

    run_watch(&config).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn temp_root() -> (TempDir, Utf8PathBuf) {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let root = Utf8PathBuf::from_path_buf(temp_dir.path().to_path_buf())
            .expect("Invalid path")
            .canonicalize_utf8()
            .expect("Failed to canonicalize");
        (temp_dir, root)
    }

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("pipewatch").chain(args.iter().copied()))
            .expect("Failed to parse arguments")
    }

    #[test]
    fn test_defaults_to_current_directory() {
        let (_temp_dir, root) = temp_root();

        let config = build_config(&parse(&[]), &root).unwrap();
        assert_eq!(config.directories, vec![root]);
        assert!((config.latency - pw_core::DEFAULT_LATENCY_SECS).abs() < f64::EPSILON);
    }

    #[test]
    fn test_relative_directories_are_resolved() {
        let (_temp_dir, root) = temp_root();
        std::fs::create_dir(root.join("src")).unwrap();

        let config = build_config(&parse(&["src", "--latency", "0.1"]), &root).unwrap();
        assert_eq!(config.directories, vec![root.join("src")]);
        assert!((config.latency - 0.1).abs() < f64::EPSILON);
    }

    #[test]
    fn test_cli_overrides_config_file() {
        let (_temp_dir, root) = temp_root();
        std::fs::create_dir(root.join("from-file")).unwrap();
        std::fs::create_dir(root.join("from-cli")).unwrap();
        let config_path = root.join("pipewatch.json");
        std::fs::write(
            &config_path,
            format!(
                r#"{{"directories": ["{}"], "latency": 2.0}}"#,
                root.join("from-file")
            ),
        )
        .unwrap();

        let from_file = build_config(&parse(&["--config", config_path.as_str()]), &root).unwrap();
        assert_eq!(from_file.directories, vec![root.join("from-file")]);
        assert!((from_file.latency - 2.0).abs() < f64::EPSILON);

        let overridden = build_config(
            &parse(&["--config", config_path.as_str(), "from-cli", "-l", "0.25"]),
            &root,
        )
        .unwrap();
        assert_eq!(overridden.directories, vec![root.join("from-cli")]);
        assert!((overridden.latency - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_missing_directory_is_rejected() {
        let (_temp_dir, root) = temp_root();
        let err = build_config(&parse(&["missing"]), &root).unwrap_err();
        assert!(err.to_string().starts_with("Path does not exist"));
    }

    #[test]
    fn test_negative_latency_is_rejected() {
        let (_temp_dir, root) = temp_root();
        let err = build_config(&parse(&["--latency=-1"]), &root).unwrap_err();
        assert!(err.to_string().contains("latency"));
    }
}
