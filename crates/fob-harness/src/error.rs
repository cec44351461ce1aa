//! Error types for the development harness.
//!
//! The hierarchy mirrors the failure classes the harness deals with:
//!
//! - **Configuration errors** (`ConfigError`, `WatchError`) are fatal at
//!   startup or registration and never retried.
//! - **Process lifecycle errors** (`ProcessError`) surface to the caller; the
//!   child is left killed and the next rebuild starts clean.
//! - **Build errors** are not part of this hierarchy. They are reported as a
//!   structured [`SourceError`](crate::SourceError) so they can be rendered
//!   with source context.
//!
//! `HarnessError` is the top-level type and converts from every domain error
//! via `#[from]`.

use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;
use thiserror::Error;

/// Top-level harness error type.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// Invalid or unreadable harness configuration
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A watched root could not be registered
    #[error("Watch error: {0}")]
    Watch(#[from] WatchError),

    /// Child process lifecycle failure
    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    /// Proxy server failed to bind or serve
    #[error("Server error: {0}")]
    Server(String),

    /// I/O errors from file system operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Unrecoverable environment fault (e.g. the child could not be killed)
    #[error("Fatal: {0}")]
    Fatal(String),

    /// Generic errors with custom messages
    #[error("{0}")]
    Custom(String),
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration sources could not be merged or deserialized
    #[error("Failed to load harness configuration: {0}\n\nHint: Check harness.toml syntax and FOB_HARNESS_* variables")]
    Extract(String),

    /// Invalid value for a configuration option
    #[error("Invalid value for '{field}': {value}\n\nHint: {hint}")]
    InvalidValue {
        /// Name of the field with invalid value
        field: String,
        /// The invalid value
        value: String,
        /// Helpful hint for correct values
        hint: String,
    },
}

/// Errors raised while registering watched roots.
///
/// All of these are configuration errors: registration stops at the first one
/// and nothing is retried.
#[derive(Debug, Error)]
pub enum WatchError {
    /// The root (or its symlink target) does not exist or cannot be read
    #[error("Failed to stat watched path {}: {source}", .path.display())]
    Stat {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Walking a directory tree failed (unreadable entry, symlink loop)
    #[error("Failed to walk directory {}: {source}", .path.display())]
    Walk {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },

    /// The notification backend refused to watch a path
    #[error("Failed to watch {}: {source}", .path.display())]
    Register {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },

    /// The notification backend could not be created
    #[error("Failed to create watcher: {0}")]
    Backend(#[from] notify::Error),
}

/// Child process lifecycle errors.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The binary could not be launched
    #[error("Failed to launch {}: {source}", .binary.display())]
    Spawn {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The app exited before announcing it was ready
    #[error("app died before it was ready: {status}")]
    Exited {
        /// Exit status reported by the OS
        status: ExitStatus,
    },

    /// The ready sentinel did not appear in time; the process was killed
    #[error("app timed out after {timeout:?} without announcing it was listening")]
    StartupTimeout { timeout: Duration },

    /// Waiting on the child failed
    #[error("Failed to wait for app process: {0}")]
    Wait(#[source] std::io::Error),

    /// Terminating the app failed; the harness cannot recover from this
    #[error("Failed to kill app server (pid {pid}): {source}")]
    KillFailed {
        pid: u32,
        #[source]
        source: std::io::Error,
    },
}

/// Result type alias using `HarnessError` as the default error type.
pub type Result<T, E = HarnessError> = std::result::Result<T, E>;

/// Extension trait for attaching context to errors.
pub trait ResultExt<T> {
    /// Prefix the error with a message.
    fn context(self, msg: impl std::fmt::Display) -> Result<T>;
}

impl<T, E: Into<HarnessError>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, msg: impl std::fmt::Display) -> Result<T> {
        self.map_err(|e| {
            let err: HarnessError = e.into();
            HarnessError::Custom(format!("{}: {}", msg, err))
        })
    }
}
