//! Error types for the container runner.

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for runner operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The sandbox runtime could not be acquired.
    #[error("failed to acquire sandbox: {0}")]
    Acquisition(String),

    /// The initial file mount was rejected by the runtime.
    #[error("failed to mount project files: {0}")]
    Mount(String),

    /// A file re-sync attempt failed.
    #[error("failed to sync project files: {0}")]
    Sync(String),

    /// The sandbox has not been mounted yet.
    #[error("sandbox is not ready")]
    NotReady,

    /// The session failed during acquisition or mount and cannot be used.
    #[error("sandbox session failed: {0}")]
    SessionFailed(String),

    /// The install command could not be run at all.
    #[error("failed to run install command: {0}")]
    Install(String),

    /// An install is already running.
    #[error("an install is already in progress")]
    InstallInProgress,

    /// The project has no successful install yet.
    #[error("dependencies must be installed before starting the server")]
    InstallRequired,

    /// The snapshot lacks the file required before install.
    #[error("project has no {0}")]
    MissingManifest(String),

    /// The dev server could not be started.
    #[error("failed to start dev server: {0}")]
    Start(String),

    /// A dev server is already live.
    #[error("dev server is already running")]
    AlreadyRunning,

    /// No dev server is running.
    #[error("dev server is not running")]
    NotRunning,

    /// Reading the process output stream failed.
    #[error("failed to read process output: {0}")]
    StreamRead(String),

    /// The kill request could not be delivered.
    #[error("failed to kill process: {0}")]
    Kill(String),

    /// A file path escapes the sandbox root.
    #[error("invalid file path: {0}")]
    InvalidPath(PathBuf),

    /// The same path appears twice in a snapshot.
    #[error("duplicate file path in snapshot: {0}")]
    DuplicatePath(String),

    /// IO error inside the runtime.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Returns true for errors that end the sandbox session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Acquisition(_) | Error::Mount(_))
    }
}

/// Result type alias for runner operations.
pub type Result<T> = std::result::Result<T, Error>;
