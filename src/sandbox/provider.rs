//! Sandbox runtime traits and types.
//!
//! The runtime is an opaque capability: it stores files and runs processes
//! in isolation. Events that a browser runtime delivers through callbacks are
//! exposed here as channels.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

use crate::config::CommandSpec;
use crate::error::Result;
use crate::files::FileSet;

/// Notification that a server inside the sandbox is accepting connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerReady {
    /// Port the server listens on.
    pub port: u16,
    /// URL the preview should load.
    pub url: String,
}

/// Combined output of a command run to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Whether the command exited with status zero.
    pub success: bool,
    /// Exit code, if the process exited normally.
    pub exit_code: Option<i32>,
    /// Combined stdout and stderr.
    pub output: String,
}

/// Chunks of output from a long-running process.
///
/// The channel closing means the process exited. An `Err` item reports a
/// read failure; no further chunks follow it.
pub type OutputStream = mpsc::Receiver<Result<String>>;

/// Control handle for a long-running process.
#[async_trait]
pub trait ProcessHandle: Send + Sync {
    /// Requests termination of the process.
    async fn kill(&self) -> Result<()>;

    /// Runtime-specific process identifier, if known.
    fn id(&self) -> Option<u32> {
        None
    }
}

/// A freshly spawned long-running process.
pub struct SpawnedProcess {
    /// Handle used to terminate the process.
    pub handle: Box<dyn ProcessHandle>,
    /// Continuous output of the process.
    pub output: OutputStream,
}

impl std::fmt::Debug for SpawnedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpawnedProcess")
            .field("id", &self.handle.id())
            .finish_non_exhaustive()
    }
}

/// An acquired sandbox runtime.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Writes the full snapshot into an empty sandbox filesystem.
    async fn mount(&self, files: &FileSet) -> Result<()>;

    /// Writes a new full snapshot over the mounted filesystem.
    async fn sync(&self, files: &FileSet) -> Result<()>;

    /// Runs a command to completion and captures its output.
    ///
    /// A non-zero exit is reported through [`CommandOutput::success`], not as
    /// an error.
    async fn run_command(&self, command: &CommandSpec) -> Result<CommandOutput>;

    /// Starts a long-running process with streamed output.
    async fn spawn_long_running(&self, command: &CommandSpec) -> Result<SpawnedProcess>;

    /// Subscribes to server-ready notifications.
    ///
    /// Every subscriber sees each notification sent after it subscribed
    /// exactly once.
    fn server_ready(&self) -> broadcast::Receiver<ServerReady>;
}

/// Provider for sandbox runtimes.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// The type of sandbox this provider hands out.
    type Sandbox: Sandbox + 'static;

    /// Returns the session's sandbox, booting it on first call.
    ///
    /// Repeated and concurrent calls resolve to the same instance.
    async fn acquire(&self) -> Result<Arc<Self::Sandbox>>;

    /// Returns the name of this provider.
    fn name(&self) -> &str;
}
