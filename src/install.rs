//! Dependency installation.

use serde::{Deserialize, Serialize};

use crate::config::CommandSpec;
use crate::error::{Error, Result};
use crate::sandbox::Sandbox;

/// Outcome of an install run.
///
/// A failing install is a normal outcome with `success == false`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallOutcome {
    /// Whether the install command exited with status zero.
    pub success: bool,
    /// Combined output of the install command.
    pub output: String,
}

/// Runs the install command inside the sandbox.
#[derive(Debug, Clone)]
pub struct DependencyInstaller {
    command: CommandSpec,
}

impl DependencyInstaller {
    /// Creates an installer for the given command.
    pub fn new(command: CommandSpec) -> Self {
        Self { command }
    }

    /// Returns the install command.
    pub fn command(&self) -> &CommandSpec {
        &self.command
    }

    /// Runs the install command to completion.
    ///
    /// Only failures to run the command at all are errors.
    pub async fn install<S>(&self, sandbox: &S) -> Result<InstallOutcome>
    where
        S: Sandbox + ?Sized,
    {
        let output = sandbox
            .run_command(&self.command)
            .await
            .map_err(|e| Error::Install(e.to_string()))?;

        if output.success {
            tracing::info!(command = %self.command, "dependencies installed");
        } else {
            tracing::warn!(
                command = %self.command,
                exit_code = ?output.exit_code,
                "install command failed"
            );
        }

        Ok(InstallOutcome {
            success: output.success,
            output: output.output,
        })
    }
}
