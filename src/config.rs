//! Runner configuration and validation.
//!
//! Configuration is read from TOML (typically `runner.toml` next to the
//! project) and validated before a session is booted.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A program and its arguments, run inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Program name or path.
    pub program: String,
    /// Arguments passed to the program.
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandSpec {
    /// Creates a command from a program and its arguments.
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Configuration for an orchestrated sandbox session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Command that installs project dependencies.
    #[serde(default = "default_install_command")]
    pub install_command: CommandSpec,

    /// Long-running command that serves the project.
    #[serde(default = "default_dev_command")]
    pub dev_command: CommandSpec,

    /// File that must be present in the snapshot before install is allowed.
    #[serde(default)]
    pub install_manifest: Option<String>,

    /// Capacity of the channel between a process and the output pump.
    #[serde(default = "default_output_channel_capacity")]
    pub output_channel_capacity: usize,
}

fn default_install_command() -> CommandSpec {
    CommandSpec::new("npm", ["install"])
}

fn default_dev_command() -> CommandSpec {
    CommandSpec::new("npm", ["run", "dev"])
}

fn default_output_channel_capacity() -> usize {
    256
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            install_command: default_install_command(),
            dev_command: default_dev_command(),
            install_manifest: None,
            output_channel_capacity: default_output_channel_capacity(),
        }
    }
}

impl RunnerConfig {
    /// Configuration for npm projects, requiring a `package.json`.
    pub fn node() -> Self {
        Self {
            install_manifest: Some("package.json".to_string()),
            ..Self::default()
        }
    }

    /// Sets the install command.
    pub fn with_install_command(mut self, command: CommandSpec) -> Self {
        self.install_command = command;
        self
    }

    /// Sets the dev server command.
    pub fn with_dev_command(mut self, command: CommandSpec) -> Self {
        self.dev_command = command;
        self
    }

    /// Sets the file required before install.
    pub fn with_install_manifest(mut self, manifest: Option<String>) -> Self {
        self.install_manifest = manifest;
        self
    }

    /// Parses configuration from a TOML string.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        toml::from_str(source).map_err(|e| Error::Config(format!("invalid runner config: {}", e)))
    }

    /// Loads configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }
}

/// Problems found in a [`RunnerConfig`] before a session is created.
///
/// Errors stop the orchestrator from being built. Warnings, such as a
/// program name containing whitespace, are logged and the session proceeds.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// True when no problem would stop the orchestrator from starting.
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    /// Folds in the findings for one command, e.g. `install_command`.
    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    /// Returns the warnings for logging, or every error joined into one
    /// [`Error::Config`].
    pub fn into_result(self) -> Result<Vec<String>> {
        if self.is_valid() {
            Ok(self.warnings)
        } else {
            Err(Error::Config(self.errors.join("; ")))
        }
    }
}

/// Checked by [`Orchestrator::new`](crate::Orchestrator::new) before any
/// sandbox is acquired.
pub trait Validate {
    fn validate(&self) -> ValidationResult;
}

impl Validate for CommandSpec {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.program.trim().is_empty() {
            result.add_error("command program cannot be empty");
        }

        if self.program.contains(char::is_whitespace) {
            result.add_warning(format!(
                "program '{}' contains whitespace; arguments belong in args",
                self.program
            ));
        }

        result
    }
}

impl Validate for RunnerConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        let mut install = self.install_command.validate();
        install.errors = install
            .errors
            .into_iter()
            .map(|e| format!("install_command: {}", e))
            .collect();
        result.merge(install);

        let mut dev = self.dev_command.validate();
        dev.errors = dev
            .errors
            .into_iter()
            .map(|e| format!("dev_command: {}", e))
            .collect();
        result.merge(dev);

        if self.output_channel_capacity == 0 {
            result.add_error("output_channel_capacity must be greater than zero");
        }

        if let Some(manifest) = &self.install_manifest {
            if manifest.trim().is_empty() {
                result.add_error("install_manifest cannot be empty when set");
            }
        }

        result
    }
}
