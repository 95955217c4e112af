//! Container Runner - ephemeral sandbox execution for live project previews
//!
//! This library boots an isolated sandbox for a project snapshot, keeps its
//! files in sync with upstream edits, installs dependencies, supervises a
//! long-running dev server and relays the URL it serves on to a preview.

pub mod config;
pub mod error;
pub mod files;
pub mod install;
pub mod ledger;
pub mod orchestrator;
pub mod output;
pub mod preview;
pub mod sandbox;
pub mod server;
pub mod sync;

#[cfg(test)]
mod testing;

pub use config::{CommandSpec, RunnerConfig, Validate, ValidationResult};
pub use error::{Error, Result};
pub use files::{FileArtifact, FileSet};
pub use install::{DependencyInstaller, InstallOutcome};
pub use ledger::{ExecutionStep, PendingStep, SharedLedger, StepKind, StepLedger, StepStatus};
pub use orchestrator::{Orchestrator, Phase, RunnerEvent, RunnerSnapshot, SyncOutcome};
pub use output::{OutputAggregator, OutputBuffer, OUTPUT_CAP};
pub use preview::{PreviewBridge, PreviewState, PreviewStatus};
pub use sandbox::{LocalSandbox, Sandbox, SandboxProvider, ServerReady};
pub use server::{DevServerController, OutputSinks, ServerState, StopReport};
pub use sync::{FileSynchronizer, SyncReceipt};
