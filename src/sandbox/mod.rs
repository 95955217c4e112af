//! Sandbox runtime interface.
//!
//! This module provides the [`SandboxProvider`] and [`Sandbox`] traits the
//! orchestrator drives, and the directory-backed [`LocalSandbox`] runtime.

mod local;
mod provider;

pub use local::{detect_server_ready, LocalSandbox, LocalSandboxInstance};
pub use provider::{
    CommandOutput, OutputStream, ProcessHandle, Sandbox, SandboxProvider, ServerReady,
    SpawnedProcess,
};
