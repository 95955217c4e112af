//! Session orchestration.
//!
//! The [`Orchestrator`] owns one sandbox session and drives it through
//! acquire, mount and ready. Once ready, install, start, stop and sync are
//! independently triggerable and each is recorded in the step ledger.
//!
//! Every operation takes `&mut self`; requests never interleave.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::{RunnerConfig, Validate};
use crate::error::{Error, Result};
use crate::files::FileSet;
use crate::install::{DependencyInstaller, InstallOutcome};
use crate::ledger::{ExecutionStep, SharedLedger, StepKind, StepLedger, StepStatus};
use crate::output::OutputAggregator;
use crate::preview::{PreviewBridge, PreviewStatus};
use crate::sandbox::{Sandbox, SandboxProvider, ServerReady};
use crate::server::{DevServerController, OutputSinks, ServerState, StopReport};
use crate::sync::{FileSynchronizer, SyncReceipt};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Session phase. Acquire and mount happen once per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Uninitialized,
    Acquiring,
    Mounting,
    Ready,
    Failed,
}

/// Notifications for the layer above the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerEvent {
    /// A snapshot batch was written into the sandbox.
    FilesSynced {
        file_count: usize,
        fingerprint: String,
    },
    /// A server inside the sandbox became reachable.
    PreviewReady(ServerReady),
    /// The dev server exited without being stopped.
    ServerExited,
    /// Reading the dev server's output failed; the server keeps running.
    OutputFailed(String),
}

/// What happened to a snapshot handed to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Held until the session can be booted.
    Deferred,
    /// Written as the initial mount.
    Mounted(SyncReceipt),
    /// Written as an incremental sync.
    Applied(SyncReceipt),
    /// Identical to what the sandbox already has; nothing was written.
    Unchanged,
}

/// Read-only projection for the presentation layer.
#[derive(Debug, Clone, Serialize)]
pub struct RunnerSnapshot {
    pub phase: Phase,
    pub steps: Vec<ExecutionStep>,
    pub terminal_output: String,
    pub preview_url: String,
    pub preview_status: PreviewStatus,
    pub container_ready: bool,
    pub server_running: bool,
    pub server_state: ServerState,
}

/// Top-level state machine for one sandbox session.
pub struct Orchestrator<P: SandboxProvider> {
    provider: P,
    config: RunnerConfig,
    phase: Phase,
    failure: Option<String>,
    visible: bool,
    sandbox: Option<Arc<P::Sandbox>>,
    /// Latest snapshot not yet mounted.
    pending: Option<FileSet>,
    /// Snapshot currently in the sandbox.
    files: FileSet,
    ledger: SharedLedger,
    synchronizer: FileSynchronizer,
    installer: DependencyInstaller,
    server: DevServerController,
    output: OutputAggregator,
    preview: PreviewBridge,
    events: broadcast::Sender<RunnerEvent>,
    relay: Option<JoinHandle<()>>,
}

impl<P: SandboxProvider> Orchestrator<P> {
    /// Creates an orchestrator after validating `config`.
    pub fn new(provider: P, config: RunnerConfig) -> Result<Self> {
        for warning in config.validate().into_result()? {
            tracing::warn!(warning = %warning, "runner config warning");
        }

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            installer: DependencyInstaller::new(config.install_command.clone()),
            server: DevServerController::new(config.dev_command.clone()),
            provider,
            config,
            phase: Phase::Uninitialized,
            failure: None,
            visible: false,
            sandbox: None,
            pending: None,
            files: FileSet::default(),
            ledger: SharedLedger::new(),
            synchronizer: FileSynchronizer::new(),
            output: OutputAggregator::new(),
            preview: PreviewBridge::new(),
            events,
            relay: None,
        })
    }

    /// Returns the current phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Returns a copy of the step ledger.
    pub fn ledger(&self) -> StepLedger {
        self.ledger.snapshot()
    }

    /// Returns a handle to the terminal buffer.
    pub fn output(&self) -> OutputAggregator {
        self.output.clone()
    }

    /// Returns the preview bridge.
    pub fn preview(&self) -> &PreviewBridge {
        &self.preview
    }

    /// Returns the dev server state.
    pub fn server_state(&self) -> ServerState {
        self.server.state()
    }

    /// Returns the sandbox provider.
    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Subscribes to runner events.
    pub fn subscribe(&self) -> broadcast::Receiver<RunnerEvent> {
        self.events.subscribe()
    }

    /// Returns true if [`Orchestrator::install`] would be accepted.
    pub fn can_install(&self) -> bool {
        self.phase == Phase::Ready
            && !self.install_in_progress()
            && self.missing_manifest().is_none()
    }

    /// Returns true if [`Orchestrator::start`] would be accepted.
    pub fn can_start(&self) -> bool {
        self.phase == Phase::Ready
            && self.server.state() == ServerState::Idle
            && self.has_installed()
    }

    /// Returns true if [`Orchestrator::stop`] would be accepted.
    pub fn can_stop(&self) -> bool {
        self.server.is_running()
    }

    /// Records whether the preview is visible; booting waits for visibility.
    ///
    /// Returns [`SyncOutcome::Mounted`] if this call booted the session and
    /// [`SyncOutcome::Deferred`] otherwise.
    pub async fn set_visible(&mut self, visible: bool) -> Result<SyncOutcome> {
        self.visible = visible;
        self.try_initialize().await
    }

    /// Accepts a new snapshot from upstream.
    ///
    /// Before the session is ready the snapshot is held (and mounted once
    /// the session boots); afterwards it is synced.
    pub async fn files_changed(&mut self, files: FileSet) -> Result<SyncOutcome> {
        match self.phase {
            Phase::Ready => self.sync(files).await,
            Phase::Failed => Err(self.session_failed()),
            _ => {
                self.pending = Some(files);
                self.try_initialize().await
            }
        }
    }

    async fn try_initialize(&mut self) -> Result<SyncOutcome> {
        // Acquiring or Mounting here means an earlier boot was cancelled;
        // acquire is idempotent, so booting again is safe.
        if matches!(self.phase, Phase::Ready | Phase::Failed) || !self.visible {
            return Ok(SyncOutcome::Deferred);
        }
        let files = match &self.pending {
            Some(files) if !files.is_empty() => files.clone(),
            _ => return Ok(SyncOutcome::Deferred),
        };

        let receipt = self.initialize(files).await?;
        self.pending = None;
        Ok(SyncOutcome::Mounted(receipt))
    }

    async fn initialize(&mut self, files: FileSet) -> Result<SyncReceipt> {
        self.phase = Phase::Acquiring;
        let init = self.ledger.begin_keyed("init", "Initializing sandbox");

        let sandbox = match self.provider.acquire().await {
            Ok(sandbox) => sandbox,
            Err(e) => {
                let e = match e {
                    Error::Acquisition(_) => e,
                    other => Error::Acquisition(other.to_string()),
                };
                init.finish(StepStatus::Error, Some(e.to_string()));
                return Err(self.fail_session(e));
            }
        };
        init.finish(StepStatus::Success, None);
        tracing::info!(provider = %self.provider.name(), "sandbox acquired");

        self.phase = Phase::Mounting;
        let mount = self.ledger.begin_keyed("mount", "Mounting project files");

        let receipt = match self.synchronizer.mount(&*sandbox, &files).await {
            Ok(receipt) => receipt,
            Err(e) => {
                mount.finish(StepStatus::Error, Some(e.to_string()));
                return Err(self.fail_session(e));
            }
        };
        mount.finish(
            StepStatus::Success,
            Some(format!("Mounted {} files", receipt.file_count)),
        );

        // Subscribe before anything can start a server.
        let ready = sandbox.server_ready();
        self.relay = Some(tokio::spawn(
            self.preview.clone().relay(ready, self.events.clone()),
        ));

        self.files = files;
        self.sandbox = Some(sandbox);
        self.phase = Phase::Ready;
        tracing::info!(files = receipt.file_count, "sandbox ready");

        self.notify_synced(&receipt);
        Ok(receipt)
    }

    fn fail_session(&mut self, error: Error) -> Error {
        tracing::error!(error = %error, "sandbox session failed");
        self.phase = Phase::Failed;
        self.failure = Some(error.to_string());
        error
    }

    fn session_failed(&self) -> Error {
        Error::SessionFailed(self.failure.clone().unwrap_or_default())
    }

    fn ready_sandbox(&self) -> Result<Arc<P::Sandbox>> {
        match (self.phase, &self.sandbox) {
            (Phase::Ready, Some(sandbox)) => Ok(Arc::clone(sandbox)),
            (Phase::Failed, _) => Err(self.session_failed()),
            _ => Err(Error::NotReady),
        }
    }

    fn notify_synced(&self, receipt: &SyncReceipt) {
        // Nobody listening is fine.
        let _ = self.events.send(RunnerEvent::FilesSynced {
            file_count: receipt.file_count,
            fingerprint: receipt.fingerprint.clone(),
        });
    }

    /// Writes a new snapshot into the ready sandbox.
    ///
    /// A snapshot identical to the last one applied produces no step.
    pub async fn sync(&mut self, files: FileSet) -> Result<SyncOutcome> {
        let sandbox = self.ready_sandbox()?;

        if files.is_empty() || self.synchronizer.is_current(&files) {
            tracing::debug!(files = files.len(), "snapshot unchanged, skipping sync");
            return Ok(SyncOutcome::Unchanged);
        }

        let step = self
            .ledger
            .begin(StepKind::Sync, format!("Syncing {} files", files.len()));

        match self.synchronizer.sync(&*sandbox, &files).await {
            Ok(receipt) => {
                step.finish(StepStatus::Success, None);
                self.files = files;
                self.notify_synced(&receipt);
                Ok(SyncOutcome::Applied(receipt))
            }
            Err(e) => {
                tracing::warn!(error = %e, "file sync failed");
                step.finish(StepStatus::Error, Some(e.to_string()));
                Err(e)
            }
        }
    }

    fn install_in_progress(&self) -> bool {
        self.ledger
            .with(|ledger| ledger.any_with(StepKind::Install, StepStatus::Running))
    }

    fn has_installed(&self) -> bool {
        self.ledger
            .with(|ledger| ledger.any_with(StepKind::Install, StepStatus::Success))
    }

    fn missing_manifest(&self) -> Option<&str> {
        self.config
            .install_manifest
            .as_deref()
            .filter(|manifest| !self.files.contains(manifest))
    }

    /// Installs dependencies.
    ///
    /// A failing install command is returned as an outcome with
    /// `success == false` and recorded as an error step. Dropping the
    /// returned future marks the step cancelled; install can then be retried.
    pub async fn install(&mut self) -> Result<InstallOutcome> {
        let sandbox = self.ready_sandbox()?;
        if self.install_in_progress() {
            return Err(Error::InstallInProgress);
        }
        if let Some(manifest) = self.missing_manifest() {
            return Err(Error::MissingManifest(manifest.to_string()));
        }

        let step = self
            .ledger
            .begin(StepKind::Install, "Installing dependencies");

        match self.installer.install(&*sandbox).await {
            Ok(outcome) => {
                let status = if outcome.success {
                    StepStatus::Success
                } else {
                    StepStatus::Error
                };
                step.finish(status, Some(outcome.output.clone()));
                self.output.append_block(&outcome.output).await;
                Ok(outcome)
            }
            Err(e) => {
                tracing::error!(error = %e, "install could not run");
                step.finish(StepStatus::Error, Some(e.to_string()));
                Err(e)
            }
        }
    }

    /// Starts the dev server.
    ///
    /// Requires a ready session, an idle server and a successful install.
    pub async fn start(&mut self) -> Result<()> {
        let sandbox = self.ready_sandbox()?;
        if self.server.state() != ServerState::Idle {
            return Err(Error::AlreadyRunning);
        }
        if !self.has_installed() {
            return Err(Error::InstallRequired);
        }

        let step = self
            .ledger
            .begin(StepKind::Start, "Starting development server");
        let sinks = OutputSinks {
            output: self.output.clone(),
            events: self.events.clone(),
            ledger: self.ledger.clone(),
        };

        match self.server.start(&*sandbox, sinks).await {
            Ok(()) => {
                step.finish(StepStatus::Success, None);
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "dev server failed to start");
                step.finish(StepStatus::Error, Some(e.to_string()));
                Err(e)
            }
        }
    }

    /// Stops the dev server and clears the preview.
    ///
    /// The server is considered stopped even if the kill request fails; the
    /// failure is recorded on the stop step.
    pub async fn stop(&mut self) -> Result<StopReport> {
        if !self.server.is_running() {
            return Err(Error::NotRunning);
        }

        self.preview.clear();
        let report = self.server.stop().await;

        match &report.kill_error {
            None => self.ledger.record(
                StepKind::Stop,
                "Stopped development server",
                StepStatus::Success,
                None,
            ),
            Some(reason) => self.ledger.record(
                StepKind::Stop,
                "Stopped development server",
                StepStatus::Error,
                Some(format!("kill request failed: {}", reason)),
            ),
        };

        Ok(report)
    }

    /// Clears the terminal buffer.
    pub async fn clear_output(&self) {
        self.output.clear().await;
    }

    /// Re-requests the current preview URL.
    pub fn refresh_preview(&self) -> Option<String> {
        self.preview.refresh()
    }

    /// Records that the preview at `url` finished loading.
    pub fn preview_loaded(&self, url: &str) -> bool {
        self.preview.mark_loaded(url)
    }

    /// Records that the preview at `url` failed to load.
    pub fn preview_failed(&self, url: &str) -> bool {
        self.preview.mark_failed(url)
    }

    /// Returns the read-only projection of the session.
    pub async fn snapshot(&self) -> RunnerSnapshot {
        let preview = self.preview.current();
        let server_state = self.server.state();

        RunnerSnapshot {
            phase: self.phase,
            steps: self.ledger.with(|ledger| ledger.steps().to_vec()),
            terminal_output: self.output.contents().await,
            preview_url: preview.url().to_string(),
            preview_status: preview.status,
            container_ready: self.phase == Phase::Ready,
            server_running: server_state == ServerState::Running,
            server_state,
        }
    }
}

impl<P: SandboxProvider> Drop for Orchestrator<P> {
    fn drop(&mut self) {
        if let Some(relay) = self.relay.take() {
            relay.abort();
        }
    }
}
