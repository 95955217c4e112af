//! Dev server process control.
//!
//! The controller owns at most one live process. Its output is pumped into
//! the terminal buffer by a background task that runs until the process
//! exits or the server is stopped.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::CommandSpec;
use crate::error::{Error, Result};
use crate::ledger::{SharedLedger, StepKind, StepStatus};
use crate::orchestrator::RunnerEvent;
use crate::output::OutputAggregator;
use crate::sandbox::{OutputStream, ProcessHandle, Sandbox};

/// Lifecycle state of the dev server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    Idle,
    Starting,
    Running,
    Stopping,
}

/// Result of a stop request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StopReport {
    /// Why the kill request failed, if it did.
    pub kill_error: Option<String>,
}

/// Puts the controller back to idle when dropped, unless disarmed.
///
/// Covers start and stop futures that are dropped before finishing.
struct IdleOnDrop<'a> {
    state: &'a watch::Sender<ServerState>,
    armed: bool,
}

impl<'a> IdleOnDrop<'a> {
    fn new(state: &'a watch::Sender<ServerState>) -> Self {
        Self { state, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for IdleOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.state.send_replace(ServerState::Idle);
        }
    }
}

/// Where the output pump delivers what it reads.
#[derive(Debug, Clone)]
pub struct OutputSinks {
    /// Terminal buffer for output chunks.
    pub output: OutputAggregator,
    /// Runner events (`ServerExited`, `OutputFailed`).
    pub events: broadcast::Sender<RunnerEvent>,
    /// Ledger that records read failures.
    pub ledger: SharedLedger,
}

/// The live process and its output pump.
struct LiveProcess {
    handle: Box<dyn ProcessHandle>,
    release: Option<oneshot::Sender<()>>,
    pump: JoinHandle<()>,
}

/// Starts, supervises and stops the dev server.
pub struct DevServerController {
    command: CommandSpec,
    state: Arc<watch::Sender<ServerState>>,
    process: Option<LiveProcess>,
}

impl DevServerController {
    /// Creates an idle controller for the given command.
    pub fn new(command: CommandSpec) -> Self {
        let (state, _) = watch::channel(ServerState::Idle);
        Self {
            command,
            state: Arc::new(state),
            process: None,
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    /// Returns true while the server is running.
    pub fn is_running(&self) -> bool {
        self.state() == ServerState::Running
    }

    /// Watches state changes, including exits noticed by the output pump.
    pub fn subscribe(&self) -> watch::Receiver<ServerState> {
        self.state.subscribe()
    }

    /// Starts the dev server and begins pumping its output into `sinks`.
    ///
    /// Fails with [`Error::AlreadyRunning`] unless the controller is idle;
    /// the existing process is left untouched in that case.
    pub async fn start<S>(&mut self, sandbox: &S, sinks: OutputSinks) -> Result<()>
    where
        S: Sandbox + ?Sized,
    {
        if self.state() != ServerState::Idle {
            return Err(Error::AlreadyRunning);
        }

        // A process that exited on its own leaves its pump behind.
        if let Some(stale) = self.process.take() {
            let _ = stale.pump.await;
        }

        self.state.send_replace(ServerState::Starting);
        let starting = IdleOnDrop::new(&self.state);

        let spawned = sandbox
            .spawn_long_running(&self.command)
            .await
            .map_err(|e| Error::Start(e.to_string()))?;

        starting.disarm();
        self.state.send_replace(ServerState::Running);

        let (release_tx, release_rx) = oneshot::channel();
        let pump = tokio::spawn(pump_output(
            spawned.output,
            sinks,
            release_rx,
            Arc::clone(&self.state),
        ));

        tracing::info!(command = %self.command, pid = ?spawned.handle.id(), "dev server started");

        self.process = Some(LiveProcess {
            handle: spawned.handle,
            release: Some(release_tx),
            pump,
        });
        Ok(())
    }

    /// Stops the dev server.
    ///
    /// Always ends in [`ServerState::Idle`], even if the returned future is
    /// dropped early. A failed kill is logged and reported, not retried.
    pub async fn stop(&mut self) -> StopReport {
        let process = self.process.take();
        let _idle = IdleOnDrop::new(&self.state);
        let Some(mut process) = process else {
            return StopReport::default();
        };

        self.state.send_replace(ServerState::Stopping);

        let kill_error = match process.handle.kill().await {
            Ok(()) => None,
            Err(e) => {
                tracing::warn!(error = %e, "failed to kill dev server");
                Some(e.to_string())
            }
        };

        if let Some(release) = process.release.take() {
            // The pump may already be gone if the process exited.
            let _ = release.send(());
        }
        if let Err(e) = process.pump.await {
            tracing::warn!(error = %e, "output pump ended abnormally");
        }

        tracing::info!("dev server stopped");

        StopReport { kill_error }
    }
}

impl Drop for DevServerController {
    fn drop(&mut self) {
        if let Some(process) = self.process.take() {
            process.pump.abort();
        }
    }
}

/// Moves chunks from the process stream into the terminal buffer.
///
/// The stream is dropped on every exit path: release, read error or exit.
/// A read error is recorded in the ledger and announced as
/// [`RunnerEvent::OutputFailed`]; the server itself keeps running.
async fn pump_output(
    mut stream: OutputStream,
    sinks: OutputSinks,
    mut release: oneshot::Receiver<()>,
    state: Arc<watch::Sender<ServerState>>,
) {
    let exited = loop {
        tokio::select! {
            biased;
            _ = &mut release => {
                tracing::debug!("output stream released");
                break false;
            }
            chunk = stream.recv() => match chunk {
                Some(Ok(text)) => sinks.output.append(&text).await,
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "stopped reading dev server output");
                    sinks.ledger.record(
                        StepKind::Output,
                        "Reading dev server output",
                        StepStatus::Error,
                        Some(e.to_string()),
                    );
                    let _ = sinks.events.send(RunnerEvent::OutputFailed(e.to_string()));
                    break false;
                }
                None => break true,
            }
        }
    };
    drop(stream);

    if exited {
        let changed = state.send_if_modified(|current| {
            if *current == ServerState::Running {
                *current = ServerState::Idle;
                true
            } else {
                false
            }
        });
        if changed {
            tracing::info!("dev server exited");
            let _ = sinks.events.send(RunnerEvent::ServerExited);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedSandbox;
    use std::time::Duration;

    fn controller() -> DevServerController {
        DevServerController::new(CommandSpec::new("npm", ["run", "dev"]))
    }

    fn events() -> broadcast::Sender<RunnerEvent> {
        broadcast::channel(16).0
    }

    fn sinks(output: &OutputAggregator) -> OutputSinks {
        OutputSinks {
            output: output.clone(),
            events: events(),
            ledger: SharedLedger::new(),
        }
    }

    async fn wait_for_output(output: &OutputAggregator, expected: &str) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while output.contents().await != expected {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("output did not arrive");
    }

    #[tokio::test]
    async fn start_runs_and_pumps_output() {
        let sandbox = ScriptedSandbox::new();
        let output = OutputAggregator::new();
        let mut server = controller();

        server.start(&sandbox, sinks(&output)).await.unwrap();
        assert_eq!(server.state(), ServerState::Running);

        sandbox.emit("> vite\n").await;
        sandbox.emit("ready\n").await;

        wait_for_output(&output, "> vite\nready\n").await;
    }

    #[tokio::test]
    async fn start_while_running_fails_and_keeps_process() {
        let sandbox = ScriptedSandbox::new();
        let output = OutputAggregator::new();
        let mut server = controller();
        server.start(&sandbox, sinks(&output)).await.unwrap();

        let result = server.start(&sandbox, sinks(&output)).await;

        assert!(matches!(result, Err(Error::AlreadyRunning)));
        assert_eq!(sandbox.spawned(), 1);
        assert_eq!(server.state(), ServerState::Running);

        sandbox.emit("still here\n").await;
        wait_for_output(&output, "still here\n").await;
    }

    #[tokio::test]
    async fn spawn_failure_returns_to_idle() {
        let sandbox = ScriptedSandbox::new();
        sandbox.fail_spawn("port in use");
        let mut server = controller();

        let result = server.start(&sandbox, sinks(&OutputAggregator::new())).await;

        assert!(matches!(result, Err(Error::Start(msg)) if msg.contains("port in use")));
        assert_eq!(server.state(), ServerState::Idle);
    }

    #[tokio::test]
    async fn stop_kills_and_returns_to_idle() {
        let sandbox = ScriptedSandbox::new();
        let mut server = controller();
        server.start(&sandbox, sinks(&OutputAggregator::new())).await.unwrap();

        let report = server.stop().await;

        assert_eq!(report.kill_error, None);
        assert_eq!(server.state(), ServerState::Idle);
        assert_eq!(sandbox.kills(), 1);
    }

    #[tokio::test]
    async fn stop_returns_to_idle_even_when_kill_fails() {
        let sandbox = ScriptedSandbox::new();
        sandbox.fail_kill("permission denied");
        let mut server = controller();
        server.start(&sandbox, sinks(&OutputAggregator::new())).await.unwrap();

        let report = server.stop().await;

        assert!(report.kill_error.unwrap().contains("permission denied"));
        assert_eq!(server.state(), ServerState::Idle);
    }

    #[tokio::test]
    async fn process_exit_returns_to_idle_and_notifies() {
        let sandbox = ScriptedSandbox::new();
        let wiring = sinks(&OutputAggregator::new());
        let mut rx = wiring.events.subscribe();
        let mut server = controller();
        let mut state = server.subscribe();
        server.start(&sandbox, wiring).await.unwrap();

        sandbox.exit_process();

        tokio::time::timeout(Duration::from_secs(2), state.wait_for(|s| *s == ServerState::Idle))
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(rx.recv().await.unwrap(), RunnerEvent::ServerExited));

        server.start(&sandbox, sinks(&OutputAggregator::new())).await.unwrap();
        assert_eq!(sandbox.spawned(), 2);
    }

    #[tokio::test]
    async fn read_error_is_recorded_and_keeps_server_running() {
        let sandbox = ScriptedSandbox::new();
        let output = OutputAggregator::new();
        let wiring = sinks(&output);
        let ledger = wiring.ledger.clone();
        let mut events = wiring.events.subscribe();
        let mut server = controller();
        server.start(&sandbox, wiring).await.unwrap();

        sandbox.emit("first\n").await;
        sandbox.emit_read_error("decoder failed").await;
        wait_for_output(&output, "first\n").await;

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("no output failure event")
            .unwrap();
        assert!(matches!(event, RunnerEvent::OutputFailed(msg) if msg.contains("decoder failed")));

        let snapshot = ledger.snapshot();
        let step = snapshot.latest(StepKind::Output).unwrap();
        assert_eq!(step.status, StepStatus::Error);
        assert!(step.output.as_deref().unwrap().contains("decoder failed"));

        assert_eq!(server.state(), ServerState::Running);
        let report = server.stop().await;
        assert_eq!(report.kill_error, None);
        assert_eq!(server.state(), ServerState::Idle);
    }

    #[tokio::test]
    async fn abandoned_stop_still_ends_idle() {
        let sandbox = ScriptedSandbox::new();
        sandbox.delay_kill(Duration::from_millis(300));
        let mut server = controller();
        server.start(&sandbox, sinks(&OutputAggregator::new())).await.unwrap();

        let result = tokio::time::timeout(Duration::from_millis(20), server.stop()).await;

        assert!(result.is_err());
        assert_eq!(server.state(), ServerState::Idle);
        sandbox.clear_delays();
        server.start(&sandbox, sinks(&OutputAggregator::new())).await.unwrap();
        assert_eq!(sandbox.spawned(), 2);
    }

    #[tokio::test]
    async fn stop_when_idle_is_harmless() {
        let mut server = controller();

        let report = server.stop().await;

        assert_eq!(report, StopReport::default());
        assert_eq!(server.state(), ServerState::Idle);
    }
}
