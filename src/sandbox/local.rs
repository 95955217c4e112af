//! Directory-backed sandbox runtime.
//!
//! Each session gets its own directory under a base path. Commands run as
//! host processes with that directory as their working directory. Dev server
//! readiness is detected from the URL the server prints on startup.

use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{broadcast, mpsc, oneshot, OnceCell};

use crate::config::CommandSpec;
use crate::error::{Error, Result};
use crate::files::FileSet;

use super::provider::{
    CommandOutput, ProcessHandle, Sandbox, SandboxProvider, ServerReady, SpawnedProcess,
};

const DEFAULT_OUTPUT_CAPACITY: usize = 256;
const READY_CHANNEL_CAPACITY: usize = 16;
/// How long a terminated process group gets before it is force-killed.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Matches ANSI color escapes, which dev servers wrap around URLs.
fn ansi_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\x1b\[[0-9;]*[A-Za-z]").expect("valid ANSI pattern"))
}

/// Matches a printed server URL: Vite's `Local: http://localhost:5173/`,
/// Next's `ready - started server on 0.0.0.0:3000, url: http://localhost:3000`.
fn url_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(https?://(?:[A-Za-z0-9.\-]+|\[[0-9A-Fa-f:]+\]):(\d{2,5}))(/[^\s,]*)?")
            .expect("valid URL pattern")
    })
}

/// Matches Express-style `server running on port 8080`.
fn port_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)\b(?:listening|running|started|ready)\b.*?\bport\s+(\d{2,5})\b")
            .expect("valid port pattern")
    })
}

/// Extracts a server-ready notification from a line of dev server output.
pub fn detect_server_ready(line: &str) -> Option<ServerReady> {
    let line = ansi_pattern().replace_all(line, "");

    if let Some(captures) = url_pattern().captures(&line) {
        let port = captures.get(2)?.as_str().parse::<u16>().ok()?;
        let base = captures.get(1)?.as_str();
        let path = captures
            .get(3)
            .map(|m| m.as_str().trim_end_matches(['.', ')']))
            .unwrap_or("");
        return Some(ServerReady {
            port,
            url: format!("{}{}", base, path),
        });
    }

    let captures = port_pattern().captures(&line)?;
    let port = captures.get(1)?.as_str().parse::<u16>().ok()?;
    Some(ServerReady {
        port,
        url: format!("http://localhost:{}", port),
    })
}

/// Rejects paths that would escape the sandbox root.
fn resolve_path(root: &Path, relative: &str) -> Result<PathBuf> {
    let candidate = Path::new(relative);
    let escapes = relative.is_empty()
        || candidate.components().any(|c| {
            matches!(
                c,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        });

    if escapes {
        return Err(Error::InvalidPath(candidate.to_path_buf()));
    }
    Ok(root.join(candidate))
}

/// A sandbox session backed by a host directory.
pub struct LocalSandboxInstance {
    /// Root directory of the session.
    root: PathBuf,
    /// Fan-out of server-ready notifications.
    ready_tx: broadcast::Sender<ServerReady>,
    /// Capacity of each process output channel.
    output_capacity: usize,
}

impl LocalSandboxInstance {
    /// Returns the session directory.
    pub fn path(&self) -> &Path {
        &self.root
    }

    async fn write_files(&self, files: &FileSet) -> Result<()> {
        for file in files {
            let target = resolve_path(&self.root, &file.path)?;
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&target, &file.content).await?;
        }
        Ok(())
    }
}

impl Drop for LocalSandboxInstance {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.root) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::error!(error = %e, path = ?self.root, "failed to remove sandbox directory on drop");
            }
        }
    }
}

#[async_trait]
impl Sandbox for LocalSandboxInstance {
    async fn mount(&self, files: &FileSet) -> Result<()> {
        self.write_files(files).await?;
        tracing::info!(path = ?self.root, files = files.len(), "mounted project files");
        Ok(())
    }

    async fn sync(&self, files: &FileSet) -> Result<()> {
        self.write_files(files).await?;
        tracing::debug!(path = ?self.root, files = files.len(), "synced project files");
        Ok(())
    }

    async fn run_command(&self, command: &CommandSpec) -> Result<CommandOutput> {
        tracing::info!(command = %command, path = ?self.root, "running command");

        let output = Command::new(&command.program)
            .args(&command.args)
            .current_dir(&self.root)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        Ok(CommandOutput {
            success: output.status.success(),
            exit_code: output.status.code(),
            output: combined,
        })
    }

    async fn spawn_long_running(&self, command: &CommandSpec) -> Result<SpawnedProcess> {
        tracing::info!(command = %command, path = ?self.root, "spawning long-running process");

        let mut process = Command::new(&command.program);
        process
            .args(&command.args)
            .current_dir(&self.root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so a kill reaches everything the server forks.
        #[cfg(unix)]
        process.process_group(0);
        let mut child = process.spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Io(std::io::Error::other("stdout was not piped")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Io(std::io::Error::other("stderr was not piped")))?;
        let id = child.id();

        let (output_tx, output_rx) = mpsc::channel(self.output_capacity);
        let (kill_tx, kill_rx) = mpsc::channel(1);

        tokio::spawn(supervise(
            child,
            stdout,
            stderr,
            output_tx,
            kill_rx,
            self.ready_tx.clone(),
        ));

        Ok(SpawnedProcess {
            handle: Box::new(LocalProcess { id, kill_tx }),
            output: output_rx,
        })
    }

    fn server_ready(&self) -> broadcast::Receiver<ServerReady> {
        self.ready_tx.subscribe()
    }
}

type KillReply = oneshot::Sender<std::io::Result<()>>;

/// Handle to a process supervised by [`supervise`].
struct LocalProcess {
    id: Option<u32>,
    kill_tx: mpsc::Sender<KillReply>,
}

#[async_trait]
impl ProcessHandle for LocalProcess {
    async fn kill(&self) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.kill_tx
            .send(reply_tx)
            .await
            .map_err(|_| Error::Kill("process has already exited".to_string()))?;

        match reply_rx.await {
            Ok(result) => result.map_err(|e| Error::Kill(e.to_string())),
            Err(_) => Err(Error::Kill("process exited before kill was delivered".to_string())),
        }
    }

    fn id(&self) -> Option<u32> {
        self.id
    }
}

/// Terminates the process group led by `child`.
///
/// The group gets SIGTERM, then SIGKILL for anything still alive after
/// [`KILL_GRACE`].
async fn terminate(child: &mut Child) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let Some(pid) = child.id() else {
            return child.kill().await;
        };
        let group = Pid::from_raw(pid as i32);

        match killpg(group, Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => {
                tracing::warn!(pid, error = %e, "failed to signal process group");
                return Err(e.into());
            }
        }

        if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_err() {
            tracing::warn!(pid, "process group ignored SIGTERM, killing");
        }

        match killpg(group, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => return Err(e.into()),
        }
        child.wait().await?;
        tracing::debug!(pid, "process group terminated");
        Ok(())
    }

    #[cfg(not(unix))]
    {
        child.kill().await
    }
}

/// Forwards output lines, announces readiness and services kill requests
/// until the process exits.
async fn supervise(
    mut child: Child,
    stdout: ChildStdout,
    stderr: ChildStderr,
    output_tx: mpsc::Sender<Result<String>>,
    mut kill_rx: mpsc::Receiver<KillReply>,
    ready_tx: broadcast::Sender<ServerReady>,
) {
    let mut stdout = BufReader::new(stdout).lines();
    let mut stderr = BufReader::new(stderr).lines();
    let mut stdout_open = true;
    let mut stderr_open = true;
    let mut forwarding = true;
    let mut announced_port = None;

    while stdout_open || stderr_open {
        let (from_stdout, line) = tokio::select! {
            line = stdout.next_line(), if stdout_open => (true, line),
            line = stderr.next_line(), if stderr_open => (false, line),
            Some(reply) = kill_rx.recv() => {
                let _ = reply.send(terminate(&mut child).await);
                continue;
            }
        };

        match line {
            Ok(Some(line)) => {
                if let Some(ready) = detect_server_ready(&line) {
                    if announced_port != Some(ready.port) {
                        announced_port = Some(ready.port);
                        tracing::info!(port = ready.port, url = %ready.url, "server ready");
                        // No subscribers is fine; the announcement is dropped.
                        let _ = ready_tx.send(ready);
                    }
                }
                if forwarding && output_tx.send(Ok(format!("{}\n", line))).await.is_err() {
                    tracing::debug!("output receiver released, discarding further output");
                    forwarding = false;
                }
            }
            Ok(None) if from_stdout => stdout_open = false,
            Ok(None) => stderr_open = false,
            Err(e) => {
                tracing::warn!(error = %e, "error reading process output");
                if forwarding {
                    let _ = output_tx.send(Err(Error::StreamRead(e.to_string()))).await;
                }
                break;
            }
        }
    }

    drop(output_tx);

    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            Some(reply) = kill_rx.recv() => {
                let _ = reply.send(terminate(&mut child).await);
            }
        }
    };

    match status {
        Ok(status) => tracing::info!(status = %status, "long-running process exited"),
        Err(e) => tracing::warn!(error = %e, "failed to wait for long-running process"),
    }
}

/// Provider that creates one directory-backed sandbox per session.
pub struct LocalSandbox {
    /// Base directory for session directories. If None, uses a temp directory.
    base_dir: Option<PathBuf>,
    /// Capacity of each process output channel.
    output_capacity: usize,
    /// The session, once booted.
    session: OnceCell<Arc<LocalSandboxInstance>>,
}

impl LocalSandbox {
    /// Creates a new provider.
    ///
    /// If `base_dir` is provided, session directories are created there.
    /// Otherwise, a system temp directory is used.
    pub fn new(base_dir: Option<PathBuf>) -> Self {
        Self {
            base_dir,
            output_capacity: DEFAULT_OUTPUT_CAPACITY,
            session: OnceCell::new(),
        }
    }

    /// Sets the capacity of process output channels.
    pub fn with_output_capacity(mut self, capacity: usize) -> Self {
        self.output_capacity = capacity.max(1);
        self
    }

    async fn boot(&self) -> Result<Arc<LocalSandboxInstance>> {
        let base = match &self.base_dir {
            Some(dir) => dir.clone(),
            None => std::env::temp_dir().join("container-runner-sessions"),
        };
        let root = base.join(format!("session-{}", uuid::Uuid::new_v4()));

        tokio::fs::create_dir_all(&root).await.map_err(|e| {
            Error::Acquisition(format!("cannot create {}: {}", root.display(), e))
        })?;

        let (ready_tx, _) = broadcast::channel(READY_CHANNEL_CAPACITY);
        tracing::info!(path = ?root, "booted local sandbox");

        Ok(Arc::new(LocalSandboxInstance {
            root,
            ready_tx,
            output_capacity: self.output_capacity,
        }))
    }
}

#[async_trait]
impl SandboxProvider for LocalSandbox {
    type Sandbox = LocalSandboxInstance;

    async fn acquire(&self) -> Result<Arc<LocalSandboxInstance>> {
        let session = self.session.get_or_try_init(|| self.boot()).await?;
        Ok(Arc::clone(session))
    }

    fn name(&self) -> &str {
        "local"
    }
}
