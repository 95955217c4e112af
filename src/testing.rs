//! Scripted sandbox runtime for unit tests.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, OnceCell};

use crate::config::CommandSpec;
use crate::error::{Error, Result};
use crate::files::FileSet;
use crate::sandbox::{
    CommandOutput, ProcessHandle, Sandbox, SandboxProvider, ServerReady, SpawnedProcess,
};

#[derive(Default)]
struct Script {
    files: BTreeMap<String, Vec<u8>>,
    mount_error: Option<String>,
    sync_error: Option<String>,
    command_error: Option<String>,
    spawn_error: Option<String>,
    kill_error: Option<String>,
    mount_delay: Option<Duration>,
    command_delay: Option<Duration>,
    kill_delay: Option<Duration>,
    install_result: Option<(bool, String)>,
    commands_run: Vec<String>,
    spawned: usize,
    kills: usize,
    live_output: Option<mpsc::Sender<Result<String>>>,
}

/// Sandbox whose behavior is set up by the test.
pub struct ScriptedSandbox {
    script: Arc<Mutex<Script>>,
    ready_tx: broadcast::Sender<ServerReady>,
}

impl ScriptedSandbox {
    pub fn new() -> Self {
        let (ready_tx, _) = broadcast::channel(16);
        Self {
            script: Arc::new(Mutex::new(Script::default())),
            ready_tx,
        }
    }

    pub fn files(&self) -> BTreeMap<String, Vec<u8>> {
        self.script.lock().unwrap().files.clone()
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.script.lock().unwrap().files.get(path).cloned()
    }

    pub fn fail_mount(&self, msg: &str) {
        self.script.lock().unwrap().mount_error = Some(msg.to_string());
    }

    pub fn fail_sync(&self, msg: &str) {
        self.script.lock().unwrap().sync_error = Some(msg.to_string());
    }

    pub fn fail_commands(&self, msg: &str) {
        self.script.lock().unwrap().command_error = Some(msg.to_string());
    }

    pub fn fail_spawn(&self, msg: &str) {
        self.script.lock().unwrap().spawn_error = Some(msg.to_string());
    }

    pub fn fail_kill(&self, msg: &str) {
        self.script.lock().unwrap().kill_error = Some(msg.to_string());
    }

    pub fn clear_failures(&self) {
        let mut script = self.script.lock().unwrap();
        script.mount_error = None;
        script.sync_error = None;
        script.command_error = None;
        script.spawn_error = None;
        script.kill_error = None;
    }

    pub fn delay_mount(&self, delay: Duration) {
        self.script.lock().unwrap().mount_delay = Some(delay);
    }

    pub fn delay_commands(&self, delay: Duration) {
        self.script.lock().unwrap().command_delay = Some(delay);
    }

    pub fn delay_kill(&self, delay: Duration) {
        self.script.lock().unwrap().kill_delay = Some(delay);
    }

    pub fn clear_delays(&self) {
        let mut script = self.script.lock().unwrap();
        script.mount_delay = None;
        script.command_delay = None;
        script.kill_delay = None;
    }

    pub fn set_install_result(&self, success: bool, output: &str) {
        self.script.lock().unwrap().install_result = Some((success, output.to_string()));
    }

    pub fn commands_run(&self) -> Vec<String> {
        self.script.lock().unwrap().commands_run.clone()
    }

    pub fn spawned(&self) -> usize {
        self.script.lock().unwrap().spawned
    }

    pub fn kills(&self) -> usize {
        self.script.lock().unwrap().kills
    }

    /// Sends a chunk on the live process output stream.
    pub async fn emit(&self, chunk: &str) {
        let tx = self.script.lock().unwrap().live_output.clone();
        if let Some(tx) = tx {
            tx.send(Ok(chunk.to_string())).await.unwrap();
        }
    }

    /// Sends a read failure on the live process output stream.
    pub async fn emit_read_error(&self, msg: &str) {
        let tx = self.script.lock().unwrap().live_output.take();
        if let Some(tx) = tx {
            tx.send(Err(Error::StreamRead(msg.to_string()))).await.unwrap();
        }
    }

    /// Simulates the live process exiting on its own.
    pub fn exit_process(&self) {
        self.script.lock().unwrap().live_output = None;
    }

    /// Announces a ready server.
    pub fn announce_ready(&self, port: u16, url: &str) {
        let _ = self.ready_tx.send(ServerReady {
            port,
            url: url.to_string(),
        });
    }

    fn write(&self, files: &FileSet) {
        let mut script = self.script.lock().unwrap();
        for file in files {
            script.files.insert(file.path.clone(), file.content.clone());
        }
    }
}

#[async_trait]
impl Sandbox for ScriptedSandbox {
    async fn mount(&self, files: &FileSet) -> Result<()> {
        let delay = self.script.lock().unwrap().mount_delay;
        pause(delay).await;
        if let Some(msg) = self.script.lock().unwrap().mount_error.clone() {
            return Err(Error::Io(std::io::Error::other(msg)));
        }
        self.write(files);
        Ok(())
    }

    async fn sync(&self, files: &FileSet) -> Result<()> {
        if let Some(msg) = self.script.lock().unwrap().sync_error.clone() {
            return Err(Error::Io(std::io::Error::other(msg)));
        }
        self.write(files);
        Ok(())
    }

    async fn run_command(&self, command: &CommandSpec) -> Result<CommandOutput> {
        let delay = self.script.lock().unwrap().command_delay;
        pause(delay).await;
        let mut script = self.script.lock().unwrap();
        if let Some(msg) = script.command_error.clone() {
            return Err(Error::Io(std::io::Error::other(msg)));
        }
        script.commands_run.push(command.to_string());
        let (success, output) = script
            .install_result
            .clone()
            .unwrap_or((true, String::new()));
        Ok(CommandOutput {
            success,
            exit_code: Some(if success { 0 } else { 1 }),
            output,
        })
    }

    async fn spawn_long_running(&self, _command: &CommandSpec) -> Result<SpawnedProcess> {
        let mut script = self.script.lock().unwrap();
        if let Some(msg) = script.spawn_error.clone() {
            return Err(Error::Io(std::io::Error::other(msg)));
        }
        let (tx, rx) = mpsc::channel(64);
        script.live_output = Some(tx);
        script.spawned += 1;
        Ok(SpawnedProcess {
            handle: Box::new(ScriptedProcess {
                script: Arc::clone(&self.script),
            }),
            output: rx,
        })
    }

    fn server_ready(&self) -> broadcast::Receiver<ServerReady> {
        self.ready_tx.subscribe()
    }
}

struct ScriptedProcess {
    script: Arc<Mutex<Script>>,
}

#[async_trait]
impl ProcessHandle for ScriptedProcess {
    async fn kill(&self) -> Result<()> {
        let delay = self.script.lock().unwrap().kill_delay;
        pause(delay).await;
        let mut script = self.script.lock().unwrap();
        script.kills += 1;
        if let Some(msg) = script.kill_error.clone() {
            return Err(Error::Kill(msg));
        }
        script.live_output = None;
        Ok(())
    }
}

async fn pause(delay: Option<Duration>) {
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }
}

/// Provider handing out one shared [`ScriptedSandbox`].
pub struct ScriptedProvider {
    sandbox: Arc<ScriptedSandbox>,
    session: OnceCell<Arc<ScriptedSandbox>>,
    acquire_error: Mutex<Option<String>>,
    acquisitions: Mutex<usize>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            sandbox: Arc::new(ScriptedSandbox::new()),
            session: OnceCell::new(),
            acquire_error: Mutex::new(None),
            acquisitions: Mutex::new(0),
        }
    }

    pub fn sandbox(&self) -> Arc<ScriptedSandbox> {
        Arc::clone(&self.sandbox)
    }

    pub fn fail_acquire(&self, msg: &str) {
        *self.acquire_error.lock().unwrap() = Some(msg.to_string());
    }

    pub fn acquisitions(&self) -> usize {
        *self.acquisitions.lock().unwrap()
    }
}

#[async_trait]
impl SandboxProvider for ScriptedProvider {
    type Sandbox = ScriptedSandbox;

    async fn acquire(&self) -> Result<Arc<ScriptedSandbox>> {
        let session = self
            .session
            .get_or_try_init(|| async {
                *self.acquisitions.lock().unwrap() += 1;
                if let Some(msg) = self.acquire_error.lock().unwrap().clone() {
                    return Err(Error::Acquisition(msg));
                }
                Ok(Arc::clone(&self.sandbox))
            })
            .await?;
        Ok(Arc::clone(session))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
