//! Container Runner CLI
//!
//! Boots a local sandbox for a project directory, installs dependencies and
//! runs its dev server until interrupted.

use std::path::PathBuf;
use std::time::Duration;

use container_runner::{
    FileSet, LocalSandbox, Orchestrator, RunnerConfig, RunnerEvent, SyncOutcome,
};

const OUTPUT_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    // Parse args
    let args: Vec<String> = std::env::args().collect();

    if args.len() != 2 {
        eprintln!("Usage: {} <project-dir>", args[0]);
        eprintln!("\nRuns the project's dev server in a local sandbox.");
        eprintln!("\nConfiguration is read from <project-dir>/runner.toml when present.");
        eprintln!("Set RUST_LOG to control log verbosity.");
        std::process::exit(2);
    }

    let project_dir = PathBuf::from(&args[1]);

    if let Err(e) = run(project_dir).await {
        eprintln!("container-runner failed: {}", e);
        std::process::exit(1);
    }
}

async fn run(project_dir: PathBuf) -> container_runner::Result<()> {
    let config_path = project_dir.join("runner.toml");
    let config = if config_path.is_file() {
        tracing::info!(path = ?config_path, "loading runner config");
        RunnerConfig::load(&config_path)?
    } else {
        RunnerConfig::node()
    };

    let files = FileSet::from_dir(&project_dir)?;
    tracing::info!(files = files.len(), dir = ?project_dir, "loaded project files");

    let provider = LocalSandbox::new(None).with_output_capacity(config.output_channel_capacity);
    let mut orchestrator = Orchestrator::new(provider, config)?;
    let mut events = orchestrator.subscribe();

    orchestrator.set_visible(true).await?;
    if let SyncOutcome::Mounted(receipt) = orchestrator.files_changed(files).await? {
        println!("Mounted {} files", receipt.file_count);
        tracing::debug!(fingerprint = %receipt.fingerprint, "initial snapshot");
    }

    let install = orchestrator.install().await?;
    print!("{}", install.output);
    if !install.success {
        eprintln!("\nDependency install failed");
        std::process::exit(1);
    }

    orchestrator.start().await?;

    let output = orchestrator.output();
    let (_, mut cursor) = output.read_since(0).await;
    let mut poll = tokio::time::interval(OUTPUT_POLL_INTERVAL);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                tracing::info!("interrupt received, stopping dev server");
                break;
            }
            event = events.recv() => match event {
                Ok(RunnerEvent::PreviewReady(ready)) => {
                    println!("\nPreview: {}", ready.url);
                }
                Ok(RunnerEvent::ServerExited) => {
                    println!("\nDev server exited");
                    break;
                }
                Ok(RunnerEvent::OutputFailed(reason)) => {
                    eprintln!("\nLost dev server output: {}", reason);
                }
                Ok(RunnerEvent::FilesSynced { .. }) => {}
                Err(e) => tracing::debug!(error = %e, "event stream interrupted"),
            },
            _ = poll.tick() => {
                let (text, next) = output.read_since(cursor).await;
                cursor = next;
                print!("{}", text);
            }
        }
    }

    let (text, _) = output.read_since(cursor).await;
    print!("{}", text);

    if orchestrator.can_stop() {
        let report = orchestrator.stop().await?;
        if let Some(reason) = report.kill_error {
            eprintln!("Failed to kill dev server: {}", reason);
        }
    }

    let snapshot = orchestrator.snapshot().await;
    match serde_json::to_string_pretty(&snapshot) {
        Ok(json) => println!("{}", json),
        Err(e) => tracing::warn!(error = %e, "failed to encode session snapshot"),
    }

    Ok(())
}
