//! Headless host for the introduction task scheduler.
//!
//! Loads the configuration (first argument, or the default config path),
//! opens the task store, restores persisted tasks, and runs the scheduler
//! until Ctrl-C. Owners listed in the signal file get an introduction task
//! if they do not have one yet.
//!
//! All tracing output goes to stderr.

use std::sync::Arc;

use anyhow::Context;
use introducer::signals::{InMemorySignals, MessageSource, SignalFile, TrustSource};
use introducer::{
    Collaborators, Scheduler, SchedulerConfig, SchedulerEvent, SqliteTaskStore, SystemClock,
    TaskRegistry,
};
use tokio::sync::mpsc;

fn load_config() -> anyhow::Result<SchedulerConfig> {
    if let Some(arg) = std::env::args_os().nth(1) {
        let path = std::path::PathBuf::from(arg);
        return SchedulerConfig::from_file(&path)
            .with_context(|| format!("cannot load config from {}", path.display()));
    }

    let path = SchedulerConfig::default_config_path();
    if path.exists() {
        SchedulerConfig::from_file(&path)
            .with_context(|| format!("cannot load config from {}", path.display()))
    } else {
        tracing::info!("no config at {}, using defaults", path.display());
        Ok(SchedulerConfig::default())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("introducer=info")),
        )
        .init();

    tracing::info!("introducer-host starting");

    let config = load_config()?;
    let store = Arc::new(
        SqliteTaskStore::open(&config.store_dir)
            .with_context(|| format!("cannot open task store in {}", config.store_dir.display()))?,
    );

    let signal_file = config.signal_file.as_ref().map(SignalFile::new);
    let (messages, trust): (Arc<dyn MessageSource>, Arc<dyn TrustSource>) = match &signal_file {
        Some(file) => {
            let file = Arc::new(file.clone());
            (file.clone() as Arc<dyn MessageSource>, file as Arc<dyn TrustSource>)
        }
        None => {
            tracing::warn!("no signal_file configured; every identity looks quiet");
            let signals = Arc::new(InMemorySignals::new());
            (signals.clone() as Arc<dyn MessageSource>, signals as Arc<dyn TrustSource>)
        }
    };

    let clock = Arc::new(SystemClock);
    let collaborators = Collaborators {
        messages,
        trust,
        config: Arc::new(config.clone()),
        clock: clock.clone(),
    };
    let registry = Arc::new(TaskRegistry::new(
        store,
        collaborators,
        config.processing_interval(),
    ));
    registry.restore().context("cannot restore persisted tasks")?;

    if let Some(file) = &signal_file {
        match file.owners() {
            Ok(owners) => {
                for owner in owners {
                    registry.ensure_introduction_task(&owner)?;
                }
            }
            Err(e) => tracing::warn!("cannot list owners from signal file: {e}"),
        }
    }

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let scheduler = Scheduler::new(Arc::clone(&registry), clock, event_tx).with_config(&config);
    let history = scheduler.history_handle();
    let handle = scheduler.run();

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            event = event_rx.recv() => match event {
                Some(SchedulerEvent::Processed { task_id, owner, visible: true }) => {
                    tracing::info!(task_id = %task_id, owner = %owner, "introduction task is visible");
                }
                Some(SchedulerEvent::Processed { .. }) => {}
                Some(SchedulerEvent::CommitFailed { task_id, error }) => {
                    tracing::error!(task_id = %task_id, "task commit failed: {error}");
                }
                None => break,
            },
            result = &mut shutdown => {
                result.context("cannot listen for Ctrl-C")?;
                tracing::info!("received Ctrl-C, shutting down");
                break;
            }
        }
    }

    handle.abort();
    tracing::info!(runs = history.len(), "introducer-host shut down cleanly");
    Ok(())
}
