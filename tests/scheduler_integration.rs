#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use introducer::scheduler::TaskRunOutcome;
use introducer::signals::SignalFile;
use introducer::{
    Collaborators, ManualClock, OwnerId, PersistentTask, Scheduler, SchedulerConfig,
    SchedulerEvent, SqliteTaskStore, TaskRegistry, Timestamp,
};
use tokio::sync::mpsc;

const START: Timestamp = Timestamp::from_millis(1_750_000_000_000);

fn write_signals(path: &Path, json: &str) {
    std::fs::write(path, json).expect("write signal file");
}

fn registry_for(root: &Path, clock: Arc<ManualClock>) -> (Arc<TaskRegistry>, SignalFile) {
    let config = SchedulerConfig {
        store_dir: root.join("store"),
        signal_file: Some(root.join("signals.json")),
        ..SchedulerConfig::default()
    };
    let signals = SignalFile::new(root.join("signals.json"));
    let store = Arc::new(SqliteTaskStore::open(&config.store_dir).unwrap());
    let collaborators = Collaborators {
        messages: Arc::new(signals.clone()),
        trust: Arc::new(signals.clone()),
        config: Arc::new(config.clone()),
        clock,
    };
    let registry = TaskRegistry::new(store, collaborators, config.processing_interval());
    (Arc::new(registry), signals)
}

#[test]
fn tick_driven_by_signal_file() {
    let dir = tempfile::TempDir::new().unwrap();
    write_signals(
        &dir.path().join("signals.json"),
        r#"{"owners":{"alice":{"messages":3,"trusters":1},"bob":{"messages":0,"trusters":0}}}"#,
    );
    let clock = Arc::new(ManualClock::new(START));
    let (registry, signals) = registry_for(dir.path(), clock.clone());
    for owner in signals.owners().unwrap() {
        registry.ensure_introduction_task(&owner).unwrap();
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut scheduler = Scheduler::new(registry.clone(), clock.clone(), tx);
    let summary = scheduler.tick();
    assert_eq!(summary.processed, 2);

    let mut visible = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let SchedulerEvent::Processed {
            owner,
            visible: true,
            ..
        } = event
        {
            visible.push(owner);
        }
    }
    assert_eq!(visible, vec![OwnerId::new("alice").unwrap()]);

    let alice = registry
        .introduction_task(&OwnerId::new("alice").unwrap())
        .unwrap()
        .unwrap();
    assert_eq!(alice.number_of_puzzles_to_solve().unwrap(), 10);
    assert!(
        scheduler
            .history()
            .iter()
            .all(|run| run.outcome == TaskRunOutcome::Processed)
    );
}

#[test]
fn missing_signal_file_backs_off_every_task() {
    let dir = tempfile::TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(START));
    let (registry, _signals) = registry_for(dir.path(), clock.clone());
    let carol = registry
        .ensure_introduction_task(&OwnerId::new("carol").unwrap())
        .unwrap();

    let (tx, _rx) = mpsc::unbounded_channel();
    let mut scheduler = Scheduler::new(registry, clock.clone(), tx);
    scheduler.tick();

    let interval = SchedulerConfig::default().processing_interval();
    assert_eq!(
        carol.next_processing_time().unwrap(),
        START.saturating_add(interval / 8)
    );

    // Nothing is due again until the short backoff elapses.
    clock.advance(interval / 16);
    assert_eq!(scheduler.tick().processed, 0);
    clock.advance(interval / 16);
    assert_eq!(scheduler.tick().processed, 1);
}

#[test]
fn restart_keeps_schedule_and_progress() {
    let dir = tempfile::TempDir::new().unwrap();
    write_signals(
        &dir.path().join("signals.json"),
        r#"{"owners":{"alice":{"messages":1,"trusters":0}}}"#,
    );
    let alice = OwnerId::new("alice").unwrap();

    {
        let clock = Arc::new(ManualClock::new(START));
        let (registry, _signals) = registry_for(dir.path(), clock.clone());
        let task = registry.ensure_introduction_task(&alice).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        Scheduler::new(registry, clock, tx).tick();
        task.on_puzzle_solved().unwrap();
    }

    let clock = Arc::new(ManualClock::new(START.saturating_add(Duration::from_secs(60))));
    let (registry, _signals) = registry_for(dir.path(), clock.clone());
    assert_eq!(registry.restore().unwrap(), 1);

    let (tx, _rx) = mpsc::unbounded_channel();
    let mut scheduler = Scheduler::new(registry.clone(), clock, tx);
    assert_eq!(scheduler.tick().processed, 0, "task is not due after a restart");

    let task = registry.introduction_task(&alice).unwrap().unwrap();
    assert_eq!(task.number_of_puzzles_to_solve().unwrap(), 9);
}

#[tokio::test]
async fn run_loop_reports_visible_task() {
    let dir = tempfile::TempDir::new().unwrap();
    write_signals(
        &dir.path().join("signals.json"),
        r#"{"owners":{"dave":{"messages":5,"trusters":4}}}"#,
    );
    let clock = Arc::new(ManualClock::new(START));
    let (registry, _signals) = registry_for(dir.path(), clock.clone());
    let dave = OwnerId::new("dave").unwrap();
    registry.ensure_introduction_task(&dave).unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = Scheduler::new(registry, clock, tx)
        .with_tick_interval(Duration::from_millis(10))
        .run();

    let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("event within timeout")
        .expect("channel open");
    match event {
        SchedulerEvent::Processed { owner, visible, .. } => {
            assert_eq!(owner, dave);
            assert!(visible);
        }
        other => panic!("unexpected event: {other:?}"),
    }

    handle.abort();
}
