//! Scheduler background loop.
//!
//! Spawns a tokio task that periodically asks the registry for due tasks and
//! processes them one after another. Outcomes go to a bounded in-memory run
//! history and to an event channel for the embedding application. The history
//! is shared through [`RunHistory`], so it stays readable after [`Scheduler::run`]
//! has taken the scheduler.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, Timestamp};
use crate::config::{DEFAULT_HISTORY_LIMIT, DEFAULT_TICK_INTERVAL_SECS, SchedulerConfig};
use crate::scheduler::registry::TaskRegistry;
use crate::task::{OwnerId, TaskId};

/// How a single `process()` call ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "error")]
pub enum TaskRunOutcome {
    Processed,
    CommitFailed(String),
}

/// One entry of the scheduler's run history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRunRecord {
    pub task_id: TaskId,
    pub owner: OwnerId,
    pub started_at: Timestamp,
    pub finished_at: Timestamp,
    pub outcome: TaskRunOutcome,
}

/// Cloneable handle on the scheduler's run history, oldest entry first.
#[derive(Debug, Clone, Default)]
pub struct RunHistory {
    runs: Arc<Mutex<Vec<TaskRunRecord>>>,
}

impl RunHistory {
    /// Copy of the current entries.
    pub fn snapshot(&self) -> Vec<TaskRunRecord> {
        self.runs().clone()
    }

    pub fn len(&self) -> usize {
        self.runs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs().is_empty()
    }

    fn push_bounded(&self, run: TaskRunRecord, max_entries: usize) {
        let mut runs = self.runs();
        runs.push(run);
        if runs.len() <= max_entries {
            return;
        }
        let drop_count = runs.len().saturating_sub(max_entries);
        runs.drain(0..drop_count);
    }

    // Entries are plain records, so a writer that panicked leaves nothing half-done.
    fn runs(&self) -> MutexGuard<'_, Vec<TaskRunRecord>> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Notification sent after each processed task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    /// The task committed its new state. `visible` tells whether it should
    /// now be shown to its owner.
    Processed {
        task_id: TaskId,
        owner: OwnerId,
        visible: bool,
    },
    /// The task could not commit; it stays due and is retried next tick.
    CommitFailed { task_id: TaskId, error: String },
}

/// Counts for a single tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub processed: usize,
    pub failed: usize,
}

/// Background scheduler that runs due tasks.
pub struct Scheduler {
    registry: Arc<TaskRegistry>,
    clock: Arc<dyn Clock>,
    tick_interval: Duration,
    /// Recent run history.
    history: RunHistory,
    /// Max history entries kept in memory.
    max_history_entries: usize,
    /// Channel for task outcomes.
    event_tx: mpsc::UnboundedSender<SchedulerEvent>,
}

impl Scheduler {
    /// Create a new scheduler with the given event channel.
    pub fn new(
        registry: Arc<TaskRegistry>,
        clock: Arc<dyn Clock>,
        event_tx: mpsc::UnboundedSender<SchedulerEvent>,
    ) -> Self {
        Self {
            registry,
            clock,
            tick_interval: Duration::from_secs(DEFAULT_TICK_INTERVAL_SECS),
            history: RunHistory::default(),
            max_history_entries: DEFAULT_HISTORY_LIMIT,
            event_tx,
        }
    }

    /// Apply tick interval and history limit from `config`.
    pub fn with_config(self, config: &SchedulerConfig) -> Self {
        self.with_tick_interval(config.tick_interval())
            .with_history_limit(config.history_limit)
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Override the in-memory run-history limit.
    pub fn with_history_limit(mut self, max_entries: usize) -> Self {
        self.max_history_entries = max_entries.max(1);
        self
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    /// Recent run history, oldest first.
    pub fn history(&self) -> Vec<TaskRunRecord> {
        self.history.snapshot()
    }

    /// Shared view of the run history. Take it before calling [`run`](Self::run)
    /// to keep reading history while the loop owns the scheduler.
    pub fn history_handle(&self) -> RunHistory {
        self.history.clone()
    }

    /// Start the background loop.
    pub fn run(mut self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            match self.registry.len() {
                Ok(count) => info!("scheduler started with {count} tasks"),
                Err(e) => warn!("scheduler started, registry unreadable: {e}"),
            }
            let mut interval = tokio::time::interval(self.tick_interval);

            loop {
                interval.tick().await;
                self.tick();
                if self.event_tx.is_closed() {
                    debug!("scheduler event channel closed, stopping");
                    break;
                }
            }
        })
    }

    /// Execute one scheduler tick: process every task that is due now.
    pub fn tick(&mut self) -> TickSummary {
        let mut summary = TickSummary::default();
        let now = self.clock.now();
        let due = match self.registry.due_tasks(now) {
            Ok(due) => due,
            Err(e) => {
                error!("cannot list due tasks: {e}");
                return summary;
            }
        };

        for task in due {
            let task_id = task.id();
            let owner = task.owner().clone();
            let started_at = self.clock.now();

            let (outcome, event) = match task.process() {
                Ok(()) => {
                    summary.processed += 1;
                    let finished = self.clock.now();
                    let visible = match task.next_display_time() {
                        Ok(display) => display <= finished,
                        Err(e) => {
                            warn!(task_id = %task_id, "cannot read display time: {e}");
                            false
                        }
                    };
                    (
                        TaskRunOutcome::Processed,
                        SchedulerEvent::Processed {
                            task_id,
                            owner: owner.clone(),
                            visible,
                        },
                    )
                }
                Err(e) => {
                    summary.failed += 1;
                    warn!(task_id = %task_id, owner = %owner, "task processing failed: {e}");
                    let error = e.to_string();
                    (
                        TaskRunOutcome::CommitFailed(error.clone()),
                        SchedulerEvent::CommitFailed { task_id, error },
                    )
                }
            };

            self.history.push_bounded(
                TaskRunRecord {
                    task_id,
                    owner,
                    started_at,
                    finished_at: self.clock.now(),
                    outcome,
                },
                self.max_history_entries,
            );

            if self.event_tx.send(event).is_err() {
                debug!("scheduler event channel closed, stopping");
                return summary;
            }
        }

        if summary.processed + summary.failed > 0 {
            debug!(
                processed = summary.processed,
                failed = summary.failed,
                "scheduler tick finished"
            );
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::clock::ManualClock;
    use crate::error::{Result, TaskError};
    use crate::signals::{Collaborators, InMemorySignals, OwnerSignals};
    use crate::store::{SqliteTaskStore, TaskStore};
    use crate::task::{PersistentTask, TaskRecord};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    const DAY: Duration = Duration::from_secs(24 * 3600);
    const T0: Timestamp = Timestamp::from_millis(1_700_000_000_000);

    /// Store that can be switched to reject writes for one owner.
    struct SelectiveStore {
        inner: SqliteTaskStore,
        reject: Mutex<Option<OwnerId>>,
        armed: AtomicBool,
    }

    impl TaskStore for SelectiveStore {
        fn store_and_commit(&self, record: &TaskRecord) -> Result<()> {
            if self.armed.load(Ordering::SeqCst)
                && self.reject.lock().unwrap().as_ref() == Some(&record.owner)
            {
                return Err(TaskError::Persistence(rusqlite::Error::InvalidQuery));
            }
            self.inner.store_and_commit(record)
        }
        fn load(&self, id: &TaskId) -> Result<Option<TaskRecord>> {
            self.inner.load(id)
        }
        fn load_all(&self) -> Result<Vec<TaskRecord>> {
            self.inner.load_all()
        }
        fn load_owner(&self, owner: &OwnerId) -> Result<Vec<TaskRecord>> {
            self.inner.load_owner(owner)
        }
        fn delete_owner(&self, owner: &OwnerId) -> Result<usize> {
            self.inner.delete_owner(owner)
        }
    }

    struct Fixture {
        clock: Arc<ManualClock>,
        signals: Arc<InMemorySignals>,
        store: Arc<SelectiveStore>,
        registry: Arc<TaskRegistry>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(T0));
        let signals = Arc::new(InMemorySignals::new());
        let store = Arc::new(SelectiveStore {
            inner: SqliteTaskStore::open_in_memory().unwrap(),
            reject: Mutex::new(None),
            armed: AtomicBool::new(false),
        });
        let collaborators = Collaborators {
            messages: signals.clone(),
            trust: signals.clone(),
            config: Arc::new(SchedulerConfig::default()),
            clock: clock.clone(),
        };
        let registry = Arc::new(TaskRegistry::new(store.clone(), collaborators, DAY));
        Fixture {
            clock,
            signals,
            store,
            registry,
        }
    }

    fn owner(raw: &str) -> OwnerId {
        OwnerId::new(raw).unwrap()
    }

    fn make_scheduler(
        fx: &Fixture,
    ) -> (Scheduler, mpsc::UnboundedReceiver<SchedulerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let scheduler = Scheduler::new(fx.registry.clone(), fx.clock.clone(), tx);
        (scheduler, rx)
    }

    #[test]
    fn tick_processes_due_tasks_and_records_history() {
        let fx = fixture();
        let alice = owner("alice");
        fx.signals.set(&alice, OwnerSignals { messages: 1, trusters: 0 }).unwrap();
        let task = fx.registry.ensure_introduction_task(&alice).unwrap();
        let (mut scheduler, mut rx) = make_scheduler(&fx);

        let summary = scheduler.tick();

        assert_eq!(summary, TickSummary { processed: 1, failed: 0 });
        let event = rx.try_recv().expect("event available");
        assert_eq!(
            event,
            SchedulerEvent::Processed {
                task_id: task.id(),
                owner: alice.clone(),
                visible: true,
            }
        );
        assert_eq!(scheduler.history().len(), 1);
        assert_eq!(scheduler.history()[0].owner, alice);
        assert_eq!(scheduler.history()[0].outcome, TaskRunOutcome::Processed);
        assert_eq!(task.next_processing_time().unwrap(), T0.saturating_add(DAY));
    }

    #[test]
    fn tick_skips_tasks_not_yet_due() {
        let fx = fixture();
        fx.registry.ensure_introduction_task(&owner("alice")).unwrap();
        let (mut scheduler, mut rx) = make_scheduler(&fx);

        scheduler.tick();
        let _ = rx.try_recv();
        fx.clock.advance(Duration::from_secs(3600));
        let summary = scheduler.tick();

        assert_eq!(summary, TickSummary::default());
        assert!(rx.try_recv().is_err());

        fx.clock.advance(DAY);
        assert_eq!(scheduler.tick().processed, 1);
    }

    #[test]
    fn quiet_identity_is_not_visible() {
        let fx = fixture();
        fx.registry.ensure_introduction_task(&owner("bob")).unwrap();
        let (mut scheduler, mut rx) = make_scheduler(&fx);

        scheduler.tick();

        assert!(matches!(
            rx.try_recv().unwrap(),
            SchedulerEvent::Processed { visible: false, .. }
        ));
    }

    #[test]
    fn commit_failure_does_not_stop_other_tasks() {
        let fx = fixture();
        let alice = owner("alice");
        let bob = owner("bob");
        let a = fx.registry.ensure_introduction_task(&alice).unwrap();
        let b = fx.registry.ensure_introduction_task(&bob).unwrap();
        *fx.store.reject.lock().unwrap() = Some(alice.clone());
        fx.store.armed.store(true, Ordering::SeqCst);
        let (mut scheduler, mut rx) = make_scheduler(&fx);

        let summary = scheduler.tick();

        assert_eq!(summary, TickSummary { processed: 1, failed: 1 });
        let first = rx.try_recv().unwrap();
        assert!(matches!(first, SchedulerEvent::CommitFailed { task_id, .. } if task_id == a.id()));
        let second = rx.try_recv().unwrap();
        assert!(matches!(second, SchedulerEvent::Processed { task_id, .. } if task_id == b.id()));
        assert!(matches!(
            scheduler.history()[0].outcome,
            TaskRunOutcome::CommitFailed(_)
        ));
        // Failed task keeps its old schedule and is retried next tick.
        assert_eq!(a.next_processing_time().unwrap(), T0);

        fx.store.armed.store(false, Ordering::SeqCst);
        assert_eq!(scheduler.tick(), TickSummary { processed: 1, failed: 0 });
    }

    #[test]
    fn run_history_is_bounded() {
        let fx = fixture();
        for name in ["a", "b", "c"] {
            fx.registry.ensure_introduction_task(&owner(name)).unwrap();
        }
        let (scheduler, _rx) = make_scheduler(&fx);
        let mut scheduler = scheduler.with_history_limit(2);

        scheduler.tick();

        let history = scheduler.history();
        let owners: Vec<&str> = history.iter().map(|r| r.owner.as_str()).collect();
        assert_eq!(owners, vec!["b", "c"]);
    }

    #[test]
    fn with_config_applies_limits() {
        let fx = fixture();
        let config = SchedulerConfig {
            tick_interval_secs: 5,
            history_limit: 0,
            ..SchedulerConfig::default()
        };
        let (scheduler, _rx) = make_scheduler(&fx);
        let scheduler = scheduler.with_config(&config);

        assert_eq!(scheduler.tick_interval, Duration::from_secs(5));
        assert_eq!(scheduler.max_history_entries, 1);
    }

    #[test]
    fn new_scheduler_uses_config_defaults() {
        let fx = fixture();
        let defaults = SchedulerConfig::default();
        let (scheduler, _rx) = make_scheduler(&fx);

        assert_eq!(scheduler.tick_interval, defaults.tick_interval());
        assert_eq!(scheduler.max_history_entries, defaults.history_limit);
    }

    #[test]
    fn history_serializes_outcome_tag() {
        let record = TaskRunRecord {
            task_id: TaskId::new(),
            owner: owner("alice"),
            started_at: T0,
            finished_at: T0,
            outcome: TaskRunOutcome::CommitFailed("disk full".to_owned()),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["outcome"]["status"], "commit_failed");
        assert_eq!(json["outcome"]["error"], "disk full");
        assert_eq!(json["owner"], "alice");
    }

    #[tokio::test]
    async fn run_starts_and_ticks() {
        let fx = fixture();
        let alice = owner("alice");
        fx.signals.set(&alice, OwnerSignals { messages: 3, trusters: 1 }).unwrap();
        fx.registry.ensure_introduction_task(&alice).unwrap();
        let (scheduler, mut rx) = make_scheduler(&fx);

        let handle = scheduler
            .with_tick_interval(Duration::from_millis(10))
            .run();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await;
        let event = event.expect("tick within timeout").expect("channel open");
        assert!(matches!(event, SchedulerEvent::Processed { visible: true, .. }));

        handle.abort();
    }

    #[tokio::test]
    async fn history_handle_is_readable_while_loop_runs() {
        let fx = fixture();
        let alice = owner("alice");
        fx.registry.ensure_introduction_task(&alice).unwrap();
        let (scheduler, mut rx) = make_scheduler(&fx);
        let history = scheduler.history_handle();
        assert!(history.is_empty());

        let handle = scheduler
            .with_tick_interval(Duration::from_millis(10))
            .run();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await;
        assert!(event.expect("tick within timeout").is_some());

        let runs = history.snapshot();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].owner, alice);
        assert_eq!(runs[0].outcome, TaskRunOutcome::Processed);

        handle.abort();
    }

    #[tokio::test]
    async fn run_stops_when_receiver_dropped() {
        let fx = fixture();
        let (scheduler, rx) = make_scheduler(&fx);
        drop(rx);

        let handle = scheduler
            .with_tick_interval(Duration::from_millis(10))
            .run();

        let joined = tokio::time::timeout(Duration::from_secs(5), handle).await;
        assert!(joined.is_ok(), "loop should exit once nobody listens");
    }
}
