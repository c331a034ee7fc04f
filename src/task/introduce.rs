//! Introduction task: decides whether an identity must solve introduction
//! puzzles to become trusted by enough peers.
//!
//! An identity needs introduction once it has written at least one message
//! while fewer than `minimum_truster_count` peers trust it. The task then
//! asks for twice that many puzzles, since not every solved puzzle yields a
//! new truster, and counts them down as the user solves them.
//!
//! The state is derived, not enumerated:
//! - *dormant*: no puzzles pending, display time is [`Timestamp::NEVER`];
//! - *needs introduction*: puzzles pending, display time already reached.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::{OwnerId, PersistentTask, TaskId, TaskKind, TaskRecord, TaskView};
use crate::clock::Timestamp;
use crate::error::{Result, SignalError, TaskError};
use crate::signals::Collaborators;
use crate::store::TaskStore;

/// Puzzles requested per missing-truster threshold unit.
const PUZZLE_SLACK_FACTOR: u32 = 2;

/// A failed cycle retries after `processing_interval / RETRY_DIVISOR`.
const RETRY_DIVISOR: u32 = 8;

/// Mutable fields, guarded by the task lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct IntroductionState {
    next_processing_time: Timestamp,
    next_display_time: Timestamp,
    puzzles_to_solve: u32,
}

/// Per-identity introduction task.
pub struct IntroduceIdentityTask {
    id: TaskId,
    owner: OwnerId,
    processing_interval: Duration,
    state: Mutex<IntroductionState>,
    store: Arc<dyn TaskStore>,
    collaborators: Collaborators,
}

impl std::fmt::Debug for IntroduceIdentityTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntroduceIdentityTask")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("processing_interval", &self.processing_interval)
            .finish_non_exhaustive()
    }
}

impl IntroduceIdentityTask {
    /// Create a dormant task for `owner`, due for processing right away, and
    /// commit it.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::Persistence`] if the initial commit fails.
    pub fn new(
        owner: OwnerId,
        store: Arc<dyn TaskStore>,
        collaborators: Collaborators,
        processing_interval: Duration,
    ) -> Result<Self> {
        let now = collaborators.clock.now();
        let task = Self {
            id: TaskId::new(),
            owner,
            processing_interval,
            state: Mutex::new(IntroductionState {
                next_processing_time: now,
                next_display_time: Timestamp::NEVER,
                puzzles_to_solve: 0,
            }),
            store,
            collaborators,
        };

        let record = task.record()?;
        task.store.store_and_commit(&record)?;
        debug!(task_id = %task.id, owner = %task.owner, "created introduction task");
        Ok(task)
    }

    /// Rebuild a task from its stored record. Nothing is committed.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::InvalidInput`] if `record` belongs to another task kind.
    pub fn restore(
        record: TaskRecord,
        store: Arc<dyn TaskStore>,
        collaborators: Collaborators,
        processing_interval: Duration,
    ) -> Result<Self> {
        if record.kind != TaskKind::IntroduceIdentity {
            return Err(TaskError::InvalidInput(format!(
                "task {} is a {}, not an introduction task",
                record.id,
                record.kind.as_str()
            )));
        }
        Ok(Self {
            id: record.id,
            owner: record.owner,
            processing_interval,
            state: Mutex::new(IntroductionState {
                next_processing_time: record.next_processing_time,
                next_display_time: record.next_display_time,
                puzzles_to_solve: record.puzzles_to_solve,
            }),
            store,
            collaborators,
        })
    }

    /// The nominal period between two processing cycles.
    pub fn processing_interval(&self) -> Duration {
        self.processing_interval
    }

    /// Puzzles the owner still has to solve.
    pub fn number_of_puzzles_to_solve(&self) -> Result<u32> {
        Ok(self.lock()?.puzzles_to_solve)
    }

    /// The user solved one puzzle.
    ///
    /// Decrements the pending count, never below zero, and hides the task
    /// once nothing is left. Returns the remaining count.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::Persistence`] if the commit fails; the in-memory
    /// state is then left unchanged.
    pub fn on_puzzle_solved(&self) -> Result<u32> {
        self.mutate(|state| {
            state.puzzles_to_solve = state.puzzles_to_solve.saturating_sub(1);
            if state.puzzles_to_solve == 0 {
                state.next_display_time = Timestamp::NEVER;
            }
            state.puzzles_to_solve
        })
    }

    /// Count of puzzles the owner must solve, or `None` when no introduction
    /// is needed this cycle.
    fn required_puzzles(&self) -> std::result::Result<Option<u32>, SignalError> {
        let messages = self.collaborators.messages.count_messages_by(&self.owner)?;
        if messages == 0 {
            return Ok(None);
        }

        let minimum = self.collaborators.config.minimum_truster_count()?;
        let trusters = self.collaborators.trust.received_trust_count(&self.owner)?;
        if trusters < minimum {
            debug!(owner = %self.owner, trusters, minimum, "identity lacks trusters");
            return Ok(Some(minimum.saturating_mul(PUZZLE_SLACK_FACTOR)));
        }
        Ok(None)
    }

    fn retry_interval(&self) -> Duration {
        self.processing_interval / RETRY_DIVISOR
    }

    fn lock(&self) -> Result<MutexGuard<'_, IntroductionState>> {
        self.state
            .lock()
            .map_err(|_| TaskError::LockPoisoned("introduction task state"))
    }

    fn to_record(&self, state: &IntroductionState) -> TaskRecord {
        TaskRecord {
            id: self.id,
            owner: self.owner.clone(),
            kind: TaskKind::IntroduceIdentity,
            next_processing_time: state.next_processing_time,
            next_display_time: state.next_display_time,
            puzzles_to_solve: state.puzzles_to_solve,
        }
    }

    /// Apply `change` to a copy of the state, commit the copy, and publish it.
    ///
    /// The lock is held throughout. If the commit fails the published state
    /// stays at the last committed value.
    fn mutate<R>(&self, change: impl FnOnce(&mut IntroductionState) -> R) -> Result<R> {
        let mut guard = self.lock()?;
        let mut staged = *guard;
        let outcome = change(&mut staged);

        if let Err(e) = self.store.store_and_commit(&self.to_record(&staged)) {
            error!(task_id = %self.id, owner = %self.owner, "cannot commit task state: {e}");
            return Err(e);
        }
        *guard = staged;
        Ok(outcome)
    }
}

impl PersistentTask for IntroduceIdentityTask {
    fn id(&self) -> TaskId {
        self.id
    }

    fn owner(&self) -> &OwnerId {
        &self.owner
    }

    fn kind(&self) -> TaskKind {
        TaskKind::IntroduceIdentity
    }

    fn next_processing_time(&self) -> Result<Timestamp> {
        Ok(self.lock()?.next_processing_time)
    }

    fn next_display_time(&self) -> Result<Timestamp> {
        Ok(self.lock()?.next_display_time)
    }

    fn record(&self) -> Result<TaskRecord> {
        let state = self.lock()?;
        Ok(self.to_record(&state))
    }

    fn process(&self) -> Result<()> {
        self.mutate(|state| {
            let now = self.collaborators.clock.now();

            match self.required_puzzles() {
                Ok(Some(puzzles)) => {
                    info!(
                        task_id = %self.id,
                        owner = %self.owner,
                        puzzles,
                        "identity needs introduction"
                    );
                    state.puzzles_to_solve = puzzles;
                    state.next_display_time = now;
                    state.next_processing_time = now.saturating_add(self.processing_interval);
                }
                Ok(None) => {
                    state.next_processing_time = now.saturating_add(self.processing_interval);
                }
                Err(e) => {
                    let retry = self.retry_interval();
                    warn!(
                        task_id = %self.id,
                        owner = %self.owner,
                        retry_ms = u64::try_from(retry.as_millis()).unwrap_or(u64::MAX),
                        "signal query failed, retrying early: {e}"
                    );
                    state.next_processing_time = now.saturating_add(retry);
                }
            }
        })
    }

    fn display(&self) -> Result<TaskView> {
        let state = self.lock()?;
        Ok(TaskView {
            owner: self.owner.clone(),
            id: self.id,
            puzzles_to_solve: state.puzzles_to_solve,
        })
    }

    fn on_hide_for_some_time(&self) -> Result<()> {
        self.mutate(|state| {
            let now = self.collaborators.clock.now();
            state.puzzles_to_solve = 0;
            state.next_processing_time = now.saturating_add(self.processing_interval);
            state.next_display_time = Timestamp::NEVER;
            debug!(task_id = %self.id, owner = %self.owner, "introduction task hidden");
        })
    }
}
