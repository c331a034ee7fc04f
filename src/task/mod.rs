//! Persistent, owner-scoped tasks.
//!
//! A task carries a stable [`TaskId`], a back-reference to the identity that
//! owns it, and two independent timers: when the scheduler should next call
//! [`PersistentTask::process`], and when the presentation layer should start
//! showing the task to the user.
//!
//! Sub-modules:
//! - `introduce`: [`IntroduceIdentityTask`], which asks an identity to solve
//!   introduction puzzles until enough peers trust it.

pub mod introduce;

pub use introduce::IntroduceIdentityTask;

use crate::clock::Timestamp;
use crate::error::{Result, TaskError};
use serde::{Deserialize, Serialize};

const MAX_OWNER_ID_LEN: usize = 256;

/// Stable identifier of a task instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(uuid::Uuid);

impl TaskId {
    /// A fresh random identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Parse the hyphenated form produced by `Display`.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::InvalidInput`] when `raw` is not a UUID.
    pub fn parse(raw: &str) -> Result<Self> {
        uuid::Uuid::parse_str(raw.trim())
            .map(Self)
            .map_err(|e| TaskError::InvalidInput(format!("task id {raw:?}: {e}")))
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

/// Identity on whose behalf a task runs.
///
/// The task only refers to its owner; it never manages the identity's
/// lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OwnerId(String);

impl OwnerId {
    /// Validate and wrap an owner identifier.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::InvalidInput`] for empty or overlong identifiers.
    pub fn new(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(TaskError::InvalidInput("owner id must not be empty".to_owned()));
        }
        if trimmed.len() > MAX_OWNER_ID_LEN {
            return Err(TaskError::InvalidInput("owner id is too long".to_owned()));
        }
        Ok(Self(trimmed.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for OwnerId {
    type Error = TaskError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<OwnerId> for String {
    fn from(value: OwnerId) -> Self {
        value.0
    }
}

impl std::fmt::Display for OwnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Concrete task type, stored alongside each record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    IntroduceIdentity,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::IntroduceIdentity => "introduce_identity",
        }
    }
}

impl std::str::FromStr for TaskKind {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "introduce_identity" => Ok(Self::IntroduceIdentity),
            other => Err(TaskError::InvalidInput(format!("unknown task kind: {other}"))),
        }
    }
}

/// The complete persisted state of one task.
///
/// A commit writes every field of a record or none of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub owner: OwnerId,
    pub kind: TaskKind,
    pub next_processing_time: Timestamp,
    pub next_display_time: Timestamp,
    pub puzzles_to_solve: u32,
}

impl TaskRecord {
    /// `true` when the scheduler may run the task at `now`.
    #[must_use]
    pub fn is_due(&self, now: Timestamp) -> bool {
        self.next_processing_time <= now
    }

    /// `true` when the task should be shown to its owner at `now`.
    #[must_use]
    pub fn is_visible(&self, now: Timestamp) -> bool {
        self.next_display_time <= now
    }
}

/// Presentation-ready snapshot of a task, produced by [`PersistentTask::display`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskView {
    pub owner: OwnerId,
    pub id: TaskId,
    pub puzzles_to_solve: u32,
}

/// A durable, owner-scoped unit of recurring work.
///
/// Every method that reads or writes mutable state holds the task's own lock
/// for the whole call. Mutators commit through the task store before the
/// lock is released, so the next lock holder always reads committed state.
pub trait PersistentTask: Send + Sync + std::fmt::Debug {
    fn id(&self) -> TaskId;

    fn owner(&self) -> &OwnerId;

    fn kind(&self) -> TaskKind;

    /// Earliest time the scheduler should call [`PersistentTask::process`] again.
    fn next_processing_time(&self) -> Result<Timestamp>;

    /// Earliest time the task should be shown; [`Timestamp::NEVER`] hides it.
    fn next_display_time(&self) -> Result<Timestamp>;

    /// Snapshot of the persisted fields.
    fn record(&self) -> Result<TaskRecord>;

    /// Run one scheduling cycle and commit the result.
    ///
    /// Callers only invoke this once `now >= next_processing_time`; the task
    /// does not re-check. Collaborator failures are absorbed into a retry
    /// backoff. The only error returned is a failed commit.
    fn process(&self) -> Result<()>;

    /// Side-effect-free view of the current state.
    fn display(&self) -> Result<TaskView>;

    /// The user dismissed the task; hide it and re-evaluate later.
    fn on_hide_for_some_time(&self) -> Result<()>;
}
