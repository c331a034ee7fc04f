//! Durable task storage.
//!
//! Sub-modules:
//! - `schema`: SQLite DDL definitions.
//! - `sqlite`: SQLite-backed [`SqliteTaskStore`].

pub(crate) mod schema;
pub mod sqlite;

pub use sqlite::SqliteTaskStore;

use crate::error::Result;
use crate::task::{OwnerId, TaskId, TaskRecord};

/// Persistence substrate for tasks.
pub trait TaskStore: Send + Sync {
    /// Durably and atomically write every field of `record`.
    ///
    /// Idempotent: committing the same record twice leaves one row.
    fn store_and_commit(&self, record: &TaskRecord) -> Result<()>;

    /// Load one task by id.
    fn load(&self, id: &TaskId) -> Result<Option<TaskRecord>>;

    /// Every stored task, grouped by owner in creation order.
    ///
    /// Rows that no longer decode are logged and skipped.
    fn load_all(&self) -> Result<Vec<TaskRecord>>;

    /// Tasks of one owner in creation order, skipping undecodable rows.
    fn load_owner(&self, owner: &OwnerId) -> Result<Vec<TaskRecord>>;

    /// Delete all tasks of `owner`. Returns how many were removed.
    fn delete_owner(&self, owner: &OwnerId) -> Result<usize>;
}
