//! SQLite-backed task store.
//!
//! One database file at `{root_dir}/introducer.db`. Every
//! [`TaskStore::store_and_commit`] call runs in its own transaction.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, warn};

use super::TaskStore;
use super::schema::{apply_schema, read_schema_version};
use crate::clock::Timestamp;
use crate::error::{Result, TaskError};
use crate::task::{OwnerId, TaskId, TaskKind, TaskRecord};

/// Database filename within the store root directory.
const DB_FILENAME: &str = "introducer.db";

const SELECT_COLUMNS: &str =
    "SELECT id, owner, kind, next_processing_time, next_display_time, puzzles_to_solve FROM tasks";

/// SQLite-backed [`TaskStore`].
///
/// Thread-safe via an internal `Mutex<Connection>`; all statements are
/// serialized.
pub struct SqliteTaskStore {
    root: Option<PathBuf>,
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteTaskStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteTaskStore")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl SqliteTaskStore {
    /// Open (or create) the database at `{root_dir}/introducer.db`.
    pub fn open(root_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(root_dir)?;
        let conn = Connection::open(root_dir.join(DB_FILENAME))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        apply_schema(&conn)?;
        debug!("opened task store at {}", root_dir.display());
        Ok(Self {
            root: Some(root_dir.to_path_buf()),
            conn: Mutex::new(conn),
        })
    }

    /// A throwaway store that lives as long as the value.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        apply_schema(&conn)?;
        Ok(Self {
            root: None,
            conn: Mutex::new(conn),
        })
    }

    /// Root directory, or `None` for an in-memory store.
    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    /// Read the current schema version from the database.
    pub fn schema_version(&self) -> Result<Option<u32>> {
        let conn = self.lock()?;
        Ok(read_schema_version(&conn)?)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| TaskError::LockPoisoned("task store connection"))
    }
}

impl TaskStore for SqliteTaskStore {
    fn store_and_commit(&self, record: &TaskRecord) -> Result<()> {
        let conn = self.lock()?;
        let tx = conn.unchecked_transaction()?;

        tx.execute(
            "INSERT INTO tasks \
             (id, owner, kind, next_processing_time, next_display_time, puzzles_to_solve, created_seq) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, \
                     (SELECT COALESCE(MAX(created_seq), 0) + 1 FROM tasks)) \
             ON CONFLICT(id) DO UPDATE SET \
               next_processing_time = excluded.next_processing_time, \
               next_display_time = excluded.next_display_time, \
               puzzles_to_solve = excluded.puzzles_to_solve",
            params![
                record.id.to_string(),
                record.owner.as_str(),
                record.kind.as_str(),
                record.next_processing_time.as_millis(),
                record.next_display_time.as_millis(),
                i64::from(record.puzzles_to_solve),
            ],
        )?;

        tx.commit()?;
        Ok(())
    }

    fn load(&self, id: &TaskId) -> Result<Option<TaskRecord>> {
        let conn = self.lock()?;
        let raw = conn
            .query_row(
                &format!("{SELECT_COLUMNS} WHERE id = ?1"),
                params![id.to_string()],
                row_to_raw,
            )
            .optional()?;
        raw.map(RawTaskRow::into_record).transpose()
    }

    fn load_all(&self) -> Result<Vec<TaskRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} ORDER BY owner, created_seq"))?;
        let rows = stmt.query_map([], row_to_raw)?;
        decode_rows(rows)
    }

    fn load_owner(&self, owner: &OwnerId) -> Result<Vec<TaskRecord>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare(&format!("{SELECT_COLUMNS} WHERE owner = ?1 ORDER BY created_seq"))?;
        let rows = stmt.query_map(params![owner.as_str()], row_to_raw)?;
        decode_rows(rows)
    }

    fn delete_owner(&self, owner: &OwnerId) -> Result<usize> {
        let conn = self.lock()?;
        let removed = conn.execute("DELETE FROM tasks WHERE owner = ?1", params![owner.as_str()])?;
        Ok(removed)
    }
}

/// Column values as stored, before validation.
struct RawTaskRow {
    id: String,
    owner: String,
    kind: String,
    next_processing_time: i64,
    next_display_time: i64,
    puzzles_to_solve: i64,
}

impl RawTaskRow {
    fn into_record(self) -> Result<TaskRecord> {
        let puzzles_to_solve = u32::try_from(self.puzzles_to_solve).map_err(|_| {
            TaskError::InvalidInput(format!("task {}: puzzle count out of range", self.id))
        })?;
        Ok(TaskRecord {
            id: TaskId::parse(&self.id)?,
            owner: OwnerId::new(self.owner)?,
            kind: self.kind.parse::<TaskKind>()?,
            next_processing_time: Timestamp::from_millis(self.next_processing_time),
            next_display_time: Timestamp::from_millis(self.next_display_time),
            puzzles_to_solve,
        })
    }
}

/// Decode rows, skipping any that fail validation.
fn decode_rows(
    rows: impl Iterator<Item = rusqlite::Result<RawTaskRow>>,
) -> Result<Vec<TaskRecord>> {
    let mut records = Vec::new();
    for row in rows {
        let raw = row?;
        let id = raw.id.clone();
        match raw.into_record() {
            Ok(record) => records.push(record),
            Err(e) => warn!(task_id = %id, "skipping undecodable task row: {e}"),
        }
    }
    Ok(records)
}

fn row_to_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawTaskRow> {
    Ok(RawTaskRow {
        id: row.get(0)?,
        owner: row.get(1)?,
        kind: row.get(2)?,
        next_processing_time: row.get(3)?,
        next_display_time: row.get(4)?,
        puzzles_to_solve: row.get(5)?,
    })
}
