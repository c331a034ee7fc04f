//! SQLite DDL definitions for the task store.

use rusqlite::Connection;

/// Version stamped into `schema_meta` on first open.
pub(crate) const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Complete DDL for the task database.
///
/// Uses `IF NOT EXISTS` throughout so `apply_schema` is idempotent.
pub(crate) const SCHEMA_SQL: &str = r#"
-- Enable WAL mode for concurrent reads during writes.
PRAGMA journal_mode = WAL;

-- Schema version tracking.
CREATE TABLE IF NOT EXISTS schema_meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

-- One row per task. Mirrors TaskRecord fields.
CREATE TABLE IF NOT EXISTS tasks (
    id                   TEXT PRIMARY KEY,
    owner                TEXT NOT NULL,
    kind                 TEXT NOT NULL,     -- snake_case TaskKind variant
    next_processing_time INTEGER NOT NULL,  -- epoch millis
    next_display_time    INTEGER NOT NULL,  -- epoch millis, i64::MAX = never
    puzzles_to_solve     INTEGER NOT NULL DEFAULT 0 CHECK (puzzles_to_solve >= 0),
    created_seq          INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tasks_owner           ON tasks(owner, created_seq);
CREATE INDEX IF NOT EXISTS idx_tasks_next_processing ON tasks(next_processing_time);
"#;

/// Apply the full schema to an open connection.
///
/// Safe to call multiple times. Seeds the schema version on a fresh database.
pub(crate) fn apply_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', ?1)",
        rusqlite::params![CURRENT_SCHEMA_VERSION.to_string()],
    )?;
    Ok(())
}

/// Read the current schema version from the database.
///
/// Returns `None` if the key is missing.
pub(crate) fn read_schema_version(conn: &Connection) -> rusqlite::Result<Option<u32>> {
    let mut stmt = conn.prepare("SELECT value FROM schema_meta WHERE key = 'schema_version'")?;
    let mut rows = stmt.query([])?;
    match rows.next()? {
        Some(row) => {
            let val: String = row.get(0)?;
            Ok(val.parse::<u32>().ok())
        }
        None => Ok(None),
    }
}
