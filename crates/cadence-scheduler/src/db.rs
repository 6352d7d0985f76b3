use std::path::Path;
use std::time::Duration;

use rusqlite::Connection;

use crate::error::Result;

/// Open the job database at `path` in WAL mode with a busy timeout, so that
/// several scheduler processes can share one file.
pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Connection> {
    let conn = Connection::open(path)?;
    // set first: switching to WAL takes a lock another process may hold
    conn.busy_timeout(busy_timeout)?;
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    Ok(conn)
}

/// Initialise the scheduler schema in `conn`.
///
/// Creates the `jobs` table (idempotent) and the composite index that serves
/// the due scan: `WHERE namespace = ? AND enabled = 1 AND next_run_at <= ?`.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS jobs (
            id                TEXT    NOT NULL PRIMARY KEY,
            namespace         TEXT    NOT NULL,
            name              TEXT    NOT NULL,
            schedule_kind     TEXT    NOT NULL,   -- once | interval | cron
            schedule          TEXT    NOT NULL,   -- JSON-encoded Schedule enum
            payload           BLOB    NOT NULL,   -- opaque task descriptor
            enabled           INTEGER NOT NULL DEFAULT 1,
            status            TEXT    NOT NULL DEFAULT 'active',
            next_run_at       INTEGER,            -- epoch millis or NULL
            last_enqueued_at  INTEGER,            -- epoch millis or NULL
            run_count         INTEGER NOT NULL DEFAULT 0,
            version           INTEGER NOT NULL DEFAULT 1,
            created_at        TEXT    NOT NULL,
            updated_at        TEXT    NOT NULL,
            UNIQUE (namespace, name)
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_jobs_due
            ON jobs (namespace, enabled, next_run_at);
        ",
    )?;
    Ok(())
}
