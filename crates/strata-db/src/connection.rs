use std::path::Path;
use std::time::Duration;

use rusqlite::Connection;
use strata_common::{Error, Result};
use tracing::info;

/// Open the SQLite database at `db_path` for migration.
///
/// `busy_timeout` bounds how long a statement waits on another writer; callers
/// usually pass the configured lock timeout so a busy database can't stall a run
/// past it.
pub fn open_database(db_path: &Path, busy_timeout: Duration) -> Result<Connection> {
    info!("opening database at {}", db_path.display());
    let conn = Connection::open(db_path)
        .map_err(|e| Error::Database(format!("failed to open database: {e}")))?;
    configure(&conn, busy_timeout)?;
    Ok(conn)
}

pub fn open_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()
        .map_err(|e| Error::Database(format!("failed to open in-memory database: {e}")))?;
    configure(&conn, Duration::ZERO)?;
    Ok(conn)
}

fn configure(conn: &Connection, busy_timeout: Duration) -> Result<()> {
    // before the pragmas: switching to WAL needs a lock another opener may hold
    conn.busy_timeout(busy_timeout)
        .map_err(|e| Error::Database(format!("failed to set busy timeout: {e}")))?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
        .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;
    Ok(())
}
