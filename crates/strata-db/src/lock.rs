use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, ErrorCode, OptionalExtension, params};
use serde::Serialize;
use strata_common::{Error, Result};
use strata_config::model::{DEFAULT_LOCK_POLL_INTERVAL_MS, is_sql_identifier};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Who currently holds the migration lock.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LockHolder {
    pub owner: String,
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
}

/// Cross-process mutual exclusion for migration runs, backed by a one-row
/// table in the target database. Every connection to the same database file
/// competes for the same row.
#[derive(Debug, Clone)]
pub struct LockManager {
    table: String,
    poll_interval: Duration,
}

impl LockManager {
    /// Lock table is named after the bookkeeping table: `<table>_lock`.
    pub fn new(bookkeeping_table: &str) -> Result<Self> {
        let table = format!("{bookkeeping_table}_lock");
        if !is_sql_identifier(&table) {
            return Err(Error::Config(format!(
                "lock table name `{table}` is not a valid SQL identifier"
            )));
        }
        Ok(Self {
            table,
            poll_interval: Duration::from_millis(DEFAULT_LOCK_POLL_INTERVAL_MS),
        })
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    /// Take the lock, polling until `timeout` elapses. A zero timeout makes a
    /// single attempt.
    pub fn acquire<'c>(&self, conn: &'c Connection, timeout: Duration) -> Result<MigrationLock<'c>> {
        let owner = Uuid::new_v4().to_string();
        let started = Instant::now();

        loop {
            match self.try_insert(conn, &owner) {
                Ok(true) => {
                    debug!("migration lock {} acquired by {owner}", self.table);
                    return Ok(MigrationLock {
                        conn,
                        table: self.table.clone(),
                        owner,
                        released: false,
                    });
                }
                Ok(false) => {}
                Err(e) if is_busy(&e) => debug!("database busy while taking migration lock"),
                Err(e) => {
                    return Err(Error::Database(format!(
                        "failed to acquire migration lock: {e}"
                    )));
                }
            }

            let waited = started.elapsed();
            if waited >= timeout {
                return Err(Error::LockTimeout {
                    table: self.table.clone(),
                    waited,
                });
            }
            thread::sleep(self.poll_interval.min(timeout - waited));
        }
    }

    fn try_insert(&self, conn: &Connection, owner: &str) -> rusqlite::Result<bool> {
        self.ensure_schema(conn)?;
        let inserted = conn.execute(
            &format!(
                "INSERT OR IGNORE INTO {} (id, owner, pid, acquired_at) VALUES (1, ?1, ?2, ?3)",
                self.table
            ),
            params![owner, std::process::id(), Utc::now().to_rfc3339()],
        )?;
        Ok(inserted == 1)
    }

    fn ensure_schema(&self, conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                owner TEXT NOT NULL,
                pid INTEGER NOT NULL,
                acquired_at TEXT NOT NULL
            );",
            self.table
        ))
    }

    pub fn holder(&self, conn: &Connection) -> Result<Option<LockHolder>> {
        self.ensure_schema(conn)
            .map_err(|e| Error::Database(format!("failed to create lock table: {e}")))?;
        let row = conn
            .query_row(
                &format!("SELECT owner, pid, acquired_at FROM {} WHERE id = 1", self.table),
                [],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, u32>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| Error::Database(format!("failed to read migration lock: {e}")))?;

        row.map(|(owner, pid, acquired_at)| {
            let acquired_at = DateTime::parse_from_rfc3339(&acquired_at)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| Error::Database(format!("invalid lock timestamp: {e}")))?;
            Ok(LockHolder {
                owner,
                pid,
                acquired_at,
            })
        })
        .transpose()
    }

    /// Drop the lock regardless of owner. For clearing locks left behind by a
    /// crashed process; returns whether a lock was held.
    pub fn force_release(&self, conn: &Connection) -> Result<bool> {
        self.ensure_schema(conn)
            .map_err(|e| Error::Database(format!("failed to create lock table: {e}")))?;
        let deleted = conn
            .execute(&format!("DELETE FROM {} WHERE id = 1", self.table), [])
            .map_err(|e| Error::Database(format!("failed to force-release migration lock: {e}")))?;
        if deleted > 0 {
            info!("migration lock {} force-released", self.table);
        }
        Ok(deleted > 0)
    }
}

fn is_busy(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if matches!(err.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

/// Held migration lock. Released on [`MigrationLock::release`] or drop.
pub struct MigrationLock<'c> {
    conn: &'c Connection,
    table: String,
    owner: String,
    released: bool,
}

impl MigrationLock<'_> {
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.delete()
            .map(|_| ())
            .map_err(|e| Error::Database(format!("failed to release migration lock: {e}")))
    }

    fn delete(&self) -> rusqlite::Result<usize> {
        self.conn.execute(
            &format!("DELETE FROM {} WHERE id = 1 AND owner = ?1", self.table),
            params![self.owner],
        )
    }
}

impl Drop for MigrationLock<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.delete() {
            warn!(
                "failed to release migration lock {} held by {}: {e}",
                self.table, self.owner
            );
        }
    }
}
