use std::fmt;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use strata_common::{Error, Result};
use strata_config::model::is_sql_identifier;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "up" => Ok(Direction::Up),
            "down" => Ok(Direction::Down),
            other => Err(Error::Database(format!("unknown migration direction `{other}`"))),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single bookkeeping row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VersionState {
    /// 0 for a database that was never migrated.
    pub version: u32,
    /// Set when a unit failed on a backend without transactional DDL.
    pub dirty: bool,
    pub applied_at: Option<DateTime<Utc>>,
}

/// One applied (or reverted) unit in the audit trail.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub version: u32,
    pub slug: String,
    pub direction: Direction,
    pub checksum: Option<String>,
    pub applied_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Persists the applied schema version inside the target database.
///
/// Uses two tables: `<name>` with exactly one row (`id = 1`) and an
/// append-only `<name>_history`.
#[derive(Debug, Clone)]
pub struct VersionStore {
    table: String,
    history_table: String,
}

impl VersionStore {
    pub fn new(table: impl Into<String>) -> Result<Self> {
        let table = table.into();
        if !is_sql_identifier(&table) {
            return Err(Error::Config(format!(
                "bookkeeping table name `{table}` is not a valid SQL identifier"
            )));
        }
        Ok(Self {
            history_table: format!("{table}_history"),
            table,
        })
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    pub fn history_table_name(&self) -> &str {
        &self.history_table
    }

    /// Create the bookkeeping tables if this is a fresh database.
    pub fn ensure_schema(&self, conn: &Connection) -> Result<()> {
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                version INTEGER NOT NULL,
                dirty INTEGER NOT NULL DEFAULT 0,
                applied_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS {history} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                version INTEGER NOT NULL,
                slug TEXT NOT NULL,
                direction TEXT NOT NULL,
                checksum TEXT,
                applied_at TEXT NOT NULL,
                duration_ms INTEGER NOT NULL DEFAULT 0
            );",
            table = self.table,
            history = self.history_table,
        ))
        .map_err(|e| Error::Database(format!("failed to create bookkeeping tables: {e}")))
    }

    pub fn current_version(&self, conn: &Connection) -> Result<u32> {
        Ok(self.state(conn)?.version)
    }

    pub fn state(&self, conn: &Connection) -> Result<VersionState> {
        self.ensure_schema(conn)?;
        let row = conn
            .query_row(
                &format!("SELECT version, dirty, applied_at FROM {} WHERE id = 1", self.table),
                [],
                |row| {
                    Ok((
                        row.get::<_, u32>(0)?,
                        row.get::<_, bool>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| Error::Database(format!("failed to read schema version: {e}")))?;

        match row {
            Some((version, dirty, applied_at)) => Ok(VersionState {
                version,
                dirty,
                applied_at: Some(parse_datetime(&applied_at)?),
            }),
            None => Ok(VersionState {
                version: 0,
                dirty: false,
                applied_at: None,
            }),
        }
    }

    /// Overwrite the bookkeeping row and clear the dirty flag.
    pub fn set_version(
        &self,
        conn: &Connection,
        version: u32,
        applied_at: DateTime<Utc>,
    ) -> Result<()> {
        self.ensure_schema(conn)?;
        self.write_row(conn, version, false, applied_at)
            .map_err(|e| Error::Database(format!("failed to set schema version {version}: {e}")))?;
        debug!("schema version set to {version}");
        Ok(())
    }

    /// Flag `version` as half-applied. Only used when DDL can't be rolled back.
    pub fn mark_dirty(&self, conn: &Connection, version: u32) -> Result<()> {
        self.ensure_schema(conn)?;
        self.write_row(conn, version, true, Utc::now())
            .map_err(|e| Error::Database(format!("failed to mark version {version} dirty: {e}")))?;
        warn!("schema marked dirty at version {version}");
        Ok(())
    }

    fn write_row(
        &self,
        conn: &Connection,
        version: u32,
        dirty: bool,
        applied_at: DateTime<Utc>,
    ) -> rusqlite::Result<usize> {
        conn.execute(
            &format!(
                "INSERT INTO {} (id, version, dirty, applied_at) VALUES (1, ?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET
                    version = excluded.version,
                    dirty = excluded.dirty,
                    applied_at = excluded.applied_at",
                self.table
            ),
            params![version, dirty, applied_at.to_rfc3339()],
        )
    }

    pub fn record(&self, conn: &Connection, entry: &HistoryEntry) -> Result<()> {
        self.ensure_schema(conn)?;
        conn.execute(
            &format!(
                "INSERT INTO {} (version, slug, direction, checksum, applied_at, duration_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                self.history_table
            ),
            params![
                entry.version,
                entry.slug,
                entry.direction.as_str(),
                entry.checksum,
                entry.applied_at.to_rfc3339(),
                entry.duration_ms as i64,
            ],
        )
        .map_err(|e| Error::Database(format!("failed to record migration history: {e}")))?;
        Ok(())
    }

    /// Full audit trail, oldest first.
    pub fn history(&self, conn: &Connection) -> Result<Vec<HistoryEntry>> {
        self.ensure_schema(conn)?;
        self.query_history(
            conn,
            &format!(
                "SELECT version, slug, direction, checksum, applied_at, duration_ms
                 FROM {} ORDER BY id ASC",
                self.history_table
            ),
            [],
        )
    }

    /// Most recent upgrade of `version`, if it was ever recorded.
    pub fn last_upgrade(&self, conn: &Connection, version: u32) -> Result<Option<HistoryEntry>> {
        self.ensure_schema(conn)?;
        let mut entries = self.query_history(
            conn,
            &format!(
                "SELECT version, slug, direction, checksum, applied_at, duration_ms
                 FROM {} WHERE version = ?1 AND direction = 'up'
                 ORDER BY id DESC LIMIT 1",
                self.history_table
            ),
            params![version],
        )?;
        Ok(entries.pop())
    }

    fn query_history<P: rusqlite::Params>(
        &self,
        conn: &Connection,
        sql: &str,
        params: P,
    ) -> Result<Vec<HistoryEntry>> {
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| Error::Database(format!("failed to prepare query: {e}")))?;

        let rows = stmt
            .query_map(params, |row| {
                Ok((
                    row.get::<_, u32>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            })
            .map_err(|e| Error::Database(format!("failed to query migration history: {e}")))?;

        let mut entries = Vec::new();
        for row in rows {
            let (version, slug, direction, checksum, applied_at, duration_ms) = row
                .map_err(|e| Error::Database(format!("failed to read history row: {e}")))?;
            entries.push(HistoryEntry {
                version,
                slug,
                direction: Direction::parse(&direction)?,
                checksum,
                applied_at: parse_datetime(&applied_at)?,
                duration_ms: duration_ms.max(0) as u64,
            });
        }
        Ok(entries)
    }
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            // rows written by hand with datetime('now')
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").map(|naive| naive.and_utc())
        })
        .map_err(|e| Error::Database(format!("invalid timestamp `{s}` in bookkeeping table: {e}")))
}
