use rusqlite::{Connection, Params, params};
use strata_common::{Error, Result};

/// The connection or open transaction a single migration unit runs against.
///
/// The runner creates one per unit and drops it before the next unit starts.
/// On transactional backends it wraps the unit's transaction, so everything
/// executed here commits or rolls back together with the version bump.
pub struct SchemaHandle<'c> {
    conn: &'c Connection,
    version: u32,
}

impl<'c> SchemaHandle<'c> {
    pub fn new(conn: &'c Connection, version: u32) -> Self {
        Self { conn, version }
    }

    /// Version of the unit this handle was opened for.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Raw access for operations that need to query existing data.
    pub fn connection(&self) -> &Connection {
        self.conn
    }

    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.conn
            .execute_batch(sql)
            .map_err(|e| Error::Database(format!("migration {}: {e}", self.version)))
    }

    pub fn execute<P: Params>(&self, sql: &str, params: P) -> Result<usize> {
        self.conn
            .execute(sql, params)
            .map_err(|e| Error::Database(format!("migration {}: {e}", self.version)))
    }

    pub fn table_exists(&self, name: &str) -> Result<bool> {
        self.conn
            .query_row(
                "SELECT count(*) > 0 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![name],
                |row| row.get(0),
            )
            .map_err(|e| Error::Database(format!("failed to check table {name}: {e}")))
    }
}
