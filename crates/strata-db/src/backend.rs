use std::collections::BTreeSet;

use strata_common::{Error, Result};

use crate::handle::SchemaHandle;

/// One row of `PRAGMA foreign_key_check`: child table, child rowid (absent
/// for `WITHOUT ROWID` tables), parent table, and constraint index.
pub type ForeignKeyViolation = (String, Option<i64>, String, i64);

/// Integrity state captured before a unit runs, so the finishing check
/// only blames the unit for problems it introduced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntegrityBaseline {
    foreign_keys: BTreeSet<ForeignKeyViolation>,
}

impl IntegrityBaseline {
    pub fn dangling_references(&self) -> usize {
        self.foreign_keys.len()
    }
}

/// Engine-specific behaviour the runner needs to know about.
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    /// Whether DDL can be rolled back. When false the runner applies each unit
    /// outside a transaction, bumps the version as the unit's last statement,
    /// and marks the schema dirty if anything fails.
    fn supports_transactional_ddl(&self) -> bool;

    /// Runs before each upgrade; the result is handed to `post_create_hook`.
    fn pre_create_hook(&self, _handle: &SchemaHandle<'_>) -> Result<IntegrityBaseline> {
        Ok(IntegrityBaseline::default())
    }

    /// Finishing step run after each upgrade, before the version bump.
    fn post_create_hook(
        &self,
        _handle: &SchemaHandle<'_>,
        _baseline: &IntegrityBaseline,
    ) -> Result<()> {
        Ok(())
    }
}

/// SQLite: DDL is transactional, and an upgrade may not add dangling foreign
/// key references. Ones already present before the unit ran are left alone.
#[derive(Debug, Default, Clone, Copy)]
pub struct SqliteBackend;

impl Backend for SqliteBackend {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn supports_transactional_ddl(&self) -> bool {
        true
    }

    fn pre_create_hook(&self, handle: &SchemaHandle<'_>) -> Result<IntegrityBaseline> {
        Ok(IntegrityBaseline {
            foreign_keys: foreign_key_violations(handle)?,
        })
    }

    fn post_create_hook(&self, handle: &SchemaHandle<'_>, baseline: &IntegrityBaseline) -> Result<()> {
        let introduced: Vec<ForeignKeyViolation> = foreign_key_violations(handle)?
            .into_iter()
            .filter(|v| !baseline.foreign_keys.contains(v))
            .collect();

        match introduced.first() {
            None => Ok(()),
            Some((table, _, parent, _)) => Err(Error::Database(format!(
                "migration {} left {} dangling foreign key reference(s), first from `{table}` to `{parent}`",
                handle.version(),
                introduced.len()
            ))),
        }
    }
}

fn foreign_key_violations(handle: &SchemaHandle<'_>) -> Result<BTreeSet<ForeignKeyViolation>> {
    let mut stmt = handle
        .connection()
        .prepare("PRAGMA foreign_key_check")
        .map_err(|e| Error::Database(format!("failed to prepare foreign key check: {e}")))?;
    stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))
        .map_err(|e| Error::Database(format!("foreign key check failed: {e}")))?
        .collect::<std::result::Result<BTreeSet<_>, _>>()
        .map_err(|e| Error::Database(format!("foreign key check failed: {e}")))
}

#[cfg(test)]
mod tests {
    use rusqlite::Connection;

    use super::*;

    fn with_orphan() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "PRAGMA foreign_keys=OFF;
             CREATE TABLE shares (id TEXT PRIMARY KEY);
             CREATE TABLE share_metadata (
                id INTEGER PRIMARY KEY,
                share_id TEXT NOT NULL REFERENCES shares(id)
             );
             INSERT INTO share_metadata (share_id) VALUES ('missing');",
        )
        .unwrap();
        conn
    }

    #[test]
    fn foreign_key_check_passes_on_consistent_schema() {
        let conn = Connection::open_in_memory().unwrap();
        let handle = SchemaHandle::new(&conn, 1);
        let baseline = SqliteBackend.pre_create_hook(&handle).unwrap();
        conn.execute_batch(
            "CREATE TABLE shares (id TEXT PRIMARY KEY);
             CREATE TABLE share_metadata (
                id INTEGER PRIMARY KEY,
                share_id TEXT NOT NULL REFERENCES shares(id)
             );
             INSERT INTO shares VALUES ('s-1');
             INSERT INTO share_metadata (share_id) VALUES ('s-1');",
        )
        .unwrap();
        assert!(SqliteBackend.post_create_hook(&handle, &baseline).is_ok());
    }

    #[test]
    fn foreign_key_check_reports_dangling_rows_added_by_the_unit() {
        let conn = with_orphan();
        let handle = SchemaHandle::new(&conn, 4);
        let err = SqliteBackend
            .post_create_hook(&handle, &IntegrityBaseline::default())
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "database error: migration 4 left 1 dangling foreign key reference(s), first from `share_metadata` to `shares`"
        );
    }

    #[test]
    fn preexisting_dangling_rows_are_not_blamed_on_the_unit() {
        let conn = with_orphan();
        let handle = SchemaHandle::new(&conn, 5);
        let baseline = SqliteBackend.pre_create_hook(&handle).unwrap();
        assert_eq!(baseline.dangling_references(), 1);

        conn.execute_batch("CREATE TABLE services (id INTEGER PRIMARY KEY);")
            .unwrap();
        assert!(SqliteBackend.post_create_hook(&handle, &baseline).is_ok());

        conn.execute("INSERT INTO share_metadata (share_id) VALUES ('also-missing')", [])
            .unwrap();
        let err = SqliteBackend.post_create_hook(&handle, &baseline).unwrap_err();
        assert!(err.to_string().contains("left 1 dangling"), "{err}");
    }
}
