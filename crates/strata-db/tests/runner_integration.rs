use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use strata_common::{Error, Target};
use strata_config::MigrateConfig;
use strata_db::{
    Backend, DirectorySource, MigrationRepository, MigrationRunner, MigrationUnit, SchemaHandle,
    open_database,
};

fn shipped_migrations() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../migrations")
}

fn config(lock_timeout_seconds: u64) -> MigrateConfig {
    MigrateConfig {
        lock_timeout_seconds,
        lock_poll_interval_ms: 5,
        ..Default::default()
    }
}

#[test]
fn initial_schema_applies_once_and_cannot_be_downgraded() {
    let dir = tempfile::tempdir().unwrap();
    let conn = open_database(&dir.path().join("manila.db"), Duration::from_secs(1)).unwrap();

    let repo = MigrationRepository::load(&DirectorySource::new(shipped_migrations())).unwrap();
    assert_eq!(repo.latest_version(), 1);
    assert_eq!(repo.unit_at(1).unwrap().name(), "001_initial_schema");

    let runner = MigrationRunner::new(repo, &config(1)).unwrap();
    assert_eq!(runner.migrate(&conn, Target::Latest).unwrap(), vec![1]);
    assert!(runner.migrate(&conn, Target::Latest).unwrap().is_empty());

    let handle = SchemaHandle::new(&conn, 1);
    for table in [
        "quotas",
        "reservations",
        "security_services",
        "share_networks",
        "network_allocations",
        "share_network_security_service_association",
        "shares",
        "share_access_map",
        "share_snapshots",
        "share_metadata",
    ] {
        assert!(handle.table_exists(table).unwrap(), "missing table {table}");
    }

    let err = runner.migrate(&conn, Target::Version(0)).unwrap_err();
    assert!(matches!(err, Error::DowngradeUnsupported(1)), "{err:?}");
    assert!(handle.table_exists("shares").unwrap());
    assert!(runner.verify(&conn).unwrap().is_empty());
}

#[test]
fn from_config_reads_the_repository_directory() {
    let cfg = MigrateConfig {
        repository_path: shipped_migrations(),
        ..config(0)
    };
    let runner = MigrationRunner::from_config(&cfg).unwrap();
    assert_eq!(runner.repository().len(), 1);
}

#[test]
fn failed_unit_leaves_previous_version_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("manila.db");

    {
        let conn = open_database(&path, Duration::from_secs(1)).unwrap();
        let runner = MigrationRunner::new(
            MigrationRepository::from_units(vec![
                MigrationUnit::from_sql(1, "services", "CREATE TABLE services (id INTEGER);", None),
                MigrationUnit::from_sql(
                    2,
                    "broken",
                    "CREATE TABLE quotas (id INTEGER); INSERT INTO nowhere VALUES (1);",
                    None,
                ),
                MigrationUnit::from_sql(3, "shares", "CREATE TABLE shares (id TEXT);", None),
            ])
            .unwrap(),
            &config(1),
        )
        .unwrap();

        match runner.migrate(&conn, Target::Version(3)) {
            Err(Error::MigrationFailed { version: 2, .. }) => {}
            other => panic!("expected migration 2 to fail, got {other:?}"),
        }
    }

    let conn = open_database(&path, Duration::from_secs(1)).unwrap();
    let version: u32 = conn
        .query_row("SELECT version FROM schema_version", [], |row| row.get(0))
        .unwrap();
    assert_eq!(version, 1);
    let handle = SchemaHandle::new(&conn, 0);
    assert!(!handle.table_exists("quotas").unwrap());
    assert!(!handle.table_exists("shares").unwrap());
}

fn slow_unit(version: u32, active: Arc<AtomicUsize>, peak: Arc<AtomicUsize>) -> MigrationUnit {
    MigrationUnit::from_fn(version, format!("slow_{version}"), move |h| {
        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(30));
        let result = h.execute_batch(&format!("CREATE TABLE slow_{version} (id INTEGER);"));
        active.fetch_sub(1, Ordering::SeqCst);
        result
    })
}

#[test]
fn concurrent_runners_never_interleave() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("manila.db");
    drop(open_database(&path, Duration::from_secs(5)).unwrap());

    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let units = (1..=3)
        .map(|v| slow_unit(v, Arc::clone(&active), Arc::clone(&peak)))
        .collect();
    let runner =
        MigrationRunner::new(MigrationRepository::from_units(units).unwrap(), &config(10))
            .unwrap();

    let results: Vec<Vec<u32>> = thread::scope(|scope| {
        let handles: Vec<_> = (0..2)
            .map(|_| {
                scope.spawn(|| {
                    let conn = open_database(&path, Duration::from_secs(10)).unwrap();
                    runner.migrate(&conn, Target::Latest).unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(peak.load(Ordering::SeqCst), 1);
    let mut lengths: Vec<usize> = results.iter().map(Vec::len).collect();
    lengths.sort();
    assert_eq!(lengths, vec![0, 3]);

    let conn = open_database(&path, Duration::from_secs(1)).unwrap();
    assert_eq!(runner.version_store().current_version(&conn).unwrap(), 3);
    assert_eq!(runner.history(&conn).unwrap().len(), 3);
    assert!(runner.lock_manager().holder(&conn).unwrap().is_none());
}

#[test]
fn fail_fast_runner_reports_lock_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("manila.db");
    let holder = open_database(&path, Duration::from_secs(1)).unwrap();
    let contender = open_database(&path, Duration::from_secs(1)).unwrap();

    let runner = MigrationRunner::new(
        MigrationRepository::from_units(vec![MigrationUnit::from_sql(
            1,
            "services",
            "CREATE TABLE services (id INTEGER);",
            None,
        )])
        .unwrap(),
        &config(0),
    )
    .unwrap();

    let _lock = runner
        .lock_manager()
        .acquire(&holder, Duration::ZERO)
        .unwrap();
    let err = runner.migrate(&contender, Target::Latest).unwrap_err();
    assert!(matches!(err, Error::LockTimeout { .. }), "{err:?}");
    assert_eq!(runner.version_store().current_version(&contender).unwrap(), 0);
}

/// A backend that can't roll back DDL.
struct AutocommitBackend;

impl Backend for AutocommitBackend {
    fn name(&self) -> &str {
        "autocommit"
    }

    fn supports_transactional_ddl(&self) -> bool {
        false
    }
}

#[test]
fn non_transactional_failure_marks_schema_dirty() {
    let dir = tempfile::tempdir().unwrap();
    let conn = open_database(&dir.path().join("manila.db"), Duration::from_secs(1)).unwrap();

    let runner = MigrationRunner::new(
        MigrationRepository::from_units(vec![
            MigrationUnit::from_sql(1, "services", "CREATE TABLE services (id INTEGER);", None),
            MigrationUnit::from_sql(
                2,
                "half_applied",
                "CREATE TABLE quotas (id INTEGER); INSERT INTO nowhere VALUES (1);",
                None,
            ),
        ])
        .unwrap(),
        &config(0),
    )
    .unwrap()
    .with_backend(AutocommitBackend);

    let err = runner.migrate(&conn, Target::Latest).unwrap_err();
    assert!(matches!(err, Error::MigrationFailed { version: 2, .. }), "{err:?}");

    // the partial change stays, and the run is not retried
    assert!(SchemaHandle::new(&conn, 2).table_exists("quotas").unwrap());
    let status = runner.status(&conn).unwrap();
    assert!(status.dirty);
    assert_eq!(status.current, 2);
    assert!(matches!(
        runner.migrate(&conn, Target::Latest),
        Err(Error::DirtySchema(2))
    ));

    // operator finishes the unit by hand and records it
    runner.force_version(&conn, 2).unwrap();
    let status = runner.status(&conn).unwrap();
    assert!(!status.dirty);
    assert!(status.pending.is_empty());
}
