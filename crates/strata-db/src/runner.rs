//! Orchestrates a migration run: lock, read the current version, plan the
//! path to the target, apply units one at a time, release.
//!
//! Every unit commits together with its version bump, so a failure at unit
//! `v` leaves the database at `v - 1`. Nothing is retried: schema changes are
//! not assumed idempotent, and the caller gets the failing version and cause.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use serde::Serialize;
use strata_common::{Error, Result, Target};
use strata_config::MigrateConfig;
use tracing::{debug, error, info, warn};

use crate::backend::{Backend, IntegrityBaseline, SqliteBackend};
use crate::handle::SchemaHandle;
use crate::lock::LockManager;
use crate::observer::{MigrationObserver, TracingObserver};
use crate::repository::{DirectorySource, MigrationRepository};
use crate::unit::MigrationUnit;
use crate::version_store::{Direction, HistoryEntry, VersionStore};

/// The ordered path between the current and the target version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationPlan {
    pub current: u32,
    pub target: u32,
    /// `None` when the schema is already at the target.
    pub direction: Option<Direction>,
    /// Versions in execution order: ascending for upgrades, descending for
    /// downgrades.
    pub versions: Vec<u32>,
}

impl MigrationPlan {
    pub fn is_noop(&self) -> bool {
        self.versions.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationStatus {
    pub backend: String,
    pub current: u32,
    pub latest: u32,
    pub dirty: bool,
    pub applied_at: Option<DateTime<Utc>>,
    pub pending: Vec<u32>,
}

/// An applied unit whose upgrade script changed after it ran.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChecksumMismatch {
    pub version: u32,
    pub slug: String,
    /// `None` when no upgrade of this version was ever recorded.
    pub recorded: Option<String>,
    pub current: String,
}

pub struct MigrationRunner {
    repository: MigrationRepository,
    store: VersionStore,
    locks: LockManager,
    backend: Arc<dyn Backend>,
    observer: Arc<dyn MigrationObserver>,
    lock_timeout: Duration,
}

impl MigrationRunner {
    pub fn new(repository: MigrationRepository, config: &MigrateConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            repository,
            store: VersionStore::new(&config.bookkeeping_table_name)?,
            locks: LockManager::new(&config.bookkeeping_table_name)?
                .with_poll_interval(config.lock_poll_interval()),
            backend: Arc::new(SqliteBackend),
            observer: Arc::new(TracingObserver),
            lock_timeout: config.lock_timeout(),
        })
    }

    /// Load the repository from `config.repository_path` and build a runner.
    pub fn from_config(config: &MigrateConfig) -> Result<Self> {
        let repository =
            MigrationRepository::load(&DirectorySource::new(&config.repository_path))?;
        Self::new(repository, config)
    }

    pub fn with_backend(mut self, backend: impl Backend + 'static) -> Self {
        self.backend = Arc::new(backend);
        self
    }

    pub fn with_observer(mut self, observer: impl MigrationObserver + 'static) -> Self {
        self.observer = Arc::new(observer);
        self
    }

    pub fn repository(&self) -> &MigrationRepository {
        &self.repository
    }

    pub fn version_store(&self) -> &VersionStore {
        &self.store
    }

    pub fn lock_manager(&self) -> &LockManager {
        &self.locks
    }

    /// Move the schema to `target`, returning the versions applied (ascending)
    /// or reverted (descending). Returns an empty list when already there.
    pub fn migrate(&self, conn: &Connection, target: Target) -> Result<Vec<u32>> {
        let result = self.migrate_locked(conn, target);
        if let Err(e) = &result {
            self.observer.run_failed(e);
        }
        result
    }

    fn migrate_locked(&self, conn: &Connection, target: Target) -> Result<Vec<u32>> {
        let lock = self.locks.acquire(conn, self.lock_timeout)?;
        self.observer.lock_acquired(lock.owner());
        debug!(backend = self.backend.name(), "planning migration");

        let plan = self.plan(conn, target)?;
        let mut applied = Vec::with_capacity(plan.versions.len());
        if let Some(direction) = plan.direction {
            for &version in &plan.versions {
                let unit = self.repository.unit_at(version)?;
                self.apply_unit(conn, unit, direction)
                    .map_err(|e| Error::migration_failed(version, e))?;
                applied.push(version);
            }
        }

        self.observer.run_completed(&applied, plan.target);
        if let Err(e) = lock.release() {
            warn!("migration finished but the lock was not released: {e}");
        }
        Ok(applied)
    }

    /// Compute the path to `target` without taking the lock or running any
    /// unit. Downgrade paths are checked in full: any unit without a
    /// downgrade fails the whole plan.
    pub fn plan(&self, conn: &Connection, target: Target) -> Result<MigrationPlan> {
        let state = self.store.state(conn)?;
        if state.dirty {
            return Err(Error::DirtySchema(state.version));
        }

        let latest = self.repository.latest_version();
        let target = match target {
            Target::Latest => latest,
            Target::Version(v) if v > latest => {
                return Err(Error::NotFound(format!(
                    "target version {v} (latest known version is {latest})"
                )));
            }
            Target::Version(v) => v,
        };
        let current = state.version;

        let (direction, versions) = if target == current {
            (None, Vec::new())
        } else if target > current {
            (Some(Direction::Up), (current + 1..=target).collect())
        } else {
            let versions: Vec<u32> = (target + 1..=current).rev().collect();
            for &v in &versions {
                let unit = self.repository.unit_at(v).map_err(|_| {
                    Error::NotFound(format!(
                        "migration {v} is applied to the database but missing from the repository"
                    ))
                })?;
                if !unit.supports_downgrade() {
                    return Err(Error::DowngradeUnsupported(v));
                }
            }
            (Some(Direction::Down), versions)
        };

        Ok(MigrationPlan {
            current,
            target,
            direction,
            versions,
        })
    }

    fn apply_unit(&self, conn: &Connection, unit: &MigrationUnit, direction: Direction) -> Result<()> {
        let op = match direction {
            Direction::Up => unit.upgrade(),
            Direction::Down => unit
                .downgrade_op()
                .ok_or(Error::DowngradeUnsupported(unit.version()))?,
        };

        self.observer.unit_started(unit, direction);
        let started = Instant::now();

        if self.backend.supports_transactional_ddl() {
            let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)
                .map_err(|e| Error::Database(format!("failed to begin transaction: {e}")))?;
            let handle = SchemaHandle::new(&tx, unit.version());
            let baseline = self.baseline(&handle, direction)?;
            op.apply(&handle)?;
            if let Some(baseline) = &baseline {
                self.backend.post_create_hook(&handle, baseline)?;
            }
            self.bump_version(&tx, unit, direction, started)?;
            tx.commit()
                .map_err(|e| Error::Database(format!("failed to commit: {e}")))?;
        } else {
            let handle = SchemaHandle::new(conn, unit.version());
            let baseline = self.baseline(&handle, direction)?;
            let outcome = op
                .apply(&handle)
                .and_then(|()| match &baseline {
                    Some(baseline) => self.backend.post_create_hook(&handle, baseline),
                    None => Ok(()),
                })
                .and_then(|()| self.bump_version(conn, unit, direction, started));
            if let Err(e) = outcome {
                if let Err(mark) = self.store.mark_dirty(conn, unit.version()) {
                    error!(
                        "could not mark migration {} dirty after failure: {mark}",
                        unit.version()
                    );
                }
                return Err(e);
            }
        }

        self.observer
            .unit_committed(unit, direction, started.elapsed());
        Ok(())
    }

    /// Integrity state before an upgrade. Downgrades aren't checked.
    fn baseline(
        &self,
        handle: &SchemaHandle<'_>,
        direction: Direction,
    ) -> Result<Option<IntegrityBaseline>> {
        match direction {
            Direction::Up => self.backend.pre_create_hook(handle).map(Some),
            Direction::Down => Ok(None),
        }
    }

    /// History first, version last: on non-transactional backends the version
    /// bump must be the final statement of the unit.
    fn bump_version(
        &self,
        conn: &Connection,
        unit: &MigrationUnit,
        direction: Direction,
        started: Instant,
    ) -> Result<()> {
        let now = Utc::now();
        self.store.record(
            conn,
            &HistoryEntry {
                version: unit.version(),
                slug: unit.slug().to_string(),
                direction,
                checksum: unit.checksum().map(str::to_string),
                applied_at: now,
                duration_ms: started.elapsed().as_millis() as u64,
            },
        )?;
        let resulting = match direction {
            Direction::Up => unit.version(),
            Direction::Down => unit.version() - 1,
        };
        self.store.set_version(conn, resulting, now)
    }

    pub fn status(&self, conn: &Connection) -> Result<MigrationStatus> {
        let state = self.store.state(conn)?;
        let latest = self.repository.latest_version();
        Ok(MigrationStatus {
            backend: self.backend.name().to_string(),
            current: state.version,
            latest,
            dirty: state.dirty,
            applied_at: state.applied_at,
            pending: (state.version..latest).map(|v| v + 1).collect(),
        })
    }

    pub fn history(&self, conn: &Connection) -> Result<Vec<HistoryEntry>> {
        self.store.history(conn)
    }

    /// Compare each applied SQL unit against the checksum recorded when it ran.
    pub fn verify(&self, conn: &Connection) -> Result<Vec<ChecksumMismatch>> {
        let current = self.store.current_version(conn)?;
        let mut mismatches = Vec::new();
        for unit in self
            .repository
            .list_units()
            .iter()
            .take_while(|u| u.version() <= current)
        {
            let Some(expected) = unit.checksum() else {
                continue;
            };
            let recorded = self
                .store
                .last_upgrade(conn, unit.version())?
                .and_then(|entry| entry.checksum);
            if recorded.as_deref() != Some(expected) {
                mismatches.push(ChecksumMismatch {
                    version: unit.version(),
                    slug: unit.slug().to_string(),
                    recorded,
                    current: expected.to_string(),
                });
            }
        }
        Ok(mismatches)
    }

    /// Operator recovery: set the version without running anything and clear
    /// the dirty flag.
    pub fn force_version(&self, conn: &Connection, version: u32) -> Result<()> {
        let latest = self.repository.latest_version();
        if version > latest {
            return Err(Error::NotFound(format!(
                "migration version {version} (latest known version is {latest})"
            )));
        }
        let lock = self.locks.acquire(conn, self.lock_timeout)?;
        self.store.set_version(conn, version, Utc::now())?;
        info!("schema version forced to {version}");
        lock.release()
    }

    /// Clear a lock left behind by a crashed run.
    pub fn force_unlock(&self, conn: &Connection) -> Result<bool> {
        self.locks.force_release(conn)
    }
}
