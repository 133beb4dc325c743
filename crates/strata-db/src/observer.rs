use std::time::Duration;

use strata_common::Error;
use tracing::{error, info};

use crate::unit::MigrationUnit;
use crate::version_store::Direction;

/// Callbacks fired by [`crate::MigrationRunner`] at fixed points of a run.
///
/// All methods default to no-ops, so observers only implement what they need.
pub trait MigrationObserver: Send + Sync {
    fn lock_acquired(&self, _owner: &str) {}

    fn unit_started(&self, _unit: &MigrationUnit, _direction: Direction) {}

    /// The unit's changes and version bump are durable.
    fn unit_committed(&self, _unit: &MigrationUnit, _direction: Direction, _elapsed: Duration) {}

    fn run_failed(&self, _error: &Error) {}

    fn run_completed(&self, _applied: &[u32], _version: u32) {}
}

/// Default observer: structured `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl MigrationObserver for TracingObserver {
    fn lock_acquired(&self, owner: &str) {
        info!(owner, "migration lock acquired");
    }

    fn unit_started(&self, unit: &MigrationUnit, direction: Direction) {
        info!(
            version = unit.version(),
            name = %unit.name(),
            %direction,
            "applying migration"
        );
    }

    fn unit_committed(&self, unit: &MigrationUnit, direction: Direction, elapsed: Duration) {
        info!(
            version = unit.version(),
            name = %unit.name(),
            %direction,
            duration_ms = elapsed.as_millis() as u64,
            "migration committed"
        );
    }

    fn run_failed(&self, error: &Error) {
        error!(version = error.version(), "migration run failed: {error}");
    }

    fn run_completed(&self, applied: &[u32], version: u32) {
        if applied.is_empty() {
            info!(version, "schema already at target version");
        } else {
            info!(version, applied = ?applied, "migration run complete");
        }
    }
}
