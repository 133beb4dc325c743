pub mod backend;
pub mod connection;
pub mod handle;
pub mod lock;
pub mod observer;
pub mod repository;
pub mod runner;
pub mod unit;
pub mod version_store;

pub use backend::{Backend, ForeignKeyViolation, IntegrityBaseline, SqliteBackend};
pub use connection::{open_database, open_in_memory};
pub use handle::SchemaHandle;
pub use lock::{LockHolder, LockManager, MigrationLock};
pub use observer::{MigrationObserver, TracingObserver};
pub use repository::{
    DirectorySource, EmbeddedMigration, EmbeddedSource, MigrationRepository, MigrationSource,
};
pub use runner::{ChecksumMismatch, MigrationPlan, MigrationRunner, MigrationStatus};
pub use unit::{Downgrade, MigrationOp, MigrationUnit, SqlOp};
pub use version_store::{Direction, HistoryEntry, VersionState, VersionStore};
