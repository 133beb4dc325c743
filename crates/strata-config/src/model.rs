use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use strata_common::{Error, Result, Target};

pub const DEFAULT_BOOKKEEPING_TABLE: &str = "schema_version";
pub const DEFAULT_REPOSITORY_PATH: &str = "migrations";
pub const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_LOCK_POLL_INTERVAL_MS: u64 = 50;

static IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").expect("identifier pattern is valid")
});

/// Whether `name` can be spliced into SQL as a bare table name.
pub fn is_sql_identifier(name: &str) -> bool {
    IDENTIFIER.is_match(name)
}

/// Settings for a migration run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrateConfig {
    /// SQLite database file to migrate.
    pub database_path: Option<PathBuf>,
    /// Directory holding `NNN_slug.up.sql` / `NNN_slug.down.sql` files.
    pub repository_path: PathBuf,
    pub target_version: Target,
    pub lock_timeout_seconds: u64,
    pub lock_poll_interval_ms: u64,
    pub bookkeeping_table_name: String,
}

impl Default for MigrateConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            repository_path: PathBuf::from(DEFAULT_REPOSITORY_PATH),
            target_version: Target::Latest,
            lock_timeout_seconds: DEFAULT_LOCK_TIMEOUT_SECS,
            lock_poll_interval_ms: DEFAULT_LOCK_POLL_INTERVAL_MS,
            bookkeeping_table_name: DEFAULT_BOOKKEEPING_TABLE.to_string(),
        }
    }
}

impl MigrateConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_seconds)
    }

    pub fn lock_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lock_poll_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if !is_sql_identifier(&self.bookkeeping_table_name) {
            return Err(Error::Config(format!(
                "bookkeeping_table_name `{}` is not a valid SQL identifier",
                self.bookkeeping_table_name
            )));
        }
        if self.lock_poll_interval_ms == 0 {
            return Err(Error::Config(
                "lock_poll_interval_ms must be greater than zero".into(),
            ));
        }
        if self.repository_path.as_os_str().is_empty() {
            return Err(Error::Config("repository_path cannot be empty".into()));
        }
        Ok(())
    }
}
