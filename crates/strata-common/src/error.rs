use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("repository integrity error: {0}")]
    RepositoryIntegrity(String),

    #[error("timed out after {waited:?} waiting for migration lock `{table}`")]
    LockTimeout { table: String, waited: Duration },

    #[error("migration {version} failed: {cause}")]
    MigrationFailed {
        version: u32,
        #[source]
        cause: Box<Error>,
    },

    #[error("downgrade not supported by migration {0}")]
    DowngradeUnsupported(u32),

    #[error(
        "schema is dirty at migration {0}; repair it by hand, then run `strata force-version`"
    )]
    DirtySchema(u32),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Wrap `cause` as the failure of migration `version`.
    pub fn migration_failed(version: u32, cause: Error) -> Self {
        Error::MigrationFailed {
            version,
            cause: Box::new(cause),
        }
    }

    /// The migration version this error is pinned to, if any.
    pub fn version(&self) -> Option<u32> {
        match self {
            Error::MigrationFailed { version, .. } => Some(*version),
            Error::DowngradeUnsupported(v) | Error::DirtySchema(v) => Some(*v),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error as _;
    use std::time::Duration;

    use super::Error;

    #[test]
    fn error_display_includes_context() {
        let e = Error::Config("bad yaml".into());
        assert_eq!(e.to_string(), "configuration error: bad yaml");

        let e = Error::RepositoryIntegrity("gap after 2".into());
        assert_eq!(e.to_string(), "repository integrity error: gap after 2");

        let e = Error::DowngradeUnsupported(2);
        assert_eq!(e.to_string(), "downgrade not supported by migration 2");

        let e = Error::Other("misc".into());
        assert_eq!(e.to_string(), "misc");
    }

    #[test]
    fn lock_timeout_names_table() {
        let e = Error::LockTimeout {
            table: "schema_version_lock".into(),
            waited: Duration::from_secs(3),
        };
        assert_eq!(
            e.to_string(),
            "timed out after 3s waiting for migration lock `schema_version_lock`"
        );
    }

    #[test]
    fn migration_failed_keeps_cause_as_source() {
        let e = Error::migration_failed(7, Error::Database("no such table: shares".into()));
        assert_eq!(
            e.to_string(),
            "migration 7 failed: database error: no such table: shares"
        );
        assert_eq!(e.version(), Some(7));
        let source = e.source().expect("cause should be exposed as source");
        assert_eq!(source.to_string(), "database error: no such table: shares");
    }

    #[test]
    fn version_is_none_for_unpinned_errors() {
        assert_eq!(Error::NotFound("x".into()).version(), None);
        assert_eq!(Error::DirtySchema(4).version(), Some(4));
    }
}
