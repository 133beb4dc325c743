use std::fmt;
use std::sync::Arc;

use ring::digest;
use strata_common::Result;

use crate::handle::SchemaHandle;

/// A transformation of schema state, run by the migration runner.
pub trait MigrationOp: Send + Sync {
    fn apply(&self, handle: &SchemaHandle<'_>) -> Result<()>;
}

/// A plain SQL script, executed as a batch.
#[derive(Debug, Clone)]
pub struct SqlOp {
    sql: String,
}

impl SqlOp {
    pub fn new(sql: impl Into<String>) -> Self {
        Self { sql: sql.into() }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }
}

impl MigrationOp for SqlOp {
    fn apply(&self, handle: &SchemaHandle<'_>) -> Result<()> {
        handle.execute_batch(&self.sql)
    }
}

/// Adapter for migrations written as Rust code.
pub struct FnOp<F>(F);

impl<F> MigrationOp for FnOp<F>
where
    F: Fn(&SchemaHandle<'_>) -> Result<()> + Send + Sync,
{
    fn apply(&self, handle: &SchemaHandle<'_>) -> Result<()> {
        (self.0)(handle)
    }
}

#[derive(Clone)]
pub enum Downgrade {
    Supported(Arc<dyn MigrationOp>),
    /// The unit can never be reverted, e.g. an initial schema.
    Unsupported { reason: String },
}

impl fmt::Debug for Downgrade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Downgrade::Supported(_) => f.write_str("Supported"),
            Downgrade::Unsupported { reason } => {
                f.debug_struct("Unsupported").field("reason", reason).finish()
            }
        }
    }
}

/// One versioned step of a migration repository.
///
/// Units are immutable once loaded. Versions start at 1 and are contiguous
/// across a repository; [`crate::MigrationRepository`] enforces that.
#[derive(Clone)]
pub struct MigrationUnit {
    version: u32,
    slug: String,
    upgrade: Arc<dyn MigrationOp>,
    downgrade: Downgrade,
    checksum: Option<String>,
}

impl MigrationUnit {
    /// A unit with no downgrade. Use [`MigrationUnit::with_downgrade`] to add one.
    pub fn new(version: u32, slug: impl Into<String>, upgrade: impl MigrationOp + 'static) -> Self {
        Self {
            version,
            slug: slug.into(),
            upgrade: Arc::new(upgrade),
            downgrade: Downgrade::Unsupported {
                reason: "no downgrade defined".to_string(),
            },
            checksum: None,
        }
    }

    pub fn from_fn<F>(version: u32, slug: impl Into<String>, upgrade: F) -> Self
    where
        F: Fn(&SchemaHandle<'_>) -> Result<()> + Send + Sync + 'static,
    {
        Self::new(version, slug, FnOp(upgrade))
    }

    /// A unit backed by SQL text. The checksum covers the upgrade script only,
    /// so adding a downgrade later doesn't count as drift.
    pub fn from_sql(version: u32, slug: impl Into<String>, up: &str, down: Option<&str>) -> Self {
        let unit = Self::new(version, slug, SqlOp::new(up));
        let unit = match down {
            Some(down) => unit.with_downgrade(SqlOp::new(down)),
            None => unit,
        };
        Self {
            checksum: Some(checksum(up)),
            ..unit
        }
    }

    pub fn with_downgrade(mut self, op: impl MigrationOp + 'static) -> Self {
        self.downgrade = Downgrade::Supported(Arc::new(op));
        self
    }

    pub fn with_downgrade_fn<F>(self, op: F) -> Self
    where
        F: Fn(&SchemaHandle<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.with_downgrade(FnOp(op))
    }

    pub fn irreversible(mut self, reason: impl Into<String>) -> Self {
        self.downgrade = Downgrade::Unsupported {
            reason: reason.into(),
        };
        self
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn slug(&self) -> &str {
        &self.slug
    }

    /// `001_initial_schema` style display name.
    pub fn name(&self) -> String {
        format!("{:03}_{}", self.version, self.slug)
    }

    pub fn upgrade(&self) -> &dyn MigrationOp {
        self.upgrade.as_ref()
    }

    pub fn downgrade(&self) -> &Downgrade {
        &self.downgrade
    }

    pub fn downgrade_op(&self) -> Option<&dyn MigrationOp> {
        match &self.downgrade {
            Downgrade::Supported(op) => Some(op.as_ref()),
            Downgrade::Unsupported { .. } => None,
        }
    }

    /// Why this unit can't be reverted, if it can't.
    pub fn downgrade_blocker(&self) -> Option<&str> {
        match &self.downgrade {
            Downgrade::Supported(_) => None,
            Downgrade::Unsupported { reason } => Some(reason),
        }
    }

    pub fn supports_downgrade(&self) -> bool {
        matches!(self.downgrade, Downgrade::Supported(_))
    }

    pub fn checksum(&self) -> Option<&str> {
        self.checksum.as_deref()
    }
}

impl fmt::Debug for MigrationUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationUnit")
            .field("version", &self.version)
            .field("slug", &self.slug)
            .field("downgrade", &self.downgrade)
            .field("checksum", &self.checksum)
            .finish_non_exhaustive()
    }
}

/// Lowercase hex SHA-256 of `sql`.
pub fn checksum(sql: &str) -> String {
    digest::digest(&digest::SHA256, sql.as_bytes())
        .as_ref()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}
