//! Discovery and integrity checking of migration units.
//!
//! A repository is loaded from a [`MigrationSource`] and validated eagerly:
//! versions must run 1, 2, ..., N with no gaps or duplicates. Nothing is ever
//! applied from a repository that failed that check.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use strata_common::{Error, Result};
use tracing::debug;

use crate::unit::MigrationUnit;

/// Where migration units come from.
pub trait MigrationSource {
    /// Human-readable location, for logs.
    fn describe(&self) -> String;

    /// Yield every unit. Order doesn't matter; the repository sorts.
    fn load_units(&self) -> Result<Vec<MigrationUnit>>;
}

/// A SQL migration compiled into the binary.
pub struct EmbeddedMigration {
    pub version: u32,
    pub name: &'static str,
    pub up: &'static str,
    pub down: Option<&'static str>,
}

/// An in-process registry of units.
#[derive(Default)]
pub struct EmbeddedSource {
    units: Vec<MigrationUnit>,
}

impl EmbeddedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_static(migrations: &[EmbeddedMigration]) -> Self {
        let units = migrations
            .iter()
            .map(|m| MigrationUnit::from_sql(m.version, m.name, m.up, m.down))
            .collect();
        Self { units }
    }

    pub fn with_unit(mut self, unit: MigrationUnit) -> Self {
        self.units.push(unit);
        self
    }
}

impl MigrationSource for EmbeddedSource {
    fn describe(&self) -> String {
        format!("embedded registry ({} units)", self.units.len())
    }

    fn load_units(&self) -> Result<Vec<MigrationUnit>> {
        Ok(self.units.clone())
    }
}

static FILE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+)_([A-Za-z0-9][A-Za-z0-9_-]*)(?:\.(up|down))?\.sql$")
        .expect("migration file pattern is valid")
});

/// A directory of `NNN_slug.up.sql` files with optional `NNN_slug.down.sql`
/// companions. `NNN_slug.sql` is accepted as an upgrade script.
pub struct DirectorySource {
    root: PathBuf,
}

struct ScriptPair {
    slug: String,
    up: Option<(PathBuf, String)>,
    down: Option<(PathBuf, String)>,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl MigrationSource for DirectorySource {
    fn describe(&self) -> String {
        format!("directory {}", self.root.display())
    }

    fn load_units(&self) -> Result<Vec<MigrationUnit>> {
        if !self.root.is_dir() {
            return Err(Error::NotFound(format!(
                "migration directory {}",
                self.root.display()
            )));
        }

        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "sql") {
                files.push(path);
            }
        }
        files.sort();

        let mut scripts: BTreeMap<u32, ScriptPair> = BTreeMap::new();
        for path in files {
            let file_name = path
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| {
                    Error::RepositoryIntegrity(format!("non UTF-8 file name: {}", path.display()))
                })?
                .to_string();

            let caps = FILE_NAME.captures(&file_name).ok_or_else(|| {
                Error::RepositoryIntegrity(format!(
                    "malformed migration file name `{file_name}` (expected NNN_slug.up.sql)"
                ))
            })?;
            let version: u32 = caps[1].parse().map_err(|_| {
                Error::RepositoryIntegrity(format!("version out of range in `{file_name}`"))
            })?;
            let slug = caps[2].to_string();
            let is_down = caps.get(3).is_some_and(|m| m.as_str() == "down");
            let sql = std::fs::read_to_string(&path)?;
            debug!("found migration script {file_name}");

            let pair = scripts.entry(version).or_insert_with(|| ScriptPair {
                slug: slug.clone(),
                up: None,
                down: None,
            });
            if pair.slug != slug {
                let msg = if is_down || pair.up.is_none() {
                    format!(
                        "upgrade and downgrade scripts of migration {version} disagree on its name: `{}` and `{slug}`",
                        pair.slug
                    )
                } else {
                    format!("duplicate version {version}: `{}` and `{slug}`", pair.slug)
                };
                return Err(Error::RepositoryIntegrity(msg));
            }
            let slot = if is_down { &mut pair.down } else { &mut pair.up };
            if let Some((existing, _)) = slot {
                return Err(Error::RepositoryIntegrity(format!(
                    "duplicate version {version}: {} and {}",
                    existing.display(),
                    path.display()
                )));
            }
            *slot = Some((path, sql));
        }

        scripts
            .into_iter()
            .map(|(version, pair)| {
                let (_, up) = pair.up.ok_or_else(|| {
                    Error::RepositoryIntegrity(format!(
                        "migration {version} ({}) has a downgrade script but no upgrade",
                        pair.slug
                    ))
                })?;
                let unit = match pair.down {
                    Some((_, down)) => MigrationUnit::from_sql(version, pair.slug, &up, Some(&down)),
                    None => {
                        let reason = format!("no {version:03}_{}.down.sql script", pair.slug);
                        MigrationUnit::from_sql(version, pair.slug, &up, None).irreversible(reason)
                    }
                };
                Ok(unit)
            })
            .collect()
    }
}

/// The validated, ordered set of units available to the runner.
#[derive(Debug)]
pub struct MigrationRepository {
    units: Vec<MigrationUnit>,
}

impl MigrationRepository {
    pub fn load(source: &dyn MigrationSource) -> Result<Self> {
        let repo = Self::from_units(source.load_units()?)?;
        debug!(
            "loaded {} migration units from {}",
            repo.units.len(),
            source.describe()
        );
        Ok(repo)
    }

    pub fn from_units(mut units: Vec<MigrationUnit>) -> Result<Self> {
        units.sort_by_key(MigrationUnit::version);
        validate_sequence(&units)?;
        Ok(Self { units })
    }

    /// All units, ascending by version.
    pub fn list_units(&self) -> &[MigrationUnit] {
        &self.units
    }

    pub fn unit_at(&self, version: u32) -> Result<&MigrationUnit> {
        version
            .checked_sub(1)
            .and_then(|idx| self.units.get(idx as usize))
            .ok_or_else(|| Error::NotFound(format!("migration version {version}")))
    }

    /// Highest known version, 0 for an empty repository.
    pub fn latest_version(&self) -> u32 {
        self.units.last().map(MigrationUnit::version).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

fn validate_sequence(units: &[MigrationUnit]) -> Result<()> {
    let mut previous: Option<&MigrationUnit> = None;
    for (idx, unit) in units.iter().enumerate() {
        if unit.slug().is_empty() {
            return Err(Error::RepositoryIntegrity(format!(
                "migration {} has an empty name",
                unit.version()
            )));
        }
        if let Some(prev) = previous
            && prev.version() == unit.version()
        {
            return Err(Error::RepositoryIntegrity(format!(
                "duplicate version {}: `{}` and `{}`",
                unit.version(),
                prev.slug(),
                unit.slug()
            )));
        }

        let expected = idx as u32 + 1;
        if unit.version() != expected {
            return Err(match previous {
                None => Error::RepositoryIntegrity(format!(
                    "versions must start at 1, found {}",
                    unit.version()
                )),
                Some(prev) => Error::RepositoryIntegrity(format!(
                    "gap in versions: {} is followed by {}",
                    prev.version(),
                    unit.version()
                )),
            });
        }
        previous = Some(unit);
    }
    Ok(())
}
