use std::path::{Path, PathBuf};

use strata_common::{Error, Result};
use tracing::{debug, info};

use crate::model::MigrateConfig;

/// Environment variables that override file settings.
pub const ENV_DATABASE: &str = "STRATA_DATABASE";
pub const ENV_MIGRATIONS: &str = "STRATA_MIGRATIONS";
pub const ENV_TARGET: &str = "STRATA_TARGET";
pub const ENV_LOCK_TIMEOUT: &str = "STRATA_LOCK_TIMEOUT";
pub const ENV_TABLE: &str = "STRATA_TABLE";

/// Loads [`MigrateConfig`] from YAML or TOML and applies environment overrides.
pub struct ConfigLoader;

impl ConfigLoader {
    /// `~/.strata`, falling back to the working directory when there is no home.
    pub fn default_config_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".strata")
    }

    /// Load from `path` if given, else from the default config file if present,
    /// else start from defaults. Environment overrides are applied last.
    pub fn load(path: Option<&Path>) -> Result<MigrateConfig> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default_path = Self::default_config_dir().join("config.yml");
                if default_path.is_file() {
                    Self::from_file(&default_path)?
                } else {
                    debug!("no config file at {}, using defaults", default_path.display());
                    MigrateConfig::default()
                }
            }
        };

        Self::apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<MigrateConfig> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read {}: {e}", path.display()))
        })?;

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let config = match ext {
            "yml" | "yaml" => serde_yaml::from_str(&contents)
                .map_err(|e| Error::Config(format!("YAML parse error: {e}")))?,
            "toml" => toml::from_str(&contents)
                .map_err(|e| Error::Config(format!("TOML parse error: {e}")))?,
            other => {
                return Err(Error::Config(format!(
                    "unsupported config extension: {other}"
                )));
            }
        };

        info!("loaded config from {}", path.display());
        Ok(config)
    }

    /// Apply overrides using `lookup` so tests don't have to touch the process env.
    pub fn apply_env_overrides(
        config: &mut MigrateConfig,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<()> {
        if let Some(db) = lookup(ENV_DATABASE).filter(|v| !v.is_empty()) {
            config.database_path = Some(PathBuf::from(db));
        }
        if let Some(dir) = lookup(ENV_MIGRATIONS).filter(|v| !v.is_empty()) {
            config.repository_path = PathBuf::from(dir);
        }
        if let Some(target) = lookup(ENV_TARGET).filter(|v| !v.is_empty()) {
            config.target_version = target.parse()?;
        }
        if let Some(timeout) = lookup(ENV_LOCK_TIMEOUT).filter(|v| !v.is_empty()) {
            config.lock_timeout_seconds = timeout.trim().parse().map_err(|_| {
                Error::Config(format!("{ENV_LOCK_TIMEOUT} must be whole seconds, got `{timeout}`"))
            })?;
        }
        if let Some(table) = lookup(ENV_TABLE).filter(|v| !v.is_empty()) {
            config.bookkeeping_table_name = table;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use strata_common::Target;

    use super::*;

    #[test]
    fn loads_yaml_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("strata.yaml");
        std::fs::write(
            &path,
            "database_path: /var/lib/manila/manila.db\nrepository_path: db/versions\ntarget_version: latest\n",
        )
        .unwrap();

        let config = ConfigLoader::from_file(&path).unwrap();
        assert_eq!(
            config.database_path.as_deref(),
            Some(Path::new("/var/lib/manila/manila.db"))
        );
        assert_eq!(config.repository_path, PathBuf::from("db/versions"));
        assert_eq!(config.target_version, Target::Latest);
    }

    #[test]
    fn loads_toml_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("strata.toml");
        std::fs::write(
            &path,
            "target_version = 2\nbookkeeping_table_name = \"migrate_version\"\n",
        )
        .unwrap();

        let config = ConfigLoader::load(Some(&path)).unwrap();
        assert_eq!(config.target_version, Target::Version(2));
        assert_eq!(config.bookkeeping_table_name, "migrate_version");
    }

    #[test]
    fn rejects_unknown_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("strata.ini");
        std::fs::write(&path, "target_version=1").unwrap();
        let err = ConfigLoader::from_file(&path).unwrap_err();
        assert!(err.to_string().contains("unsupported config extension: ini"));
    }

    #[test]
    fn env_overrides_win_over_file_values() {
        let env: HashMap<&str, &str> = [
            (ENV_DATABASE, "/tmp/override.db"),
            (ENV_TARGET, "4"),
            (ENV_LOCK_TIMEOUT, "0"),
            (ENV_TABLE, ""),
        ]
        .into_iter()
        .collect();

        let mut config = MigrateConfig::default();
        ConfigLoader::apply_env_overrides(&mut config, |k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.database_path, Some(PathBuf::from("/tmp/override.db")));
        assert_eq!(config.target_version, Target::Version(4));
        assert_eq!(config.lock_timeout_seconds, 0);
        // empty values are ignored
        assert_eq!(config.bookkeeping_table_name, "schema_version");
    }

    #[test]
    fn bad_env_timeout_is_a_config_error() {
        let mut config = MigrateConfig::default();
        let err = ConfigLoader::apply_env_overrides(&mut config, |k| {
            (k == ENV_LOCK_TIMEOUT).then(|| "soon".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
