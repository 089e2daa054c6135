//! Implementation of the configuration module.
//!
//! Configuration is read from an optional TOML file, then overridden by
//! environment variables prefixed with `FARMHAND__` (for example
//! `FARMHAND__DATABASE__PATH` or `FARMHAND__DISPATCH__INTERVAL_SECS`).
//! Command line flags are applied last by each command.

use std::path::Path;
use std::path::PathBuf;

use anyhow::Context as _;
use anyhow::Result;
use anyhow::bail;
use farmhand_engine::EngineConfig;
use farmhand_engine::config::BackendConfig;
use farmhand_engine::config::DispatchConfig;
use farmhand_engine::config::PostProcessingConfig;
use farmhand_engine::config::TopologyConfig;
use serde::Deserialize;
use serde::Serialize;

/// The prefix of configuration environment variables.
pub const ENV_PREFIX: &str = "FARMHAND";

/// The separator between the prefix and nested keys of configuration
/// environment variables.
pub const ENV_SEPARATOR: &str = "__";

/// The default path of the database.
pub const DEFAULT_DATABASE_PATH: &str = "farmhand.db";

/// Default database path function for serde.
fn default_database_path() -> PathBuf {
    PathBuf::from(DEFAULT_DATABASE_PATH)
}

/// Represents the configuration of farmhand.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct Config {
    /// The database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,
    /// The execution backend to use.
    #[serde(default)]
    pub backend: BackendConfig,
    /// The dispatch configuration.
    #[serde(default)]
    pub dispatch: DispatchConfig,
    /// The cluster topology configuration.
    #[serde(default)]
    pub topology: TopologyConfig,
    /// The post-processing configuration.
    #[serde(default)]
    pub post_processing: PostProcessingConfig,
}

/// Represents the database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct DatabaseConfig {
    /// The path of the SQLite database file.
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

impl Config {
    /// Loads the configuration.
    ///
    /// A `path` that is given must exist. Environment variables override the
    /// values of the file.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            if !path.is_file() {
                bail!(
                    "configuration file `{path}` does not exist",
                    path = path.display()
                );
            }

            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }

        builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator(ENV_SEPARATOR)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true),
            )
            .build()
            .context("failed to read configuration")?
            .try_deserialize()
            .context("failed to parse configuration")
    }

    /// Gets the engine part of the configuration.
    pub fn engine(&self) -> EngineConfig {
        EngineConfig {
            backend: self.backend.clone(),
            dispatch: self.dispatch.clone(),
            topology: self.topology.clone(),
            post_processing: self.post_processing.clone(),
        }
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.database.path.as_os_str().is_empty() {
            bail!("database configuration value `path` cannot be empty");
        }

        self.engine().validate()
    }
}
