//! Implementation of farmhand CLI commands.

use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use farmhand_engine::ExecutionBackend;
use farmhand_engine::backend;

use crate::Config;
use crate::SqliteDatabase;

pub mod kill;
pub mod queue;
pub mod report;
pub mod serve;
pub mod status;
pub mod submit;
pub mod topology;

/// Opens the database named by the configuration.
async fn open_database(config: &Config) -> Result<Arc<SqliteDatabase>> {
    let db = SqliteDatabase::new(&config.database.path)
        .await
        .with_context(|| {
            format!(
                "failed to open database `{path}`",
                path = config.database.path.display()
            )
        })?;
    Ok(Arc::new(db))
}

/// Creates and initializes the configured execution backend.
async fn open_backend(config: &Config) -> Result<Arc<dyn ExecutionBackend>> {
    let backend = backend::from_config(&config.backend);
    backend
        .initialize(config.backend.root())
        .await
        .with_context(|| format!("failed to initialize the {} backend", backend.name()))?;
    Ok(backend)
}
