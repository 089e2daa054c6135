//! Database implementation of the job pair store.

use thiserror::Error;

pub mod models;
pub mod sqlite;

pub use sqlite::SqliteDatabase;

/// Database errors.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// A database error.
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// A migration error.
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// An I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A validation error.
    #[error("validation error: {0}")]
    Validation(String),
}

/// Result type for database operations.
pub type Result<T> = std::result::Result<T, DatabaseError>;
