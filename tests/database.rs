//! Database tests.

#[path = "database/sqlite.rs"]
mod sqlite;
