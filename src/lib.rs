//! The farmhand job pair dispatcher.
//!
//! This crate provides the SQLite implementation of the job pair store, the
//! top level configuration file and the implementation of the `farmhand`
//! command line tool. The dispatch core lives in [`farmhand_engine`].

pub mod commands;
pub mod config;
pub mod database;

pub use config::Config;
pub use database::SqliteDatabase;
