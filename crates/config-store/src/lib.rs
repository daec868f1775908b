//! Key/value configuration store shared with the API gateway.
//!
//! This crate provides:
//! - The `conf` table schema and its libsql repository
//! - Read, read-modify-write and batch upsert operations over config entries
//! - Raw statement execution against any libsql database for one-off DDL

pub mod logic;
pub mod repository;

pub use logic::{ConfigEntry, apply_update, get_config_entry, list_config_entries, upsert_all};
pub use repository::{ConfigEntryRepositoryLike, RawStatementExecutor, Repository, SqlStatementExecutor};
