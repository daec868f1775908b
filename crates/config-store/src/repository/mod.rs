//! Repository layer for the config store
//! Contains trait definitions and the libsql implementation for config entries

pub mod sqlite;

use async_trait::async_trait;
use shared::{error::CommonError, primitives::WrappedChronoDateTime};

pub use sqlite::{Repository, SqlStatementExecutor};

use crate::logic::ConfigEntry;

/// Parameters for creating or overwriting a config entry
#[derive(Debug, Clone)]
pub struct UpsertConfigEntry {
    pub key: String,
    pub value: String,
    pub updated_at: WrappedChronoDateTime,
}

/// Repository trait for config entry operations
#[async_trait]
pub trait ConfigEntryRepositoryLike: Send + Sync {
    /// Get a config entry by key
    async fn get_config_entry_by_key(&self, key: &str) -> Result<Option<ConfigEntry>, CommonError>;

    /// List every config entry ordered by key
    async fn get_config_entries(&self) -> Result<Vec<ConfigEntry>, CommonError>;

    /// Create or overwrite all entries in a single transaction
    async fn upsert_config_entries(&self, params: &[UpsertConfigEntry]) -> Result<(), CommonError>;

    /// Read the current value of `key`, apply `transform` and persist the
    /// result. Read and write happen inside one transaction.
    async fn update_config_entry_with<F>(
        &self,
        key: &str,
        transform: F,
    ) -> Result<ConfigEntry, CommonError>
    where
        F: FnOnce(Option<String>) -> String + Send;
}

/// Executes opaque SQL against a relational store
#[async_trait]
pub trait RawStatementExecutor: Send + Sync {
    /// Run `sql` (one or more `;`-separated statements) atomically
    async fn execute_raw_statement(&self, sql: &str) -> Result<(), CommonError>;
}
