//! SQLite repository implementation for the config store

#![allow(non_camel_case_types)]
mod queries;
mod raw_impl;

pub use queries::*;

use crate::logic::ConfigEntry;
use crate::repository::{ConfigEntryRepositoryLike, RawStatementExecutor, UpsertConfigEntry};
use anyhow::Context;
use shared::{
    error::CommonError,
    libsql::SQLITE_BACKEND,
    primitives::{SqlMigrationLoader, WrappedChronoDateTime},
};
use std::collections::BTreeMap;
use tracing::debug;

/// SQLite repository for config entries
#[derive(Clone)]
pub struct Repository {
    conn: shared::libsql::Connection,
}

impl Repository {
    /// Create a new repository instance
    pub fn new(conn: shared::libsql::Connection) -> Self {
        Self { conn }
    }

    /// Get the underlying connection
    pub fn connection(&self) -> &shared::libsql::Connection {
        &self.conn
    }
}

impl SqlMigrationLoader for Repository {
    fn load_sql_migrations() -> BTreeMap<&'static str, BTreeMap<&'static str, &'static str>> {
        BTreeMap::from([(
            SQLITE_BACKEND,
            BTreeMap::from([
                (
                    "20231216000000_conf.sqlite.up.sql",
                    include_str!("../../../dbs/config_store/migrations/20231216000000_conf.sqlite.up.sql"),
                ),
                (
                    "20231216000000_conf.sqlite.down.sql",
                    include_str!("../../../dbs/config_store/migrations/20231216000000_conf.sqlite.down.sql"),
                ),
            ]),
        )])
    }
}

fn repository_error(e: anyhow::Error) -> CommonError {
    CommonError::repository(e.to_string(), e)
}

#[async_trait::async_trait]
impl ConfigEntryRepositoryLike for Repository {
    async fn get_config_entry_by_key(&self, key: &str) -> Result<Option<ConfigEntry>, CommonError> {
        let result = get_conf_by_key(&self.conn, get_conf_by_key_params { key })
            .await
            .context("Failed to get config entry by key")
            .map_err(repository_error)?;

        match result {
            Some(row) => Ok(Some(ConfigEntry::try_from(row)?)),
            None => Ok(None),
        }
    }

    async fn get_config_entries(&self) -> Result<Vec<ConfigEntry>, CommonError> {
        let rows = get_confs(&self.conn)
            .await
            .context("Failed to get config entries")
            .map_err(repository_error)?;

        rows.into_iter().map(ConfigEntry::try_from).collect()
    }

    async fn upsert_config_entries(&self, params: &[UpsertConfigEntry]) -> Result<(), CommonError> {
        let tx = self
            .conn
            .transaction()
            .await
            .context("Failed to begin config upsert transaction")
            .map_err(repository_error)?;

        for entry in params {
            let sqlc_params = upsert_conf_params {
                key: &entry.key,
                value: &entry.value,
                updated_at: &entry.updated_at,
            };

            // dropping the transaction on error rolls it back
            upsert_conf(&tx, sqlc_params)
                .await
                .with_context(|| format!("Failed to upsert config entry {}", entry.key))
                .map_err(repository_error)?;
        }

        tx.commit()
            .await
            .context("Failed to commit config upsert transaction")
            .map_err(repository_error)?;

        debug!(count = params.len(), "upserted config entries");
        Ok(())
    }

    async fn update_config_entry_with<F>(
        &self,
        key: &str,
        transform: F,
    ) -> Result<ConfigEntry, CommonError>
    where
        F: FnOnce(Option<String>) -> String + Send,
    {
        let tx = self
            .conn
            .transaction()
            .await
            .context("Failed to begin config update transaction")
            .map_err(repository_error)?;

        let current = get_conf_by_key(&tx, get_conf_by_key_params { key })
            .await
            .context("Failed to read config entry for update")
            .map_err(repository_error)?;

        let value = transform(current.map(|row| row.value));
        let now = WrappedChronoDateTime::now();

        upsert_conf(
            &tx,
            upsert_conf_params {
                key,
                value: &value,
                updated_at: &now,
            },
        )
        .await
        .context("Failed to write updated config entry")
        .map_err(repository_error)?;

        let updated = get_conf_by_key(&tx, get_conf_by_key_params { key })
            .await
            .context("Failed to re-read updated config entry")
            .map_err(repository_error)?
            .ok_or_else(|| CommonError::not_found("config entry vanished during update", key))?;

        tx.commit()
            .await
            .context("Failed to commit config update transaction")
            .map_err(repository_error)?;

        ConfigEntry::try_from(updated)
    }
}

/// Runs opaque SQL on any libsql connection, e.g. the database the identity
/// provider writes its tables to
#[derive(Clone)]
pub struct SqlStatementExecutor {
    conn: shared::libsql::Connection,
}

impl SqlStatementExecutor {
    pub fn new(conn: shared::libsql::Connection) -> Self {
        Self { conn }
    }

    pub fn connection(&self) -> &shared::libsql::Connection {
        &self.conn
    }
}

#[async_trait::async_trait]
impl RawStatementExecutor for SqlStatementExecutor {
    async fn execute_raw_statement(&self, sql: &str) -> Result<(), CommonError> {
        self.conn
            .execute_transactional_batch(sql)
            .await
            .context("Failed to execute raw statement")
            .map_err(repository_error)?;
        Ok(())
    }
}
