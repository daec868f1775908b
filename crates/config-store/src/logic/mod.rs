//! Business logic layer for the config store
//! Contains the config entry model and the read / update / upsert operations

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use shared::{error::CommonError, primitives::WrappedChronoDateTime};
use tracing::info;

use crate::repository::{ConfigEntryRepositoryLike, UpsertConfigEntry};

/// A single key/value setting. Keys are unique.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigEntry {
    pub key: String,
    pub value: String,
    pub created_at: WrappedChronoDateTime,
    pub updated_at: WrappedChronoDateTime,
}

/// Get the entry stored under `key`. A missing key is `Ok(None)`.
pub async fn get_config_entry<R>(repository: &R, key: &str) -> Result<Option<ConfigEntry>, CommonError>
where
    R: ConfigEntryRepositoryLike,
{
    repository.get_config_entry_by_key(key).await
}

/// List all entries ordered by key
pub async fn list_config_entries<R>(repository: &R) -> Result<Vec<ConfigEntry>, CommonError>
where
    R: ConfigEntryRepositoryLike,
{
    repository.get_config_entries().await
}

/// Read-modify-write a single entry. `transform` receives `None` when the
/// key has never been written.
pub async fn apply_update<R, F>(repository: &R, key: &str, transform: F) -> Result<ConfigEntry, CommonError>
where
    R: ConfigEntryRepositoryLike,
    F: FnOnce(Option<String>) -> String + Send,
{
    let entry = repository.update_config_entry_with(key, transform).await?;
    info!(key, "config entry updated");
    Ok(entry)
}

/// Create or overwrite every pair in `entries` as one unit
pub async fn upsert_all<R>(repository: &R, entries: &BTreeMap<String, String>) -> Result<(), CommonError>
where
    R: ConfigEntryRepositoryLike,
{
    if entries.is_empty() {
        return Ok(());
    }

    let now = WrappedChronoDateTime::now();
    let params: Vec<UpsertConfigEntry> = entries
        .iter()
        .map(|(key, value)| UpsertConfigEntry {
            key: key.clone(),
            value: value.clone(),
            updated_at: now,
        })
        .collect();

    repository.upsert_config_entries(&params).await?;
    info!(keys = ?entries.keys().collect::<Vec<_>>(), "config entries upserted");
    Ok(())
}
