//! Row conversion implementations for the `conf` queries

use crate::logic::ConfigEntry;
use shared::error::CommonError;

use super::Row_conf;

impl TryFrom<Row_conf> for ConfigEntry {
    type Error = CommonError;
    fn try_from(row: Row_conf) -> Result<Self, Self::Error> {
        Ok(ConfigEntry {
            key: row.key,
            value: row.value,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
