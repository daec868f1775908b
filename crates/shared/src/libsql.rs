use std::collections::BTreeMap;
use std::ops::Deref;
use std::path::{Path, PathBuf};

use crate::error::CommonError;
use libsql::params::IntoParams;
use libsql::{BatchRows, Database, Rows};
use tracing::{debug, info};
use url::Url;

/// Name of the backend key used inside a [`Migrations`] map.
pub const SQLITE_BACKEND: &str = "sqlite";

const MIGRATIONS_TABLE_DDL: &str = "CREATE TABLE IF NOT EXISTS _schema_migrations (
    name TEXT PRIMARY KEY NOT NULL,
    applied_at TEXT NOT NULL
)";

#[derive(Debug, Clone)]
pub struct Connection(pub libsql::Connection);

impl Connection {
    pub fn new(connection: libsql::Connection) -> Self {
        Self(connection)
    }
}

impl Deref for Connection {
    type Target = libsql::Connection;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[macro_export]
macro_rules! execute_with_retry {
    ($operation:expr) => {
        execute_with_retry!($operation, 10)
    };
    ($operation:expr, $max_retries:expr) => {{
        async {
            let mut _retries = 0u32;
            let _max_retries: u32 = $max_retries;

            loop {
                match $operation.await {
                    Ok(result) => break Ok(result),
                    Err(err) => {
                        let err_str = err.to_string();
                        if err_str.contains("database is locked") || err_str.contains("SQLITE_BUSY")
                        {
                            tracing::warn!("Database is locked, retrying... {:?}", err);
                            if _retries >= _max_retries {
                                break Err(err);
                            }

                            _retries += 1;

                            let delay_us = 10_000 * (1 << _retries.min(6));
                            tokio::time::sleep(std::time::Duration::from_micros(delay_us)).await;
                        } else {
                            tracing::error!("Error executing with retry: {:?}", err);
                            break Err(err);
                        }
                    }
                }
            }
        }
        .await
    }};
}

impl Connection {
    /// Execute a statement, returning the number of changed rows. Busy errors
    /// are retried with exponential back-off.
    pub async fn execute(&self, sql: &str, params: impl IntoParams) -> libsql::Result<u64> {
        tracing::trace!("executing `{}`", sql);
        let params = params.into_params()?;
        execute_with_retry!(self.0.execute(sql, params.clone()), 10)
    }

    /// Execute a batch of `;`-separated statements.
    pub async fn execute_batch(&self, sql: &str) -> libsql::Result<BatchRows> {
        tracing::trace!("executing batch `{}`", sql);
        execute_with_retry!(self.0.execute_batch(sql), 10)
    }

    /// Execute a batch of statements atomically in a transaction.
    pub async fn execute_transactional_batch(&self, sql: &str) -> libsql::Result<BatchRows> {
        tracing::trace!("executing batch transactional `{}`", sql);
        execute_with_retry!(self.0.execute_transactional_batch(sql), 10)
    }

    /// Run a query and return its [`Rows`].
    pub async fn query(&self, sql: &str, params: impl IntoParams) -> libsql::Result<Rows> {
        let stmt = self.prepare(sql).await?;
        let params = params.into_params()?;
        execute_with_retry!(stmt.query(params.clone()), 10)
    }
}

pub struct LocalConnectionParams {
    pub path_to_db_file: PathBuf,
}

pub struct RemoteReplicaConnectionParams {
    pub path_to_db_file: PathBuf,
    pub remote_url: String,
    pub auth_token: String,
}

pub struct RemoteConnectionParams {
    pub remote_url: String,
    pub auth_token: String,
}

pub enum ConnectionType {
    Local(LocalConnectionParams),
    RemoteReplica(RemoteReplicaConnectionParams),
    Remote(RemoteConnectionParams),
}

fn get_libsql_path(url: &Url, raw: &str) -> PathBuf {
    // libsql://./relative/path parses "." as the host
    if raw.starts_with("libsql://./") {
        PathBuf::from(format!(".{}", url.path()))
    } else {
        PathBuf::from(url.path())
    }
}

fn required_query_param(url: &Url, key: &str) -> Result<String, CommonError> {
    url.query_pairs()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.to_string())
        .ok_or_else(|| {
            CommonError::InvalidRequest {
                msg: format!("missing {key} query parameter in database url"),
                source: None,
            }
        })
}

impl TryFrom<Url> for ConnectionType {
    type Error = CommonError;

    fn try_from(url: Url) -> Result<Self, Self::Error> {
        if url.scheme() != "libsql" {
            return Err(CommonError::InvalidRequest {
                msg: format!("invalid database url scheme: {}", url.scheme()),
                source: None,
            });
        }

        let mode = required_query_param(&url, "mode")?;
        let mut remote_url = url.clone();
        remote_url.set_query(None);

        match mode.as_str() {
            "local" => Ok(ConnectionType::Local(LocalConnectionParams {
                path_to_db_file: get_libsql_path(&url, url.as_str()),
            })),
            "remote_replica" => Ok(ConnectionType::RemoteReplica(
                RemoteReplicaConnectionParams {
                    auth_token: required_query_param(&url, "auth")?,
                    path_to_db_file: PathBuf::from(required_query_param(&url, "path")?),
                    remote_url: remote_url.to_string(),
                },
            )),
            "remote" => Ok(ConnectionType::Remote(RemoteConnectionParams {
                auth_token: required_query_param(&url, "auth")?,
                remote_url: remote_url.to_string(),
            })),
            other => Err(CommonError::InvalidRequest {
                msg: format!("invalid database connection mode: {other}"),
                source: None,
            }),
        }
    }
}

/// Migrations keyed by backend (`sqlite`) and then by file name.
pub type Migrations<'a> = BTreeMap<&'a str, BTreeMap<&'a str, &'a str>>;

pub fn merge_nested_migrations<'a>(mergable_migrations: Vec<Migrations<'a>>) -> Migrations<'a> {
    let mut target = Migrations::new();
    for other in mergable_migrations {
        for (outer_key, inner_map) in other {
            target
                .entry(outer_key)
                .and_modify(|existing_inner| {
                    for (inner_key, value) in inner_map.iter() {
                        existing_inner.insert(*inner_key, *value);
                    }
                })
                .or_insert(inner_map);
        }
    }
    target
}

/// Apply every pending `.up.` migration for the sqlite backend, in file name
/// order. Applied migrations are recorded in `_schema_migrations`.
pub async fn apply_migrations(
    conn: &Connection,
    migrations: &Migrations<'_>,
) -> Result<(), CommonError> {
    let Some(migrations_to_run) = migrations.get(SQLITE_BACKEND) else {
        return Ok(());
    };

    conn.execute(MIGRATIONS_TABLE_DDL, ()).await?;

    for (name, contents) in migrations_to_run
        .iter()
        .filter(|(name, _)| name.contains(".up."))
    {
        let mut rows = conn
            .query(
                "SELECT name FROM _schema_migrations WHERE name = ?1",
                libsql::params![name.to_string()],
            )
            .await?;
        if rows.next().await?.is_some() {
            debug!("migration {name} already applied");
            continue;
        }

        let tx = conn.transaction().await?;
        tx.execute_batch(contents).await?;
        tx.execute(
            "INSERT INTO _schema_migrations (name, applied_at) VALUES (?1, ?2)",
            libsql::params![name.to_string(), chrono::Utc::now().to_rfc3339()],
        )
        .await?;
        tx.commit().await?;
        info!("applied migration {name}");
    }

    Ok(())
}

fn create_db_file_parent_dir(parent_path: Option<&Path>) -> Result<(), CommonError> {
    if let Some(path) = parent_path {
        if !path.as_os_str().is_empty() && !std::fs::exists(path)? {
            std::fs::create_dir_all(path)?;
        }
    }
    Ok(())
}

pub async fn establish_db_connection<'a>(
    connection_string: &Url,
    migrations: Option<Migrations<'a>>,
) -> Result<(Database, Connection), CommonError> {
    let connection_type = ConnectionType::try_from(connection_string.clone())?;

    let db = match connection_type {
        ConnectionType::Local(params) => {
            info!("establishing local connection");
            create_db_file_parent_dir(params.path_to_db_file.parent())?;
            libsql::Builder::new_local(params.path_to_db_file.clone())
                .build()
                .await?
        }
        ConnectionType::RemoteReplica(params) => {
            info!("establishing remote replica connection");
            create_db_file_parent_dir(params.path_to_db_file.parent())?;
            libsql::Builder::new_remote_replica(
                params.path_to_db_file.clone(),
                params.remote_url.clone(),
                params.auth_token.clone(),
            )
            .read_your_writes(true)
            .build()
            .await?
        }
        ConnectionType::Remote(params) => {
            info!("establishing remote connection");
            libsql::Builder::new_remote(params.remote_url.clone(), params.auth_token.clone())
                .build()
                .await?
        }
    };

    let conn = Connection(db.connect()?);

    if let Some(migrations) = migrations {
        apply_migrations(&conn, &migrations).await?;
    }

    Ok((db, conn))
}
