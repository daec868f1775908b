//! SQL statements over the `conf` table

use shared::primitives::WrappedChronoDateTime;

pub struct Row_conf {
    pub key: String,
    pub value: String,
    pub created_at: WrappedChronoDateTime,
    pub updated_at: WrappedChronoDateTime,
}

fn get_datetime(row: &libsql::Row, idx: i32) -> Result<WrappedChronoDateTime, libsql::Error> {
    let raw: String = row.get(idx)?;
    WrappedChronoDateTime::try_from(raw.as_str()).map_err(|_| libsql::Error::InvalidColumnType)
}

impl Row_conf {
    fn from_row(row: &libsql::Row) -> Result<Self, libsql::Error> {
        Ok(Self {
            key: row.get(0)?,
            value: row.get(1)?,
            created_at: get_datetime(row, 2)?,
            updated_at: get_datetime(row, 3)?,
        })
    }
}

pub struct get_conf_by_key_params<'a> {
    pub key: &'a str,
}

pub async fn get_conf_by_key(
    conn: &libsql::Connection,
    params: get_conf_by_key_params<'_>,
) -> Result<Option<Row_conf>, libsql::Error> {
    let mut rows = conn
        .query(
            "SELECT key, value, created_at, updated_at FROM conf WHERE key = ?1",
            libsql::params![params.key.to_string()],
        )
        .await?;

    match rows.next().await? {
        Some(row) => Ok(Some(Row_conf::from_row(&row)?)),
        None => Ok(None),
    }
}

pub async fn get_confs(conn: &libsql::Connection) -> Result<Vec<Row_conf>, libsql::Error> {
    let mut rows = conn
        .query(
            "SELECT key, value, created_at, updated_at FROM conf ORDER BY key",
            (),
        )
        .await?;

    let mut items = Vec::new();
    while let Some(row) = rows.next().await? {
        items.push(Row_conf::from_row(&row)?);
    }
    Ok(items)
}

pub struct upsert_conf_params<'a> {
    pub key: &'a str,
    pub value: &'a str,
    pub updated_at: &'a WrappedChronoDateTime,
}

pub async fn upsert_conf(
    conn: &libsql::Connection,
    params: upsert_conf_params<'_>,
) -> Result<u64, libsql::Error> {
    conn.execute(
        r#"INSERT INTO conf (
    key,
    value,
    created_at,
    updated_at
) VALUES (
    ?1,
    ?2,
    ?3,
    ?3
) ON CONFLICT (key) DO UPDATE SET
    value = excluded.value,
    updated_at = excluded.updated_at"#,
        libsql::params![
            params.key.to_string(),
            params.value.to_string(),
            libsql::Value::from(*params.updated_at),
        ],
    )
    .await
}
