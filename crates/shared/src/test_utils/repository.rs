use crate::error::CommonError;
use crate::libsql::{Connection, Migrations, apply_migrations, merge_nested_migrations};

/// Open a fresh `:memory:` database with the given migrations applied.
///
/// The returned [`libsql::Database`] must be kept alive for as long as the
/// connection is in use.
pub async fn setup_in_memory_database<'a>(
    migrations: Vec<Migrations<'a>>,
) -> Result<(libsql::Database, Connection), CommonError> {
    let db = libsql::Builder::new_local(":memory:").build().await?;
    let conn = Connection(db.connect()?);

    conn.execute("PRAGMA foreign_keys = ON", ()).await?;

    let migrations_to_run = merge_nested_migrations(migrations);
    apply_migrations(&conn, &migrations_to_run).await?;

    Ok((db, conn))
}
