use std::error::Error;

use anyhow::Context;
use bootstrap::{BootstrapConfig, BootstrapOrchestrator, BootstrapOutcome};
use clap::Parser;
use config_store::{Repository, SqlStatementExecutor};
use envconfig::Envconfig;
use human_panic::setup_panic;
use keycloak_admin::AdminClient;
use shared::libsql::establish_db_connection;
use shared::primitives::SqlMigrationLoader;
use tracing::{error, info};

/// Provision the leafog realm in Keycloak and publish its signing key to the
/// config store. Safe to run on every start.
#[derive(Parser)]
#[command(version, about)]
struct Cli {}

fn log_error_chain(err: &(dyn Error)) {
    let mut current: Option<&(dyn Error)> = err.source();

    while let Some(e) = current {
        eprintln!("Caused by: {e}");
        current = e.source();
    }
}

async fn run() -> Result<BootstrapOutcome, anyhow::Error> {
    let config = BootstrapConfig::init_from_env().context("invalid bootstrap configuration")?;
    info!(?config, "loaded bootstrap configuration");

    let (_db, conn) = establish_db_connection(
        &config.config_db_conn_string,
        Some(Repository::load_sql_migrations()),
    )
    .await
    .context("failed to open config store")?;

    let (_user_view_db, user_view_conn) =
        establish_db_connection(&config.user_view_db_conn_string, None)
            .await
            .context("failed to open identity provider database")?;

    let admin_client = AdminClient::new(config.admin_client_config()?)?;
    let orchestrator = BootstrapOrchestrator::new(
        admin_client,
        Repository::new(conn),
        SqlStatementExecutor::new(user_view_conn),
        config.provisioning_definitions(),
    );

    Ok(orchestrator.run_with_deadline(config.deadline()).await?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_panic!();
    let _cli = Cli::parse();
    shared::env::configure_env()?;
    shared::logging::configure_logging()?;

    match run().await {
        Ok(outcome) => {
            info!(?outcome, "bootstrap finished");
            Ok(())
        }
        Err(e) => {
            error!("bootstrap failed: {e}");
            eprintln!("Error: {e}");
            log_error_chain(&*e);
            ::std::process::exit(1);
        }
    }
}
