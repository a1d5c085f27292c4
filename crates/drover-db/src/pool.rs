use std::path::Path;

use anyhow::{Context, Result, bail};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};
use tracing::info;

use crate::config::DbConfig;

/// Open the shared connection pool.
///
/// One pool serves the scheduler loops and the HTTP ingress; the bounds
/// come from [`DbConfig`].
pub async fn create_pool(config: &DbConfig) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout)
        .connect(&config.database_url)
        .await
        .with_context(|| format!("failed to connect to database at {}", config.database_url))
}

/// Apply pending migrations from `migrations_dir`.
///
/// The directory is loaded at runtime instead of through the
/// `sqlx::migrate!()` macro, so building the workspace never needs a live
/// database.
pub async fn run_migrations(pool: &PgPool, migrations_dir: &Path) -> Result<()> {
    let migrator = sqlx::migrate::Migrator::new(migrations_dir)
        .await
        .with_context(|| {
            format!(
                "failed to load migrations from {}",
                migrations_dir.display()
            )
        })?;
    let available = migrator.iter().count();

    migrator
        .run(pool)
        .await
        .context("failed to run database migrations")?;

    info!(available, "migrations up to date");
    Ok(())
}

/// Create the target database when it does not exist yet.
///
/// Probes the target directly first -- on an existing installation this is
/// one connection and no maintenance-database traffic. Only when the probe
/// fails does it go through the `postgres` maintenance database and issue
/// `CREATE DATABASE`. A concurrent `db-init` losing the creation race is
/// fine: `duplicate_database` counts as success.
pub async fn ensure_database_exists(config: &DbConfig) -> Result<()> {
    let probe = PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(config.acquire_timeout)
        .connect(&config.database_url)
        .await;
    if let Ok(pool) = probe {
        pool.close().await;
        return Ok(());
    }

    let db_name = config
        .database_name()
        .context("could not determine database name from URL")?;
    // CREATE DATABASE cannot take a bind parameter; refuse any name that
    // would need quoting rather than trying to escape it.
    if !db_name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        bail!("database name {db_name:?} is not a plain identifier");
    }

    let maintenance_url = config.maintenance_url();
    let maint_pool = PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(config.acquire_timeout)
        .connect(&maintenance_url)
        .await
        .with_context(|| {
            format!("failed to connect to maintenance database at {maintenance_url}")
        })?;

    let created = maint_pool
        .execute(format!("CREATE DATABASE {db_name}").as_str())
        .await;
    maint_pool.close().await;

    match created {
        Ok(_) => {
            info!(db = db_name, "database created");
            Ok(())
        }
        Err(sqlx::Error::Database(e)) if e.code().as_deref() == Some("42P04") => Ok(()),
        Err(e) => Err(e).with_context(|| format!("failed to create database {db_name}")),
    }
}

/// Migrations directory bundled with this crate.
///
/// Resolved from `CARGO_MANIFEST_DIR` at compile time, so it points into
/// the source tree; `drover db-init` and the test harness both load from
/// here. Installed binaries without a source tree must embed the
/// migrations themselves.
pub fn default_migrations_path() -> &'static Path {
    Path::new(concat!(env!("CARGO_MANIFEST_DIR"), "/migrations"))
}
