mod config;
mod serve_cmd;
mod status_cmd;

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio_util::sync::CancellationToken;

use drover_core::ledger::ResourceLedger;
use drover_core::metrics::{MetricsSink, PromSink};
use drover_core::scheduler::Scheduler;
use drover_core::store::{PgStore, TaskStore};
use drover_db::pool;

use config::DroverConfig;
use serve_cmd::AppState;

#[derive(Parser)]
#[command(
    name = "drover",
    about = "Task-dispatching service for long-running AI inference jobs"
)]
struct Cli {
    /// Database URL (overrides DROVER_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a drover config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = "postgresql://localhost:5432/drover")]
        db_url: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Create the drover database and run migrations
    DbInit,
    /// Run the scheduler and the HTTP API
    Serve {
        /// Bind address (overrides config file)
        #[arg(long)]
        bind: Option<String>,
        /// Port (overrides config file)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Show task queue and worker fleet status
    Status,
}

/// Execute `drover init`: write the config file.
fn cmd_init(db_url: &str, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let cfg = config::ConfigFile {
        database: config::DatabaseSection {
            url: db_url.to_string(),
        },
        server: config::ServerSection::default(),
        scheduler: config::SchedulerSection::default(),
    };

    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    println!();
    println!("Next: run `drover db-init` to create and migrate the database.");

    Ok(())
}

/// Execute `drover db-init`: create the database and run migrations.
async fn cmd_db_init(cli_db_url: Option<&str>) -> anyhow::Result<()> {
    let resolved = DroverConfig::resolve(cli_db_url)?;

    println!("Initializing drover database...");

    pool::ensure_database_exists(&resolved.db_config).await?;

    let db_pool = pool::create_pool(&resolved.db_config).await?;
    pool::run_migrations(&db_pool, pool::default_migrations_path()).await?;
    db_pool.close().await;

    println!("drover db-init complete.");
    Ok(())
}

/// Execute `drover serve`: scheduler loop plus HTTP API until shutdown.
async fn cmd_serve(
    cli_db_url: Option<&str>,
    bind: Option<String>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    let resolved = DroverConfig::resolve(cli_db_url)?;
    let bind = bind.unwrap_or(resolved.server.bind);
    let port = port.unwrap_or(resolved.server.port);

    // Fatal on unreachable storage: serve refuses to start half-alive.
    let db_pool = pool::create_pool(&resolved.db_config)
        .await
        .context("storage unreachable, refusing to start")?;

    let store: Arc<dyn TaskStore> = Arc::new(PgStore::new(db_pool.clone()));
    let ledger = Arc::new(
        ResourceLedger::rebuild(store.as_ref())
            .await
            .context("failed to rebuild resource ledger from store")?,
    );
    let metrics: Arc<dyn MetricsSink> = Arc::new(PromSink);

    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install Prometheus metrics recorder")?;

    let cancel = CancellationToken::new();
    let scheduler = Scheduler::new(
        Arc::clone(&store),
        Arc::clone(&ledger),
        Arc::clone(&metrics),
        resolved.scheduler.clone(),
    );
    let scheduler_handle = {
        let cancel = cancel.clone();
        tokio::spawn(async move { scheduler.run(cancel).await })
    };

    let state = AppState {
        store,
        ledger,
        metrics,
        task_timeout: resolved.scheduler.task_timeout,
        prometheus: Some(prometheus),
    };

    let serve_result = serve_cmd::run_serve(state, &bind, port, cancel.clone()).await;

    // The server has stopped (ctrl-c or bind failure); stop the scheduler
    // and wait for its in-flight pass.
    cancel.cancel();
    if let Err(e) = scheduler_handle.await {
        tracing::error!(error = %e, "scheduler task panicked");
    }
    db_pool.close().await;

    serve_result
}

/// Execute `drover status`.
async fn cmd_status(cli_db_url: Option<&str>) -> anyhow::Result<()> {
    let resolved = DroverConfig::resolve(cli_db_url)?;
    let db_pool = pool::create_pool(&resolved.db_config).await?;
    let store = PgStore::new(db_pool.clone());
    let result = status_cmd::run_status(&store).await;
    db_pool.close().await;
    result
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { db_url, force } => {
            cmd_init(&db_url, force)?;
        }
        Commands::DbInit => {
            cmd_db_init(cli.database_url.as_deref()).await?;
        }
        Commands::Serve { bind, port } => {
            cmd_serve(cli.database_url.as_deref(), bind, port).await?;
        }
        Commands::Status => {
            cmd_status(cli.database_url.as_deref()).await?;
        }
    }

    Ok(())
}
