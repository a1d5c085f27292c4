//! Postgres-backed test harness shared by drover's integration tests.
//!
//! One server per test binary, one throwaway database per test. The server
//! is an external instance when `DROVER_TEST_PG_URL` is set (nextest setup
//! script), otherwise a testcontainers Postgres started on first use and
//! kept for the life of the process. Each test gets a [`TestDb`]: a
//! uniquely-named, fully-migrated database that [`TestDb::teardown`]
//! removes.

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};
use testcontainers::ContainerAsync;
use testcontainers::ImageExt;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

use drover_db::pool;

/// The shared server: its root URL (no database path), plus the container
/// handle when we started one ourselves. The handle is never dropped
/// before process exit; dropping it would stop the container under the
/// remaining tests.
struct PgServer {
    root_url: String,
    _keepalive: Option<ContainerAsync<Postgres>>,
}

static PG_SERVER: OnceCell<PgServer> = OnceCell::const_new();

async fn server() -> &'static PgServer {
    PG_SERVER
        .get_or_init(|| async {
            if let Ok(url) = std::env::var("DROVER_TEST_PG_URL") {
                return PgServer {
                    root_url: url,
                    _keepalive: None,
                };
            }

            let container = Postgres::default()
                .with_tag("18")
                .start()
                .await
                .expect("failed to start PostgreSQL container");
            let host = container
                .get_host()
                .await
                .expect("failed to get container host");
            let port = container
                .get_host_port_ipv4(5432)
                .await
                .expect("failed to get mapped port");

            PgServer {
                root_url: format!("postgresql://postgres:postgres@{host}:{port}"),
                _keepalive: Some(container),
            }
        })
        .await
}

/// One-connection pool to the server's `postgres` database, for issuing
/// CREATE/DROP DATABASE.
async fn admin_pool() -> PgPool {
    let root_url = &server().await.root_url;
    PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(30))
        .connect(&format!("{root_url}/postgres"))
        .await
        .expect("failed to connect to the admin database")
}

/// A migrated, uniquely-named database for one test.
pub struct TestDb {
    pub pool: PgPool,
    name: String,
}

impl TestDb {
    /// Create a fresh database on the shared server and apply drover's
    /// migrations to it.
    pub async fn new() -> Self {
        let name = format!("drover_test_{}", Uuid::new_v4().simple());

        let admin = admin_pool().await;
        admin
            .execute(format!("CREATE DATABASE {name}").as_str())
            .await
            .unwrap_or_else(|e| panic!("failed to create test database {name}: {e}"));
        admin.close().await;

        let root_url = &server().await.root_url;
        let db_pool = PgPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&format!("{root_url}/{name}"))
            .await
            .unwrap_or_else(|e| panic!("failed to connect to test database {name}: {e}"));

        pool::run_migrations(&db_pool, pool::default_migrations_path())
            .await
            .expect("migrations should apply cleanly");

        Self {
            pool: db_pool,
            name,
        }
    }

    /// Close the pool and drop the database.
    ///
    /// `WITH (FORCE)` kicks any connection the test leaked, so teardown
    /// cannot hang on a busy database. Errors are swallowed: a database
    /// that is already gone is not a test failure.
    pub async fn teardown(self) {
        self.pool.close().await;

        let admin = admin_pool().await;
        let stmt = format!("DROP DATABASE IF EXISTS {} WITH (FORCE)", self.name);
        let _ = admin.execute(stmt.as_str()).await;
        admin.close().await;
    }
}
