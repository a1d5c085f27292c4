use std::env;
use std::time::Duration;

/// Connection settings for the drover database.
///
/// The URL comes from `DROVER_DATABASE_URL` (or the CLI flag that overrides
/// it); pool sizing can be tuned with `DROVER_DATABASE_POOL_SIZE`. One pool
/// serves both the scheduler loops and the HTTP ingress, so it is sized for
/// a handful of concurrent ingress handlers on top of the single in-flight
/// scheduler pass.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Full PostgreSQL connection URL, query string included.
    pub database_url: String,
    /// Upper bound on pooled connections.
    pub max_connections: u32,
    /// How long to wait for a pooled connection before failing the call.
    pub acquire_timeout: Duration,
}

impl DbConfig {
    /// The connection URL used when nothing is configured.
    pub const DEFAULT_URL: &str = "postgresql://localhost:5432/drover";

    const DEFAULT_POOL_SIZE: u32 = 8;
    const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

    /// Build a config from the environment.
    ///
    /// `DROVER_DATABASE_POOL_SIZE` overrides the pool bound when it parses
    /// to a positive integer; anything else keeps the default.
    pub fn from_env() -> Self {
        let mut config = Self::new(
            env::var("DROVER_DATABASE_URL").unwrap_or_else(|_| Self::DEFAULT_URL.to_owned()),
        );
        if let Ok(size) = env::var("DROVER_DATABASE_POOL_SIZE") {
            if let Ok(size) = size.parse::<u32>() {
                if size > 0 {
                    config.max_connections = size;
                }
            }
        }
        config
    }

    /// Build a config from an explicit URL with default pool sizing
    /// (tests, CLI flags).
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections: Self::DEFAULT_POOL_SIZE,
            acquire_timeout: Self::DEFAULT_ACQUIRE_TIMEOUT,
        }
    }

    /// Name of the database the URL addresses, with any query string
    /// stripped: `postgresql://h:5432/drover?sslmode=disable` names
    /// `drover`. `None` when the URL carries no database path.
    pub fn database_name(&self) -> Option<&str> {
        let tail = self.database_url.rsplit('/').next()?;
        let name = tail.split('?').next().unwrap_or(tail);
        (!name.is_empty()).then_some(name)
    }

    /// URL addressing the `postgres` maintenance database on the same
    /// server, preserving the query string (TLS options and the like must
    /// survive the swap). `drover db-init` connects here to issue
    /// `CREATE DATABASE`.
    pub fn maintenance_url(&self) -> String {
        let (base, query) = match self.database_url.split_once('?') {
            Some((base, query)) => (base, Some(query)),
            None => (self.database_url.as_str(), None),
        };
        let server = match base.rfind('/') {
            Some(pos) => &base[..pos],
            None => base,
        };
        match query {
            Some(query) => format!("{server}/postgres?{query}"),
            None => format!("{server}/postgres"),
        }
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self::from_env()
    }
}
