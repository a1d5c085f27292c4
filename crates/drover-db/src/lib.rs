//! PostgreSQL persistence for drover: connection pool, migrations, row
//! models, and query functions over the `tasks` and `workers` tables.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
