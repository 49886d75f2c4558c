//! Postgres pool for the row store.

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::config::Config;

/// Type alias for the database pool.
pub type Pool = PgPool;

/// Open a pool sized and timed by the server configuration.
pub async fn connect(config: &Config) -> Result<Pool, sqlx::Error> {
    options(config).connect(&config.database_url).await
}

/// A pool that opens its first connection on demand.
pub fn connect_lazy(config: &Config) -> Result<Pool, sqlx::Error> {
    options(config).connect_lazy(&config.database_url)
}

fn options(config: &Config) -> PgPoolOptions {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout)
}

/// Round trip to the database.
pub async fn ping(pool: &Pool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

/// Run database migrations.
pub async fn run_migrations(pool: &Pool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
