//! Database initialization and migration runner.
//!
//! SYSTEM CONTEXT
//! ==============
//! The relay binary uses this module to create the shared SQLx pool and apply
//! the live-map schema before it serves; the pool then backs `/healthz`.
//! Clients that want change feeds build a `PgBackend` on the same schema.

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::config::env_parse;

const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;

fn db_max_connections() -> u32 {
    env_parse("DB_MAX_CONNECTIONS", DEFAULT_DB_MAX_CONNECTIONS)
}

/// Initialize the `PostgreSQL` connection pool and run migrations.
///
/// # Errors
///
/// Returns an error if the connection or migrations fail.
pub async fn init_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(db_max_connections())
        .connect(database_url)
        .await?;

    sqlx::migrate!("src/db/migrations").run(&pool).await?;

    Ok(pool)
}
