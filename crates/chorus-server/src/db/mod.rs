use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Build the session-record pool without connecting. The database is a
/// best-effort collaborator, so an unreachable server must not stop startup;
/// connection errors surface on the first query instead.
pub fn init_pool(database_url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect_lazy(database_url)?;

    tracing::info!("Database connection pool initialized");
    Ok(pool)
}
