use secrecy::SecretString;

use crate::{adapters::persistence::PostgresPersistence, infra::db::init_db};

pub mod app;
pub mod config;
pub mod db;
pub mod error;
pub mod pause_sweeper;
pub mod setup;

pub async fn postgres_persistence(
    database_url: &SecretString,
    max_connections: u32,
    run_migrations: bool,
) -> anyhow::Result<PostgresPersistence> {
    let pool = init_db(database_url, max_connections).await?;
    if run_migrations {
        db::run_migrations(&pool).await?;
    }
    let persistence = PostgresPersistence::new(pool);
    Ok(persistence)
}
