use std::sync::Arc;

use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::{
    adapters::memory::{InMemorySubscriptionStore, InMemoryWalletStore},
    application::{
        clock::SystemClock,
        use_cases::{subscription::SubscriptionRepo, wallet::WalletRepo},
    },
    infra::{
        app::AppServices,
        config::{AppConfig, LogFormat, StorageBackend},
        error::InfraError,
        postgres_persistence,
    },
};

pub async fn init_app_services(config: AppConfig) -> anyhow::Result<AppServices> {
    let clock = Arc::new(SystemClock);

    let (wallet_repo, subscription_repo): (Arc<dyn WalletRepo>, Arc<dyn SubscriptionRepo>) =
        match config.storage_backend {
            StorageBackend::Postgres => {
                let database_url = config
                    .database_url
                    .as_ref()
                    .ok_or(InfraError::ConfigMissing { var: "DATABASE_URL" })?;
                let postgres_arc = Arc::new(
                    postgres_persistence(
                        database_url,
                        config.database_max_connections,
                        config.run_migrations,
                    )
                    .await?,
                );
                (
                    postgres_arc.clone() as Arc<dyn WalletRepo>,
                    postgres_arc as Arc<dyn SubscriptionRepo>,
                )
            }
            StorageBackend::Memory => (
                Arc::new(InMemoryWalletStore::new()) as Arc<dyn WalletRepo>,
                Arc::new(InMemorySubscriptionStore::new()) as Arc<dyn SubscriptionRepo>,
            ),
        };

    info!(backend = %config.storage_backend, "Storage backend ready");
    Ok(AppServices::new(
        config,
        wallet_repo,
        subscription_repo,
        clock,
    ))
}

pub fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "subledger=info".into());

    match format {
        LogFormat::Pretty => {
            let console_layer = fmt::layer()
                .with_target(false)
                .with_level(true)
                .pretty();
            tracing_subscriber::registry()
                .with(filter)
                .with(console_layer)
                .try_init()
                .ok();
        }
        LogFormat::Json => {
            let json_layer = fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(true);
            tracing_subscriber::registry()
                .with(filter)
                .with(json_layer)
                .try_init()
                .ok();
        }
    }
}
