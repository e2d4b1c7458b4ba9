use std::sync::Arc;

use crate::{
    application::{
        clock::Clock,
        use_cases::{
            subscription::{SubscriptionAggregateStore, SubscriptionRepo},
            subscription_pause::PauseStateMachine,
            wallet::{WalletLedger, WalletRepo},
        },
    },
    infra::config::AppConfig,
};

/// Everything a caller needs to drive the engine, wired onto one backend.
#[derive(Clone)]
pub struct AppServices {
    pub config: Arc<AppConfig>,
    pub wallet_ledger: Arc<WalletLedger>,
    pub subscriptions: Arc<SubscriptionAggregateStore>,
    pub pauses: Arc<PauseStateMachine>,
}

impl AppServices {
    pub fn new(
        config: AppConfig,
        wallet_repo: Arc<dyn WalletRepo>,
        subscription_repo: Arc<dyn SubscriptionRepo>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let max_retries = config.ledger_max_retries;
        Self {
            wallet_ledger: Arc::new(WalletLedger::new(wallet_repo, clock.clone(), max_retries)),
            subscriptions: Arc::new(SubscriptionAggregateStore::new(
                subscription_repo.clone(),
                clock.clone(),
                max_retries,
            )),
            pauses: Arc::new(PauseStateMachine::new(subscription_repo, clock, max_retries)),
            config: Arc::new(config),
        }
    }
}
