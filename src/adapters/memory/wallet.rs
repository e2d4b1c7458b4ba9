use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use super::{lock, table::Table};
use crate::{
    app_error::AppResult,
    application::{
        scope::TenantScope,
        use_cases::wallet::{BalanceUpdate, WalletFilter, WalletRepo},
    },
    domain::entities::wallet::Wallet,
};

pub struct InMemoryWalletStore {
    wallets: Mutex<Table<Wallet>>,
}

impl Default for InMemoryWalletStore {
    fn default() -> Self {
        Self {
            wallets: Mutex::new(Table::new("wallet")),
        }
    }
}

impl InMemoryWalletStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WalletRepo for InMemoryWalletStore {
    async fn create(&self, wallet: &Wallet) -> AppResult<()> {
        lock(&self.wallets, "wallet")?.insert(wallet.clone())
    }

    async fn get_by_id(&self, scope: &TenantScope, id: Uuid) -> AppResult<Option<Wallet>> {
        Ok(lock(&self.wallets, "wallet")?.get(scope, id).cloned())
    }

    async fn list(&self, scope: &TenantScope, filter: &WalletFilter) -> AppResult<Vec<Wallet>> {
        Ok(lock(&self.wallets, "wallet")?.list(scope, filter))
    }

    async fn count(&self, scope: &TenantScope, filter: &WalletFilter) -> AppResult<i64> {
        Ok(lock(&self.wallets, "wallet")?.count(scope, filter))
    }

    async fn update(
        &self,
        scope: &TenantScope,
        wallet: &Wallet,
        expected_version: i64,
    ) -> AppResult<Option<Wallet>> {
        let mut wallets = lock(&self.wallets, "wallet")?;
        let Some(stored) = wallets.get_mut(scope, wallet.id) else {
            return Ok(None);
        };
        if stored.version != expected_version {
            return Ok(None);
        }
        stored.name = wallet.name.clone();
        stored.description = wallet.description.clone();
        stored.wallet_status = wallet.wallet_status;
        stored.auto_topup_trigger = wallet.auto_topup_trigger;
        stored.auto_topup = wallet.auto_topup;
        stored.metadata = wallet.metadata.clone();
        stored.config = wallet.config.clone();
        stored.status = wallet.status;
        stored.updated_at = wallet.updated_at;
        stored.updated_by = wallet.updated_by.clone();
        stored.version += 1;
        Ok(Some(stored.clone()))
    }

    async fn update_balances(
        &self,
        scope: &TenantScope,
        id: Uuid,
        expected_version: i64,
        update: &BalanceUpdate,
    ) -> AppResult<Option<Wallet>> {
        let mut wallets = lock(&self.wallets, "wallet")?;
        let Some(stored) = wallets.get_mut(scope, id) else {
            return Ok(None);
        };
        if stored.version != expected_version {
            return Ok(None);
        }
        stored.balance = update.pools.balance;
        stored.credit_balance = update.pools.credit_balance;
        stored.updated_at = update.updated_at;
        stored.updated_by = update.updated_by.clone();
        stored.version += 1;
        Ok(Some(stored.clone()))
    }
}
