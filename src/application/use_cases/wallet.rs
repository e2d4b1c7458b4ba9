use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::{
    app_error::{AppError, AppResult, ResultExt},
    application::{
        clock::Clock,
        filter::{EntityFilter, QueryFilter, Record},
        scope::{TenantOwned, TenantScope},
        validators::{normalize_currency, validate_metadata, validate_wallet_config},
    },
    domain::entities::{
        auto_topup::{
            AutoTopupEvaluator, AutoTopupTrigger, TopupDecision, TopupDenomination,
            TopupThreshold, validate_auto_topup,
        },
        record_status::RecordStatus,
        wallet::{DebitSplit, PoolBalances, Wallet, WalletPool, WalletStatus, WalletType},
    },
};

pub const DEFAULT_MAX_RETRIES: u32 = 5;

#[async_trait]
pub trait WalletRepo: Send + Sync {
    async fn create(&self, wallet: &Wallet) -> AppResult<()>;
    async fn get_by_id(&self, scope: &TenantScope, id: Uuid) -> AppResult<Option<Wallet>>;
    async fn list(&self, scope: &TenantScope, filter: &WalletFilter) -> AppResult<Vec<Wallet>>;
    async fn count(&self, scope: &TenantScope, filter: &WalletFilter) -> AppResult<i64>;
    /// Writes descriptive fields, lifecycle status and auto-topup settings.
    /// Balances and currency are never touched. Returns `None` when the stored
    /// version no longer equals `expected_version`.
    async fn update(
        &self,
        scope: &TenantScope,
        wallet: &Wallet,
        expected_version: i64,
    ) -> AppResult<Option<Wallet>>;
    /// Compare-and-set on both pools. Returns `None` on a version mismatch.
    async fn update_balances(
        &self,
        scope: &TenantScope,
        id: Uuid,
        expected_version: i64,
        update: &BalanceUpdate,
    ) -> AppResult<Option<Wallet>>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct BalanceUpdate {
    pub pools: PoolBalances,
    pub updated_at: DateTime<Utc>,
    pub updated_by: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct WalletFilter {
    pub query: QueryFilter,
    pub customer_id: Option<Uuid>,
    /// Empty matches every lifecycle status.
    pub wallet_status: Vec<WalletStatus>,
    pub currency: Option<String>,
    pub wallet_ids: Vec<Uuid>,
}

impl WalletFilter {
    pub fn for_customer(customer_id: Uuid) -> Self {
        Self {
            customer_id: Some(customer_id),
            ..Self::default()
        }
    }
}

impl EntityFilter<Wallet> for WalletFilter {
    fn query(&self) -> &QueryFilter {
        &self.query
    }

    fn matches(&self, wallet: &Wallet) -> bool {
        self.customer_id.is_none_or(|id| wallet.customer_id == id)
            && (self.wallet_status.is_empty() || self.wallet_status.contains(&wallet.wallet_status))
            && self
                .currency
                .as_deref()
                .is_none_or(|c| wallet.currency.eq_ignore_ascii_case(c))
            && (self.wallet_ids.is_empty() || self.wallet_ids.contains(&wallet.id))
    }
}

impl TenantOwned for Wallet {
    fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    fn environment_id(&self) -> &str {
        &self.environment_id
    }
}

impl Record for Wallet {
    fn id(&self) -> Uuid {
        self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn record_status(&self) -> RecordStatus {
        self.status
    }
}

#[derive(Debug, Clone)]
pub struct CreateWalletInput {
    pub customer_id: Uuid,
    pub name: Option<String>,
    pub description: Option<String>,
    pub currency: String,
    /// Currency units per credit; defaults to 1.
    pub conversion_rate: Option<Decimal>,
    pub wallet_type: WalletType,
    pub auto_topup_trigger: Option<AutoTopupTrigger>,
    pub auto_topup_min_balance: Option<Decimal>,
    pub auto_topup_amount: Option<Decimal>,
    pub auto_topup_denomination: TopupDenomination,
    pub metadata: BTreeMap<String, String>,
    pub config: serde_json::Value,
}

impl CreateWalletInput {
    pub fn new(customer_id: Uuid, currency: impl Into<String>) -> Self {
        Self {
            customer_id,
            name: None,
            description: None,
            currency: currency.into(),
            conversion_rate: None,
            wallet_type: WalletType::default(),
            auto_topup_trigger: None,
            auto_topup_min_balance: None,
            auto_topup_amount: None,
            auto_topup_denomination: TopupDenomination::default(),
            metadata: BTreeMap::new(),
            config: serde_json::json!({}),
        }
    }
}

/// Descriptive fields only. Currency and balances have dedicated paths.
#[derive(Debug, Clone, Default)]
pub struct UpdateWalletInput {
    pub name: Option<String>,
    pub description: Option<String>,
    pub metadata: Option<BTreeMap<String, String>>,
    /// Replaces the stored config as a whole.
    pub config: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AutoTopupConfig {
    pub trigger: Option<AutoTopupTrigger>,
    pub min_balance: Option<Decimal>,
    pub amount: Option<Decimal>,
    pub denomination: TopupDenomination,
}

/// What happened to the follow-up replenishment after a debit.
#[derive(Debug)]
pub enum TopupOutcome {
    NotRequired,
    Applied { amount: Decimal },
    /// The debit stands; the replenishment did not land.
    Failed(AppError),
}

#[derive(Debug)]
pub struct DebitOutcome {
    /// Latest known state, including any applied top-up.
    pub wallet: Wallet,
    pub debited: DebitSplit,
    pub topup: TopupOutcome,
}

/// Per-wallet linearizable credit and debit over two balance pools.
///
/// Every balance change is a read, a pure plan and a compare-and-set on the
/// wallet version. A lost race re-reads and re-plans, so a debit is checked
/// against the balances it actually replaces.
#[derive(Clone)]
pub struct WalletLedger {
    repo: Arc<dyn WalletRepo>,
    clock: Arc<dyn Clock>,
    evaluator: AutoTopupEvaluator,
    max_retries: u32,
}

impl WalletLedger {
    pub fn new(repo: Arc<dyn WalletRepo>, clock: Arc<dyn Clock>, max_retries: u32) -> Self {
        Self {
            repo,
            clock,
            evaluator: AutoTopupEvaluator,
            max_retries,
        }
    }

    #[instrument(skip(self, input), fields(tenant_id = %scope.tenant_id(), customer_id = %input.customer_id))]
    pub async fn create_wallet(
        &self,
        scope: &TenantScope,
        input: CreateWalletInput,
    ) -> AppResult<Wallet> {
        let currency = normalize_currency(&input.currency)?;
        validate_metadata(input.metadata.keys())?;
        validate_wallet_config(&input.config)?;
        let conversion_rate = input.conversion_rate.unwrap_or(Decimal::ONE);
        if conversion_rate <= Decimal::ZERO {
            return Err(AppError::InvalidInput(
                "conversion_rate must be positive".into(),
            ));
        }
        let auto_topup = TopupThreshold::from_parts(
            input.auto_topup_min_balance,
            input.auto_topup_amount,
            input.auto_topup_denomination,
        )?;
        validate_auto_topup(input.auto_topup_trigger, auto_topup.as_ref())?;

        let name = input
            .name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| "Prepaid Wallet".to_string());

        let now = self.clock.now();
        let actor = scope.actor().map(str::to_owned);
        let wallet = Wallet {
            id: Uuid::new_v4(),
            tenant_id: scope.tenant_id().to_string(),
            environment_id: scope.environment_id().to_string(),
            customer_id: input.customer_id,
            name,
            description: input.description,
            currency,
            balance: Decimal::ZERO,
            credit_balance: Decimal::ZERO,
            conversion_rate,
            wallet_status: WalletStatus::Active,
            wallet_type: input.wallet_type,
            auto_topup_trigger: input.auto_topup_trigger,
            auto_topup,
            metadata: input.metadata,
            config: input.config,
            status: RecordStatus::Published,
            version: 1,
            created_at: now,
            updated_at: now,
            created_by: actor.clone(),
            updated_by: actor,
        };

        scope
            .bounded(self.repo.create(&wallet))
            .await
            .for_entity("wallet", wallet.id)?;
        info!(wallet_id = %wallet.id, currency = %wallet.currency, "Wallet created");
        Ok(wallet)
    }

    #[instrument(skip(self), fields(tenant_id = %scope.tenant_id()))]
    pub async fn get_wallet(&self, scope: &TenantScope, id: Uuid) -> AppResult<Wallet> {
        self.load(scope, id).await
    }

    #[instrument(skip(self, filter), fields(tenant_id = %scope.tenant_id()))]
    pub async fn list_wallets(
        &self,
        scope: &TenantScope,
        filter: &WalletFilter,
    ) -> AppResult<Vec<Wallet>> {
        filter.validate()?;
        scope
            .bounded(self.repo.list(scope, filter))
            .await
            .for_entity("wallet", "list")
    }

    pub async fn count_wallets(&self, scope: &TenantScope, filter: &WalletFilter) -> AppResult<i64> {
        filter.validate()?;
        scope
            .bounded(self.repo.count(scope, filter))
            .await
            .for_entity("wallet", "count")
    }

    #[instrument(skip(self, input), fields(tenant_id = %scope.tenant_id()))]
    pub async fn update_wallet(
        &self,
        scope: &TenantScope,
        id: Uuid,
        input: UpdateWalletInput,
    ) -> AppResult<Wallet> {
        if let Some(name) = &input.name {
            if name.trim().is_empty() {
                return Err(AppError::InvalidInput("name must not be blank".into()));
            }
        }
        if let Some(metadata) = &input.metadata {
            validate_metadata(metadata.keys())?;
        }
        if let Some(config) = &input.config {
            validate_wallet_config(config)?;
        }
        self.mutate_wallet(scope, id, |wallet| {
            if let Some(name) = &input.name {
                wallet.name = name.trim().to_string();
            }
            if let Some(description) = &input.description {
                wallet.description = Some(description.clone());
            }
            if let Some(metadata) = &input.metadata {
                wallet.metadata = metadata.clone();
            }
            if let Some(config) = &input.config {
                wallet.config = config.clone();
            }
            Ok(())
        })
        .await
    }

    /// Lifecycle change. A wallet can only be closed once both pools are empty.
    #[instrument(skip(self), fields(tenant_id = %scope.tenant_id()))]
    pub async fn set_wallet_status(
        &self,
        scope: &TenantScope,
        id: Uuid,
        next: WalletStatus,
    ) -> AppResult<Wallet> {
        let wallet = self
            .mutate_wallet(scope, id, |wallet| {
                if wallet.wallet_status == next {
                    return Ok(());
                }
                if !wallet.wallet_status.can_transition_to(next) {
                    return Err(AppError::invalid_transition(wallet.wallet_status, next));
                }
                if next == WalletStatus::Closed && !wallet.is_empty() {
                    return Err(AppError::InvalidInput(
                        "wallet must be empty before it can be closed".into(),
                    ));
                }
                wallet.wallet_status = next;
                Ok(())
            })
            .await?;
        info!(wallet_id = %id, wallet_status = %wallet.wallet_status, "Wallet status changed");
        Ok(wallet)
    }

    #[instrument(skip(self, config), fields(tenant_id = %scope.tenant_id()))]
    pub async fn set_auto_topup_config(
        &self,
        scope: &TenantScope,
        id: Uuid,
        config: AutoTopupConfig,
    ) -> AppResult<Wallet> {
        let threshold =
            TopupThreshold::from_parts(config.min_balance, config.amount, config.denomination)?;
        validate_auto_topup(config.trigger, threshold.as_ref())?;

        self.mutate_wallet(scope, id, |wallet| {
            wallet.auto_topup_trigger = config.trigger;
            wallet.auto_topup = threshold;
            Ok(())
        })
        .await
    }

    /// Credit `amount` to one pool.
    #[instrument(skip(self), fields(tenant_id = %scope.tenant_id()))]
    pub async fn credit(
        &self,
        scope: &TenantScope,
        id: Uuid,
        amount: Decimal,
        pool: WalletPool,
    ) -> AppResult<Wallet> {
        ensure_positive(amount)?;
        let (wallet, ()) = self
            .mutate_balances(scope, id, |wallet| {
                ensure_spendable(wallet)?;
                Ok((wallet.pools_after_credit(amount, pool)?, ()))
            })
            .await?;
        info!(wallet_id = %id, %amount, pool = %pool, "Wallet credited");
        Ok(wallet)
    }

    /// Debit `amount`, drawing the credit pool first and the spendable balance
    /// for the remainder. Refused as a whole when both pools cannot cover it.
    /// A replenishment fired by the new balance is applied right after and
    /// reported in [`DebitOutcome::topup`].
    #[instrument(skip(self), fields(tenant_id = %scope.tenant_id()))]
    pub async fn debit(
        &self,
        scope: &TenantScope,
        id: Uuid,
        amount: Decimal,
    ) -> AppResult<DebitOutcome> {
        ensure_positive(amount)?;
        let (wallet, debited) = self
            .mutate_balances(scope, id, |wallet| {
                ensure_spendable(wallet)?;
                let Some(split) = wallet.split_debit(amount) else {
                    return Err(AppError::InsufficientFunds {
                        requested: amount,
                        available: wallet.total_available()?,
                    });
                };
                Ok((wallet.pools_after_debit(split), split))
            })
            .await?;
        info!(
            wallet_id = %id,
            %amount,
            from_credit_balance = %debited.from_credit_balance,
            from_balance = %debited.from_balance,
            "Wallet debited"
        );

        let (wallet, topup) = self.apply_auto_topup(scope, wallet).await;
        Ok(DebitOutcome {
            wallet,
            debited,
            topup,
        })
    }

    pub async fn convert_credit_to_currency(
        &self,
        scope: &TenantScope,
        id: Uuid,
        credits: Decimal,
    ) -> AppResult<Decimal> {
        let wallet = self.load(scope, id).await?;
        wallet.convert_credit_to_currency(credits)
    }

    /// Conditional replenishment against the post-debit version.
    ///
    /// Any concurrent write in between forces a re-read and a fresh decision,
    /// so two debits racing below the minimum produce a single top-up.
    async fn apply_auto_topup(&self, scope: &TenantScope, debited: Wallet) -> (Wallet, TopupOutcome) {
        let mut current = debited;
        for attempt in 0..=self.max_retries {
            let amount = match self.evaluator.evaluate(&current) {
                Ok(TopupDecision::TopUp { amount }) => amount,
                Ok(TopupDecision::NoAction) => return (current, TopupOutcome::NotRequired),
                Err(err) => return self.topup_failed(current, err),
            };
            if !current.is_active() {
                return (current, TopupOutcome::NotRequired);
            }

            let pools = match current.pools_after_credit(amount, WalletPool::Balance) {
                Ok(pools) => pools,
                Err(err) => return self.topup_failed(current, err),
            };
            let update = self.balance_update(scope, pools);
            let written = scope
                .bounded(
                    self.repo
                        .update_balances(scope, current.id, current.version, &update),
                )
                .await
                .for_entity("wallet", current.id);
            match written {
                Ok(Some(wallet)) => {
                    info!(wallet_id = %wallet.id, %amount, "Auto top-up applied");
                    return (wallet, TopupOutcome::Applied { amount });
                }
                Ok(None) => {
                    debug!(wallet_id = %current.id, attempt, "Wallet moved before top-up, re-evaluating");
                    match self.load(scope, current.id).await {
                        Ok(fresh) => current = fresh,
                        Err(err) => return self.topup_failed(current, err),
                    }
                }
                Err(err) => return self.topup_failed(current, err),
            }
        }
        let err = AppError::Conflict(format!(
            "wallet {} kept changing during auto top-up",
            current.id
        ));
        self.topup_failed(current, err)
    }

    fn topup_failed(&self, wallet: Wallet, err: AppError) -> (Wallet, TopupOutcome) {
        warn!(wallet_id = %wallet.id, error = %err, "Auto top-up failed after debit");
        (wallet, TopupOutcome::Failed(err))
    }

    async fn load(&self, scope: &TenantScope, id: Uuid) -> AppResult<Wallet> {
        scope
            .bounded(self.repo.get_by_id(scope, id))
            .await
            .for_entity("wallet", id)?
            .ok_or(AppError::NotFound)
    }

    fn balance_update(&self, scope: &TenantScope, pools: PoolBalances) -> BalanceUpdate {
        BalanceUpdate {
            pools,
            updated_at: self.clock.now(),
            updated_by: scope.actor().map(str::to_owned),
        }
    }

    /// Read, plan, compare-and-set; retried on a lost race.
    async fn mutate_balances<T, F>(
        &self,
        scope: &TenantScope,
        id: Uuid,
        mut plan: F,
    ) -> AppResult<(Wallet, T)>
    where
        F: FnMut(&Wallet) -> AppResult<(PoolBalances, T)> + Send,
        T: Send,
    {
        for attempt in 0..=self.max_retries {
            let wallet = self.load(scope, id).await?;
            let (pools, extra) = plan(&wallet)?;
            if pools.balance < Decimal::ZERO || pools.credit_balance < Decimal::ZERO {
                return Err(AppError::Internal(format!(
                    "planned negative pool for wallet {id}"
                )));
            }

            let update = self.balance_update(scope, pools);
            let written = scope
                .bounded(self.repo.update_balances(scope, id, wallet.version, &update))
                .await
                .for_entity("wallet", id)?;
            match written {
                Some(updated) => return Ok((updated, extra)),
                None => {
                    debug!(wallet_id = %id, attempt, "Wallet version moved, retrying");
                    tokio::task::yield_now().await;
                }
            }
        }
        warn!(wallet_id = %id, retries = self.max_retries, "Gave up on contended wallet");
        Err(AppError::Conflict(format!(
            "wallet {id} is being modified concurrently"
        )))
    }

    async fn mutate_wallet<F>(&self, scope: &TenantScope, id: Uuid, mut apply: F) -> AppResult<Wallet>
    where
        F: FnMut(&mut Wallet) -> AppResult<()> + Send,
    {
        for attempt in 0..=self.max_retries {
            let current = self.load(scope, id).await?;
            let mut next = current.clone();
            apply(&mut next)?;
            if next == current {
                return Ok(current);
            }
            next.updated_at = self.clock.now();
            next.updated_by = scope.actor().map(str::to_owned);

            let written = scope
                .bounded(self.repo.update(scope, &next, current.version))
                .await
                .for_entity("wallet", id)?;
            match written {
                Some(updated) => return Ok(updated),
                None => debug!(wallet_id = %id, attempt, "Wallet version moved, retrying"),
            }
        }
        Err(AppError::Conflict(format!(
            "wallet {id} is being modified concurrently"
        )))
    }
}

fn ensure_positive(amount: Decimal) -> AppResult<()> {
    if amount <= Decimal::ZERO {
        return Err(AppError::InvalidInput("amount must be positive".into()));
    }
    Ok(())
}

fn ensure_spendable(wallet: &Wallet) -> AppResult<()> {
    if !wallet.is_active() {
        return Err(AppError::InvalidInput(format!(
            "wallet is {}",
            wallet.wallet_status
        )));
    }
    Ok(())
}
