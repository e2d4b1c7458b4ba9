use std::collections::BTreeMap;

use async_trait::async_trait;
use sqlx::{postgres::PgRow, Postgres, QueryBuilder, Row};
use uuid::Uuid;

use super::{
    metadata_json, parse_json_with_fallback, push_order_and_page, push_record_status, push_scope,
};
use crate::{
    adapters::persistence::PostgresPersistence,
    app_error::{AppError, AppResult},
    application::{
        scope::TenantScope,
        use_cases::wallet::{BalanceUpdate, WalletFilter, WalletRepo},
    },
    domain::entities::{
        auto_topup::{AutoTopupTrigger, TopupDenomination, TopupThreshold},
        wallet::Wallet,
    },
};

const SELECT_COLS: &str = r#"
    id, tenant_id, environment_id, customer_id, name, description, currency,
    balance, credit_balance, conversion_rate, wallet_status, wallet_type,
    auto_topup_trigger, auto_topup_min_balance, auto_topup_amount, topup_denomination,
    metadata, config, status, version, created_at, updated_at, created_by, updated_by
"#;

fn row_to_wallet(row: &PgRow) -> AppResult<Wallet> {
    let id: Uuid = row.get("id");
    let auto_topup = TopupThreshold::from_parts(
        row.get("auto_topup_min_balance"),
        row.get("auto_topup_amount"),
        row.get::<TopupDenomination, _>("topup_denomination"),
    )
    .map_err(|e| AppError::Internal(format!("wallet {id} has an invalid auto-topup: {e}")))?;
    let metadata_raw: serde_json::Value = row.get("metadata");
    let metadata: BTreeMap<String, String> =
        parse_json_with_fallback(&metadata_raw, "metadata", "wallet", &id.to_string());

    Ok(Wallet {
        id,
        tenant_id: row.get("tenant_id"),
        environment_id: row.get("environment_id"),
        customer_id: row.get("customer_id"),
        name: row.get("name"),
        description: row.get("description"),
        currency: row.get("currency"),
        balance: row.get("balance"),
        credit_balance: row.get("credit_balance"),
        conversion_rate: row.get("conversion_rate"),
        wallet_status: row.get("wallet_status"),
        wallet_type: row.get("wallet_type"),
        auto_topup_trigger: row.get::<Option<AutoTopupTrigger>, _>("auto_topup_trigger"),
        auto_topup,
        metadata,
        config: row.get("config"),
        status: row.get("status"),
        version: row.get("version"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        created_by: row.get("created_by"),
        updated_by: row.get("updated_by"),
    })
}

fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, scope: &TenantScope, filter: &WalletFilter) {
    push_scope(qb, "", scope);
    push_record_status(qb, &filter.query);
    if let Some(customer_id) = filter.customer_id {
        qb.push(" AND customer_id = ").push_bind(customer_id);
    }
    if !filter.wallet_status.is_empty() {
        let statuses: Vec<String> = filter
            .wallet_status
            .iter()
            .map(|s| s.as_ref().to_string())
            .collect();
        qb.push(" AND wallet_status::text = ANY(")
            .push_bind(statuses)
            .push(")");
    }
    if let Some(currency) = &filter.currency {
        qb.push(" AND currency = ")
            .push_bind(currency.trim().to_ascii_lowercase());
    }
    if !filter.wallet_ids.is_empty() {
        qb.push(" AND id = ANY(")
            .push_bind(filter.wallet_ids.clone())
            .push(")");
    }
}

#[async_trait]
impl WalletRepo for PostgresPersistence {
    async fn create(&self, wallet: &Wallet) -> AppResult<()> {
        let threshold = wallet.auto_topup.as_ref();
        sqlx::query(
            r#"
            INSERT INTO wallets (
                id, tenant_id, environment_id, customer_id, name, description, currency,
                balance, credit_balance, conversion_rate, wallet_status, wallet_type,
                auto_topup_trigger, auto_topup_min_balance, auto_topup_amount, topup_denomination,
                metadata, config, status, version, created_at, updated_at, created_by, updated_by
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                    $17, $18, $19, $20, $21, $22, $23, $24)
            "#,
        )
        .bind(wallet.id)
        .bind(&wallet.tenant_id)
        .bind(&wallet.environment_id)
        .bind(wallet.customer_id)
        .bind(&wallet.name)
        .bind(&wallet.description)
        .bind(&wallet.currency)
        .bind(wallet.balance)
        .bind(wallet.credit_balance)
        .bind(wallet.conversion_rate)
        .bind(wallet.wallet_status)
        .bind(wallet.wallet_type)
        .bind(wallet.auto_topup_trigger)
        .bind(threshold.map(|t| t.min_balance()))
        .bind(threshold.map(|t| t.amount()))
        .bind(threshold.map(|t| t.denomination()).unwrap_or_default())
        .bind(metadata_json(&wallet.metadata)?)
        .bind(&wallet.config)
        .bind(wallet.status)
        .bind(wallet.version)
        .bind(wallet.created_at)
        .bind(wallet.updated_at)
        .bind(&wallet.created_by)
        .bind(&wallet.updated_by)
        .execute(&self.pool)
        .await
        .map_err(AppError::from)?;
        Ok(())
    }

    async fn get_by_id(&self, scope: &TenantScope, id: Uuid) -> AppResult<Option<Wallet>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM wallets WHERE id = $1 AND tenant_id = $2 AND environment_id = $3",
            SELECT_COLS
        ))
        .bind(id)
        .bind(scope.tenant_id())
        .bind(scope.environment_id())
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::from)?;
        row.as_ref().map(row_to_wallet).transpose()
    }

    async fn list(&self, scope: &TenantScope, filter: &WalletFilter) -> AppResult<Vec<Wallet>> {
        let mut qb = QueryBuilder::<Postgres>::new(format!("SELECT {} FROM wallets", SELECT_COLS));
        push_filter(&mut qb, scope, filter);
        push_order_and_page(&mut qb, &filter.query);

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(AppError::from)?;
        rows.iter().map(row_to_wallet).collect()
    }

    async fn count(&self, scope: &TenantScope, filter: &WalletFilter) -> AppResult<i64> {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM wallets");
        push_filter(&mut qb, scope, filter);

        let count: i64 = qb
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .map_err(AppError::from)?;
        Ok(count)
    }

    async fn update(
        &self,
        scope: &TenantScope,
        wallet: &Wallet,
        expected_version: i64,
    ) -> AppResult<Option<Wallet>> {
        let threshold = wallet.auto_topup.as_ref();
        let row = sqlx::query(&format!(
            r#"
            UPDATE wallets
            SET name = $5, description = $6, wallet_status = $7,
                auto_topup_trigger = $8, auto_topup_min_balance = $9, auto_topup_amount = $10,
                topup_denomination = $11, metadata = $12, config = $13, status = $14,
                updated_at = $15, updated_by = $16, version = version + 1
            WHERE id = $1 AND tenant_id = $2 AND environment_id = $3 AND version = $4
            RETURNING {}
            "#,
            SELECT_COLS
        ))
        .bind(wallet.id)
        .bind(scope.tenant_id())
        .bind(scope.environment_id())
        .bind(expected_version)
        .bind(&wallet.name)
        .bind(&wallet.description)
        .bind(wallet.wallet_status)
        .bind(wallet.auto_topup_trigger)
        .bind(threshold.map(|t| t.min_balance()))
        .bind(threshold.map(|t| t.amount()))
        .bind(threshold.map(|t| t.denomination()).unwrap_or_default())
        .bind(metadata_json(&wallet.metadata)?)
        .bind(&wallet.config)
        .bind(wallet.status)
        .bind(wallet.updated_at)
        .bind(&wallet.updated_by)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::from)?;
        row.as_ref().map(row_to_wallet).transpose()
    }

    async fn update_balances(
        &self,
        scope: &TenantScope,
        id: Uuid,
        expected_version: i64,
        update: &BalanceUpdate,
    ) -> AppResult<Option<Wallet>> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE wallets
            SET balance = $5, credit_balance = $6, updated_at = $7, updated_by = $8,
                version = version + 1
            WHERE id = $1 AND tenant_id = $2 AND environment_id = $3 AND version = $4
            RETURNING {}
            "#,
            SELECT_COLS
        ))
        .bind(id)
        .bind(scope.tenant_id())
        .bind(scope.environment_id())
        .bind(expected_version)
        .bind(update.pools.balance)
        .bind(update.pools.credit_balance)
        .bind(update.updated_at)
        .bind(&update.updated_by)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::from)?;
        row.as_ref().map(row_to_wallet).transpose()
    }
}
