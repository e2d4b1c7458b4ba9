use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

use super::auto_topup::{AutoTopupTrigger, TopupThreshold};
use super::record_status::RecordStatus;
use crate::app_error::{AppError, AppResult};

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    sqlx::Type,
    AsRefStr,
    Display,
    EnumString,
)]
#[sqlx(type_name = "wallet_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum WalletStatus {
    #[default]
    Active,
    Frozen,
    Closed,
}

impl WalletStatus {
    pub fn valid_transitions(&self) -> &'static [WalletStatus] {
        match self {
            WalletStatus::Active => &[WalletStatus::Frozen, WalletStatus::Closed],
            WalletStatus::Frozen => &[WalletStatus::Active, WalletStatus::Closed],
            WalletStatus::Closed => &[],
        }
    }

    pub fn can_transition_to(&self, next: WalletStatus) -> bool {
        self.valid_transitions().contains(&next)
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    sqlx::Type,
    AsRefStr,
    Display,
    EnumString,
)]
#[sqlx(type_name = "wallet_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum WalletType {
    #[default]
    Prepaid,
    Postpaid,
}

/// Which ledger pool a credit lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum WalletPool {
    Balance,
    CreditBalance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolBalances {
    pub balance: Decimal,
    pub credit_balance: Decimal,
}

/// How a debit is spread across the two pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebitSplit {
    pub from_credit_balance: Decimal,
    pub from_balance: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Wallet {
    pub id: Uuid,
    pub tenant_id: String,
    pub environment_id: String,
    pub customer_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    /// Lower-case ISO 4217 code. Fixed at creation.
    pub currency: String,
    pub balance: Decimal,
    pub credit_balance: Decimal,
    pub conversion_rate: Decimal,
    pub wallet_status: WalletStatus,
    pub wallet_type: WalletType,
    pub auto_topup_trigger: Option<AutoTopupTrigger>,
    pub auto_topup: Option<TopupThreshold>,
    pub metadata: BTreeMap<String, String>,
    /// Caller-owned settings, stored as-is. Always a JSON object.
    pub config: serde_json::Value,
    pub status: RecordStatus,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_by: Option<String>,
    pub updated_by: Option<String>,
}

impl Wallet {
    pub fn pools(&self) -> PoolBalances {
        PoolBalances {
            balance: self.balance,
            credit_balance: self.credit_balance,
        }
    }

    pub fn total_available(&self) -> AppResult<Decimal> {
        self.balance
            .checked_add(self.credit_balance)
            .ok_or_else(|| out_of_range("total available"))
    }

    /// Both pools hold nothing.
    pub fn is_empty(&self) -> bool {
        self.balance.is_zero() && self.credit_balance.is_zero()
    }

    pub fn is_active(&self) -> bool {
        self.wallet_status == WalletStatus::Active
    }

    pub fn convert_credit_to_currency(&self, amount: Decimal) -> AppResult<Decimal> {
        amount
            .checked_mul(self.conversion_rate)
            .ok_or_else(|| out_of_range("converted amount"))
    }

    /// Credit pool first, spendable balance for the remainder.
    /// `None` when both pools together cannot cover `amount`.
    pub fn split_debit(&self, amount: Decimal) -> Option<DebitSplit> {
        let from_credit_balance = amount.min(self.credit_balance);
        let from_balance = amount - from_credit_balance;
        if from_balance > self.balance {
            return None;
        }
        Some(DebitSplit {
            from_credit_balance,
            from_balance,
        })
    }

    pub fn pools_after_debit(&self, split: DebitSplit) -> PoolBalances {
        PoolBalances {
            balance: self.balance - split.from_balance,
            credit_balance: self.credit_balance - split.from_credit_balance,
        }
    }

    pub fn pools_after_credit(
        &self,
        amount: Decimal,
        pool: WalletPool,
    ) -> AppResult<PoolBalances> {
        let mut pools = self.pools();
        let target = match pool {
            WalletPool::Balance => &mut pools.balance,
            WalletPool::CreditBalance => &mut pools.credit_balance,
        };
        *target = target
            .checked_add(amount)
            .ok_or_else(|| out_of_range(pool.as_ref()))?;
        Ok(pools)
    }
}

fn out_of_range(what: &str) -> AppError {
    AppError::InvalidInput(format!("{what} exceeds the supported decimal range"))
}
