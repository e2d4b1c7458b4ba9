//! Test data factories for creating valid test fixtures.
//!
//! Each factory function creates a complete, valid object with sensible defaults.
//! Use the closure parameter to override specific fields as needed.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, TimeZone, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::{
    application::{
        scope::TenantScope,
        use_cases::subscription::{CreateLineItemInput, CreateSubscriptionInput},
    },
    domain::entities::{
        record_status::RecordStatus,
        subscription::{
            BillingCadence, BillingPeriod, Subscription, SubscriptionLineItem, SubscriptionStatus,
        },
        subscription_pause::{PauseStatus, SubscriptionPause},
        wallet::{Wallet, WalletStatus, WalletType},
    },
};

pub const TEST_TENANT: &str = "tenant_test";
pub const TEST_ENVIRONMENT: &str = "env_test";

/// Scope every factory below stamps onto its records.
pub fn test_scope() -> TenantScope {
    TenantScope::new(TEST_TENANT, TEST_ENVIRONMENT)
        .expect("valid test scope")
        .with_actor("user_test")
}

pub fn other_tenant_scope() -> TenantScope {
    TenantScope::new("tenant_other", TEST_ENVIRONMENT).expect("valid test scope")
}

/// Create a test wallet with sensible defaults.
pub fn create_test_wallet(overrides: impl FnOnce(&mut Wallet)) -> Wallet {
    let now = test_datetime();
    let mut wallet = Wallet {
        id: Uuid::new_v4(),
        tenant_id: TEST_TENANT.to_string(),
        environment_id: TEST_ENVIRONMENT.to_string(),
        customer_id: Uuid::new_v4(),
        name: "Prepaid Wallet".to_string(),
        description: None,
        currency: "usd".to_string(),
        balance: Decimal::ZERO,
        credit_balance: Decimal::ZERO,
        conversion_rate: Decimal::ONE,
        wallet_status: WalletStatus::Active,
        wallet_type: WalletType::Prepaid,
        auto_topup_trigger: None,
        auto_topup: None,
        metadata: BTreeMap::new(),
        config: serde_json::json!({}),
        status: RecordStatus::Published,
        version: 1,
        created_at: now,
        updated_at: now,
        created_by: Some("user_test".to_string()),
        updated_by: Some("user_test".to_string()),
    };
    overrides(&mut wallet);
    wallet
}

/// Create a test subscription with sensible defaults.
pub fn create_test_subscription(overrides: impl FnOnce(&mut Subscription)) -> Subscription {
    let now = test_datetime();
    let mut subscription = Subscription {
        id: Uuid::new_v4(),
        tenant_id: TEST_TENANT.to_string(),
        environment_id: TEST_ENVIRONMENT.to_string(),
        customer_id: Uuid::new_v4(),
        plan_id: Uuid::new_v4(),
        currency: "usd".to_string(),
        subscription_status: SubscriptionStatus::Active,
        billing_cadence: BillingCadence::Recurring,
        billing_period: BillingPeriod::Monthly,
        billing_period_count: 1,
        start_date: now,
        end_date: None,
        current_period_start: now,
        current_period_end: test_datetime_offset_days(30),
        cancelled_at: None,
        pause_status: PauseStatus::None,
        active_pause_id: None,
        metadata: BTreeMap::new(),
        status: RecordStatus::Published,
        version: 1,
        created_at: now,
        updated_at: now,
        created_by: None,
        updated_by: None,
    };
    overrides(&mut subscription);
    subscription
}

/// Create a test line item belonging to `subscription`.
pub fn create_test_line_item(
    subscription: &Subscription,
    position: i32,
    overrides: impl FnOnce(&mut SubscriptionLineItem),
) -> SubscriptionLineItem {
    let mut item = SubscriptionLineItem {
        id: Uuid::new_v4(),
        subscription_id: subscription.id,
        tenant_id: subscription.tenant_id.clone(),
        environment_id: subscription.environment_id.clone(),
        price_id: Uuid::new_v4(),
        display_name: Some(format!("Component {position}")),
        quantity: Decimal::ONE,
        currency: subscription.currency.clone(),
        billing_period: subscription.billing_period,
        start_date: subscription.start_date,
        end_date: None,
        position,
        metadata: BTreeMap::new(),
        status: RecordStatus::Published,
        created_at: subscription.created_at,
        updated_at: subscription.created_at,
        created_by: None,
        updated_by: None,
    };
    overrides(&mut item);
    item
}

/// Create a test pause for `subscription`, scheduled one day out for a week.
pub fn create_test_pause(
    subscription: &Subscription,
    overrides: impl FnOnce(&mut SubscriptionPause),
) -> SubscriptionPause {
    let mut pause = SubscriptionPause {
        id: Uuid::new_v4(),
        subscription_id: subscription.id,
        tenant_id: subscription.tenant_id.clone(),
        environment_id: subscription.environment_id.clone(),
        pause_status: PauseStatus::Scheduled,
        pause_start: test_datetime_offset_days(1),
        pause_end: test_datetime_offset_days(8),
        resumed_at: None,
        reason: None,
        metadata: BTreeMap::new(),
        status: RecordStatus::Published,
        created_at: test_datetime(),
        updated_at: test_datetime(),
        created_by: None,
        updated_by: None,
    };
    overrides(&mut pause);
    pause
}

/// Input for a monthly recurring subscription starting at the test epoch.
pub fn create_subscription_input(
    overrides: impl FnOnce(&mut CreateSubscriptionInput),
) -> CreateSubscriptionInput {
    let mut input = CreateSubscriptionInput {
        customer_id: Uuid::new_v4(),
        plan_id: Uuid::new_v4(),
        currency: "usd".to_string(),
        subscription_status: SubscriptionStatus::Active,
        billing_cadence: BillingCadence::Recurring,
        billing_period: BillingPeriod::Monthly,
        billing_period_count: 1,
        start_date: test_datetime(),
        end_date: None,
        metadata: BTreeMap::new(),
    };
    overrides(&mut input);
    input
}

pub fn create_line_item_input(name: &str, quantity: Decimal) -> CreateLineItemInput {
    CreateLineItemInput {
        price_id: Uuid::new_v4(),
        display_name: Some(name.to_string()),
        quantity,
        billing_period: None,
        start_date: None,
        end_date: None,
        metadata: BTreeMap::new(),
    }
}

/// Fixed reference instant for deterministic tests.
pub fn test_datetime() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 15, 12, 0, 0)
        .single()
        .expect("valid test datetime")
}

pub fn test_datetime_offset_days(days: i64) -> DateTime<Utc> {
    test_datetime() + Duration::days(days)
}
