use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

use super::record_status::RecordStatus;
use super::subscription_pause::{PauseStatus, SubscriptionPause};

#[derive(
    Debug,
    Clone,
    Copy,
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
#[sqlx(type_name = "subscription_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum SubscriptionStatus {
    Active,
    Paused,
    #[serde(alias = "canceled")]
    #[strum(to_string = "cancelled", serialize = "canceled")]
    Cancelled,
    Incomplete,
    IncompleteExpired,
    PastDue,
    Trialing,
    Unpaid,
}

impl SubscriptionStatus {
    /// Returns true if the customer should have access to subscription features
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Active | SubscriptionStatus::Trialing
        )
    }

    /// No billing activity ever resumes from these.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Cancelled | SubscriptionStatus::IncompleteExpired
        )
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
#[sqlx(type_name = "billing_cadence", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum BillingCadence {
    #[default]
    Recurring,
    Onetime,
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
#[sqlx(type_name = "billing_period", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum BillingPeriod {
    Daily,
    Weekly,
    #[default]
    Monthly,
    Annual,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Subscription {
    pub id: Uuid,
    pub tenant_id: String,
    pub environment_id: String,
    pub customer_id: Uuid,
    pub plan_id: Uuid,
    pub currency: String,
    pub subscription_status: SubscriptionStatus,
    pub billing_cadence: BillingCadence,
    pub billing_period: BillingPeriod,
    pub billing_period_count: i32,
    pub start_date: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    pub cancelled_at: Option<DateTime<Utc>>,
    /// Mirror of the open pause's state; `None` when nothing is scheduled or running.
    pub pause_status: PauseStatus,
    pub active_pause_id: Option<Uuid>,
    pub metadata: BTreeMap<String, String>,
    pub status: RecordStatus,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_by: Option<String>,
    pub updated_by: Option<String>,
}

impl Subscription {
    /// `active` status and `start_date <= at <= end_date` (open end allowed).
    pub fn is_active_at(&self, at: DateTime<Utc>) -> bool {
        self.subscription_status == SubscriptionStatus::Active
            && self.start_date <= at
            && self.end_date.is_none_or(|end| end >= at)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubscriptionLineItem {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub tenant_id: String,
    pub environment_id: String,
    pub price_id: Uuid,
    pub display_name: Option<String>,
    pub quantity: Decimal,
    pub currency: String,
    pub billing_period: BillingPeriod,
    pub start_date: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
    /// Zero-based order in which the items were supplied.
    pub position: i32,
    pub metadata: BTreeMap<String, String>,
    pub status: RecordStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_by: Option<String>,
    pub updated_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubscriptionWithLineItems {
    pub subscription: Subscription,
    pub line_items: Vec<SubscriptionLineItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubscriptionWithPauses {
    pub subscription: Subscription,
    pub pauses: Vec<SubscriptionPause>,
}

impl SubscriptionWithPauses {
    /// The single scheduled-or-active pause, if any.
    pub fn open_pause(&self) -> Option<&SubscriptionPause> {
        self.pauses.iter().find(|p| p.pause_status.is_open())
    }
}
