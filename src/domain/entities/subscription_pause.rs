use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

use super::record_status::RecordStatus;

/// Pause state, both for a single pause record and as the subscription-level mirror.
///
/// `None` is the "no pause" marker and the origin of every new pause instance.
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
#[sqlx(type_name = "pause_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum PauseStatus {
    #[default]
    None,
    Scheduled,
    Active,
    Completed,
    Cancelled,
}

impl PauseStatus {
    /// Valid transitions from this state
    pub fn valid_transitions(&self) -> &'static [PauseStatus] {
        match self {
            PauseStatus::None => &[PauseStatus::Scheduled, PauseStatus::Active],
            PauseStatus::Scheduled => &[PauseStatus::Active, PauseStatus::Cancelled],
            PauseStatus::Active => &[PauseStatus::Completed, PauseStatus::Cancelled],
            PauseStatus::Completed | PauseStatus::Cancelled => &[],
        }
    }

    /// Check if transition to the given state is valid
    pub fn can_transition_to(&self, next: PauseStatus) -> bool {
        self.valid_transitions().contains(&next)
    }

    /// Scheduled or running; at most one per subscription.
    pub fn is_open(&self) -> bool {
        matches!(self, PauseStatus::Scheduled | PauseStatus::Active)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PauseStatus::Completed | PauseStatus::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubscriptionPause {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub tenant_id: String,
    pub environment_id: String,
    pub pause_status: PauseStatus,
    pub pause_start: DateTime<Utc>,
    /// Scheduled resume point.
    pub pause_end: DateTime<Utc>,
    /// When the pause actually ended (completion or cancellation of a running pause).
    pub resumed_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
    pub metadata: BTreeMap<String, String>,
    pub status: RecordStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_by: Option<String>,
    pub updated_by: Option<String>,
}

impl SubscriptionPause {
    pub fn is_due_to_start(&self, now: DateTime<Utc>) -> bool {
        self.pause_status == PauseStatus::Scheduled && self.pause_start <= now
    }

    pub fn is_due_to_resume(&self, now: DateTime<Utc>) -> bool {
        self.pause_status == PauseStatus::Active && self.pause_end <= now
    }
}
