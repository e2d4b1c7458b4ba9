//! Filter → sort → paginate pipeline shared by every aggregate.
//!
//! Each entity gets its own strongly typed filter implementing
//! [`EntityFilter`]. The in-memory stores run [`apply_filter`] and
//! [`count_matching`] directly; the Postgres adapter translates the same
//! filter fields into SQL and reuses [`QueryFilter`] for ordering and paging.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

use crate::{
    app_error::{AppError, AppResult},
    application::scope::{TenantOwned, TenantScope},
    domain::entities::record_status::RecordStatus,
};

pub const DEFAULT_LIMIT: i64 = 50;
pub const MAX_LIMIT: i64 = 1000;

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, AsRefStr, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum SortField {
    #[default]
    CreatedAt,
    UpdatedAt,
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, AsRefStr, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub fn as_sql(&self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Page {
    Limited { limit: i64, offset: i64 },
    /// Batch and cron listings. Predicates and tenant scope still apply.
    Unlimited,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryFilter {
    pub page: Page,
    pub sort: SortField,
    pub order: SortOrder,
    /// `None` matches every record status.
    pub record_status: Option<RecordStatus>,
}

impl Default for QueryFilter {
    fn default() -> Self {
        Self {
            page: Page::Limited {
                limit: DEFAULT_LIMIT,
                offset: 0,
            },
            sort: SortField::default(),
            order: SortOrder::default(),
            record_status: Some(RecordStatus::Published),
        }
    }
}

impl QueryFilter {
    pub fn unlimited() -> Self {
        Self {
            page: Page::Unlimited,
            ..Self::default()
        }
    }

    pub fn paged(limit: i64, offset: i64) -> Self {
        Self {
            page: Page::Limited { limit, offset },
            ..Self::default()
        }
    }

    pub fn sorted_by(mut self, sort: SortField, order: SortOrder) -> Self {
        self.sort = sort;
        self.order = order;
        self
    }

    pub fn validate(&self) -> AppResult<()> {
        if let Page::Limited { limit, offset } = self.page {
            if !(1..=MAX_LIMIT).contains(&limit) {
                return Err(AppError::InvalidInput(format!(
                    "limit must be between 1 and {MAX_LIMIT}"
                )));
            }
            if offset < 0 {
                return Err(AppError::InvalidInput("offset must not be negative".into()));
            }
        }
        Ok(())
    }
}

/// Inclusive bounds on `created_at`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeRangeFilter {
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl TimeRangeFilter {
    pub fn validate(&self) -> AppResult<()> {
        if let (Some(start), Some(end)) = (self.start_time, self.end_time) {
            if start > end {
                return Err(AppError::InvalidInput(
                    "start_time must not be after end_time".into(),
                ));
            }
        }
        Ok(())
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start_time.is_none_or(|start| at >= start) && self.end_time.is_none_or(|end| at <= end)
    }
}

/// Columns every listable record exposes to the engine.
pub trait Record: TenantOwned {
    fn id(&self) -> Uuid;
    fn created_at(&self) -> DateTime<Utc>;
    fn updated_at(&self) -> DateTime<Utc>;
    fn record_status(&self) -> RecordStatus;
}

pub trait EntityFilter<T> {
    fn query(&self) -> &QueryFilter;

    /// Entity-specific predicate. Scope and record status are checked by the engine.
    fn matches(&self, item: &T) -> bool;

    fn validate(&self) -> AppResult<()> {
        self.query().validate()
    }
}

fn admitted<T: Record, F: EntityFilter<T>>(scope: &TenantScope, filter: &F, item: &T) -> bool {
    scope.owns(item)
        && filter
            .query()
            .record_status
            .is_none_or(|status| item.record_status() == status)
        && filter.matches(item)
}

fn compare<T: Record>(query: &QueryFilter, a: &T, b: &T) -> Ordering {
    let by_field = match query.sort {
        SortField::CreatedAt => a.created_at().cmp(&b.created_at()),
        SortField::UpdatedAt => a.updated_at().cmp(&b.updated_at()),
    }
    .then_with(|| a.id().cmp(&b.id()));
    match query.order {
        SortOrder::Asc => by_field,
        SortOrder::Desc => by_field.reverse(),
    }
}

pub fn apply_filter<'a, T, F, I>(items: I, scope: &TenantScope, filter: &F) -> Vec<T>
where
    T: Record + Clone + 'a,
    F: EntityFilter<T>,
    I: IntoIterator<Item = &'a T>,
{
    let query = filter.query();
    let mut matched: Vec<&T> = items
        .into_iter()
        .filter(|item| admitted(scope, filter, *item))
        .collect();
    matched.sort_by(|a, b| compare(query, *a, *b));

    let page: Box<dyn Iterator<Item = &&T>> = match query.page {
        Page::Unlimited => Box::new(matched.iter()),
        Page::Limited { limit, offset } => Box::new(
            matched
                .iter()
                .skip(offset.max(0) as usize)
                .take(limit.max(0) as usize),
        ),
    };
    page.map(|item| (*item).clone()).collect()
}

pub fn count_matching<'a, T, F, I>(items: I, scope: &TenantScope, filter: &F) -> i64
where
    T: Record + 'a,
    F: EntityFilter<T>,
    I: IntoIterator<Item = &'a T>,
{
    items
        .into_iter()
        .filter(|item| admitted(scope, filter, *item))
        .count() as i64
}
