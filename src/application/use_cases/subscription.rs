use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::{
    app_error::{AppError, AppResult, ResultExt},
    application::{
        clock::Clock,
        filter::{EntityFilter, Page, QueryFilter, Record, SortOrder, TimeRangeFilter},
        scope::{TenantOwned, TenantScope},
        validators::{normalize_currency, validate_metadata},
    },
    domain::entities::{
        record_status::RecordStatus,
        subscription::{
            BillingCadence, BillingPeriod, Subscription, SubscriptionLineItem,
            SubscriptionStatus, SubscriptionWithLineItems, SubscriptionWithPauses,
        },
        subscription_pause::{PauseStatus, SubscriptionPause},
    },
};

#[async_trait]
pub trait SubscriptionRepo: Send + Sync {
    async fn create(&self, subscription: &Subscription) -> AppResult<()>;
    /// Inserts the subscription and every line item, or nothing at all.
    async fn create_with_line_items(
        &self,
        subscription: &Subscription,
        line_items: &[SubscriptionLineItem],
    ) -> AppResult<()>;
    async fn get_by_id(&self, scope: &TenantScope, id: Uuid) -> AppResult<Option<Subscription>>;
    /// Line items ordered by `position`.
    async fn get_with_line_items(
        &self,
        scope: &TenantScope,
        id: Uuid,
    ) -> AppResult<Option<SubscriptionWithLineItems>>;
    /// Pauses ordered by creation.
    async fn get_with_pauses(
        &self,
        scope: &TenantScope,
        id: Uuid,
    ) -> AppResult<Option<SubscriptionWithPauses>>;
    async fn list(
        &self,
        scope: &TenantScope,
        filter: &SubscriptionFilter,
    ) -> AppResult<Vec<SubscriptionWithLineItems>>;
    async fn count(&self, scope: &TenantScope, filter: &SubscriptionFilter) -> AppResult<i64>;
    /// Writes lifecycle and descriptive fields; the pause mirror is only
    /// written through the pause operations. `None` on a version mismatch.
    async fn update(
        &self,
        scope: &TenantScope,
        subscription: &Subscription,
        expected_version: i64,
    ) -> AppResult<Option<Subscription>>;
    /// Removes the subscription and its line items. Returns `false` when absent.
    async fn delete(
        &self,
        scope: &TenantScope,
        id: Uuid,
        retention: PauseRetention,
    ) -> AppResult<bool>;

    /// Inserts a pause and writes the owning subscription in one unit.
    /// `Conflict` if the subscription already has an open pause.
    async fn create_pause(
        &self,
        scope: &TenantScope,
        write: &PauseWrite,
    ) -> AppResult<Option<Subscription>>;
    async fn get_pause(&self, scope: &TenantScope, id: Uuid) -> AppResult<Option<SubscriptionPause>>;
    /// Replaces a pause row and writes the owning subscription in one unit.
    async fn update_pause(
        &self,
        scope: &TenantScope,
        write: &PauseWrite,
    ) -> AppResult<Option<Subscription>>;
    async fn list_pauses(
        &self,
        scope: &TenantScope,
        filter: &PauseFilter,
    ) -> AppResult<Vec<SubscriptionPause>>;
    /// Pauses in `status` whose relevant boundary is at or before `now`:
    /// `pause_start` for scheduled, `pause_end` for active.
    async fn list_due_pauses(
        &self,
        scope: &TenantScope,
        status: PauseStatus,
        now: DateTime<Utc>,
    ) -> AppResult<Vec<SubscriptionPause>>;
    /// Scopes holding at least one due pause. Unscoped; used by the sweeper only.
    async fn list_due_pause_scopes(&self, now: DateTime<Utc>) -> AppResult<Vec<TenantScope>>;
}

/// What happens to a deleted subscription's pause history.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PauseRetention {
    #[default]
    Retain,
    Purge,
}

/// A pause row plus the subscription state it implies, committed together
/// when the stored subscription is still at `expected_version`.
#[derive(Debug, Clone)]
pub struct PauseWrite {
    pub pause: SubscriptionPause,
    pub subscription: Subscription,
    pub expected_version: i64,
}

#[derive(Debug, Clone, Default)]
pub struct SubscriptionFilter {
    pub query: QueryFilter,
    pub customer_id: Option<Uuid>,
    pub plan_id: Option<Uuid>,
    pub subscription_status: Vec<SubscriptionStatus>,
    pub billing_cadence: Vec<BillingCadence>,
    pub billing_period: Vec<BillingPeriod>,
    pub time_range: TimeRangeFilter,
    pub subscription_ids: Vec<Uuid>,
    /// Only consulted when `subscription_status` is empty.
    pub include_cancelled: bool,
    pub active_at: Option<DateTime<Utc>>,
}

impl SubscriptionFilter {
    pub fn unlimited() -> Self {
        Self {
            query: QueryFilter::unlimited(),
            ..Self::default()
        }
    }
}

impl EntityFilter<Subscription> for SubscriptionFilter {
    fn query(&self) -> &QueryFilter {
        &self.query
    }

    fn matches(&self, sub: &Subscription) -> bool {
        let status_ok = if self.subscription_status.is_empty() {
            self.include_cancelled || sub.subscription_status != SubscriptionStatus::Cancelled
        } else {
            self.subscription_status.contains(&sub.subscription_status)
        };

        status_ok
            && self.customer_id.is_none_or(|id| sub.customer_id == id)
            && self.plan_id.is_none_or(|id| sub.plan_id == id)
            && (self.billing_cadence.is_empty() || self.billing_cadence.contains(&sub.billing_cadence))
            && (self.billing_period.is_empty() || self.billing_period.contains(&sub.billing_period))
            && self.time_range.contains(sub.created_at)
            && (self.subscription_ids.is_empty() || self.subscription_ids.contains(&sub.id))
            && self.active_at.is_none_or(|at| sub.is_active_at(at))
    }

    fn validate(&self) -> AppResult<()> {
        self.query.validate()?;
        self.time_range.validate()
    }
}

#[derive(Debug, Clone)]
pub struct PauseFilter {
    pub query: QueryFilter,
    pub subscription_id: Option<Uuid>,
    pub pause_status: Vec<PauseStatus>,
}

impl PauseFilter {
    /// Whole history of one subscription, oldest first.
    pub fn for_subscription(subscription_id: Uuid) -> Self {
        Self {
            query: QueryFilter {
                order: SortOrder::Asc,
                record_status: None,
                ..QueryFilter::unlimited()
            },
            subscription_id: Some(subscription_id),
            pause_status: Vec::new(),
        }
    }
}

impl EntityFilter<SubscriptionPause> for PauseFilter {
    fn query(&self) -> &QueryFilter {
        &self.query
    }

    fn matches(&self, pause: &SubscriptionPause) -> bool {
        self.subscription_id.is_none_or(|id| pause.subscription_id == id)
            && (self.pause_status.is_empty() || self.pause_status.contains(&pause.pause_status))
    }
}

macro_rules! scoped_record {
    ($ty:ty) => {
        impl TenantOwned for $ty {
            fn tenant_id(&self) -> &str {
                &self.tenant_id
            }

            fn environment_id(&self) -> &str {
                &self.environment_id
            }
        }

        impl Record for $ty {
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
    };
}

scoped_record!(Subscription);
scoped_record!(SubscriptionLineItem);
scoped_record!(SubscriptionPause);

#[derive(Debug, Clone)]
pub struct CreateSubscriptionInput {
    pub customer_id: Uuid,
    pub plan_id: Uuid,
    pub currency: String,
    pub subscription_status: SubscriptionStatus,
    pub billing_cadence: BillingCadence,
    pub billing_period: BillingPeriod,
    pub billing_period_count: i32,
    pub start_date: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct CreateLineItemInput {
    pub price_id: Uuid,
    pub display_name: Option<String>,
    pub quantity: Decimal,
    /// Defaults to the subscription's period.
    pub billing_period: Option<BillingPeriod>,
    /// Defaults to the subscription's start.
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateSubscriptionInput {
    pub subscription_status: Option<SubscriptionStatus>,
    pub end_date: Option<DateTime<Utc>>,
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub metadata: Option<BTreeMap<String, String>>,
}

/// Subscription + line items + pauses as one unit of consistency.
#[derive(Clone)]
pub struct SubscriptionAggregateStore {
    repo: Arc<dyn SubscriptionRepo>,
    clock: Arc<dyn Clock>,
    max_retries: u32,
}

impl SubscriptionAggregateStore {
    pub fn new(repo: Arc<dyn SubscriptionRepo>, clock: Arc<dyn Clock>, max_retries: u32) -> Self {
        Self {
            repo,
            clock,
            max_retries,
        }
    }

    #[instrument(skip(self, input), fields(tenant_id = %scope.tenant_id()))]
    pub async fn create(
        &self,
        scope: &TenantScope,
        input: CreateSubscriptionInput,
    ) -> AppResult<Subscription> {
        let subscription = self.build_subscription(scope, input)?;
        scope
            .bounded(self.repo.create(&subscription))
            .await
            .for_entity("subscription", subscription.id)?;
        info!(subscription_id = %subscription.id, "Subscription created");
        Ok(subscription)
    }

    /// All-or-nothing: a rejected line item leaves no subscription behind.
    #[instrument(skip(self, input, items), fields(tenant_id = %scope.tenant_id(), item_count = items.len()))]
    pub async fn create_with_line_items(
        &self,
        scope: &TenantScope,
        input: CreateSubscriptionInput,
        items: Vec<CreateLineItemInput>,
    ) -> AppResult<SubscriptionWithLineItems> {
        let subscription = self.build_subscription(scope, input)?;
        let line_items = items
            .into_iter()
            .enumerate()
            .map(|(position, item)| build_line_item(&subscription, position, item))
            .collect::<AppResult<Vec<_>>>()?;

        scope
            .bounded(self.repo.create_with_line_items(&subscription, &line_items))
            .await
            .for_entity("subscription", subscription.id)?;
        info!(
            subscription_id = %subscription.id,
            line_items = line_items.len(),
            "Subscription created with line items"
        );
        Ok(SubscriptionWithLineItems {
            subscription,
            line_items,
        })
    }

    pub async fn get(&self, scope: &TenantScope, id: Uuid) -> AppResult<Subscription> {
        scope
            .bounded(self.repo.get_by_id(scope, id))
            .await
            .for_entity("subscription", id)?
            .ok_or(AppError::NotFound)
    }

    pub async fn get_with_line_items(
        &self,
        scope: &TenantScope,
        id: Uuid,
    ) -> AppResult<SubscriptionWithLineItems> {
        scope
            .bounded(self.repo.get_with_line_items(scope, id))
            .await
            .for_entity("subscription", id)?
            .ok_or(AppError::NotFound)
    }

    pub async fn get_with_pauses(
        &self,
        scope: &TenantScope,
        id: Uuid,
    ) -> AppResult<SubscriptionWithPauses> {
        scope
            .bounded(self.repo.get_with_pauses(scope, id))
            .await
            .for_entity("subscription", id)?
            .ok_or(AppError::NotFound)
    }

    #[instrument(skip(self, filter), fields(tenant_id = %scope.tenant_id()))]
    pub async fn list(
        &self,
        scope: &TenantScope,
        filter: &SubscriptionFilter,
    ) -> AppResult<Vec<SubscriptionWithLineItems>> {
        filter.validate()?;
        scope
            .bounded(self.repo.list(scope, filter))
            .await
            .for_entity("subscription", "list")
    }

    pub async fn count(&self, scope: &TenantScope, filter: &SubscriptionFilter) -> AppResult<i64> {
        filter.validate()?;
        scope
            .bounded(self.repo.count(scope, filter))
            .await
            .for_entity("subscription", "count")
    }

    /// Same predicates as `filter`, without a page bound. For batch jobs.
    pub async fn list_all(
        &self,
        scope: &TenantScope,
        filter: &SubscriptionFilter,
    ) -> AppResult<Vec<SubscriptionWithLineItems>> {
        let mut filter = filter.clone();
        filter.query.page = Page::Unlimited;
        self.list(scope, &filter).await
    }

    /// Billable subscriptions (active or trialing) of one customer.
    pub async fn list_by_customer(
        &self,
        scope: &TenantScope,
        customer_id: Uuid,
    ) -> AppResult<Vec<SubscriptionWithLineItems>> {
        let filter = SubscriptionFilter {
            customer_id: Some(customer_id),
            subscription_status: vec![SubscriptionStatus::Active, SubscriptionStatus::Trialing],
            ..SubscriptionFilter::unlimited()
        };
        self.list(scope, &filter).await
    }

    pub async fn list_by_ids(
        &self,
        scope: &TenantScope,
        ids: &[Uuid],
    ) -> AppResult<Vec<SubscriptionWithLineItems>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let filter = SubscriptionFilter {
            subscription_ids: ids.to_vec(),
            include_cancelled: true,
            ..SubscriptionFilter::unlimited()
        };
        self.list(scope, &filter).await
    }

    #[instrument(skip(self, input), fields(tenant_id = %scope.tenant_id()))]
    pub async fn update(
        &self,
        scope: &TenantScope,
        id: Uuid,
        input: UpdateSubscriptionInput,
    ) -> AppResult<Subscription> {
        if let Some(metadata) = &input.metadata {
            validate_metadata(metadata.keys())?;
        }
        let now = self.clock.now();
        self.mutate(scope, id, |sub| {
            if let Some(next) = input.subscription_status {
                change_status(sub, next, now)?;
            }
            if let Some(end_date) = input.end_date {
                sub.end_date = Some(end_date);
            }
            if let Some(start) = input.current_period_start {
                sub.current_period_start = start;
            }
            if let Some(end) = input.current_period_end {
                sub.current_period_end = end;
            }
            if let Some(metadata) = &input.metadata {
                sub.metadata = metadata.clone();
            }
            validate_window(sub)
        })
        .await
    }

    /// Terminal cancellation. An open pause is left for the pause sweep to close.
    #[instrument(skip(self), fields(tenant_id = %scope.tenant_id()))]
    pub async fn cancel(
        &self,
        scope: &TenantScope,
        id: Uuid,
        at: Option<DateTime<Utc>>,
    ) -> AppResult<Subscription> {
        let at = at.unwrap_or_else(|| self.clock.now());
        let cancelled = self
            .mutate(scope, id, |sub| change_status(sub, SubscriptionStatus::Cancelled, at))
            .await?;
        info!(subscription_id = %id, "Subscription cancelled");
        Ok(cancelled)
    }

    #[instrument(skip(self), fields(tenant_id = %scope.tenant_id()))]
    pub async fn delete(
        &self,
        scope: &TenantScope,
        id: Uuid,
        retention: PauseRetention,
    ) -> AppResult<()> {
        let removed = scope
            .bounded(self.repo.delete(scope, id, retention))
            .await
            .for_entity("subscription", id)?;
        if !removed {
            return Err(AppError::NotFound);
        }
        info!(subscription_id = %id, ?retention, "Subscription deleted");
        Ok(())
    }

    async fn mutate<F>(&self, scope: &TenantScope, id: Uuid, mut apply: F) -> AppResult<Subscription>
    where
        F: FnMut(&mut Subscription) -> AppResult<()> + Send,
    {
        for attempt in 0..=self.max_retries {
            let current = self.get(scope, id).await?;
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
                .for_entity("subscription", id)?;
            match written {
                Some(updated) => return Ok(updated),
                None => debug!(subscription_id = %id, attempt, "Subscription version moved, retrying"),
            }
        }
        Err(AppError::Conflict(format!(
            "subscription {id} is being modified concurrently"
        )))
    }

    fn build_subscription(
        &self,
        scope: &TenantScope,
        input: CreateSubscriptionInput,
    ) -> AppResult<Subscription> {
        let currency = normalize_currency(&input.currency)?;
        validate_metadata(input.metadata.keys())?;
        if input.billing_period_count < 1 {
            return Err(AppError::InvalidInput(
                "billing_period_count must be at least 1".into(),
            ));
        }
        if input.subscription_status == SubscriptionStatus::Paused {
            return Err(AppError::InvalidInput(
                "subscriptions are paused through a pause, not at creation".into(),
            ));
        }

        let now = self.clock.now();
        let actor = scope.actor().map(str::to_owned);
        let subscription = Subscription {
            id: Uuid::new_v4(),
            tenant_id: scope.tenant_id().to_string(),
            environment_id: scope.environment_id().to_string(),
            customer_id: input.customer_id,
            plan_id: input.plan_id,
            currency,
            cancelled_at: (input.subscription_status == SubscriptionStatus::Cancelled)
                .then_some(now),
            subscription_status: input.subscription_status,
            billing_cadence: input.billing_cadence,
            billing_period: input.billing_period,
            billing_period_count: input.billing_period_count,
            start_date: input.start_date,
            end_date: input.end_date,
            current_period_start: input.start_date,
            current_period_end: input.end_date.unwrap_or(input.start_date),
            pause_status: PauseStatus::None,
            active_pause_id: None,
            metadata: input.metadata,
            status: RecordStatus::Published,
            version: 1,
            created_at: now,
            updated_at: now,
            created_by: actor.clone(),
            updated_by: actor,
        };
        validate_window(&subscription)?;
        Ok(subscription)
    }
}

/// Status edits through `update`. `paused` is owned by the pause machine.
fn change_status(
    sub: &mut Subscription,
    next: SubscriptionStatus,
    at: DateTime<Utc>,
) -> AppResult<()> {
    let current = sub.subscription_status;
    if current == next {
        return Ok(());
    }
    if next == SubscriptionStatus::Paused
        || (current == SubscriptionStatus::Paused && next != SubscriptionStatus::Cancelled)
        || current.is_terminal()
    {
        return Err(AppError::invalid_transition(current, next));
    }
    sub.subscription_status = next;
    if next == SubscriptionStatus::Cancelled {
        sub.cancelled_at = Some(at);
    }
    Ok(())
}

fn validate_window(sub: &Subscription) -> AppResult<()> {
    if let Some(end) = sub.end_date {
        if end < sub.start_date {
            return Err(AppError::InvalidInput(
                "end_date must not be before start_date".into(),
            ));
        }
    }
    Ok(())
}

fn build_line_item(
    subscription: &Subscription,
    position: usize,
    input: CreateLineItemInput,
) -> AppResult<SubscriptionLineItem> {
    if input.quantity < Decimal::ZERO {
        return Err(AppError::InvalidInput(format!(
            "line item {position}: quantity must not be negative"
        )));
    }
    validate_metadata(input.metadata.keys())?;
    let start_date = input.start_date.unwrap_or(subscription.start_date);
    if input.end_date.is_some_and(|end| end < start_date) {
        return Err(AppError::InvalidInput(format!(
            "line item {position}: end_date must not be before start_date"
        )));
    }
    let position = i32::try_from(position)
        .map_err(|_| AppError::InvalidInput("too many line items".into()))?;

    Ok(SubscriptionLineItem {
        id: Uuid::new_v4(),
        subscription_id: subscription.id,
        tenant_id: subscription.tenant_id.clone(),
        environment_id: subscription.environment_id.clone(),
        price_id: input.price_id,
        display_name: input.display_name,
        quantity: input.quantity,
        currency: subscription.currency.clone(),
        billing_period: input.billing_period.unwrap_or(subscription.billing_period),
        start_date,
        end_date: input.end_date,
        position,
        metadata: input.metadata,
        status: RecordStatus::Published,
        created_at: subscription.created_at,
        updated_at: subscription.created_at,
        created_by: subscription.created_by.clone(),
        updated_by: subscription.created_by.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{
        create_line_item_input, create_subscription_input, create_test_line_item,
        create_test_subscription, other_tenant_scope, subscription_harness, test_datetime,
        test_datetime_offset_days, test_scope,
    };
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn line_items_round_trip_in_order() {
        let h = subscription_harness();
        let scope = test_scope();
        let items = vec![
            create_line_item_input("Seats", dec!(5)),
            create_line_item_input("Storage", dec!(1.5)),
            create_line_item_input("Support", dec!(1)),
        ];

        let created = h
            .subscriptions
            .create_with_line_items(&scope, create_subscription_input(|_| {}), items.clone())
            .await
            .unwrap();
        let loaded = h
            .subscriptions
            .get_with_line_items(&scope, created.subscription.id)
            .await
            .unwrap();

        assert_eq!(loaded, created);
        let names: Vec<_> = loaded
            .line_items
            .iter()
            .map(|i| i.display_name.clone().unwrap())
            .collect();
        assert_eq!(names, ["Seats", "Storage", "Support"]);
        for (item, input) in loaded.line_items.iter().zip(&items) {
            assert_eq!(item.price_id, input.price_id);
            assert_eq!(item.quantity, input.quantity);
        }
    }

    #[tokio::test]
    async fn rejected_line_item_creates_nothing() {
        let h = subscription_harness();
        let scope = test_scope();
        let customer = Uuid::new_v4();
        let items = vec![
            create_line_item_input("Seats", dec!(5)),
            create_line_item_input("Broken", dec!(-1)),
        ];

        let result = h
            .subscriptions
            .create_with_line_items(
                &scope,
                create_subscription_input(|i| i.customer_id = customer),
                items,
            )
            .await;
        assert!(matches!(result, Err(AppError::InvalidInput(_))));

        let filter = SubscriptionFilter {
            customer_id: Some(customer),
            include_cancelled: true,
            ..SubscriptionFilter::default()
        };
        assert_eq!(h.subscriptions.count(&scope, &filter).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn duplicate_line_item_rolls_back_subscription() {
        let h = subscription_harness();
        let scope = test_scope();
        let subscription = create_test_subscription(|_| {});
        let first = create_test_line_item(&subscription, 0, |_| {});
        let duplicate = create_test_line_item(&subscription, 1, |i| i.id = first.id);

        let result = h
            .store
            .create_with_line_items(&subscription, &[first, duplicate])
            .await;
        assert!(matches!(result, Err(AppError::AlreadyExists(_))));
        assert!(matches!(
            h.subscriptions.get(&scope, subscription.id).await,
            Err(AppError::NotFound)
        ));
    }

    #[tokio::test]
    async fn active_at_filter_excludes_cancelled_and_out_of_window() {
        let h = subscription_harness();
        let scope = test_scope();
        let as_of = test_datetime_offset_days(10);

        let inside = create_test_subscription(|s| s.end_date = Some(test_datetime_offset_days(30)));
        let open_ended = create_test_subscription(|s| s.end_date = None);
        let ended = create_test_subscription(|s| s.end_date = Some(test_datetime_offset_days(5)));
        let future = create_test_subscription(|s| s.start_date = test_datetime_offset_days(11));
        let cancelled = create_test_subscription(|s| {
            s.subscription_status = SubscriptionStatus::Cancelled;
            s.cancelled_at = Some(test_datetime());
        });
        for sub in [&inside, &open_ended, &ended, &future, &cancelled] {
            h.store.create(sub).await.unwrap();
        }

        let filter = SubscriptionFilter {
            active_at: Some(as_of),
            include_cancelled: true,
            ..SubscriptionFilter::default()
        };
        let mut ids: Vec<_> = h
            .subscriptions
            .list(&scope, &filter)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.subscription.id)
            .collect();
        ids.sort();
        let mut expected = vec![inside.id, open_ended.id];
        expected.sort();
        assert_eq!(ids, expected);
        assert_eq!(h.subscriptions.count(&scope, &filter).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn cancelled_hidden_unless_requested() {
        let h = subscription_harness();
        let scope = test_scope();
        let customer = Uuid::new_v4();
        for status in [SubscriptionStatus::Active, SubscriptionStatus::Cancelled] {
            let sub = create_test_subscription(|s| {
                s.customer_id = customer;
                s.subscription_status = status;
            });
            h.store.create(&sub).await.unwrap();
        }

        let mut filter = SubscriptionFilter {
            customer_id: Some(customer),
            ..SubscriptionFilter::default()
        };
        assert_eq!(h.subscriptions.count(&scope, &filter).await.unwrap(), 1);
        filter.include_cancelled = true;
        assert_eq!(h.subscriptions.count(&scope, &filter).await.unwrap(), 2);
        filter.subscription_status = vec![SubscriptionStatus::Cancelled];
        assert_eq!(h.subscriptions.count(&scope, &filter).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn tenants_never_see_each_other() {
        let h = subscription_harness();
        let created = h
            .subscriptions
            .create(&test_scope(), create_subscription_input(|_| {}))
            .await
            .unwrap();
        let foreign = other_tenant_scope();

        assert!(matches!(
            h.subscriptions.get(&foreign, created.id).await,
            Err(AppError::NotFound)
        ));
        let everything = SubscriptionFilter {
            subscription_ids: vec![created.id],
            include_cancelled: true,
            ..SubscriptionFilter::unlimited()
        };
        assert!(h.subscriptions.list(&foreign, &everything).await.unwrap().is_empty());
        assert!(matches!(
            h.subscriptions
                .update(&foreign, created.id, UpdateSubscriptionInput::default())
                .await,
            Err(AppError::NotFound)
        ));
        assert!(matches!(
            h.subscriptions
                .delete(&foreign, created.id, PauseRetention::Retain)
                .await,
            Err(AppError::NotFound)
        ));
        assert!(h.subscriptions.get(&test_scope(), created.id).await.is_ok());
    }

    #[tokio::test]
    async fn update_refuses_direct_pause_edits() {
        let h = subscription_harness();
        let scope = test_scope();
        let created = h
            .subscriptions
            .create(&scope, create_subscription_input(|_| {}))
            .await
            .unwrap();

        let result = h
            .subscriptions
            .update(
                &scope,
                created.id,
                UpdateSubscriptionInput {
                    subscription_status: Some(SubscriptionStatus::Paused),
                    ..UpdateSubscriptionInput::default()
                },
            )
            .await;
        assert!(matches!(result, Err(AppError::InvalidTransition { .. })));

        let updated = h
            .subscriptions
            .update(
                &scope,
                created.id,
                UpdateSubscriptionInput {
                    subscription_status: Some(SubscriptionStatus::PastDue),
                    ..UpdateSubscriptionInput::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.subscription_status, SubscriptionStatus::PastDue);
        assert_eq!(updated.version, created.version + 1);
    }

    #[tokio::test]
    async fn cancel_is_terminal() {
        let h = subscription_harness();
        let scope = test_scope();
        let created = h
            .subscriptions
            .create(&scope, create_subscription_input(|_| {}))
            .await
            .unwrap();

        let cancelled = h.subscriptions.cancel(&scope, created.id, None).await.unwrap();
        assert_eq!(cancelled.subscription_status, SubscriptionStatus::Cancelled);
        assert_eq!(cancelled.cancelled_at, Some(test_datetime()));

        let reopen = h
            .subscriptions
            .update(
                &scope,
                created.id,
                UpdateSubscriptionInput {
                    subscription_status: Some(SubscriptionStatus::Active),
                    ..UpdateSubscriptionInput::default()
                },
            )
            .await;
        assert!(matches!(reopen, Err(AppError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn list_by_customer_returns_billable_with_items() {
        let h = subscription_harness();
        let scope = test_scope();
        let customer = Uuid::new_v4();
        for status in [
            SubscriptionStatus::Active,
            SubscriptionStatus::Trialing,
            SubscriptionStatus::PastDue,
        ] {
            h.subscriptions
                .create_with_line_items(
                    &scope,
                    create_subscription_input(|i| {
                        i.customer_id = customer;
                        i.subscription_status = status;
                    }),
                    vec![create_line_item_input("Seats", dec!(2))],
                )
                .await
                .unwrap();
        }

        let listed = h.subscriptions.list_by_customer(&scope, customer).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|s| s.line_items.len() == 1));
        assert!(listed
            .iter()
            .all(|s| s.subscription.subscription_status.is_active()));
    }

    #[tokio::test]
    async fn list_all_ignores_page_bound() {
        let h = subscription_harness();
        let scope = test_scope();
        let plan = Uuid::new_v4();
        for _ in 0..60 {
            h.store
                .create(&create_test_subscription(|s| s.plan_id = plan))
                .await
                .unwrap();
        }
        let filter = SubscriptionFilter {
            plan_id: Some(plan),
            ..SubscriptionFilter::default()
        };

        assert_eq!(h.subscriptions.list(&scope, &filter).await.unwrap().len(), 50);
        assert_eq!(h.subscriptions.list_all(&scope, &filter).await.unwrap().len(), 60);
    }

    #[tokio::test]
    async fn delete_cascades_items_and_honours_retention() {
        let h = subscription_harness();
        let scope = test_scope();
        let created = h
            .subscriptions
            .create_with_line_items(
                &scope,
                create_subscription_input(|_| {}),
                vec![create_line_item_input("Seats", dec!(1))],
            )
            .await
            .unwrap();
        let id = created.subscription.id;
        h.pauses
            .schedule_pause(
                &scope,
                id,
                test_datetime_offset_days(2),
                test_datetime_offset_days(4),
                None,
            )
            .await
            .unwrap();

        h.subscriptions
            .delete(&scope, id, PauseRetention::Retain)
            .await
            .unwrap();
        assert!(matches!(
            h.subscriptions.get_with_line_items(&scope, id).await,
            Err(AppError::NotFound)
        ));
        assert_eq!(h.pauses.list_pauses(&scope, id).await.unwrap().len(), 1);

        let other = h
            .subscriptions
            .create(&scope, create_subscription_input(|_| {}))
            .await
            .unwrap();
        h.pauses
            .schedule_pause(
                &scope,
                other.id,
                test_datetime_offset_days(2),
                test_datetime_offset_days(4),
                None,
            )
            .await
            .unwrap();
        h.subscriptions
            .delete(&scope, other.id, PauseRetention::Purge)
            .await
            .unwrap();
        assert!(h.pauses.list_pauses(&scope, other.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejects_invalid_create_input() {
        let h = subscription_harness();
        let scope = test_scope();

        let inverted = create_subscription_input(|i| {
            i.end_date = Some(test_datetime_offset_days(-1));
        });
        assert!(matches!(
            h.subscriptions.create(&scope, inverted).await,
            Err(AppError::InvalidInput(_))
        ));

        let paused = create_subscription_input(|i| {
            i.subscription_status = SubscriptionStatus::Paused;
        });
        assert!(matches!(
            h.subscriptions.create(&scope, paused).await,
            Err(AppError::InvalidInput(_))
        ));
    }
}
