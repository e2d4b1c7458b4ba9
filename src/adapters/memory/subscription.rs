use std::collections::{BTreeSet, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{lock, table::Table};
use crate::{
    app_error::{AppError, AppResult},
    application::{
        scope::TenantScope,
        use_cases::subscription::{
            PauseFilter, PauseRetention, PauseWrite, SubscriptionFilter, SubscriptionRepo,
        },
    },
    domain::entities::{
        subscription::{
            Subscription, SubscriptionLineItem, SubscriptionWithLineItems, SubscriptionWithPauses,
        },
        subscription_pause::{PauseStatus, SubscriptionPause},
    },
};

struct State {
    subscriptions: Table<Subscription>,
    line_items: Table<SubscriptionLineItem>,
    pauses: Table<SubscriptionPause>,
}

impl State {
    fn line_items_of(&self, scope: &TenantScope, subscription_id: Uuid) -> Vec<SubscriptionLineItem> {
        let mut items: Vec<_> = self
            .line_items
            .scoped(scope)
            .filter(|item| item.subscription_id == subscription_id)
            .cloned()
            .collect();
        items.sort_by_key(|item| (item.position, item.id));
        items
    }

    fn pauses_of(&self, scope: &TenantScope, subscription_id: Uuid) -> Vec<SubscriptionPause> {
        let mut pauses: Vec<_> = self
            .pauses
            .scoped(scope)
            .filter(|pause| pause.subscription_id == subscription_id)
            .cloned()
            .collect();
        pauses.sort_by_key(|pause| (pause.created_at, pause.id));
        pauses
    }

    /// Due pauses of subscriptions that still exist.
    fn is_live_and_due(
        &self,
        scope: &TenantScope,
        pause: &SubscriptionPause,
        status: PauseStatus,
        now: DateTime<Utc>,
    ) -> bool {
        let due = match status {
            PauseStatus::Scheduled => pause.is_due_to_start(now),
            PauseStatus::Active => pause.is_due_to_resume(now),
            _ => false,
        };
        due && self.subscriptions.get(scope, pause.subscription_id).is_some()
    }
}

/// Subscriptions, line items and pauses behind a single lock, so aggregate
/// writes commit together.
pub struct InMemorySubscriptionStore {
    state: Mutex<State>,
}

impl Default for InMemorySubscriptionStore {
    fn default() -> Self {
        Self {
            state: Mutex::new(State {
                subscriptions: Table::new("subscription"),
                line_items: Table::new("subscription_line_item"),
                pauses: Table::new("subscription_pause"),
            }),
        }
    }
}

impl InMemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn owner_scope(subscription: &Subscription) -> AppResult<TenantScope> {
    TenantScope::new(&subscription.tenant_id, &subscription.environment_id)
}

/// Writes the fields a pause step is allowed to change.
fn apply_pause_mirror(stored: &mut Subscription, next: &Subscription) {
    stored.subscription_status = next.subscription_status;
    stored.pause_status = next.pause_status;
    stored.active_pause_id = next.active_pause_id;
    stored.updated_at = next.updated_at;
    stored.updated_by = next.updated_by.clone();
    stored.version += 1;
}

#[async_trait]
impl SubscriptionRepo for InMemorySubscriptionStore {
    async fn create(&self, subscription: &Subscription) -> AppResult<()> {
        lock(&self.state, "subscription")?
            .subscriptions
            .insert(subscription.clone())
    }

    async fn create_with_line_items(
        &self,
        subscription: &Subscription,
        line_items: &[SubscriptionLineItem],
    ) -> AppResult<()> {
        let scope = owner_scope(subscription)?;
        let mut state = lock(&self.state, "subscription")?;

        // Validate everything before the first insert.
        state.subscriptions.ensure_vacant(subscription.id)?;
        let mut seen = HashSet::new();
        for item in line_items {
            if item.subscription_id != subscription.id || !scope.owns(item) {
                return Err(AppError::InvalidInput(format!(
                    "line item {} does not belong to subscription {}",
                    item.id, subscription.id
                )));
            }
            state.line_items.ensure_vacant(item.id)?;
            if !seen.insert(item.id) {
                return Err(AppError::AlreadyExists(format!(
                    "subscription_line_item {}",
                    item.id
                )));
            }
        }

        state.subscriptions.insert(subscription.clone())?;
        for item in line_items {
            state.line_items.insert(item.clone())?;
        }
        Ok(())
    }

    async fn get_by_id(&self, scope: &TenantScope, id: Uuid) -> AppResult<Option<Subscription>> {
        Ok(lock(&self.state, "subscription")?
            .subscriptions
            .get(scope, id)
            .cloned())
    }

    async fn get_with_line_items(
        &self,
        scope: &TenantScope,
        id: Uuid,
    ) -> AppResult<Option<SubscriptionWithLineItems>> {
        let state = lock(&self.state, "subscription")?;
        Ok(state
            .subscriptions
            .get(scope, id)
            .map(|subscription| SubscriptionWithLineItems {
                subscription: subscription.clone(),
                line_items: state.line_items_of(scope, id),
            }))
    }

    async fn get_with_pauses(
        &self,
        scope: &TenantScope,
        id: Uuid,
    ) -> AppResult<Option<SubscriptionWithPauses>> {
        let state = lock(&self.state, "subscription")?;
        Ok(state
            .subscriptions
            .get(scope, id)
            .map(|subscription| SubscriptionWithPauses {
                subscription: subscription.clone(),
                pauses: state.pauses_of(scope, id),
            }))
    }

    async fn list(
        &self,
        scope: &TenantScope,
        filter: &SubscriptionFilter,
    ) -> AppResult<Vec<SubscriptionWithLineItems>> {
        let state = lock(&self.state, "subscription")?;
        Ok(state
            .subscriptions
            .list(scope, filter)
            .into_iter()
            .map(|subscription| {
                let line_items = state.line_items_of(scope, subscription.id);
                SubscriptionWithLineItems {
                    subscription,
                    line_items,
                }
            })
            .collect())
    }

    async fn count(&self, scope: &TenantScope, filter: &SubscriptionFilter) -> AppResult<i64> {
        Ok(lock(&self.state, "subscription")?
            .subscriptions
            .count(scope, filter))
    }

    async fn update(
        &self,
        scope: &TenantScope,
        subscription: &Subscription,
        expected_version: i64,
    ) -> AppResult<Option<Subscription>> {
        let mut state = lock(&self.state, "subscription")?;
        let Some(stored) = state.subscriptions.get_mut(scope, subscription.id) else {
            return Err(AppError::NotFound);
        };
        if stored.version != expected_version {
            return Ok(None);
        }
        stored.subscription_status = subscription.subscription_status;
        stored.end_date = subscription.end_date;
        stored.current_period_start = subscription.current_period_start;
        stored.current_period_end = subscription.current_period_end;
        stored.cancelled_at = subscription.cancelled_at;
        stored.metadata = subscription.metadata.clone();
        stored.status = subscription.status;
        stored.updated_at = subscription.updated_at;
        stored.updated_by = subscription.updated_by.clone();
        stored.version += 1;
        Ok(Some(stored.clone()))
    }

    async fn delete(
        &self,
        scope: &TenantScope,
        id: Uuid,
        retention: PauseRetention,
    ) -> AppResult<bool> {
        let mut state = lock(&self.state, "subscription")?;
        if state.subscriptions.remove(scope, id).is_none() {
            return Ok(false);
        }
        state.line_items.retain(|item| item.subscription_id != id);
        if retention == PauseRetention::Purge {
            state.pauses.retain(|pause| pause.subscription_id != id);
        }
        Ok(true)
    }

    async fn create_pause(
        &self,
        scope: &TenantScope,
        write: &PauseWrite,
    ) -> AppResult<Option<Subscription>> {
        let mut state = lock(&self.state, "subscription")?;
        let State {
            subscriptions,
            pauses,
            ..
        } = &mut *state;

        if !scope.owns(&write.pause) || write.pause.subscription_id != write.subscription.id {
            return Err(AppError::InvalidInput(
                "pause does not belong to subscription".into(),
            ));
        }
        let Some(stored) = subscriptions.get_mut(scope, write.subscription.id) else {
            return Err(AppError::NotFound);
        };
        if stored.version != write.expected_version {
            return Ok(None);
        }
        if let Some(open) = pauses
            .scoped(scope)
            .find(|p| p.subscription_id == stored.id && p.pause_status.is_open())
        {
            return Err(AppError::Conflict(format!(
                "subscription {} already has open pause {}",
                stored.id, open.id
            )));
        }

        pauses.insert(write.pause.clone())?;
        apply_pause_mirror(stored, &write.subscription);
        Ok(Some(stored.clone()))
    }

    async fn get_pause(&self, scope: &TenantScope, id: Uuid) -> AppResult<Option<SubscriptionPause>> {
        Ok(lock(&self.state, "subscription")?
            .pauses
            .get(scope, id)
            .cloned())
    }

    async fn update_pause(
        &self,
        scope: &TenantScope,
        write: &PauseWrite,
    ) -> AppResult<Option<Subscription>> {
        let mut state = lock(&self.state, "subscription")?;
        let State {
            subscriptions,
            pauses,
            ..
        } = &mut *state;

        let Some(stored_pause) = pauses.get_mut(scope, write.pause.id) else {
            return Err(AppError::NotFound);
        };
        if stored_pause.subscription_id != write.subscription.id {
            return Err(AppError::InvalidInput(
                "pause does not belong to subscription".into(),
            ));
        }
        let Some(stored) = subscriptions.get_mut(scope, write.subscription.id) else {
            return Err(AppError::NotFound);
        };
        if stored.version != write.expected_version {
            return Ok(None);
        }

        *stored_pause = write.pause.clone();
        apply_pause_mirror(stored, &write.subscription);
        Ok(Some(stored.clone()))
    }

    async fn list_pauses(
        &self,
        scope: &TenantScope,
        filter: &PauseFilter,
    ) -> AppResult<Vec<SubscriptionPause>> {
        Ok(lock(&self.state, "subscription")?.pauses.list(scope, filter))
    }

    async fn list_due_pauses(
        &self,
        scope: &TenantScope,
        status: PauseStatus,
        now: DateTime<Utc>,
    ) -> AppResult<Vec<SubscriptionPause>> {
        let state = lock(&self.state, "subscription")?;
        let mut due: Vec<_> = state
            .pauses
            .scoped(scope)
            .filter(|pause| state.is_live_and_due(scope, pause, status, now))
            .cloned()
            .collect();
        due.sort_by_key(|pause| match status {
            PauseStatus::Active => (pause.pause_end, pause.id),
            _ => (pause.pause_start, pause.id),
        });
        Ok(due)
    }

    async fn list_due_pause_scopes(&self, now: DateTime<Utc>) -> AppResult<Vec<TenantScope>> {
        let state = lock(&self.state, "subscription")?;
        let mut owners = BTreeSet::new();
        for pause in state.pauses.rows() {
            let scope = TenantScope::new(&pause.tenant_id, &pause.environment_id)?;
            if [PauseStatus::Scheduled, PauseStatus::Active]
                .into_iter()
                .any(|status| state.is_live_and_due(&scope, pause, status, now))
            {
                owners.insert((pause.tenant_id.clone(), pause.environment_id.clone()));
            }
        }
        owners
            .into_iter()
            .map(|(tenant_id, environment_id)| TenantScope::new(tenant_id, environment_id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{
        create_test_pause, create_test_subscription, other_tenant_scope, test_datetime_offset_days,
        test_scope,
    };

    #[tokio::test]
    async fn due_scopes_cover_every_tenant_with_work() {
        let store = InMemorySubscriptionStore::new();
        let mine = create_test_subscription(|_| {});
        let theirs = create_test_subscription(|s| s.tenant_id = "tenant_other".into());
        let idle = create_test_subscription(|s| s.tenant_id = "tenant_idle".into());
        for sub in [&mine, &theirs, &idle] {
            store.create(sub).await.unwrap();
        }

        let mut state = store.state.lock().unwrap();
        for (sub, start) in [(&mine, 1), (&theirs, 2), (&idle, 30)] {
            state
                .pauses
                .insert(create_test_pause(sub, |p| {
                    p.pause_start = test_datetime_offset_days(start);
                    p.pause_end = test_datetime_offset_days(start + 5);
                }))
                .unwrap();
        }
        drop(state);

        let scopes = store
            .list_due_pause_scopes(test_datetime_offset_days(3))
            .await
            .unwrap();
        assert_eq!(
            scopes,
            vec![
                other_tenant_scope(),
                TenantScope::new("tenant_test", "env_test").unwrap()
            ]
        );

        let due = store
            .list_due_pauses(&test_scope(), PauseStatus::Scheduled, test_datetime_offset_days(3))
            .await
            .unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].subscription_id, mine.id);
    }

    #[tokio::test]
    async fn pauses_of_deleted_subscription_are_never_due() {
        let store = InMemorySubscriptionStore::new();
        let scope = test_scope();
        let sub = create_test_subscription(|_| {});
        store.create(&sub).await.unwrap();
        {
            let mut state = store.state.lock().unwrap();
            state.pauses.insert(create_test_pause(&sub, |_| {})).unwrap();
        }

        store.delete(&scope, sub.id, PauseRetention::Retain).await.unwrap();
        let history = store
            .list_pauses(&scope, &PauseFilter::for_subscription(sub.id))
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert!(store
            .list_due_pauses(&scope, PauseStatus::Scheduled, test_datetime_offset_days(30))
            .await
            .unwrap()
            .is_empty());
        assert!(store
            .list_due_pause_scopes(test_datetime_offset_days(30))
            .await
            .unwrap()
            .is_empty());
    }
}
