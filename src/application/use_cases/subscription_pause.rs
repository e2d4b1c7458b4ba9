use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::subscription::{PauseFilter, PauseWrite, SubscriptionRepo};
use crate::{
    app_error::{AppError, AppResult, ResultExt},
    application::{clock::Clock, scope::TenantScope},
    domain::entities::{
        record_status::RecordStatus,
        subscription::{Subscription, SubscriptionStatus},
        subscription_pause::{PauseStatus, SubscriptionPause},
    },
};

/// Result of one due-pause sweep within a scope.
#[derive(Debug, Default)]
pub struct SweepReport {
    pub transitioned: usize,
    /// Already moved by a concurrent caller.
    pub skipped: usize,
    pub failures: Vec<(Uuid, AppError)>,
}

impl SweepReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Planned next state of a subscription and one of its pauses.
type Step = Option<(Subscription, SubscriptionPause)>;

/// Drives pauses through `none → scheduled → active → completed`, with
/// cancellation out of `scheduled` and `active`.
///
/// Every step is written as one unit together with the subscription it
/// affects, guarded by the subscription version, so API calls and sweeps on
/// the same subscription serialize.
#[derive(Clone)]
pub struct PauseStateMachine {
    repo: Arc<dyn SubscriptionRepo>,
    clock: Arc<dyn Clock>,
    max_retries: u32,
}

impl PauseStateMachine {
    pub fn new(repo: Arc<dyn SubscriptionRepo>, clock: Arc<dyn Clock>, max_retries: u32) -> Self {
        Self {
            repo,
            clock,
            max_retries,
        }
    }

    /// A start that is already due creates the pause `active` and pauses the
    /// subscription in the same write.
    #[instrument(skip(self), fields(tenant_id = %scope.tenant_id()))]
    pub async fn schedule_pause(
        &self,
        scope: &TenantScope,
        subscription_id: Uuid,
        start_at: DateTime<Utc>,
        resume_at: DateTime<Utc>,
        reason: Option<&str>,
    ) -> AppResult<SubscriptionPause> {
        if resume_at <= start_at {
            return Err(AppError::InvalidInput(
                "pause window must end after it starts".into(),
            ));
        }

        for attempt in 0..=self.max_retries {
            let aggregate = scope
                .bounded(self.repo.get_with_pauses(scope, subscription_id))
                .await
                .for_entity("subscription", subscription_id)?
                .ok_or(AppError::NotFound)?;
            if let Some(open) = aggregate.open_pause() {
                return Err(AppError::Conflict(format!(
                    "subscription already has a {} pause {}",
                    open.pause_status, open.id
                )));
            }
            let current = aggregate.subscription;
            if current.subscription_status != SubscriptionStatus::Active {
                return Err(AppError::invalid_transition(
                    current.subscription_status,
                    SubscriptionStatus::Paused,
                ));
            }

            let now = self.clock.now();
            if resume_at <= now {
                return Err(AppError::InvalidInput(
                    "pause window must end in the future".into(),
                ));
            }
            let initial = if start_at <= now {
                PauseStatus::Active
            } else {
                PauseStatus::Scheduled
            };

            let actor = scope.actor().map(str::to_owned);
            let pause = SubscriptionPause {
                id: Uuid::new_v4(),
                subscription_id,
                tenant_id: current.tenant_id.clone(),
                environment_id: current.environment_id.clone(),
                pause_status: initial,
                pause_start: start_at,
                pause_end: resume_at,
                resumed_at: None,
                reason: reason.map(str::to_owned),
                metadata: BTreeMap::new(),
                status: RecordStatus::Published,
                created_at: now,
                updated_at: now,
                created_by: actor.clone(),
                updated_by: actor,
            };
            let mut next = self.touched(scope, &current, now);
            next.pause_status = initial;
            next.active_pause_id = Some(pause.id);
            if initial == PauseStatus::Active {
                next.subscription_status = SubscriptionStatus::Paused;
            }

            let write = PauseWrite {
                pause,
                subscription: next,
                expected_version: current.version,
            };
            let written = scope
                .bounded(self.repo.create_pause(scope, &write))
                .await
                .for_entity("subscription", subscription_id)?;
            match written {
                Some(_) => {
                    info!(
                        subscription_id = %subscription_id,
                        pause_id = %write.pause.id,
                        pause_status = %initial,
                        "Pause scheduled"
                    );
                    return Ok(write.pause);
                }
                None => debug!(%subscription_id, attempt, "Subscription version moved, retrying"),
            }
        }
        Err(self.contended(subscription_id))
    }

    /// Scheduled pauses whose start is at or before `now` become active.
    /// Re-running with the same `now` changes nothing.
    #[instrument(skip(self), fields(tenant_id = %scope.tenant_id()))]
    pub async fn activate_due_pauses(
        &self,
        scope: &TenantScope,
        now: DateTime<Utc>,
    ) -> AppResult<SweepReport> {
        let due = scope
            .bounded(self.repo.list_due_pauses(scope, PauseStatus::Scheduled, now))
            .await
            .for_entity("subscription_pause", "due")?;

        let mut report = SweepReport::default();
        for pause in due {
            let result = self
                .transition(scope, pause.id, now, |sub, pause| {
                    Ok(self.plan_activation(scope, sub, pause, now))
                })
                .await;
            record(&mut report, pause.id, result);
        }
        if report.transitioned > 0 || !report.is_clean() {
            info!(
                activated = report.transitioned,
                skipped = report.skipped,
                failed = report.failures.len(),
                "Activated due pauses"
            );
        }
        Ok(report)
    }

    /// Active pauses whose resume point is at or before `now` complete.
    #[instrument(skip(self), fields(tenant_id = %scope.tenant_id()))]
    pub async fn resume_due_pauses(
        &self,
        scope: &TenantScope,
        now: DateTime<Utc>,
    ) -> AppResult<SweepReport> {
        let due = scope
            .bounded(self.repo.list_due_pauses(scope, PauseStatus::Active, now))
            .await
            .for_entity("subscription_pause", "due")?;

        let mut report = SweepReport::default();
        for pause in due {
            let result = self
                .transition(scope, pause.id, now, |sub, pause| {
                    if !pause.is_due_to_resume(now) {
                        return Ok(None);
                    }
                    Ok(Some(self.plan_end(scope, sub, pause, PauseStatus::Completed, now)))
                })
                .await;
            record(&mut report, pause.id, result);
        }
        if report.transitioned > 0 || !report.is_clean() {
            info!(
                resumed = report.transitioned,
                skipped = report.skipped,
                failed = report.failures.len(),
                "Resumed due pauses"
            );
        }
        Ok(report)
    }

    /// Only from `scheduled` or `active`. Cancelling a running pause
    /// reactivates the subscription.
    #[instrument(skip(self), fields(tenant_id = %scope.tenant_id()))]
    pub async fn cancel_pause(&self, scope: &TenantScope, pause_id: Uuid) -> AppResult<SubscriptionPause> {
        let now = self.clock.now();
        let cancelled = self
            .transition(scope, pause_id, now, |sub, pause| {
                if !pause.pause_status.can_transition_to(PauseStatus::Cancelled) {
                    return Err(AppError::invalid_transition(
                        pause.pause_status,
                        PauseStatus::Cancelled,
                    ));
                }
                Ok(Some(self.plan_end(scope, sub, pause, PauseStatus::Cancelled, now)))
            })
            .await?
            .ok_or_else(|| AppError::Internal(format!("pause {pause_id} cancel was a no-op")))?;
        info!(%pause_id, subscription_id = %cancelled.subscription_id, "Pause cancelled");
        Ok(cancelled)
    }

    /// Ends the running pause of `subscription_id` ahead of its resume point.
    #[instrument(skip(self), fields(tenant_id = %scope.tenant_id()))]
    pub async fn resume_now(&self, scope: &TenantScope, subscription_id: Uuid) -> AppResult<SubscriptionPause> {
        let aggregate = scope
            .bounded(self.repo.get_with_pauses(scope, subscription_id))
            .await
            .for_entity("subscription", subscription_id)?
            .ok_or(AppError::NotFound)?;
        let pause_id = match aggregate.open_pause() {
            Some(pause) if pause.pause_status == PauseStatus::Active => pause.id,
            Some(pause) => {
                return Err(AppError::invalid_transition(
                    pause.pause_status,
                    PauseStatus::Completed,
                ));
            }
            None => {
                return Err(AppError::invalid_transition(
                    PauseStatus::None,
                    PauseStatus::Completed,
                ));
            }
        };

        let now = self.clock.now();
        let resumed = self
            .transition(scope, pause_id, now, |sub, pause| {
                if pause.pause_status != PauseStatus::Active {
                    return Err(AppError::invalid_transition(
                        pause.pause_status,
                        PauseStatus::Completed,
                    ));
                }
                Ok(Some(self.plan_end(scope, sub, pause, PauseStatus::Completed, now)))
            })
            .await?
            .ok_or_else(|| AppError::Internal(format!("pause {pause_id} resume was a no-op")))?;
        info!(%subscription_id, pause_id = %resumed.id, "Pause resumed early");
        Ok(resumed)
    }

    /// Every pause of the subscription, oldest first. History survives a
    /// retained delete of the subscription.
    pub async fn list_pauses(
        &self,
        scope: &TenantScope,
        subscription_id: Uuid,
    ) -> AppResult<Vec<SubscriptionPause>> {
        scope
            .bounded(
                self.repo
                    .list_pauses(scope, &PauseFilter::for_subscription(subscription_id)),
            )
            .await
            .for_entity("subscription", subscription_id)
    }

    /// Tenant scopes holding at least one pause due at `now`. Callers sweep
    /// each returned scope with [`Self::activate_due_pauses`] and
    /// [`Self::resume_due_pauses`].
    pub async fn due_scopes(&self, now: DateTime<Utc>) -> AppResult<Vec<TenantScope>> {
        self.repo
            .list_due_pause_scopes(now)
            .await
            .for_entity("subscription_pause", "due")
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Re-reads pause and subscription, plans, writes both under the
    /// subscription version. `Ok(None)` when the plan found nothing to do.
    async fn transition<F>(
        &self,
        scope: &TenantScope,
        pause_id: Uuid,
        now: DateTime<Utc>,
        plan: F,
    ) -> AppResult<Option<SubscriptionPause>>
    where
        F: Fn(&Subscription, &SubscriptionPause) -> AppResult<Step> + Send + Sync,
    {
        for attempt in 0..=self.max_retries {
            let pause = scope
                .bounded(self.repo.get_pause(scope, pause_id))
                .await
                .for_entity("subscription_pause", pause_id)?
                .ok_or(AppError::NotFound)?;
            let subscription = scope
                .bounded(self.repo.get_by_id(scope, pause.subscription_id))
                .await
                .for_entity("subscription", pause.subscription_id)?
                .ok_or(AppError::NotFound)?;

            let Some((next_sub, next_pause)) = plan(&subscription, &pause)? else {
                return Ok(None);
            };
            let write = PauseWrite {
                pause: next_pause,
                subscription: next_sub,
                expected_version: subscription.version,
            };
            let written = scope
                .bounded(self.repo.update_pause(scope, &write))
                .await
                .for_entity("subscription", subscription.id)?;
            match written {
                Some(_) => {
                    debug!(
                        %pause_id,
                        from = %pause.pause_status,
                        to = %write.pause.pause_status,
                        at = %now,
                        "Pause transitioned"
                    );
                    return Ok(Some(write.pause));
                }
                None => debug!(%pause_id, attempt, "Subscription version moved, retrying"),
            }
        }
        Err(self.contended(pause_id))
    }

    /// `scheduled → active`; the subscription becomes `paused`. A subscription
    /// that left `active` in the meantime has its scheduled pause cancelled.
    fn plan_activation(
        &self,
        scope: &TenantScope,
        sub: &Subscription,
        pause: &SubscriptionPause,
        now: DateTime<Utc>,
    ) -> Step {
        if !pause.is_due_to_start(now) {
            return None;
        }
        if sub.subscription_status != SubscriptionStatus::Active {
            warn!(
                subscription_id = %sub.id,
                pause_id = %pause.id,
                subscription_status = %sub.subscription_status,
                "Subscription no longer active, cancelling scheduled pause"
            );
            return Some(self.plan_end(scope, sub, pause, PauseStatus::Cancelled, now));
        }

        let mut next_pause = pause.clone();
        next_pause.pause_status = PauseStatus::Active;
        self.stamp_pause(scope, &mut next_pause, now);

        let mut next_sub = self.touched(scope, sub, now);
        next_sub.subscription_status = SubscriptionStatus::Paused;
        next_sub.pause_status = PauseStatus::Active;
        next_sub.active_pause_id = Some(pause.id);
        Some((next_sub, next_pause))
    }

    /// Closes a pause as `completed` or `cancelled`. A `paused` subscription
    /// returns to `active`; any other status is left as it is.
    fn plan_end(
        &self,
        scope: &TenantScope,
        sub: &Subscription,
        pause: &SubscriptionPause,
        terminal: PauseStatus,
        now: DateTime<Utc>,
    ) -> (Subscription, SubscriptionPause) {
        let mut next_pause = pause.clone();
        if pause.pause_status == PauseStatus::Active {
            next_pause.resumed_at = Some(now);
        }
        next_pause.pause_status = terminal;
        self.stamp_pause(scope, &mut next_pause, now);

        let mut next_sub = self.touched(scope, sub, now);
        if sub.active_pause_id == Some(pause.id) {
            next_sub.pause_status = PauseStatus::None;
            next_sub.active_pause_id = None;
        }
        if sub.subscription_status == SubscriptionStatus::Paused {
            next_sub.subscription_status = SubscriptionStatus::Active;
        }
        (next_sub, next_pause)
    }

    fn touched(&self, scope: &TenantScope, sub: &Subscription, now: DateTime<Utc>) -> Subscription {
        let mut next = sub.clone();
        next.updated_at = now.max(self.clock.now());
        next.updated_by = scope.actor().map(str::to_owned);
        next
    }

    fn stamp_pause(&self, scope: &TenantScope, pause: &mut SubscriptionPause, now: DateTime<Utc>) {
        pause.updated_at = now.max(self.clock.now());
        pause.updated_by = scope.actor().map(str::to_owned);
    }

    fn contended(&self, id: Uuid) -> AppError {
        warn!(%id, retries = self.max_retries, "Gave up on contended subscription");
        AppError::Conflict(format!("subscription for {id} is being modified concurrently"))
    }
}

fn record(report: &mut SweepReport, pause_id: Uuid, result: AppResult<Option<SubscriptionPause>>) {
    match result {
        Ok(Some(_)) => report.transitioned += 1,
        Ok(None) | Err(AppError::NotFound) => report.skipped += 1,
        Err(err) => {
            warn!(%pause_id, error = %err, "Pause transition failed");
            report.failures.push((pause_id, err));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{
        create_subscription_input, create_test_pause, create_test_subscription, other_tenant_scope,
        subscription_harness, test_datetime, test_datetime_offset_days, test_scope,
        SubscriptionHarness,
    };
    use chrono::Duration;

    async fn active_subscription(h: &SubscriptionHarness) -> Subscription {
        h.subscriptions
            .create(&test_scope(), create_subscription_input(|_| {}))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn second_pause_before_start_conflicts() {
        let h = subscription_harness();
        let scope = test_scope();
        let sub = active_subscription(&h).await;
        let t = test_datetime_offset_days(3);

        let first = h
            .pauses
            .schedule_pause(&scope, sub.id, t, t + Duration::days(7), Some("vacation"))
            .await
            .unwrap();
        assert_eq!(first.pause_status, PauseStatus::Scheduled);
        assert_eq!(first.reason.as_deref(), Some("vacation"));

        let second = h
            .pauses
            .schedule_pause(&scope, sub.id, t + Duration::days(1), t + Duration::days(9), None)
            .await;
        assert!(matches!(second, Err(AppError::Conflict(_))));

        let loaded = h.subscriptions.get(&scope, sub.id).await.unwrap();
        assert_eq!(loaded.subscription_status, SubscriptionStatus::Active);
        assert_eq!(loaded.pause_status, PauseStatus::Scheduled);
        assert_eq!(loaded.active_pause_id, Some(first.id));
    }

    #[tokio::test]
    async fn inverted_window_is_rejected() {
        let h = subscription_harness();
        let sub = active_subscription(&h).await;
        let t = test_datetime_offset_days(3);

        for resume_at in [t, t - Duration::hours(1)] {
            assert!(matches!(
                h.pauses.schedule_pause(&test_scope(), sub.id, t, resume_at, None).await,
                Err(AppError::InvalidInput(_))
            ));
        }
    }

    #[tokio::test]
    async fn pause_activates_then_completes() {
        let h = subscription_harness();
        let scope = test_scope();
        let sub = active_subscription(&h).await;
        let t = test_datetime_offset_days(3);
        let pause = h
            .pauses
            .schedule_pause(&scope, sub.id, t, t + Duration::days(7), None)
            .await
            .unwrap();

        let report = h.pauses.activate_due_pauses(&scope, t).await.unwrap();
        assert_eq!(report.transitioned, 1);
        let paused = h.subscriptions.get_with_pauses(&scope, sub.id).await.unwrap();
        assert_eq!(paused.subscription.subscription_status, SubscriptionStatus::Paused);
        assert_eq!(paused.open_pause().unwrap().pause_status, PauseStatus::Active);

        let report = h
            .pauses
            .resume_due_pauses(&scope, t + Duration::days(8))
            .await
            .unwrap();
        assert_eq!(report.transitioned, 1);
        let resumed = h.subscriptions.get_with_pauses(&scope, sub.id).await.unwrap();
        assert_eq!(resumed.subscription.subscription_status, SubscriptionStatus::Active);
        assert_eq!(resumed.subscription.pause_status, PauseStatus::None);
        assert!(resumed.open_pause().is_none());
        assert_eq!(resumed.pauses[0].id, pause.id);
        assert_eq!(resumed.pauses[0].pause_status, PauseStatus::Completed);
        assert_eq!(resumed.pauses[0].resumed_at, Some(t + Duration::days(8)));
    }

    #[tokio::test]
    async fn activation_is_idempotent() {
        let h = subscription_harness();
        let scope = test_scope();
        let sub = active_subscription(&h).await;
        let t = test_datetime_offset_days(1);
        h.pauses
            .schedule_pause(&scope, sub.id, t, t + Duration::days(2), None)
            .await
            .unwrap();

        h.pauses.activate_due_pauses(&scope, t).await.unwrap();
        let once = h.subscriptions.get_with_pauses(&scope, sub.id).await.unwrap();
        let again = h.pauses.activate_due_pauses(&scope, t).await.unwrap();
        let twice = h.subscriptions.get_with_pauses(&scope, sub.id).await.unwrap();

        assert_eq!(again.transitioned, 0);
        assert_eq!(once, twice);
    }

    #[tokio::test]
    async fn nothing_due_before_start() {
        let h = subscription_harness();
        let scope = test_scope();
        let sub = active_subscription(&h).await;
        let t = test_datetime_offset_days(5);
        h.pauses
            .schedule_pause(&scope, sub.id, t, t + Duration::days(2), None)
            .await
            .unwrap();

        let report = h
            .pauses
            .activate_due_pauses(&scope, t - Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(report.transitioned, 0);
        let loaded = h.subscriptions.get(&scope, sub.id).await.unwrap();
        assert_eq!(loaded.subscription_status, SubscriptionStatus::Active);
    }

    #[tokio::test]
    async fn immediate_start_pauses_right_away() {
        let h = subscription_harness();
        let scope = test_scope();
        let sub = active_subscription(&h).await;

        let pause = h
            .pauses
            .schedule_pause(&scope, sub.id, test_datetime(), test_datetime_offset_days(7), None)
            .await
            .unwrap();
        assert_eq!(pause.pause_status, PauseStatus::Active);
        let loaded = h.subscriptions.get(&scope, sub.id).await.unwrap();
        assert_eq!(loaded.subscription_status, SubscriptionStatus::Paused);
        assert_eq!(loaded.version, sub.version + 1);
    }

    #[tokio::test]
    async fn cancel_paths() {
        let h = subscription_harness();
        let scope = test_scope();

        let scheduled_sub = active_subscription(&h).await;
        let scheduled = h
            .pauses
            .schedule_pause(
                &scope,
                scheduled_sub.id,
                test_datetime_offset_days(2),
                test_datetime_offset_days(4),
                None,
            )
            .await
            .unwrap();
        let cancelled = h.pauses.cancel_pause(&scope, scheduled.id).await.unwrap();
        assert_eq!(cancelled.pause_status, PauseStatus::Cancelled);
        assert_eq!(cancelled.resumed_at, None);

        let running_sub = active_subscription(&h).await;
        let running = h
            .pauses
            .schedule_pause(&scope, running_sub.id, test_datetime(), test_datetime_offset_days(4), None)
            .await
            .unwrap();
        h.pauses.cancel_pause(&scope, running.id).await.unwrap();
        let restored = h.subscriptions.get(&scope, running_sub.id).await.unwrap();
        assert_eq!(restored.subscription_status, SubscriptionStatus::Active);
        assert_eq!(restored.active_pause_id, None);

        assert!(matches!(
            h.pauses.cancel_pause(&scope, running.id).await,
            Err(AppError::InvalidTransition { .. })
        ));
        // a fresh pause may follow a closed one
        assert!(h
            .pauses
            .schedule_pause(
                &scope,
                running_sub.id,
                test_datetime_offset_days(5),
                test_datetime_offset_days(6),
                None,
            )
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn resume_does_not_revive_cancelled_subscription() {
        let h = subscription_harness();
        let scope = test_scope();
        let sub = active_subscription(&h).await;
        h.pauses
            .schedule_pause(&scope, sub.id, test_datetime(), test_datetime_offset_days(3), None)
            .await
            .unwrap();
        h.subscriptions.cancel(&scope, sub.id, None).await.unwrap();

        h.pauses
            .resume_due_pauses(&scope, test_datetime_offset_days(3))
            .await
            .unwrap();
        let loaded = h.subscriptions.get_with_pauses(&scope, sub.id).await.unwrap();
        assert_eq!(loaded.subscription.subscription_status, SubscriptionStatus::Cancelled);
        assert_eq!(loaded.pauses[0].pause_status, PauseStatus::Completed);
    }

    #[tokio::test]
    async fn scheduled_pause_on_cancelled_subscription_is_dropped() {
        let h = subscription_harness();
        let scope = test_scope();
        let sub = active_subscription(&h).await;
        let t = test_datetime_offset_days(2);
        h.pauses
            .schedule_pause(&scope, sub.id, t, t + Duration::days(1), None)
            .await
            .unwrap();
        h.subscriptions.cancel(&scope, sub.id, None).await.unwrap();

        h.pauses.activate_due_pauses(&scope, t).await.unwrap();
        let loaded = h.subscriptions.get_with_pauses(&scope, sub.id).await.unwrap();
        assert_eq!(loaded.subscription.subscription_status, SubscriptionStatus::Cancelled);
        assert_eq!(loaded.pauses[0].pause_status, PauseStatus::Cancelled);
    }

    #[tokio::test]
    async fn pausing_requires_active_subscription() {
        let h = subscription_harness();
        let scope = test_scope();
        let sub = create_test_subscription(|s| s.subscription_status = SubscriptionStatus::PastDue);
        h.store.create(&sub).await.unwrap();

        assert!(matches!(
            h.pauses
                .schedule_pause(&scope, sub.id, test_datetime_offset_days(1), test_datetime_offset_days(2), None)
                .await,
            Err(AppError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn resume_now_ends_running_pause_early() {
        let h = subscription_harness();
        let scope = test_scope();
        let sub = active_subscription(&h).await;
        h.pauses
            .schedule_pause(&scope, sub.id, test_datetime(), test_datetime_offset_days(10), None)
            .await
            .unwrap();
        h.clock.advance(Duration::days(2));

        let resumed = h.pauses.resume_now(&scope, sub.id).await.unwrap();
        assert_eq!(resumed.pause_status, PauseStatus::Completed);
        assert_eq!(resumed.resumed_at, Some(test_datetime_offset_days(2)));
        let loaded = h.subscriptions.get(&scope, sub.id).await.unwrap();
        assert_eq!(loaded.subscription_status, SubscriptionStatus::Active);

        assert!(matches!(
            h.pauses.resume_now(&scope, sub.id).await,
            Err(AppError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn sweeps_and_cancels_stay_inside_scope() {
        let h = subscription_harness();
        let sub = active_subscription(&h).await;
        let t = test_datetime_offset_days(1);
        let pause = h
            .pauses
            .schedule_pause(&test_scope(), sub.id, t, t + Duration::days(1), None)
            .await
            .unwrap();
        let foreign = other_tenant_scope();

        let report = h.pauses.activate_due_pauses(&foreign, t).await.unwrap();
        assert_eq!(report.transitioned, 0);
        assert!(matches!(
            h.pauses.cancel_pause(&foreign, pause.id).await,
            Err(AppError::NotFound)
        ));
        assert!(h.pauses.list_pauses(&foreign, sub.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn store_rejects_second_open_pause() {
        let h = subscription_harness();
        let scope = test_scope();
        let sub = active_subscription(&h).await;
        h.pauses
            .schedule_pause(&scope, sub.id, test_datetime_offset_days(1), test_datetime_offset_days(2), None)
            .await
            .unwrap();
        let current = h.subscriptions.get(&scope, sub.id).await.unwrap();

        let write = PauseWrite {
            pause: create_test_pause(&current, |_| {}),
            subscription: current.clone(),
            expected_version: current.version,
        };
        assert!(matches!(
            h.store.create_pause(&scope, &write).await,
            Err(AppError::Conflict(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_schedules_leave_one_open_pause() {
        let h = subscription_harness();
        let scope = test_scope();
        let sub = active_subscription(&h).await;

        let mut tasks = Vec::new();
        for i in 0..16 {
            let pauses = h.pauses.clone();
            let id = sub.id;
            tasks.push(tokio::spawn(async move {
                pauses
                    .schedule_pause(
                        &test_scope(),
                        id,
                        test_datetime_offset_days(1 + i),
                        test_datetime_offset_days(20 + i),
                        None,
                    )
                    .await
            }));
        }
        let mut scheduled = 0;
        for task in tasks {
            if task.await.unwrap().is_ok() {
                scheduled += 1;
            }
        }

        assert_eq!(scheduled, 1);
        let open = h
            .pauses
            .list_pauses(&scope, sub.id)
            .await
            .unwrap()
            .into_iter()
            .filter(|p| p.pause_status.is_open())
            .count();
        assert_eq!(open, 1);
    }
}
