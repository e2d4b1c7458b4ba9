use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, PgConnection, Postgres, QueryBuilder, Row, Transaction};
use uuid::Uuid;

use super::{
    metadata_json, parse_json_with_fallback, push_order_and_page, push_record_status, push_scope,
};
use crate::{
    adapters::persistence::PostgresPersistence,
    app_error::{AppError, AppResult},
    application::{
        scope::TenantScope,
        use_cases::subscription::{
            PauseFilter, PauseRetention, PauseWrite, SubscriptionFilter, SubscriptionRepo,
        },
    },
    domain::entities::{
        subscription::{
            Subscription, SubscriptionLineItem, SubscriptionStatus, SubscriptionWithLineItems,
            SubscriptionWithPauses,
        },
        subscription_pause::{PauseStatus, SubscriptionPause},
    },
};

const SUBSCRIPTION_COLS: &str = r#"
    id, tenant_id, environment_id, customer_id, plan_id, currency, subscription_status,
    billing_cadence, billing_period, billing_period_count, start_date, end_date,
    current_period_start, current_period_end, cancelled_at, pause_status, active_pause_id,
    metadata, status, version, created_at, updated_at, created_by, updated_by
"#;

const LINE_ITEM_COLS: &str = r#"
    id, subscription_id, tenant_id, environment_id, price_id, display_name, quantity,
    currency, billing_period, start_date, end_date, position, metadata, status,
    created_at, updated_at, created_by, updated_by
"#;

const PAUSE_COLS: &str = r#"
    id, subscription_id, tenant_id, environment_id, pause_status, pause_start, pause_end,
    resumed_at, reason, metadata, status, created_at, updated_at, created_by, updated_by
"#;

/// Name of the partial unique index allowing one open pause per subscription.
const OPEN_PAUSE_INDEX: &str = "uq_subscription_pauses_open";

fn metadata_of(row: &PgRow, entity_type: &str, id: Uuid) -> BTreeMap<String, String> {
    let raw: serde_json::Value = row.get("metadata");
    parse_json_with_fallback(&raw, "metadata", entity_type, &id.to_string())
}

fn row_to_subscription(row: &PgRow) -> Subscription {
    let id: Uuid = row.get("id");
    Subscription {
        id,
        tenant_id: row.get("tenant_id"),
        environment_id: row.get("environment_id"),
        customer_id: row.get("customer_id"),
        plan_id: row.get("plan_id"),
        currency: row.get("currency"),
        subscription_status: row.get("subscription_status"),
        billing_cadence: row.get("billing_cadence"),
        billing_period: row.get("billing_period"),
        billing_period_count: row.get("billing_period_count"),
        start_date: row.get("start_date"),
        end_date: row.get("end_date"),
        current_period_start: row.get("current_period_start"),
        current_period_end: row.get("current_period_end"),
        cancelled_at: row.get("cancelled_at"),
        pause_status: row.get("pause_status"),
        active_pause_id: row.get("active_pause_id"),
        metadata: metadata_of(row, "subscription", id),
        status: row.get("status"),
        version: row.get("version"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        created_by: row.get("created_by"),
        updated_by: row.get("updated_by"),
    }
}

fn row_to_line_item(row: &PgRow) -> SubscriptionLineItem {
    let id: Uuid = row.get("id");
    SubscriptionLineItem {
        id,
        subscription_id: row.get("subscription_id"),
        tenant_id: row.get("tenant_id"),
        environment_id: row.get("environment_id"),
        price_id: row.get("price_id"),
        display_name: row.get("display_name"),
        quantity: row.get("quantity"),
        currency: row.get("currency"),
        billing_period: row.get("billing_period"),
        start_date: row.get("start_date"),
        end_date: row.get("end_date"),
        position: row.get("position"),
        metadata: metadata_of(row, "subscription_line_item", id),
        status: row.get("status"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        created_by: row.get("created_by"),
        updated_by: row.get("updated_by"),
    }
}

fn row_to_pause(row: &PgRow) -> SubscriptionPause {
    let id: Uuid = row.get("id");
    SubscriptionPause {
        id,
        subscription_id: row.get("subscription_id"),
        tenant_id: row.get("tenant_id"),
        environment_id: row.get("environment_id"),
        pause_status: row.get("pause_status"),
        pause_start: row.get("pause_start"),
        pause_end: row.get("pause_end"),
        resumed_at: row.get("resumed_at"),
        reason: row.get("reason"),
        metadata: metadata_of(row, "subscription_pause", id),
        status: row.get("status"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        created_by: row.get("created_by"),
        updated_by: row.get("updated_by"),
    }
}

fn push_filter(
    qb: &mut QueryBuilder<'_, Postgres>,
    scope: &TenantScope,
    filter: &SubscriptionFilter,
) {
    push_scope(qb, "", scope);
    push_record_status(qb, &filter.query);

    if filter.subscription_status.is_empty() {
        if !filter.include_cancelled {
            qb.push(" AND subscription_status <> ")
                .push_bind(SubscriptionStatus::Cancelled);
        }
    } else {
        let statuses: Vec<String> = filter
            .subscription_status
            .iter()
            .map(|s| s.as_ref().to_string())
            .collect();
        qb.push(" AND subscription_status::text = ANY(")
            .push_bind(statuses)
            .push(")");
    }
    if let Some(customer_id) = filter.customer_id {
        qb.push(" AND customer_id = ").push_bind(customer_id);
    }
    if let Some(plan_id) = filter.plan_id {
        qb.push(" AND plan_id = ").push_bind(plan_id);
    }
    if !filter.billing_cadence.is_empty() {
        let cadences: Vec<String> = filter
            .billing_cadence
            .iter()
            .map(|c| c.as_ref().to_string())
            .collect();
        qb.push(" AND billing_cadence::text = ANY(")
            .push_bind(cadences)
            .push(")");
    }
    if !filter.billing_period.is_empty() {
        let periods: Vec<String> = filter
            .billing_period
            .iter()
            .map(|p| p.as_ref().to_string())
            .collect();
        qb.push(" AND billing_period::text = ANY(")
            .push_bind(periods)
            .push(")");
    }
    if let Some(start) = filter.time_range.start_time {
        qb.push(" AND created_at >= ").push_bind(start);
    }
    if let Some(end) = filter.time_range.end_time {
        qb.push(" AND created_at <= ").push_bind(end);
    }
    if !filter.subscription_ids.is_empty() {
        qb.push(" AND id = ANY(")
            .push_bind(filter.subscription_ids.clone())
            .push(")");
    }
    if let Some(at) = filter.active_at {
        qb.push(" AND subscription_status = ")
            .push_bind(SubscriptionStatus::Active)
            .push(" AND start_date <= ")
            .push_bind(at)
            .push(" AND (end_date IS NULL OR end_date >= ")
            .push_bind(at)
            .push(")");
    }
}

fn push_pause_filter(qb: &mut QueryBuilder<'_, Postgres>, scope: &TenantScope, filter: &PauseFilter) {
    push_scope(qb, "", scope);
    push_record_status(qb, &filter.query);
    if let Some(subscription_id) = filter.subscription_id {
        qb.push(" AND subscription_id = ").push_bind(subscription_id);
    }
    if !filter.pause_status.is_empty() {
        let statuses: Vec<String> = filter
            .pause_status
            .iter()
            .map(|s| s.as_ref().to_string())
            .collect();
        qb.push(" AND pause_status::text = ANY(")
            .push_bind(statuses)
            .push(")");
    }
}

/// Snapshot reads spanning several tables see one consistent state.
async fn begin_snapshot(pool: &sqlx::PgPool) -> AppResult<Transaction<'static, Postgres>> {
    let mut tx = pool.begin().await.map_err(AppError::from)?;
    sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
        .execute(&mut *tx)
        .await
        .map_err(AppError::from)?;
    Ok(tx)
}

async fn insert_line_item(conn: &mut PgConnection, item: &SubscriptionLineItem) -> AppResult<()> {
    sqlx::query(
        r#"
        INSERT INTO subscription_line_items (
            id, subscription_id, tenant_id, environment_id, price_id, display_name, quantity,
            currency, billing_period, start_date, end_date, position, metadata, status,
            created_at, updated_at, created_by, updated_by
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
        "#,
    )
    .bind(item.id)
    .bind(item.subscription_id)
    .bind(&item.tenant_id)
    .bind(&item.environment_id)
    .bind(item.price_id)
    .bind(&item.display_name)
    .bind(item.quantity)
    .bind(&item.currency)
    .bind(item.billing_period)
    .bind(item.start_date)
    .bind(item.end_date)
    .bind(item.position)
    .bind(metadata_json(&item.metadata)?)
    .bind(item.status)
    .bind(item.created_at)
    .bind(item.updated_at)
    .bind(&item.created_by)
    .bind(&item.updated_by)
    .execute(conn)
    .await
    .map_err(AppError::from)?;
    Ok(())
}

async fn insert_subscription(conn: &mut PgConnection, sub: &Subscription) -> AppResult<()> {
    sqlx::query(
        r#"
        INSERT INTO subscriptions (
            id, tenant_id, environment_id, customer_id, plan_id, currency, subscription_status,
            billing_cadence, billing_period, billing_period_count, start_date, end_date,
            current_period_start, current_period_end, cancelled_at, pause_status, active_pause_id,
            metadata, status, version, created_at, updated_at, created_by, updated_by
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
                $18, $19, $20, $21, $22, $23, $24)
        "#,
    )
    .bind(sub.id)
    .bind(&sub.tenant_id)
    .bind(&sub.environment_id)
    .bind(sub.customer_id)
    .bind(sub.plan_id)
    .bind(&sub.currency)
    .bind(sub.subscription_status)
    .bind(sub.billing_cadence)
    .bind(sub.billing_period)
    .bind(sub.billing_period_count)
    .bind(sub.start_date)
    .bind(sub.end_date)
    .bind(sub.current_period_start)
    .bind(sub.current_period_end)
    .bind(sub.cancelled_at)
    .bind(sub.pause_status)
    .bind(sub.active_pause_id)
    .bind(metadata_json(&sub.metadata)?)
    .bind(sub.status)
    .bind(sub.version)
    .bind(sub.created_at)
    .bind(sub.updated_at)
    .bind(&sub.created_by)
    .bind(&sub.updated_by)
    .execute(conn)
    .await
    .map_err(AppError::from)?;
    Ok(())
}

async fn line_items_of(
    conn: &mut PgConnection,
    scope: &TenantScope,
    subscription_ids: &[Uuid],
) -> AppResult<HashMap<Uuid, Vec<SubscriptionLineItem>>> {
    let rows = sqlx::query(&format!(
        r#"
        SELECT {} FROM subscription_line_items
        WHERE tenant_id = $1 AND environment_id = $2 AND subscription_id = ANY($3)
        ORDER BY subscription_id, position, id
        "#,
        LINE_ITEM_COLS
    ))
    .bind(scope.tenant_id())
    .bind(scope.environment_id())
    .bind(subscription_ids)
    .fetch_all(conn)
    .await
    .map_err(AppError::from)?;

    let mut grouped: HashMap<Uuid, Vec<SubscriptionLineItem>> = HashMap::new();
    for item in rows.iter().map(row_to_line_item) {
        grouped.entry(item.subscription_id).or_default().push(item);
    }
    Ok(grouped)
}

/// Locks the subscription row and returns its current version.
async fn lock_subscription(
    conn: &mut PgConnection,
    scope: &TenantScope,
    id: Uuid,
) -> AppResult<Option<i64>> {
    let version: Option<i64> = sqlx::query_scalar(
        r#"
        SELECT version FROM subscriptions
        WHERE id = $1 AND tenant_id = $2 AND environment_id = $3
        FOR UPDATE
        "#,
    )
    .bind(id)
    .bind(scope.tenant_id())
    .bind(scope.environment_id())
    .fetch_optional(conn)
    .await
    .map_err(AppError::from)?;
    Ok(version)
}

async fn write_pause_mirror(
    conn: &mut PgConnection,
    scope: &TenantScope,
    next: &Subscription,
) -> AppResult<Subscription> {
    let row = sqlx::query(&format!(
        r#"
        UPDATE subscriptions
        SET subscription_status = $4, pause_status = $5, active_pause_id = $6,
            updated_at = $7, updated_by = $8, version = version + 1
        WHERE id = $1 AND tenant_id = $2 AND environment_id = $3
        RETURNING {}
        "#,
        SUBSCRIPTION_COLS
    ))
    .bind(next.id)
    .bind(scope.tenant_id())
    .bind(scope.environment_id())
    .bind(next.subscription_status)
    .bind(next.pause_status)
    .bind(next.active_pause_id)
    .bind(next.updated_at)
    .bind(&next.updated_by)
    .fetch_one(conn)
    .await
    .map_err(AppError::from)?;
    Ok(row_to_subscription(&row))
}

#[async_trait]
impl SubscriptionRepo for PostgresPersistence {
    async fn create(&self, subscription: &Subscription) -> AppResult<()> {
        let mut conn = self.pool.acquire().await.map_err(AppError::from)?;
        insert_subscription(&mut conn, subscription).await
    }

    async fn create_with_line_items(
        &self,
        subscription: &Subscription,
        line_items: &[SubscriptionLineItem],
    ) -> AppResult<()> {
        if let Some(stray) = line_items.iter().find(|item| {
            item.subscription_id != subscription.id
                || item.tenant_id != subscription.tenant_id
                || item.environment_id != subscription.environment_id
        }) {
            return Err(AppError::InvalidInput(format!(
                "line item {} does not belong to subscription {}",
                stray.id, subscription.id
            )));
        }

        // Dropping the transaction on any error rolls back every insert.
        let mut tx = self.pool.begin().await.map_err(AppError::from)?;
        insert_subscription(&mut tx, subscription).await?;
        for item in line_items {
            insert_line_item(&mut tx, item).await?;
        }
        tx.commit().await.map_err(AppError::from)?;
        Ok(())
    }

    async fn get_by_id(&self, scope: &TenantScope, id: Uuid) -> AppResult<Option<Subscription>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM subscriptions WHERE id = $1 AND tenant_id = $2 AND environment_id = $3",
            SUBSCRIPTION_COLS
        ))
        .bind(id)
        .bind(scope.tenant_id())
        .bind(scope.environment_id())
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::from)?;
        Ok(row.as_ref().map(row_to_subscription))
    }

    async fn get_with_line_items(
        &self,
        scope: &TenantScope,
        id: Uuid,
    ) -> AppResult<Option<SubscriptionWithLineItems>> {
        let mut tx = begin_snapshot(&self.pool).await?;
        let row = sqlx::query(&format!(
            "SELECT {} FROM subscriptions WHERE id = $1 AND tenant_id = $2 AND environment_id = $3",
            SUBSCRIPTION_COLS
        ))
        .bind(id)
        .bind(scope.tenant_id())
        .bind(scope.environment_id())
        .fetch_optional(&mut *tx)
        .await
        .map_err(AppError::from)?;
        let Some(row) = row else {
            return Ok(None);
        };

        let mut items = line_items_of(&mut tx, scope, &[id]).await?;
        tx.commit().await.map_err(AppError::from)?;
        Ok(Some(SubscriptionWithLineItems {
            subscription: row_to_subscription(&row),
            line_items: items.remove(&id).unwrap_or_default(),
        }))
    }

    async fn get_with_pauses(
        &self,
        scope: &TenantScope,
        id: Uuid,
    ) -> AppResult<Option<SubscriptionWithPauses>> {
        let mut tx = begin_snapshot(&self.pool).await?;
        let row = sqlx::query(&format!(
            "SELECT {} FROM subscriptions WHERE id = $1 AND tenant_id = $2 AND environment_id = $3",
            SUBSCRIPTION_COLS
        ))
        .bind(id)
        .bind(scope.tenant_id())
        .bind(scope.environment_id())
        .fetch_optional(&mut *tx)
        .await
        .map_err(AppError::from)?;
        let Some(row) = row else {
            return Ok(None);
        };

        let pause_rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM subscription_pauses
            WHERE subscription_id = $1 AND tenant_id = $2 AND environment_id = $3
            ORDER BY created_at, id
            "#,
            PAUSE_COLS
        ))
        .bind(id)
        .bind(scope.tenant_id())
        .bind(scope.environment_id())
        .fetch_all(&mut *tx)
        .await
        .map_err(AppError::from)?;
        tx.commit().await.map_err(AppError::from)?;

        Ok(Some(SubscriptionWithPauses {
            subscription: row_to_subscription(&row),
            pauses: pause_rows.iter().map(row_to_pause).collect(),
        }))
    }

    async fn list(
        &self,
        scope: &TenantScope,
        filter: &SubscriptionFilter,
    ) -> AppResult<Vec<SubscriptionWithLineItems>> {
        let mut tx = begin_snapshot(&self.pool).await?;
        let mut qb =
            QueryBuilder::<Postgres>::new(format!("SELECT {} FROM subscriptions", SUBSCRIPTION_COLS));
        push_filter(&mut qb, scope, filter);
        push_order_and_page(&mut qb, &filter.query);
        let rows = qb
            .build()
            .fetch_all(&mut *tx)
            .await
            .map_err(AppError::from)?;

        let subscriptions: Vec<Subscription> = rows.iter().map(row_to_subscription).collect();
        let ids: Vec<Uuid> = subscriptions.iter().map(|s| s.id).collect();
        let mut items = if ids.is_empty() {
            HashMap::new()
        } else {
            line_items_of(&mut tx, scope, &ids).await?
        };
        tx.commit().await.map_err(AppError::from)?;

        Ok(subscriptions
            .into_iter()
            .map(|subscription| {
                let line_items = items.remove(&subscription.id).unwrap_or_default();
                SubscriptionWithLineItems {
                    subscription,
                    line_items,
                }
            })
            .collect())
    }

    async fn count(&self, scope: &TenantScope, filter: &SubscriptionFilter) -> AppResult<i64> {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM subscriptions");
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
        subscription: &Subscription,
        expected_version: i64,
    ) -> AppResult<Option<Subscription>> {
        let mut tx = self.pool.begin().await.map_err(AppError::from)?;
        let Some(version) = lock_subscription(&mut tx, scope, subscription.id).await? else {
            return Err(AppError::NotFound);
        };
        if version != expected_version {
            return Ok(None);
        }

        let row = sqlx::query(&format!(
            r#"
            UPDATE subscriptions
            SET subscription_status = $4, end_date = $5, current_period_start = $6,
                current_period_end = $7, cancelled_at = $8, metadata = $9, status = $10,
                updated_at = $11, updated_by = $12, version = version + 1
            WHERE id = $1 AND tenant_id = $2 AND environment_id = $3
            RETURNING {}
            "#,
            SUBSCRIPTION_COLS
        ))
        .bind(subscription.id)
        .bind(scope.tenant_id())
        .bind(scope.environment_id())
        .bind(subscription.subscription_status)
        .bind(subscription.end_date)
        .bind(subscription.current_period_start)
        .bind(subscription.current_period_end)
        .bind(subscription.cancelled_at)
        .bind(metadata_json(&subscription.metadata)?)
        .bind(subscription.status)
        .bind(subscription.updated_at)
        .bind(&subscription.updated_by)
        .fetch_one(&mut *tx)
        .await
        .map_err(AppError::from)?;
        tx.commit().await.map_err(AppError::from)?;
        Ok(Some(row_to_subscription(&row)))
    }

    async fn delete(
        &self,
        scope: &TenantScope,
        id: Uuid,
        retention: PauseRetention,
    ) -> AppResult<bool> {
        let mut tx = self.pool.begin().await.map_err(AppError::from)?;
        // Line items go with the subscription via ON DELETE CASCADE.
        let deleted = sqlx::query(
            "DELETE FROM subscriptions WHERE id = $1 AND tenant_id = $2 AND environment_id = $3",
        )
        .bind(id)
        .bind(scope.tenant_id())
        .bind(scope.environment_id())
        .execute(&mut *tx)
        .await
        .map_err(AppError::from)?
        .rows_affected();
        if deleted == 0 {
            return Ok(false);
        }

        if retention == PauseRetention::Purge {
            sqlx::query(
                "DELETE FROM subscription_pauses WHERE subscription_id = $1 AND tenant_id = $2 AND environment_id = $3",
            )
            .bind(id)
            .bind(scope.tenant_id())
            .bind(scope.environment_id())
            .execute(&mut *tx)
            .await
            .map_err(AppError::from)?;
        }
        tx.commit().await.map_err(AppError::from)?;
        Ok(true)
    }

    async fn create_pause(
        &self,
        scope: &TenantScope,
        write: &PauseWrite,
    ) -> AppResult<Option<Subscription>> {
        let pause = &write.pause;
        if !scope.owns(pause) || pause.subscription_id != write.subscription.id {
            return Err(AppError::InvalidInput(
                "pause does not belong to subscription".into(),
            ));
        }

        let mut tx = self.pool.begin().await.map_err(AppError::from)?;
        let Some(version) = lock_subscription(&mut tx, scope, write.subscription.id).await? else {
            return Err(AppError::NotFound);
        };
        if version != write.expected_version {
            return Ok(None);
        }

        let open: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM subscription_pauses
            WHERE subscription_id = $1 AND tenant_id = $2 AND environment_id = $3
              AND pause_status IN ('scheduled', 'active')
            LIMIT 1
            "#,
        )
        .bind(write.subscription.id)
        .bind(scope.tenant_id())
        .bind(scope.environment_id())
        .fetch_optional(&mut *tx)
        .await
        .map_err(AppError::from)?;
        if let Some(open) = open {
            return Err(AppError::Conflict(format!(
                "subscription {} already has open pause {}",
                write.subscription.id, open
            )));
        }

        sqlx::query(
            r#"
            INSERT INTO subscription_pauses (
                id, subscription_id, tenant_id, environment_id, pause_status, pause_start,
                pause_end, resumed_at, reason, metadata, status, created_at, updated_at,
                created_by, updated_by
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(pause.id)
        .bind(pause.subscription_id)
        .bind(&pause.tenant_id)
        .bind(&pause.environment_id)
        .bind(pause.pause_status)
        .bind(pause.pause_start)
        .bind(pause.pause_end)
        .bind(pause.resumed_at)
        .bind(&pause.reason)
        .bind(metadata_json(&pause.metadata)?)
        .bind(pause.status)
        .bind(pause.created_at)
        .bind(pause.updated_at)
        .bind(&pause.created_by)
        .bind(&pause.updated_by)
        .execute(&mut *tx)
        .await
        .map_err(|err| match AppError::from(err) {
            AppError::AlreadyExists(constraint) if constraint == OPEN_PAUSE_INDEX => {
                AppError::Conflict(format!(
                    "subscription {} already has an open pause",
                    pause.subscription_id
                ))
            }
            other => other,
        })?;

        let stored = write_pause_mirror(&mut tx, scope, &write.subscription).await?;
        tx.commit().await.map_err(AppError::from)?;
        Ok(Some(stored))
    }

    async fn get_pause(&self, scope: &TenantScope, id: Uuid) -> AppResult<Option<SubscriptionPause>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM subscription_pauses WHERE id = $1 AND tenant_id = $2 AND environment_id = $3",
            PAUSE_COLS
        ))
        .bind(id)
        .bind(scope.tenant_id())
        .bind(scope.environment_id())
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::from)?;
        Ok(row.as_ref().map(row_to_pause))
    }

    async fn update_pause(
        &self,
        scope: &TenantScope,
        write: &PauseWrite,
    ) -> AppResult<Option<Subscription>> {
        let pause = &write.pause;
        let mut tx = self.pool.begin().await.map_err(AppError::from)?;

        let owner: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT subscription_id FROM subscription_pauses
            WHERE id = $1 AND tenant_id = $2 AND environment_id = $3
            FOR UPDATE
            "#,
        )
        .bind(pause.id)
        .bind(scope.tenant_id())
        .bind(scope.environment_id())
        .fetch_optional(&mut *tx)
        .await
        .map_err(AppError::from)?;
        let Some(owner) = owner else {
            return Err(AppError::NotFound);
        };
        if owner != write.subscription.id {
            return Err(AppError::InvalidInput(
                "pause does not belong to subscription".into(),
            ));
        }

        let Some(version) = lock_subscription(&mut tx, scope, owner).await? else {
            return Err(AppError::NotFound);
        };
        if version != write.expected_version {
            return Ok(None);
        }

        sqlx::query(
            r#"
            UPDATE subscription_pauses
            SET pause_status = $4, pause_start = $5, pause_end = $6, resumed_at = $7,
                reason = $8, metadata = $9, status = $10, updated_at = $11, updated_by = $12
            WHERE id = $1 AND tenant_id = $2 AND environment_id = $3
            "#,
        )
        .bind(pause.id)
        .bind(scope.tenant_id())
        .bind(scope.environment_id())
        .bind(pause.pause_status)
        .bind(pause.pause_start)
        .bind(pause.pause_end)
        .bind(pause.resumed_at)
        .bind(&pause.reason)
        .bind(metadata_json(&pause.metadata)?)
        .bind(pause.status)
        .bind(pause.updated_at)
        .bind(&pause.updated_by)
        .execute(&mut *tx)
        .await
        .map_err(AppError::from)?;

        let stored = write_pause_mirror(&mut tx, scope, &write.subscription).await?;
        tx.commit().await.map_err(AppError::from)?;
        Ok(Some(stored))
    }

    async fn list_pauses(
        &self,
        scope: &TenantScope,
        filter: &PauseFilter,
    ) -> AppResult<Vec<SubscriptionPause>> {
        let mut qb =
            QueryBuilder::<Postgres>::new(format!("SELECT {} FROM subscription_pauses", PAUSE_COLS));
        push_pause_filter(&mut qb, scope, filter);
        push_order_and_page(&mut qb, &filter.query);
        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(AppError::from)?;
        Ok(rows.iter().map(row_to_pause).collect())
    }

    async fn list_due_pauses(
        &self,
        scope: &TenantScope,
        status: PauseStatus,
        now: DateTime<Utc>,
    ) -> AppResult<Vec<SubscriptionPause>> {
        let boundary = match status {
            PauseStatus::Scheduled => "pause_start",
            PauseStatus::Active => "pause_end",
            _ => return Ok(Vec::new()),
        };
        let rows = sqlx::query(&format!(
            r#"
            SELECT {cols} FROM subscription_pauses p
            WHERE p.tenant_id = $1 AND p.environment_id = $2
              AND p.pause_status = $3 AND p.{boundary} <= $4
              AND EXISTS (
                  SELECT 1 FROM subscriptions s
                  WHERE s.id = p.subscription_id
                    AND s.tenant_id = p.tenant_id AND s.environment_id = p.environment_id
              )
            ORDER BY p.{boundary}, p.id
            "#,
            cols = PAUSE_COLS,
        ))
        .bind(scope.tenant_id())
        .bind(scope.environment_id())
        .bind(status)
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::from)?;
        Ok(rows.iter().map(row_to_pause).collect())
    }

    async fn list_due_pause_scopes(&self, now: DateTime<Utc>) -> AppResult<Vec<TenantScope>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT p.tenant_id, p.environment_id
            FROM subscription_pauses p
            JOIN subscriptions s
              ON s.id = p.subscription_id
             AND s.tenant_id = p.tenant_id AND s.environment_id = p.environment_id
            WHERE (p.pause_status = 'scheduled' AND p.pause_start <= $1)
               OR (p.pause_status = 'active' AND p.pause_end <= $1)
            ORDER BY p.tenant_id, p.environment_id
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::from)?;

        rows.iter()
            .map(|row| {
                TenantScope::new(
                    row.get::<String, _>("tenant_id"),
                    row.get::<String, _>("environment_id"),
                )
            })
            .collect()
    }
}
