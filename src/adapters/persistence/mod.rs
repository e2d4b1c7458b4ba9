use std::collections::BTreeMap;

use sqlx::{PgPool, Postgres, QueryBuilder};

use crate::{
    app_error::{AppError, AppResult},
    application::{
        filter::{Page, QueryFilter},
        scope::TenantScope,
    },
};

pub mod subscription;
pub mod wallet;

const MAX_JSON_LOG_LEN: usize = 200;

/// Parse a JSON column into `T`, logging a warning on failure.
///
/// SQL NULL becomes the default without logging; only real parse failures
/// (type mismatches, corruption) are reported.
pub fn parse_json_with_fallback<T: serde::de::DeserializeOwned + Default>(
    json: &serde_json::Value,
    field_name: &str,
    entity_type: &str,
    entity_id: &str,
) -> T {
    if json.is_null() {
        return T::default();
    }

    serde_json::from_value(json.clone()).unwrap_or_else(|err| {
        // Truncate raw JSON to keep large blobs out of the logs
        let raw_str = json.to_string();
        let truncated = if raw_str.len() > MAX_JSON_LOG_LEN {
            let cut = (0..=MAX_JSON_LOG_LEN)
                .rev()
                .find(|i| raw_str.is_char_boundary(*i))
                .unwrap_or(0);
            format!("{}...", &raw_str[..cut])
        } else {
            raw_str
        };

        tracing::warn!(
            field = field_name,
            entity_type = entity_type,
            entity_id = entity_id,
            raw_json = %truncated,
            error = %err,
            "Failed to parse JSON field, using default value"
        );
        T::default()
    })
}

pub(crate) fn metadata_json(metadata: &BTreeMap<String, String>) -> AppResult<serde_json::Value> {
    serde_json::to_value(metadata)
        .map_err(|e| AppError::Internal(format!("metadata serialization failed: {e}")))
}

/// `WHERE` clause restricting a table (optionally aliased) to the caller's scope.
pub(crate) fn push_scope(qb: &mut QueryBuilder<'_, Postgres>, alias: &str, scope: &TenantScope) {
    qb.push(format!(" WHERE {alias}tenant_id = "))
        .push_bind(scope.tenant_id().to_string())
        .push(format!(" AND {alias}environment_id = "))
        .push_bind(scope.environment_id().to_string());
}

/// Record-status predicate, ordering with an id tie-break, then the page window.
pub(crate) fn push_order_and_page(qb: &mut QueryBuilder<'_, Postgres>, query: &QueryFilter) {
    let direction = query.order.as_sql();
    qb.push(format!(
        " ORDER BY {} {direction}, id {direction}",
        query.sort.as_ref()
    ));
    if let Page::Limited { limit, offset } = query.page {
        qb.push(" LIMIT ").push_bind(limit);
        qb.push(" OFFSET ").push_bind(offset);
    }
}

pub(crate) fn push_record_status(qb: &mut QueryBuilder<'_, Postgres>, query: &QueryFilter) {
    if let Some(status) = query.record_status {
        qb.push(" AND status = ").push_bind(status);
    }
}

#[derive(Clone)]
pub struct PostgresPersistence {
    pool: PgPool,
}

impl PostgresPersistence {
    pub fn new(pool: PgPool) -> Self {
        PostgresPersistence { pool }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => AppError::NotFound,
            sqlx::Error::Database(db_err) => match db_err.code().as_deref() {
                // unique_violation
                Some("23505") => AppError::AlreadyExists(
                    db_err
                        .constraint()
                        .unwrap_or("A record with this value already exists")
                        .to_string(),
                ),
                // serialization_failure, deadlock_detected
                Some("40001") | Some("40P01") => {
                    AppError::Conflict("Concurrent update detected".into())
                }
                // foreign_key_violation
                Some("23503") => AppError::InvalidInput("Referenced record not found".into()),
                // not_null_violation, check_violation
                Some("23502") | Some("23514") => {
                    AppError::InvalidInput(db_err.message().to_string())
                }
                _ => {
                    tracing::error!(error = %err, "Database error");
                    AppError::unavailable("Database operation failed")
                }
            },
            _ => {
                tracing::error!(error = %err, "Database error");
                AppError::unavailable("Database operation failed")
            }
        }
    }
}
