//! Tenant / environment isolation for every aggregate operation.
//!
//! A [`TenantScope`] is built once per request by the caller and passed by
//! reference into every use case and repository method. Records carry their
//! owning tenant and environment through [`TenantOwned`]; a record outside the
//! scope is reported as `NotFound`, never as a permission error, so callers
//! cannot discover foreign identifiers.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::app_error::{AppError, AppResult};

pub trait TenantOwned {
    fn tenant_id(&self) -> &str;
    fn environment_id(&self) -> &str;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantScope {
    tenant_id: String,
    environment_id: String,
    actor: Option<String>,
    deadline: Option<Instant>,
}

impl TenantScope {
    pub fn new(tenant_id: impl Into<String>, environment_id: impl Into<String>) -> AppResult<Self> {
        let tenant_id = tenant_id.into();
        let environment_id = environment_id.into();
        if tenant_id.trim().is_empty() {
            return Err(AppError::InvalidInput("tenant_id is required".into()));
        }
        if environment_id.trim().is_empty() {
            return Err(AppError::InvalidInput("environment_id is required".into()));
        }
        Ok(Self {
            tenant_id,
            environment_id,
            actor: None,
            deadline: None,
        })
    }

    /// Records who performs the operation; written to `created_by` / `updated_by`.
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    /// Bounds every storage call made under this scope. The clock starts now.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn environment_id(&self) -> &str {
        &self.environment_id
    }

    pub fn actor(&self) -> Option<&str> {
        self.actor.as_deref()
    }

    pub fn admits(&self, tenant_id: &str, environment_id: &str) -> bool {
        self.tenant_id == tenant_id && self.environment_id == environment_id
    }

    pub fn owns<T: TenantOwned + ?Sized>(&self, record: &T) -> bool {
        self.admits(record.tenant_id(), record.environment_id())
    }

    pub fn ensure_owns<T: TenantOwned + ?Sized>(&self, record: &T) -> AppResult<()> {
        if self.owns(record) {
            Ok(())
        } else {
            Err(AppError::NotFound)
        }
    }

    /// Runs a storage future under the scope deadline.
    ///
    /// On expiry the future is dropped and `Cancelled` is returned. Stores only
    /// commit at the end of a call, so a dropped call leaves no partial write.
    pub async fn bounded<T, F>(&self, fut: F) -> AppResult<T>
    where
        F: Future<Output = AppResult<T>>,
    {
        match self.deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, fut).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!(
                        tenant_id = %self.tenant_id,
                        environment_id = %self.environment_id,
                        "Storage call exceeded scope deadline"
                    );
                    Err(AppError::Cancelled)
                }
            },
            None => fut.await,
        }
    }
}
