use std::collections::HashMap;

use uuid::Uuid;

use crate::{
    app_error::{AppError, AppResult},
    application::{
        filter::{apply_filter, count_matching, EntityFilter, Record},
        scope::TenantScope,
    },
};

/// Rows keyed by id. Every read goes through the caller's scope.
pub(crate) struct Table<T> {
    entity: &'static str,
    rows: HashMap<Uuid, T>,
}

impl<T: Record + Clone> Table<T> {
    pub fn new(entity: &'static str) -> Self {
        Self {
            entity,
            rows: HashMap::new(),
        }
    }

    pub fn ensure_vacant(&self, id: Uuid) -> AppResult<()> {
        if self.rows.contains_key(&id) {
            return Err(AppError::AlreadyExists(format!("{} {id}", self.entity)));
        }
        Ok(())
    }

    pub fn insert(&mut self, row: T) -> AppResult<()> {
        self.ensure_vacant(row.id())?;
        self.rows.insert(row.id(), row);
        Ok(())
    }

    pub fn get(&self, scope: &TenantScope, id: Uuid) -> Option<&T> {
        self.rows.get(&id).filter(|row| scope.owns(*row))
    }

    pub fn get_mut(&mut self, scope: &TenantScope, id: Uuid) -> Option<&mut T> {
        self.rows.get_mut(&id).filter(|row| scope.owns(&**row))
    }

    pub fn remove(&mut self, scope: &TenantScope, id: Uuid) -> Option<T> {
        self.get(scope, id)?;
        self.rows.remove(&id)
    }

    pub fn list<F: EntityFilter<T>>(&self, scope: &TenantScope, filter: &F) -> Vec<T> {
        apply_filter(self.rows.values(), scope, filter)
    }

    pub fn count<F: EntityFilter<T>>(&self, scope: &TenantScope, filter: &F) -> i64 {
        count_matching(self.rows.values(), scope, filter)
    }

    /// Unscoped scan, for sweeps that discover scopes themselves.
    pub fn rows(&self) -> impl Iterator<Item = &T> {
        self.rows.values()
    }

    pub fn scoped<'a>(&'a self, scope: &'a TenantScope) -> impl Iterator<Item = &'a T> + 'a {
        self.rows.values().filter(move |row| scope.owns(*row))
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&T) -> bool) {
        self.rows.retain(|_, row| keep(row));
    }
}
