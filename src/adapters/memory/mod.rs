//! Process-local stores implementing the repository ports.
//!
//! Each store keeps its whole state behind one mutex, so a call observes and
//! commits its writes atomically. Nothing is held across an `.await`.

mod table;
pub mod subscription;
pub mod wallet;

pub use subscription::InMemorySubscriptionStore;
pub use wallet::InMemoryWalletStore;

use std::sync::{Mutex, MutexGuard};

use crate::app_error::{AppError, AppResult};

/// A poisoned lock means a writer panicked mid-update; surface it as a storage fault.
pub(crate) fn lock<'a, T>(state: &'a Mutex<T>, store: &str) -> AppResult<MutexGuard<'a, T>> {
    state
        .lock()
        .map_err(|_| AppError::unavailable(format!("{store} store lock poisoned")))
}
