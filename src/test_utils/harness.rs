//! Use cases wired onto fresh in-memory stores and a manual clock.

use std::sync::Arc;

use crate::{
    adapters::memory::{InMemorySubscriptionStore, InMemoryWalletStore},
    application::{
        clock::ManualClock,
        use_cases::{
            subscription::SubscriptionAggregateStore,
            subscription_pause::PauseStateMachine,
            wallet::{DEFAULT_MAX_RETRIES, WalletLedger},
        },
    },
};

use super::factories::test_datetime;

/// Above the number of writes any contended test makes, so a lost race
/// always gets another attempt.
const TEST_MAX_RETRIES: u32 = 64;

pub struct WalletHarness {
    pub ledger: WalletLedger,
    pub store: Arc<InMemoryWalletStore>,
    pub clock: Arc<ManualClock>,
}

pub fn wallet_harness() -> WalletHarness {
    let store = Arc::new(InMemoryWalletStore::new());
    let clock = Arc::new(ManualClock::new(test_datetime()));
    WalletHarness {
        ledger: WalletLedger::new(store.clone(), clock.clone(), TEST_MAX_RETRIES),
        store,
        clock,
    }
}

pub struct SubscriptionHarness {
    pub subscriptions: SubscriptionAggregateStore,
    pub pauses: PauseStateMachine,
    pub store: Arc<InMemorySubscriptionStore>,
    pub clock: Arc<ManualClock>,
}

pub fn subscription_harness() -> SubscriptionHarness {
    let store = Arc::new(InMemorySubscriptionStore::new());
    let clock = Arc::new(ManualClock::new(test_datetime()));
    SubscriptionHarness {
        subscriptions: SubscriptionAggregateStore::new(
            store.clone(),
            clock.clone(),
            DEFAULT_MAX_RETRIES,
        ),
        pauses: PauseStateMachine::new(store.clone(), clock.clone(), TEST_MAX_RETRIES),
        store,
        clock,
    }
}
