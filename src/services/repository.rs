//! Ledger persistence interface.
//!
//! The engine reads and writes whole [`LedgerState`] records through
//! [`LedgerRepository`] and never touches a storage technology directly.

use crate::types::LedgerState;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::debug;

/// Storage errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error("Corrupt ledger record: {0}")]
    Corrupt(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Durable home of ledger states.
///
/// `save` must be all-or-nothing: after an error the previously saved state
/// is still what `load` returns.
pub trait LedgerRepository: Send + Sync {
    /// Load an account's state, `None` if the account does not exist.
    fn load(&self, account_id: &str) -> Result<Option<LedgerState>, StoreError>;

    /// Persist an account's full state.
    fn save(&self, state: &LedgerState) -> Result<(), StoreError>;

    /// IDs of every stored account.
    fn account_ids(&self) -> Result<Vec<String>, StoreError>;
}

/// In-memory repository.
#[derive(Default)]
pub struct MemoryLedgerStore {
    states: DashMap<String, LedgerState>,
    fail_saves: AtomicBool,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `save` fail until switched off again.
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

impl LedgerRepository for MemoryLedgerStore {
    fn load(&self, account_id: &str) -> Result<Option<LedgerState>, StoreError> {
        Ok(self.states.get(account_id).map(|s| s.value().clone()))
    }

    fn save(&self, state: &LedgerState) -> Result<(), StoreError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("writes disabled".to_string()));
        }
        self.states
            .insert(state.account.id.clone(), state.clone());
        debug!("Saved ledger for account {}", state.account.id);
        Ok(())
    }

    fn account_ids(&self) -> Result<Vec<String>, StoreError> {
        let mut ids: Vec<String> = self.states.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Account;
    use rust_decimal_macros::dec;

    #[test]
    fn test_memory_store_load_missing() {
        let store = MemoryLedgerStore::new();
        assert!(store.load("nobody").unwrap().is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_memory_store_save_and_load() {
        let store = MemoryLedgerStore::new();
        let state = LedgerState::new(Account::new("acct-1".to_string(), dec!(10000)));

        store.save(&state).unwrap();

        let loaded = store.load("acct-1").unwrap().unwrap();
        assert_eq!(loaded, state);
        assert_eq!(store.account_ids().unwrap(), vec!["acct-1".to_string()]);
    }

    #[test]
    fn test_memory_store_failed_save_keeps_previous() {
        let store = MemoryLedgerStore::new();
        let mut state = LedgerState::new(Account::new("acct-1".to_string(), dec!(10000)));
        store.save(&state).unwrap();

        store.set_fail_saves(true);
        state.account.cash_balance = dec!(1);
        assert!(matches!(store.save(&state), Err(StoreError::Unavailable(_))));

        let loaded = store.load("acct-1").unwrap().unwrap();
        assert_eq!(loaded.account.cash_balance, dec!(10000));

        store.set_fail_saves(false);
        store.save(&state).unwrap();
        assert_eq!(store.load("acct-1").unwrap().unwrap().account.cash_balance, dec!(1));
    }
}
