use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::core::ledger::{Ledger, LedgerError};
use crate::core::models::transaction::CreditTransaction;
use crate::core::models::user::UserId;

/// Display-only mirror of the ledger's transaction log, most recent first.
#[derive(Default)]
pub struct TransactionHistory {
    entries: Mutex<Vec<CreditTransaction>>,
    loading: AtomicBool,
    generation: AtomicU64,
}

/// Clears the loading flag however the refresh ends.
struct LoadingGuard<'a>(&'a AtomicBool);

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl TransactionHistory {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<CreditTransaction>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn entries(&self) -> Vec<CreditTransaction> {
        self.lock().clone()
    }

    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Replace the list with the ledger's latest `limit` entries.
    ///
    /// On error the previous list is kept. A `clear` that happens while the
    /// fetch is in flight wins over the fetched data.
    pub async fn refresh(
        &self,
        ledger: &dyn Ledger,
        user_id: &UserId,
        limit: usize,
    ) -> Result<usize, LedgerError> {
        let generation = self.generation.load(Ordering::SeqCst);
        self.loading.store(true, Ordering::SeqCst);
        let _loading = LoadingGuard(&self.loading);

        let mut fetched = ledger.transactions(user_id, limit).await?;
        fetched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        fetched.truncate(limit);

        let mut entries = self.lock();
        if self.generation.load(Ordering::SeqCst) != generation {
            tracing::debug!(user_id = %user_id, "Discarding transaction refresh after clear");
            return Ok(entries.len());
        }
        *entries = fetched;
        Ok(entries.len())
    }

    pub fn clear(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.lock().clear();
    }
}
