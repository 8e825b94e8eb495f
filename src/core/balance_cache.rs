use std::sync::{Mutex, MutexGuard};

use crate::core::models::balance::CreditBalance;

/// Session-scoped mirror of the ledger balance.
///
/// Every write bumps an epoch. A refresh captures the epoch when it starts and
/// is only applied if nothing was written in the meantime, so a slow plain
/// refresh can never overwrite a deduction's optimistic decrement or its
/// reconciled value. Starting a refresh also bumps the epoch, which makes the
/// most recently started refresh the only authoritative one.
pub struct BalanceCache {
    state: Mutex<CacheState>,
    low_balance_threshold: i64,
}

#[derive(Default)]
struct CacheState {
    balance: Option<CreditBalance>,
    epoch: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshTicket {
    epoch: u64,
}

/// Record of one optimistic decrement, needed to undo it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptimisticHold {
    /// Balance before the decrement
    pub previous: i64,
    /// Credits actually removed locally (after clamping)
    pub applied: i64,
    epoch: u64,
}

impl BalanceCache {
    pub fn new(low_balance_threshold: i64) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            low_balance_threshold,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self) -> Option<CreditBalance> {
        self.lock().balance.clone()
    }

    /// Spendable credits, 0 when nothing is loaded.
    pub fn available(&self) -> i64 {
        self.lock().balance.as_ref().map(|b| b.balance).unwrap_or(0)
    }

    pub fn is_loaded(&self) -> bool {
        self.lock().balance.is_some()
    }

    pub fn has_credits(&self) -> bool {
        self.lock()
            .balance
            .as_ref()
            .map(|b| b.has_credits())
            .unwrap_or(false)
    }

    /// An unloaded cache counts as low.
    pub fn is_low_balance(&self) -> bool {
        self.lock()
            .balance
            .as_ref()
            .map(|b| b.is_low(self.low_balance_threshold))
            .unwrap_or(true)
    }

    pub fn low_balance_threshold(&self) -> i64 {
        self.low_balance_threshold
    }

    /// Unconditionally replace the cached snapshot.
    pub fn replace(&self, balance: Option<CreditBalance>) {
        let mut state = self.lock();
        state.balance = balance;
        state.epoch += 1;
    }

    pub fn clear(&self) {
        self.replace(None);
    }

    pub fn begin_refresh(&self) -> RefreshTicket {
        let mut state = self.lock();
        state.epoch += 1;
        RefreshTicket { epoch: state.epoch }
    }

    /// Apply a refresh result. Returns false when a newer write won.
    pub fn complete_refresh(&self, ticket: RefreshTicket, balance: CreditBalance) -> bool {
        let mut state = self.lock();
        if state.epoch != ticket.epoch {
            tracing::debug!(
                ticket = ticket.epoch,
                current = state.epoch,
                "Discarding stale balance refresh"
            );
            return false;
        }
        state.balance = Some(balance);
        state.epoch += 1;
        true
    }

    /// Decrement the cached balance by `cost`, clamped at zero.
    ///
    /// Returns `None` when no balance is loaded; there is nothing to undo then.
    pub fn apply_optimistic(&self, cost: f64) -> Option<OptimisticHold> {
        let mut state = self.lock();
        let current = state.balance.as_ref()?.balance;
        let next = ((current as f64) - cost.max(0.0)).floor().max(0.0) as i64;
        state.epoch += 1;
        let epoch = state.epoch;
        if let Some(b) = state.balance.as_mut() {
            b.balance = next;
        }
        Some(OptimisticHold {
            previous: current,
            applied: current - next,
            epoch,
        })
    }

    /// Overwrite the balance with the ledger's confirmed value (last writer wins).
    pub fn reconcile(&self, new_balance: i64) {
        let mut state = self.lock();
        state.epoch += 1;
        match state.balance.as_mut() {
            Some(b) => b.balance = new_balance.max(0),
            None => state.balance = Some(CreditBalance::trial(0).with_balance(new_balance)),
        }
    }

    /// Undo an optimistic decrement.
    ///
    /// Restores the exact previous value when nothing else wrote since the
    /// hold was taken. Otherwise the removed credits are added back onto the
    /// current value and `false` is returned so the caller can resync.
    pub fn rollback(&self, hold: OptimisticHold) -> bool {
        let mut state = self.lock();
        let exact = state.epoch == hold.epoch;
        state.epoch += 1;
        match state.balance.as_mut() {
            Some(b) if exact => {
                b.balance = hold.previous;
                true
            }
            Some(b) => {
                b.balance = (b.balance + hold.applied).max(0);
                false
            }
            None => false,
        }
    }
}
