use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Snapshot of a user's spendable credits as reported by the ledger.
///
/// `balance` is the ledger's running total. The categorized fields are a
/// period-scoped view (positive grants since the start of the current billing
/// period) and are not expected to sum to `balance`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditBalance {
    /// Total usable credits
    pub balance: i64,
    /// Subscription credits granted this period
    #[serde(default)]
    pub subscription_credits: i64,
    /// One-time top-up credits granted this period
    #[serde(default)]
    pub topup_credits: i64,
    /// Trial credits granted this period
    #[serde(default)]
    pub trial_credits: i64,
    /// When unused subscription credits were last carried over
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_rollover: Option<DateTime<Utc>>,
    #[serde(default)]
    pub rollover_eligible: bool,
}

impl CreditBalance {
    /// Balance of a freshly initialized account holding only a trial grant.
    pub fn trial(amount: i64) -> Self {
        let amount = amount.max(0);
        Self {
            balance: amount,
            subscription_credits: 0,
            topup_credits: 0,
            trial_credits: amount,
            last_rollover: None,
            rollover_eligible: false,
        }
    }

    /// Copy of this snapshot with the running total replaced, clamped at zero.
    pub fn with_balance(&self, balance: i64) -> Self {
        Self {
            balance: balance.max(0),
            ..self.clone()
        }
    }

    pub fn has_credits(&self) -> bool {
        self.balance > 0
    }

    pub fn is_low(&self, threshold: i64) -> bool {
        self.balance < threshold
    }
}
