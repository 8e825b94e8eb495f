use serde::{Deserialize, Serialize};

use crate::core::idempotency::IdempotencyKey;
use crate::core::models::transaction::TransactionType;
use crate::core::models::user::UserId;

/// One idempotent debit request sent to the ledger.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeductRequest {
    pub user_id: UserId,
    pub amount: f64,
    pub agent_id: String,
    pub description: String,
    pub idempotency_key: IdempotencyKey,
}

/// Ledger's answer to a [`DeductRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeductionResult {
    pub success: bool,
    #[serde(default)]
    pub new_balance: i64,
    #[serde(default)]
    pub transaction_id: Option<String>,
    #[serde(default)]
    pub credits_cost: f64,
    #[serde(default, alias = "error_message")]
    pub error: Option<String>,
    /// Set when the idempotency key had already been applied
    #[serde(default)]
    pub is_duplicate: bool,
}

impl DeductionResult {
    /// Whether a failed result reports a server-side balance shortfall.
    pub fn is_insufficient_funds(&self) -> bool {
        !self.success
            && self
                .error
                .as_deref()
                .map(|e| e.to_lowercase().contains("insufficient"))
                .unwrap_or(false)
    }
}

/// Credit grant used for purchase fulfillment and admin adjustments.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AddCreditsRequest {
    pub user_id: UserId,
    pub amount: i64,
    pub kind: TransactionType,
    pub description: String,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}
