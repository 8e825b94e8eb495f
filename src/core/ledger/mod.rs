pub mod local;
pub mod remote;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::core::config::{LedgerBackend, LedgerConfig};
use crate::core::models::balance::CreditBalance;
use crate::core::models::deduction::{AddCreditsRequest, DeductRequest, DeductionResult};
use crate::core::models::pricing::AgentPricing;
use crate::core::models::transaction::CreditTransaction;
use crate::core::models::user::UserId;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("No credit record for user {0}")]
    NotFound(String),
    #[error("Ledger request timed out")]
    Timeout,
    #[error("Ledger transport error: {0}")]
    Transport(String),
    #[error("Ledger returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("Failed to parse ledger response: {0}")]
    Decode(String),
    #[error("Ledger rejected request: {0}")]
    Rejected(String),
    #[error("Ledger storage error: {0}")]
    Storage(String),
}

impl LedgerError {
    /// Failures worth retrying with the same idempotency key.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout | Self::Transport(_) => true,
            Self::Http { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

/// Authoritative server-side credit store.
///
/// `deduct` must be idempotent per [`DeductRequest::idempotency_key`]: a second
/// call with the same key applies nothing and reports `is_duplicate = true`.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Current balance, or [`LedgerError::NotFound`] for a user with no record.
    async fn get_user_credits(&self, user_id: &UserId) -> Result<CreditBalance, LedgerError>;

    /// Create a record holding a starter trial grant.
    async fn initialize_trial(
        &self,
        user_id: &UserId,
        amount: i64,
    ) -> Result<CreditBalance, LedgerError>;

    async fn deduct(&self, request: &DeductRequest) -> Result<DeductionResult, LedgerError>;

    async fn add_credits(&self, request: &AddCreditsRequest) -> Result<bool, LedgerError>;

    /// Most recent entries first.
    async fn transactions(
        &self,
        user_id: &UserId,
        limit: usize,
    ) -> Result<Vec<CreditTransaction>, LedgerError>;

    async fn agent_pricing(&self, agent_id: &str) -> Result<Option<AgentPricing>, LedgerError>;
}

/// Read a user's balance, lazily granting the trial when no record exists yet.
pub async fn load_or_initialize(
    ledger: &dyn Ledger,
    user_id: &UserId,
    trial_grant: i64,
) -> Result<CreditBalance, LedgerError> {
    match ledger.get_user_credits(user_id).await {
        Err(LedgerError::NotFound(_)) => {
            tracing::info!(user_id = %user_id, trial_grant, "No credit record, initializing trial");
            ledger.initialize_trial(user_id, trial_grant).await
        }
        other => other,
    }
}

/// Build the ledger selected by configuration.
pub fn open(config: &LedgerConfig) -> anyhow::Result<Arc<dyn Ledger>> {
    match config.backend {
        LedgerBackend::Local => {
            let path = config.local_path();
            tracing::debug!(path = %path.display(), "Opening local ledger");
            Ok(Arc::new(local::LocalLedger::open(path)?))
        }
        LedgerBackend::Remote => {
            let url = config
                .url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("ledger.url is required for the remote backend"))?;
            let api_key = config.resolved_api_key().ok_or_else(|| {
                anyhow::anyhow!("ledger.api_key or CREDMETER_LEDGER_KEY is required for the remote backend")
            })?;
            Ok(Arc::new(remote::RemoteLedger::new(
                url,
                &api_key,
                config.timeout(),
                config.max_retries,
            )?))
        }
    }
}
