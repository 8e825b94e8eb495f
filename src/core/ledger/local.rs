use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};

use crate::core::ledger::{Ledger, LedgerError};
use crate::core::models::balance::CreditBalance;
use crate::core::models::deduction::{AddCreditsRequest, DeductRequest, DeductionResult};
use crate::core::models::pricing::AgentPricing;
use crate::core::models::transaction::{CreditTransaction, TransactionType};
use crate::core::models::user::UserId;

const LEDGER_VERSION: u64 = 1;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Account {
    balance: i64,
    #[serde(default)]
    last_rollover: Option<DateTime<Utc>>,
    #[serde(default)]
    transactions: Vec<CreditTransaction>,
    /// Committed deductions keyed by idempotency key
    #[serde(default)]
    processed: HashMap<String, DeductionResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LedgerFile {
    #[serde(default)]
    version: u64,
    #[serde(default)]
    accounts: HashMap<String, Account>,
}

impl Default for LedgerFile {
    fn default() -> Self {
        Self {
            version: LEDGER_VERSION,
            accounts: HashMap::new(),
        }
    }
}

/// Single-process ledger persisted as JSON.
///
/// Stores whole credits: fractional debit amounts are rounded up before they
/// are applied.
pub struct LocalLedger {
    path: Option<PathBuf>,
    state: Mutex<LedgerFile>,
    pricing: HashMap<String, AgentPricing>,
}

impl LocalLedger {
    /// Open (or start) a ledger file. A missing file is an empty ledger.
    pub fn open(path: PathBuf) -> Result<Self, LedgerError> {
        let state = match std::fs::read_to_string(&path) {
            Ok(content) => {
                let file: LedgerFile = serde_json::from_str(&content).map_err(|e| {
                    LedgerError::Storage(format!("Corrupt ledger file {}: {}", path.display(), e))
                })?;
                if file.version != LEDGER_VERSION {
                    return Err(LedgerError::Storage(format!(
                        "Unsupported ledger version {} in {} (expected {})",
                        file.version,
                        path.display(),
                        LEDGER_VERSION
                    )));
                }
                file
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => LedgerFile::default(),
            Err(e) => {
                return Err(LedgerError::Storage(format!(
                    "Failed to read {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        Ok(Self {
            path: Some(path),
            state: Mutex::new(state),
            pricing: HashMap::new(),
        })
    }

    #[cfg(test)]
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(LedgerFile::default()),
            pricing: HashMap::new(),
        }
    }

    /// Serve these entries from [`Ledger::agent_pricing`].
    #[cfg(test)]
    pub fn with_pricing(mut self, entries: impl IntoIterator<Item = AgentPricing>) -> Self {
        for entry in entries {
            self.pricing.insert(entry.agent_id.clone(), entry);
        }
        self
    }

    fn lock(&self) -> MutexGuard<'_, LedgerFile> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Install `account` for `user_id` and write the file. On a failed write
    /// the previous account is put back, so memory never runs ahead of disk.
    fn commit(
        &self,
        state: &mut LedgerFile,
        user_id: &UserId,
        account: Account,
    ) -> Result<(), LedgerError> {
        let previous = state.accounts.insert(user_id.to_string(), account);
        if let Err(e) = self.persist(state) {
            match previous {
                Some(prev) => state.accounts.insert(user_id.to_string(), prev),
                None => state.accounts.remove(user_id.as_str()),
            };
            return Err(e);
        }
        Ok(())
    }

    fn persist(&self, state: &LedgerFile) -> Result<(), LedgerError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                LedgerError::Storage(format!("Failed to create {}: {}", parent.display(), e))
            })?;
        }
        let json = serde_json::to_string_pretty(state)
            .map_err(|e| LedgerError::Storage(format!("Failed to serialize ledger: {}", e)))?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .and_then(|_| std::fs::rename(&tmp, path))
            .map_err(|e| LedgerError::Storage(format!("Failed to write {}: {}", path.display(), e)))
    }
}

fn new_transaction_id() -> String {
    format!("tx_{}", uuid::Uuid::new_v4().simple())
}

/// Start of the billing period containing `now` (first day of the month, UTC).
fn period_start(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .with_day(1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
        .unwrap_or(now)
}

fn snapshot(account: &Account, now: DateTime<Utc>) -> CreditBalance {
    let start = period_start(now);
    let granted = |kind: TransactionType| -> i64 {
        account
            .transactions
            .iter()
            .filter(|t| t.kind == kind && t.amount > 0 && t.created_at >= start)
            .map(|t| t.amount)
            .sum()
    };
    let subscription_credits = granted(TransactionType::Subscription);
    CreditBalance {
        balance: account.balance.max(0),
        subscription_credits,
        topup_credits: granted(TransactionType::Topup),
        trial_credits: granted(TransactionType::Trial),
        last_rollover: account.last_rollover,
        rollover_eligible: subscription_credits > 0
            && account.last_rollover.map(|t| t < start).unwrap_or(true),
    }
}

#[async_trait]
impl Ledger for LocalLedger {
    async fn get_user_credits(&self, user_id: &UserId) -> Result<CreditBalance, LedgerError> {
        let state = self.lock();
        state
            .accounts
            .get(user_id.as_str())
            .map(|a| snapshot(a, Utc::now()))
            .ok_or_else(|| LedgerError::NotFound(user_id.to_string()))
    }

    async fn initialize_trial(
        &self,
        user_id: &UserId,
        amount: i64,
    ) -> Result<CreditBalance, LedgerError> {
        let mut state = self.lock();
        if let Some(existing) = state.accounts.get(user_id.as_str()) {
            return Ok(snapshot(existing, Utc::now()));
        }
        let amount = amount.max(0);
        let now = Utc::now();
        let mut account = Account {
            balance: amount,
            ..Account::default()
        };
        if amount > 0 {
            account.transactions.push(CreditTransaction {
                id: new_transaction_id(),
                kind: TransactionType::Trial,
                amount,
                description: "Welcome trial credits".to_string(),
                metadata: serde_json::Map::new(),
                created_at: now,
            });
        }
        let balance = snapshot(&account, now);
        self.commit(&mut state, user_id, account)?;
        Ok(balance)
    }

    async fn deduct(&self, request: &DeductRequest) -> Result<DeductionResult, LedgerError> {
        if !request.amount.is_finite() || request.amount < 0.0 {
            return Err(LedgerError::Rejected(format!(
                "invalid debit amount {}",
                request.amount
            )));
        }
        let mut state = self.lock();
        let mut account = state
            .accounts
            .get(request.user_id.as_str())
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(request.user_id.to_string()))?;

        if let Some(previous) = account.processed.get(request.idempotency_key.as_str()) {
            return Ok(DeductionResult {
                is_duplicate: true,
                ..previous.clone()
            });
        }

        let charge = request.amount.ceil() as i64;
        if account.balance < charge {
            return Ok(DeductionResult {
                success: false,
                new_balance: account.balance,
                transaction_id: None,
                credits_cost: request.amount,
                error: Some(format!(
                    "Insufficient credits: need {}, have {}",
                    charge, account.balance
                )),
                is_duplicate: false,
            });
        }

        account.balance -= charge;
        let mut metadata = serde_json::Map::new();
        metadata.insert("agent_id".into(), request.agent_id.clone().into());
        metadata.insert(
            "idempotency_key".into(),
            request.idempotency_key.as_str().into(),
        );
        metadata.insert("credits_cost".into(), serde_json::json!(request.amount));
        let tx = CreditTransaction {
            id: new_transaction_id(),
            kind: TransactionType::Usage,
            amount: -charge,
            description: request.description.clone(),
            metadata,
            created_at: Utc::now(),
        };
        let result = DeductionResult {
            success: true,
            new_balance: account.balance,
            transaction_id: Some(tx.id.clone()),
            credits_cost: request.amount,
            error: None,
            is_duplicate: false,
        };
        account.transactions.push(tx);
        account
            .processed
            .insert(request.idempotency_key.to_string(), result.clone());
        self.commit(&mut state, &request.user_id, account)?;
        Ok(result)
    }

    async fn add_credits(&self, request: &AddCreditsRequest) -> Result<bool, LedgerError> {
        if request.kind == TransactionType::Usage {
            return Err(LedgerError::Rejected(
                "usage entries are only created by deductions".to_string(),
            ));
        }
        if request.kind != TransactionType::AdminRevoke && request.amount <= 0 {
            return Err(LedgerError::Rejected(format!(
                "{} amount must be positive, got {}",
                request.kind.id(),
                request.amount
            )));
        }

        let mut state = self.lock();
        let mut account = state
            .accounts
            .get(request.user_id.as_str())
            .cloned()
            .unwrap_or_default();
        let now = Utc::now();
        let applied = if request.kind == TransactionType::AdminRevoke {
            -(request.amount.abs().min(account.balance.max(0)))
        } else {
            request.amount
        };
        account.balance += applied;
        if request.kind == TransactionType::Rollover {
            account.last_rollover = Some(now);
        }
        account.transactions.push(CreditTransaction {
            id: new_transaction_id(),
            kind: request.kind,
            amount: applied,
            description: request.description.clone(),
            metadata: request.metadata.clone(),
            created_at: now,
        });
        self.commit(&mut state, &request.user_id, account)?;
        Ok(true)
    }

    async fn transactions(
        &self,
        user_id: &UserId,
        limit: usize,
    ) -> Result<Vec<CreditTransaction>, LedgerError> {
        let state = self.lock();
        let Some(account) = state.accounts.get(user_id.as_str()) else {
            return Ok(Vec::new());
        };
        let mut entries: Vec<CreditTransaction> =
            account.transactions.iter().rev().cloned().collect();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        entries.truncate(limit);
        Ok(entries)
    }

    async fn agent_pricing(&self, agent_id: &str) -> Result<Option<AgentPricing>, LedgerError> {
        Ok(self.pricing.get(agent_id).cloned())
    }
}
