//! Test doubles for the ledger and telemetry seams.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::core::ledger::local::LocalLedger;
use crate::core::ledger::{Ledger, LedgerError};
use crate::core::models::balance::CreditBalance;
use crate::core::models::deduction::{AddCreditsRequest, DeductRequest, DeductionResult};
use crate::core::models::pricing::AgentPricing;
use crate::core::models::transaction::CreditTransaction;
use crate::core::models::user::UserId;
use crate::core::telemetry::{ActivityEvent, ErrorEvent, TelemetrySink};

#[derive(Clone, Copy)]
pub enum DeductBehavior {
    /// Delegate to the in-memory ledger
    Normal,
    /// Fail before touching the ledger
    Error(fn() -> LedgerError),
    /// Apply the debit, then report a failure as if the response was lost
    CommitThenError(fn() -> LedgerError),
    /// Never answer
    Hang,
}

/// In-memory ledger whose failures and timing can be scripted.
pub struct ScriptedLedger {
    inner: LocalLedger,
    behavior: Mutex<DeductBehavior>,
    requests: Mutex<Vec<DeductRequest>>,
    fail_reads: Mutex<bool>,
    fail_pricing: Mutex<bool>,
    pricing: Mutex<Option<AgentPricing>>,
    pricing_calls: AtomicUsize,
    read_calls: AtomicUsize,
    /// When set, `deduct` signals `deduct_entered` and waits on this before answering
    deduct_gate: Mutex<Option<Arc<Notify>>>,
    pub deduct_entered: Arc<Notify>,
    /// When set, `get_user_credits` reads first and waits on this before answering
    read_gate: Mutex<Option<Arc<Notify>>>,
    pub read_entered: Arc<Notify>,
    /// Same as `read_gate`, for `transactions`
    history_gate: Mutex<Option<Arc<Notify>>>,
    pub history_entered: Arc<Notify>,
}

impl ScriptedLedger {
    pub fn new() -> Self {
        Self {
            inner: LocalLedger::in_memory(),
            behavior: Mutex::new(DeductBehavior::Normal),
            requests: Mutex::new(Vec::new()),
            fail_reads: Mutex::new(false),
            fail_pricing: Mutex::new(false),
            pricing: Mutex::new(None),
            pricing_calls: AtomicUsize::new(0),
            read_calls: AtomicUsize::new(0),
            deduct_gate: Mutex::new(None),
            deduct_entered: Arc::new(Notify::new()),
            read_gate: Mutex::new(None),
            read_entered: Arc::new(Notify::new()),
            history_gate: Mutex::new(None),
            history_entered: Arc::new(Notify::new()),
        }
    }

    /// Ledger with an account already holding `balance` trial credits.
    pub async fn with_account(user: &UserId, balance: i64) -> Self {
        let ledger = Self::new();
        ledger.inner.initialize_trial(user, balance).await.unwrap();
        ledger
    }

    pub fn set_behavior(&self, behavior: DeductBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub fn fail_reads(&self, fail: bool) {
        *self.fail_reads.lock().unwrap() = fail;
    }

    pub fn fail_pricing(&self, fail: bool) {
        *self.fail_pricing.lock().unwrap() = fail;
    }

    pub fn set_pricing(&self, pricing: AgentPricing) {
        *self.pricing.lock().unwrap() = Some(pricing);
    }

    pub fn pricing_calls(&self) -> usize {
        self.pricing_calls.load(Ordering::SeqCst)
    }

    pub fn read_calls(&self) -> usize {
        self.read_calls.load(Ordering::SeqCst)
    }

    pub fn deduct_requests(&self) -> Vec<DeductRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn hold_deducts(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.deduct_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn hold_reads(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.read_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn hold_history(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.history_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn release_reads(&self) {
        *self.read_gate.lock().unwrap() = None;
    }

    /// Balance as the ledger sees it, bypassing scripted failures.
    pub async fn ledger_balance(&self, user: &UserId) -> i64 {
        self.inner.get_user_credits(user).await.unwrap().balance
    }

    pub async fn ledger_transactions(&self, user: &UserId) -> Vec<CreditTransaction> {
        self.inner.transactions(user, usize::MAX).await.unwrap()
    }
}

#[async_trait]
impl Ledger for ScriptedLedger {
    async fn get_user_credits(&self, user_id: &UserId) -> Result<CreditBalance, LedgerError> {
        self.read_calls.fetch_add(1, Ordering::SeqCst);
        if *self.fail_reads.lock().unwrap() {
            return Err(LedgerError::Transport("connection refused".into()));
        }
        let snapshot = self.inner.get_user_credits(user_id).await;
        let gate = self.read_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            self.read_entered.notify_one();
            gate.notified().await;
        }
        snapshot
    }

    async fn initialize_trial(
        &self,
        user_id: &UserId,
        amount: i64,
    ) -> Result<CreditBalance, LedgerError> {
        if *self.fail_reads.lock().unwrap() {
            return Err(LedgerError::Transport("connection refused".into()));
        }
        self.inner.initialize_trial(user_id, amount).await
    }

    async fn deduct(&self, request: &DeductRequest) -> Result<DeductionResult, LedgerError> {
        self.requests.lock().unwrap().push(request.clone());
        let gate = self.deduct_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            self.deduct_entered.notify_one();
            gate.notified().await;
        }
        let behavior = *self.behavior.lock().unwrap();
        match behavior {
            DeductBehavior::Normal => self.inner.deduct(request).await,
            DeductBehavior::Error(make) => Err(make()),
            DeductBehavior::CommitThenError(make) => {
                self.inner.deduct(request).await?;
                Err(make())
            }
            DeductBehavior::Hang => {
                std::future::pending::<()>().await;
                unreachable!()
            }
        }
    }

    async fn add_credits(&self, request: &AddCreditsRequest) -> Result<bool, LedgerError> {
        self.inner.add_credits(request).await
    }

    async fn transactions(
        &self,
        user_id: &UserId,
        limit: usize,
    ) -> Result<Vec<CreditTransaction>, LedgerError> {
        if *self.fail_reads.lock().unwrap() {
            return Err(LedgerError::Transport("connection refused".into()));
        }
        let entries = self.inner.transactions(user_id, limit).await;
        let gate = self.history_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            self.history_entered.notify_one();
            gate.notified().await;
        }
        entries
    }

    async fn agent_pricing(&self, agent_id: &str) -> Result<Option<AgentPricing>, LedgerError> {
        self.pricing_calls.fetch_add(1, Ordering::SeqCst);
        if *self.fail_pricing.lock().unwrap() {
            return Err(LedgerError::Http {
                status: 503,
                body: "unavailable".into(),
            });
        }
        Ok(self
            .pricing
            .lock()
            .unwrap()
            .clone()
            .filter(|p| p.agent_id == agent_id))
    }
}

/// Telemetry sink that keeps every event for assertions.
#[derive(Default)]
pub struct RecordingSink {
    pub activities: Mutex<Vec<ActivityEvent>>,
    pub errors: Mutex<Vec<ErrorEvent>>,
}

impl RecordingSink {
    pub fn activities(&self) -> Vec<ActivityEvent> {
        self.activities.lock().unwrap().clone()
    }

    pub fn errors(&self) -> Vec<ErrorEvent> {
        self.errors.lock().unwrap().clone()
    }
}

impl TelemetrySink for RecordingSink {
    fn log_activity(&self, event: ActivityEvent) {
        self.activities.lock().unwrap().push(event);
    }

    fn log_error(&self, event: ErrorEvent) {
        self.errors.lock().unwrap().push(event);
    }
}
