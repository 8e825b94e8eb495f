use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;

use crate::core::balance_cache::{BalanceCache, OptimisticHold};
use crate::core::idempotency::{IdempotencyKey, KeyIntent};
use crate::core::ledger::{Ledger, LedgerError};
use crate::core::models::deduction::{DeductRequest, DeductionResult};
use crate::core::models::pricing::ChargePolicy;
use crate::core::models::user::UserId;
use crate::core::pricing::PricingResolver;
use crate::core::telemetry::{ActivityEvent, ErrorEvent, Severity, TelemetrySink};

/// Scope segment of deduction idempotency keys.
pub const DEDUCT_SCOPE: &str = "deduct";

/// Lifecycle of one deduction attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    OptimisticallyApplied,
    Committed,
    RolledBack,
}

/// A debit the ledger confirmed.
#[derive(Debug, Clone, PartialEq)]
pub struct Committed {
    pub agent_id: String,
    pub cost: f64,
    pub new_balance: i64,
    pub transaction_id: Option<String>,
    pub idempotency_key: IdempotencyKey,
    /// The ledger had already applied this key
    pub duplicate: bool,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeductionFailure {
    #[error("A deduction for {agent_id} is already in progress")]
    InFlight { agent_id: String },
    #[error("No signed-in user to charge")]
    Unauthenticated,
    #[error("Insufficient credits: need {required}, have {available}")]
    InsufficientCredits { required: f64, available: i64 },
    #[error("Deduction timed out after {after_ms} ms")]
    Timeout { after_ms: u64 },
    #[error("Ledger unavailable: {0}")]
    Transient(String),
    #[error("Deduction rejected: {message}")]
    Rejected { message: String, reference: String },
    #[error("Unexpected deduction failure: {message}")]
    Unexpected { message: String, reference: String },
}

impl DeductionFailure {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InFlight { .. } => "in_flight",
            Self::Unauthenticated => "unauthenticated",
            Self::InsufficientCredits { .. } => "insufficient_credits",
            Self::Timeout { .. } => "timeout",
            Self::Transient(_) => "transient",
            Self::Rejected { .. } => "rejected",
            Self::Unexpected { .. } => "unexpected",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            Self::InFlight { .. } | Self::Unauthenticated | Self::InsufficientCredits { .. } => {
                Severity::Low
            }
            Self::Timeout { .. } | Self::Transient(_) => Severity::Medium,
            Self::Rejected { .. } => Severity::High,
            Self::Unexpected { .. } => Severity::Critical,
        }
    }

    /// Whether sending the same message again may succeed without user action.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Transient(_) | Self::InFlight { .. })
    }

    /// Support reference for failures the user cannot fix themselves.
    pub fn reference(&self) -> Option<&str> {
        match self {
            Self::Rejected { reference, .. } | Self::Unexpected { reference, .. } => {
                Some(reference.as_str())
            }
            _ => None,
        }
    }
}

/// Optimistic decrement that is undone unless explicitly committed.
///
/// Dropping an attempt that is still `OptimisticallyApplied` (e.g. the caller's
/// future was cancelled) rolls it back.
struct Attempt<'a> {
    cache: &'a BalanceCache,
    hold: Option<OptimisticHold>,
    state: AttemptState,
}

impl<'a> Attempt<'a> {
    fn begin(cache: &'a BalanceCache, cost: f64) -> Self {
        let hold = cache.apply_optimistic(cost);
        Self {
            cache,
            hold,
            state: AttemptState::OptimisticallyApplied,
        }
    }

    fn commit(&mut self, new_balance: i64) {
        self.cache.reconcile(new_balance);
        self.state = AttemptState::Committed;
    }

    /// Returns false when the local value could not be restored exactly.
    fn roll_back(&mut self) -> bool {
        self.state = AttemptState::RolledBack;
        match self.hold.take() {
            Some(hold) => self.cache.rollback(hold),
            None => true,
        }
    }
}

impl Drop for Attempt<'_> {
    fn drop(&mut self) {
        if self.state == AttemptState::OptimisticallyApplied {
            tracing::warn!("Deduction abandoned mid-flight, rolling back optimistic update");
            self.roll_back();
        }
    }
}

/// Marks a (user, agent) pair busy for the duration of one deduction.
struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<String>>,
    key: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.key);
    }
}

/// Orchestrates optimistic decrement, idempotent ledger debit and reconciliation.
pub struct DeductionCoordinator {
    ledger: Arc<dyn Ledger>,
    pricing: Arc<PricingResolver>,
    cache: Arc<BalanceCache>,
    telemetry: Arc<dyn TelemetrySink>,
    policy: ChargePolicy,
    timeout: Duration,
    in_flight: Mutex<HashSet<String>>,
}

impl DeductionCoordinator {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        pricing: Arc<PricingResolver>,
        cache: Arc<BalanceCache>,
        telemetry: Arc<dyn TelemetrySink>,
        policy: ChargePolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            ledger,
            pricing,
            cache,
            telemetry,
            policy,
            timeout,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Whether a deduction for this user and agent is pending.
    pub fn is_in_flight(&self, user_id: &UserId, agent_id: &str) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&in_flight_key(user_id, agent_id))
    }

    fn claim(&self, user_id: &UserId, agent_id: &str) -> Result<InFlightGuard<'_>, DeductionFailure> {
        let key = in_flight_key(user_id, agent_id);
        let mut set = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if !set.insert(key.clone()) {
            return Err(DeductionFailure::InFlight {
                agent_id: agent_id.to_string(),
            });
        }
        Ok(InFlightGuard {
            set: &self.in_flight,
            key,
        })
    }

    /// Charge the user for one interaction with `agent_id`.
    ///
    /// Every path ends in a terminal state before returning: the cache holds
    /// either the ledger-confirmed balance or the pre-attempt balance.
    pub async fn deduct_credits(
        &self,
        user_id: &UserId,
        agent_id: &str,
    ) -> Result<Committed, DeductionFailure> {
        let _guard = match self.claim(user_id, agent_id) {
            Ok(guard) => guard,
            Err(failure) => {
                tracing::debug!(user_id = %user_id, agent_id, "Deduction already in flight");
                return Err(failure);
            }
        };

        let pricing = self.pricing.get_agent_pricing(agent_id).await;
        let cost = self.policy.debit_amount(&pricing);
        let key = IdempotencyKey::for_action(KeyIntent::NewAction, DEDUCT_SCOPE, agent_id, user_id);
        let request = DeductRequest {
            user_id: user_id.clone(),
            amount: cost,
            agent_id: agent_id.to_string(),
            description: format!("Chat with {}", agent_id),
            idempotency_key: key,
        };

        let mut attempt = Attempt::begin(&self.cache, cost);
        let outcome = tokio::time::timeout(self.timeout, self.ledger.deduct(&request)).await;

        let result = match outcome {
            Ok(Ok(res)) if res.success => {
                attempt.commit(res.new_balance);
                Ok(committed(&request, res))
            }
            Ok(Ok(res)) => {
                let failure = classify_refusal(&request, res.clone());
                attempt.roll_back();
                if matches!(failure, DeductionFailure::InsufficientCredits { .. }) {
                    // The refusal carries the ledger's own balance.
                    self.cache.reconcile(res.new_balance);
                }
                Err(failure)
            }
            Ok(Err(e)) => {
                let failure = classify_error(&request, e);
                if !attempt.roll_back() {
                    self.resync(user_id).await;
                }
                Err(failure)
            }
            Err(_) => {
                if !attempt.roll_back() {
                    self.resync(user_id).await;
                }
                Err(DeductionFailure::Timeout {
                    after_ms: self.timeout.as_millis() as u64,
                })
            }
        };

        self.report(&request, &result);
        result
    }

    /// Re-read the balance after a rollback that could not be restored exactly.
    async fn resync(&self, user_id: &UserId) {
        let ticket = self.cache.begin_refresh();
        match self.ledger.get_user_credits(user_id).await {
            Ok(balance) => {
                self.cache.complete_refresh(ticket, balance);
            }
            Err(e) => tracing::warn!(user_id = %user_id, error = %e, "Balance resync after rollback failed"),
        }
    }

    fn report(&self, request: &DeductRequest, result: &Result<Committed, DeductionFailure>) {
        let user = Some(request.user_id.as_str());
        match result {
            Ok(c) => {
                if c.duplicate {
                    tracing::warn!(
                        agent_id = %c.agent_id,
                        idempotency_key = %c.idempotency_key,
                        transaction_id = c.transaction_id.as_deref().unwrap_or("-"),
                        "Ledger reported duplicate deduction, no second debit applied"
                    );
                }
                tracing::info!(
                    agent_id = %c.agent_id,
                    cost = c.cost,
                    new_balance = c.new_balance,
                    transaction_id = c.transaction_id.as_deref().unwrap_or("-"),
                    idempotency_key = %c.idempotency_key,
                    duplicate = c.duplicate,
                    "Credits deducted"
                );
                self.telemetry.log_activity(
                    ActivityEvent::new("credits_deducted", user)
                        .detail("agent_id", c.agent_id.clone())
                        .detail("cost", c.cost)
                        .detail("new_balance", c.new_balance)
                        .detail("transaction_id", c.transaction_id.clone())
                        .detail("idempotency_key", c.idempotency_key.to_string())
                        .detail("duplicate", c.duplicate),
                );
            }
            Err(failure) => {
                let balance_after = self.cache.available();
                let mut event = ErrorEvent::new(
                    format!("Credit deduction failed: {}", failure),
                    failure.severity(),
                    user,
                )
                .context("agent_id", request.agent_id.clone())
                .context("cost", request.amount)
                .context("idempotency_key", request.idempotency_key.to_string())
                .context("failure", failure.kind())
                .context("balance_after", balance_after);
                if let Some(reference) = failure.reference() {
                    event = event.reference(reference);
                }
                self.telemetry.log_error(event);
                self.telemetry.log_activity(
                    ActivityEvent::new("credit_deduction_failed", user)
                        .detail("agent_id", request.agent_id.clone())
                        .detail("cost", request.amount)
                        .detail("failure", failure.kind())
                        .detail("idempotency_key", request.idempotency_key.to_string()),
                );
            }
        }
    }
}

fn in_flight_key(user_id: &UserId, agent_id: &str) -> String {
    format!("{}:{}", user_id, agent_id.trim().to_lowercase())
}

/// Short support token derived from the attempt's idempotency key nonce.
fn reference_for(request: &DeductRequest) -> String {
    request
        .idempotency_key
        .as_str()
        .rsplit('_')
        .next()
        .unwrap_or_default()
        .chars()
        .take(8)
        .collect::<String>()
        .to_uppercase()
}

fn committed(request: &DeductRequest, res: DeductionResult) -> Committed {
    Committed {
        agent_id: request.agent_id.clone(),
        cost: request.amount,
        new_balance: res.new_balance.max(0),
        transaction_id: res.transaction_id,
        idempotency_key: request.idempotency_key.clone(),
        duplicate: res.is_duplicate,
    }
}

fn classify_refusal(request: &DeductRequest, res: DeductionResult) -> DeductionFailure {
    if res.is_insufficient_funds() {
        DeductionFailure::InsufficientCredits {
            required: request.amount,
            available: res.new_balance.max(0),
        }
    } else {
        DeductionFailure::Rejected {
            message: res
                .error
                .unwrap_or_else(|| "deduction was not applied".to_string()),
            reference: reference_for(request),
        }
    }
}

fn classify_error(request: &DeductRequest, error: LedgerError) -> DeductionFailure {
    match error {
        LedgerError::Timeout => DeductionFailure::Transient("ledger request timed out".into()),
        e if e.is_transient() => DeductionFailure::Transient(e.to_string()),
        LedgerError::Rejected(message) => DeductionFailure::Rejected {
            message,
            reference: reference_for(request),
        },
        e => DeductionFailure::Unexpected {
            message: e.to_string(),
            reference: reference_for(request),
        },
    }
}
