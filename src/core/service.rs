use std::sync::{Arc, Mutex};

use crate::core::balance_cache::BalanceCache;
use crate::core::config::{AppConfig, CreditsConfig};
use crate::core::deduction::{Committed, DeductionCoordinator, DeductionFailure};
use crate::core::eligibility::Eligibility;
use crate::core::gate::{self, GateDecision};
use crate::core::ledger::{self, Ledger, LedgerError};
use crate::core::models::balance::CreditBalance;
use crate::core::models::deduction::AddCreditsRequest;
use crate::core::models::pricing::AgentPricing;
use crate::core::models::transaction::CreditTransaction;
use crate::core::models::user::UserId;
use crate::core::pricing::PricingResolver;
use crate::core::telemetry::{ActivityEvent, ErrorEvent, HttpSink, Severity, TelemetrySink, TracingSink};
use crate::core::transactions::TransactionHistory;

/// Session-scoped credit state for one signed-in user.
///
/// Owns the balance cache, the transaction history and the deduction
/// coordinator. Construct one per session and pass it to whatever drives the
/// chat flow.
pub struct CreditService {
    ledger: Arc<dyn Ledger>,
    pricing: Arc<PricingResolver>,
    cache: Arc<BalanceCache>,
    history: TransactionHistory,
    coordinator: DeductionCoordinator,
    telemetry: Arc<dyn TelemetrySink>,
    user: Mutex<Option<UserId>>,
    trial_grant: i64,
    history_limit: usize,
}

impl CreditService {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        pricing: PricingResolver,
        telemetry: Arc<dyn TelemetrySink>,
        credits: &CreditsConfig,
    ) -> Self {
        let pricing = Arc::new(pricing);
        let cache = Arc::new(BalanceCache::new(credits.low_balance_threshold));
        let coordinator = DeductionCoordinator::new(
            ledger.clone(),
            pricing.clone(),
            cache.clone(),
            telemetry.clone(),
            credits.charge_policy,
            credits.deduct_timeout(),
        );
        Self {
            ledger,
            pricing,
            cache,
            history: TransactionHistory::new(),
            coordinator,
            telemetry,
            user: Mutex::new(None),
            trial_grant: credits.trial_grant,
            history_limit: credits.history_limit,
        }
    }

    pub fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let ledger = ledger::open(&config.ledger)?;
        let pricing = PricingResolver::new(config.pricing.clone()).with_ledger(ledger.clone());
        let telemetry: Arc<dyn TelemetrySink> = match &config.telemetry.endpoint {
            Some(endpoint) => Arc::new(HttpSink::new(endpoint)?),
            None => Arc::new(TracingSink),
        };
        Ok(Self::new(ledger, pricing, telemetry, &config.credits))
    }

    pub fn telemetry(&self) -> Arc<dyn TelemetrySink> {
        self.telemetry.clone()
    }

    pub fn current_user(&self) -> Option<UserId> {
        self.user.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Switch the signed-in user. Cached state always starts over; a new user
    /// gets balance and history loaded.
    pub async fn on_auth_change(&self, user: Option<UserId>) -> Result<(), LedgerError> {
        let previous = {
            let mut current = self.user.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *current, user.clone())
        };
        self.cache.clear();
        self.history.clear();

        match user {
            None => {
                if let Some(previous) = previous {
                    tracing::info!(user_id = %previous, "Signed out, credit state cleared");
                }
                Ok(())
            }
            Some(user) => {
                tracing::info!(user_id = %user, "Signed in, loading credit state");
                self.refresh_balance().await?;
                if let Err(e) = self.refresh_transactions().await {
                    tracing::warn!(user_id = %user, error = %e, "Could not load transaction history");
                }
                Ok(())
            }
        }
    }

    pub fn balance(&self) -> Option<CreditBalance> {
        self.cache.get()
    }

    /// Re-read the balance from the ledger, initializing the trial for a new user.
    ///
    /// Returns the cached balance afterwards, which may be a newer value from
    /// a deduction that completed during the read.
    pub async fn refresh_balance(&self) -> Result<Option<CreditBalance>, LedgerError> {
        let Some(user) = self.current_user() else {
            return Ok(None);
        };
        let ticket = self.cache.begin_refresh();
        match ledger::load_or_initialize(self.ledger.as_ref(), &user, self.trial_grant).await {
            Ok(balance) => {
                self.cache.complete_refresh(ticket, balance);
                Ok(self.cache.get())
            }
            Err(e) => {
                self.telemetry.log_error(
                    ErrorEvent::new(
                        format!("Balance refresh failed: {}", e),
                        Severity::Medium,
                        Some(user.as_str()),
                    )
                    .context("operation", "refresh_balance"),
                );
                Err(e)
            }
        }
    }

    pub async fn refresh_transactions(&self) -> Result<usize, LedgerError> {
        let Some(user) = self.current_user() else {
            return Ok(0);
        };
        self.history
            .refresh(self.ledger.as_ref(), &user, self.history_limit)
            .await
    }

    pub fn transactions(&self) -> Vec<CreditTransaction> {
        self.history.entries()
    }

    pub fn loading_transactions(&self) -> bool {
        self.history.is_loading()
    }

    pub async fn get_agent_pricing(&self, agent_id: &str) -> AgentPricing {
        self.pricing.get_agent_pricing(agent_id).await
    }

    pub fn configured_pricing(&self) -> Vec<AgentPricing> {
        self.pricing.configured()
    }

    /// Whether the current user may start an interaction with `agent_id`.
    ///
    /// Reads the cache; only an empty cache triggers a ledger read. Any
    /// failure to resolve balance or pricing answers "no".
    pub async fn check_can_use_agent(&self, agent_id: &str) -> Eligibility {
        if self.current_user().is_some() && !self.cache.is_loaded() {
            if let Err(e) = self.refresh_balance().await {
                tracing::warn!(agent_id, error = %e, "Balance unavailable, refusing agent use");
                return Eligibility::fail_closed();
            }
        }
        match self.pricing.try_get_agent_pricing(agent_id).await {
            Ok(pricing) => Eligibility::evaluate(&pricing, self.cache.available()),
            Err(e) => {
                tracing::warn!(agent_id, error = %e, "Pricing unavailable, refusing agent use");
                Eligibility::fail_closed()
            }
        }
    }

    pub async fn deduct_credits(&self, agent_id: &str) -> Result<Committed, DeductionFailure> {
        let user = self.current_user().ok_or(DeductionFailure::Unauthenticated)?;
        let committed = self.coordinator.deduct_credits(&user, agent_id).await?;
        if let Err(e) = self.refresh_transactions().await {
            tracing::debug!(error = %e, "Transaction history refresh after deduction failed");
        }
        Ok(committed)
    }

    pub fn is_deduction_in_flight(&self, agent_id: &str) -> bool {
        self.current_user()
            .map(|user| self.coordinator.is_in_flight(&user, agent_id))
            .unwrap_or(false)
    }

    /// Grant credits through the ledger. Refreshes local state when the grant
    /// targets the signed-in user.
    pub async fn add_credits(&self, request: &AddCreditsRequest) -> Result<bool, LedgerError> {
        let applied = self.ledger.add_credits(request).await?;
        self.telemetry.log_activity(
            ActivityEvent::new("credits_added", Some(request.user_id.as_str()))
                .detail("amount", request.amount)
                .detail("type", request.kind.id())
                .detail("applied", applied),
        );
        if applied && self.current_user().as_ref() == Some(&request.user_id) {
            self.refresh_balance().await?;
            if let Err(e) = self.refresh_transactions().await {
                tracing::debug!(error = %e, "Transaction history refresh after grant failed");
            }
        }
        Ok(applied)
    }

    pub fn has_credits(&self) -> bool {
        self.cache.has_credits()
    }

    pub fn is_low_balance(&self) -> bool {
        self.cache.is_low_balance()
    }

    pub fn low_balance_threshold(&self) -> i64 {
        self.cache.low_balance_threshold()
    }

    /// Paywall decision for using `agent_id` from `route`.
    pub async fn gate(&self, agent_id: &str, route: &str, allow_zero_credits: bool) -> GateDecision {
        let eligibility = self.check_can_use_agent(agent_id).await;
        let balance = self.current_user().map(|_| {
            self.cache
                .get()
                .unwrap_or_else(|| CreditBalance::trial(0))
        });
        gate::decide(eligibility.required, balance.as_ref(), route, allow_zero_credits)
    }
}
