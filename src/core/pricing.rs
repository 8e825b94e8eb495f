use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::core::ledger::{Ledger, LedgerError};
use crate::core::models::pricing::AgentPricing;

/// Maps agent ids to credit weights.
///
/// Lookup order: configured table, then the ledger's pricing store, then the
/// default weight. Never fails; remote errors fall through to the default.
pub struct PricingResolver {
    table: HashMap<String, AgentPricing>,
    ledger: Option<Arc<dyn Ledger>>,
    resolved: Mutex<HashMap<String, AgentPricing>>,
}

/// Normalize an agent id for lookups: trimmed, lowercased.
fn normalize_agent_id(agent_id: &str) -> String {
    agent_id.trim().to_lowercase()
}

impl PricingResolver {
    pub fn new(entries: impl IntoIterator<Item = AgentPricing>) -> Self {
        let table = entries
            .into_iter()
            .filter(|p| {
                if p.is_usable() {
                    true
                } else {
                    tracing::warn!(agent_id = %p.agent_id, weight = p.credit_weight, "Ignoring unusable pricing entry");
                    false
                }
            })
            .map(|p| (normalize_agent_id(&p.agent_id), p))
            .collect();
        Self {
            table,
            ledger: None,
            resolved: Mutex::new(HashMap::new()),
        }
    }

    /// Consult the ledger for agents missing from the configured table.
    pub fn with_ledger(mut self, ledger: Arc<dyn Ledger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Configured entries, sorted by agent id.
    pub fn configured(&self) -> Vec<AgentPricing> {
        let mut entries: Vec<AgentPricing> = self.table.values().cloned().collect();
        entries.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        entries
    }

    pub async fn get_agent_pricing(&self, agent_id: &str) -> AgentPricing {
        match self.try_get_agent_pricing(agent_id).await {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(agent_id, error = %e, "Pricing lookup failed, using default");
                AgentPricing::default_for(agent_id)
            }
        }
    }

    /// Like [`get_agent_pricing`](Self::get_agent_pricing) but surfaces ledger
    /// errors, for callers that must fail closed.
    pub async fn try_get_agent_pricing(&self, agent_id: &str) -> Result<AgentPricing, LedgerError> {
        let key = normalize_agent_id(agent_id);
        if let Some(p) = self.table.get(&key) {
            return Ok(p.clone());
        }
        if let Some(p) = self.memo().get(&key) {
            return Ok(p.clone());
        }

        // Errors are not memoized so the next lookup can reach the ledger again.
        let pricing = match &self.ledger {
            Some(ledger) => match ledger.agent_pricing(agent_id).await? {
                Some(p) if p.is_usable() => p,
                Some(p) => {
                    tracing::warn!(agent_id, weight = p.credit_weight, "Ledger returned unusable weight, using default");
                    AgentPricing::default_for(agent_id)
                }
                None => AgentPricing::default_for(agent_id),
            },
            None => AgentPricing::default_for(agent_id),
        };
        self.memo().insert(key, pricing.clone());
        Ok(pricing)
    }

    fn memo(&self) -> std::sync::MutexGuard<'_, HashMap<String, AgentPricing>> {
        self.resolved.lock().unwrap_or_else(|e| e.into_inner())
    }
}
