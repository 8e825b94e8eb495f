use serde::Serialize;

use crate::core::models::pricing::AgentPricing;

/// Whether a user may start an interaction with an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Eligibility {
    pub can_use: bool,
    /// Whole credits the agent requires, `ceil(credit_weight)`
    pub required: i64,
    pub available: i64,
}

impl Eligibility {
    pub fn evaluate(pricing: &AgentPricing, available: i64) -> Self {
        let required = pricing.required_credits();
        let available = available.max(0);
        Self {
            can_use: available >= required,
            required,
            available,
        }
    }

    /// Answer used when balance or pricing cannot be resolved.
    pub fn fail_closed() -> Self {
        Self {
            can_use: false,
            required: 1,
            available: 0,
        }
    }

    /// Credits missing before the interaction is allowed.
    pub fn shortfall(&self) -> i64 {
        (self.required - self.available).max(0)
    }
}
