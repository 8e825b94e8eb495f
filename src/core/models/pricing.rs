use serde::{Deserialize, Serialize};

/// Credit weight charged for agents without an explicit price.
pub const DEFAULT_CREDIT_WEIGHT: f64 = 1.0;

/// Cost schedule entry for one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentPricing {
    pub agent_id: String,
    /// Credits per interaction, may be fractional
    pub credit_weight: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_basis: Option<String>,
}

impl AgentPricing {
    pub fn default_for(agent_id: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            credit_weight: DEFAULT_CREDIT_WEIGHT,
            description: Some("Standard rate".to_string()),
            cost_basis: Some("default".to_string()),
        }
    }

    /// Whole credits a user must hold before starting an interaction.
    pub fn required_credits(&self) -> i64 {
        self.credit_weight.max(0.0).ceil() as i64
    }

    /// A weight the rest of the system can reason about: finite and not negative.
    pub fn is_usable(&self) -> bool {
        self.credit_weight.is_finite() && self.credit_weight >= 0.0
    }
}

/// How an agent's weight turns into the amount sent to the ledger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChargePolicy {
    /// Debit `ceil(weight)`, the same amount the eligibility check requires.
    #[default]
    RoundUp,
    /// Debit the raw weight while eligibility still requires `ceil(weight)`.
    RawWeight,
}

impl ChargePolicy {
    pub fn id(&self) -> &'static str {
        match self {
            Self::RoundUp => "round_up",
            Self::RawWeight => "raw_weight",
        }
    }

    pub fn debit_amount(&self, pricing: &AgentPricing) -> f64 {
        match self {
            Self::RoundUp => pricing.required_credits() as f64,
            Self::RawWeight => pricing.credit_weight.max(0.0),
        }
    }
}
