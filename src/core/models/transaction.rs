use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Trial,
    Subscription,
    Topup,
    Usage,
    Rollover,
    AdminGrant,
    AdminRevoke,
    ReferralBonus,
}

impl TransactionType {
    pub fn from_id(id: &str) -> Option<Self> {
        match id.to_lowercase().as_str() {
            "trial" => Some(Self::Trial),
            "subscription" => Some(Self::Subscription),
            "topup" | "top_up" | "top-up" => Some(Self::Topup),
            "usage" => Some(Self::Usage),
            "rollover" => Some(Self::Rollover),
            "admin_grant" | "admin-grant" => Some(Self::AdminGrant),
            "admin_revoke" | "admin-revoke" => Some(Self::AdminRevoke),
            "referral_bonus" | "referral-bonus" | "referral" => Some(Self::ReferralBonus),
            _ => None,
        }
    }

    pub fn id(&self) -> &'static str {
        match self {
            Self::Trial => "trial",
            Self::Subscription => "subscription",
            Self::Topup => "topup",
            Self::Usage => "usage",
            Self::Rollover => "rollover",
            Self::AdminGrant => "admin_grant",
            Self::AdminRevoke => "admin_revoke",
            Self::ReferralBonus => "referral_bonus",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Trial => "Trial",
            Self::Subscription => "Subscription",
            Self::Topup => "Top-up",
            Self::Usage => "Usage",
            Self::Rollover => "Rollover",
            Self::AdminGrant => "Admin grant",
            Self::AdminRevoke => "Admin revoke",
            Self::ReferralBonus => "Referral bonus",
        }
    }

    /// Whether entries of this type remove credits from the balance.
    pub fn is_debit(&self) -> bool {
        matches!(self, Self::Usage | Self::AdminRevoke)
    }
}

/// Immutable ledger entry. Only the ledger creates these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditTransaction {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: TransactionType,
    /// Positive = credit, negative = debit
    pub amount: i64,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}
