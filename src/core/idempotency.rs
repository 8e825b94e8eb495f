use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::core::models::user::UserId;

/// Caller-generated token that lets the ledger apply a request at most once.
///
/// A key is minted once per user action. Transport retries of that action
/// carry the same key; a new action always mints a new one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

/// Whether a request belongs to a new user action or resends an earlier one.
#[derive(Debug, Clone, Copy)]
pub enum KeyIntent<'a> {
    NewAction,
    /// Attempt `0` is the first send of `key`; later attempts are transport retries.
    Retry {
        key: &'a IdempotencyKey,
        attempt: u32,
    },
}

impl IdempotencyKey {
    /// Mint a key unique to (scope, agent, user, time, nonce).
    pub fn mint(scope: &str, agent_id: &str, user_id: &UserId) -> Self {
        let nonce = uuid::Uuid::new_v4().simple().to_string();
        Self(format!(
            "{}_{}_{}_{}_{}",
            sanitize(scope),
            sanitize(agent_id),
            sanitize(user_id.as_str()),
            Utc::now().timestamp_millis(),
            &nonce[..12]
        ))
    }

    /// Resolve the key for a request: fresh for a new action, unchanged for a retry.
    pub fn for_action(intent: KeyIntent<'_>, scope: &str, agent_id: &str, user_id: &UserId) -> Self {
        match intent {
            KeyIntent::NewAction => Self::mint(scope, agent_id, user_id),
            KeyIntent::Retry { key, attempt } => {
                if attempt > 0 {
                    tracing::debug!(idempotency_key = %key, attempt, "Reusing idempotency key for retry");
                }
                key.clone()
            }
        }
    }

    /// Wrap a key received from elsewhere (ledger responses, fixtures).
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Keep key segments free of the `_` separator and anything a header would reject.
fn sanitize(part: &str) -> String {
    let cleaned: String = part
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    if cleaned.is_empty() {
        "none".to_string()
    } else {
        cleaned
    }
}
