use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::core::deduction::DEDUCT_SCOPE;
use crate::core::idempotency::{IdempotencyKey, KeyIntent};
use crate::core::ledger::{Ledger, LedgerError};
use crate::core::models::balance::CreditBalance;
use crate::core::models::deduction::{AddCreditsRequest, DeductRequest, DeductionResult};
use crate::core::models::pricing::AgentPricing;
use crate::core::models::transaction::CreditTransaction;
use crate::core::models::user::UserId;

/// Base delay between transport retries; attempt `n` waits `n` times this.
pub const RETRY_BACKOFF: Duration = Duration::from_millis(250);

/// Client for a PostgREST-style ledger (tables under `/rest/v1`, atomic
/// operations under `/rest/v1/rpc`).
pub struct RemoteLedger {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    max_retries: u32,
    retry_backoff: Duration,
}

#[derive(Serialize)]
struct InitializeTrialParams<'a> {
    p_user_id: &'a str,
    p_amount: i64,
}

#[derive(Serialize)]
struct DeductParams<'a> {
    p_user_id: &'a str,
    p_amount: f64,
    p_agent_id: &'a str,
    p_description: &'a str,
    p_idempotency_key: &'a str,
}

#[derive(Serialize)]
struct AddCreditsParams<'a> {
    p_user_id: &'a str,
    p_amount: i64,
    p_type: &'a str,
    p_description: &'a str,
    p_metadata: &'a serde_json::Map<String, serde_json::Value>,
}

/// RPC functions may answer with a bare object or a one-row set.
#[derive(Deserialize)]
#[serde(untagged)]
enum RpcRow<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> RpcRow<T> {
    fn into_first(self) -> Option<T> {
        match self {
            Self::One(v) => Some(v),
            Self::Many(v) => v.into_iter().next(),
        }
    }
}

/// Validate that a ledger URL uses HTTPS, allowing plain HTTP only for loopback.
///
/// The service key is sent on every request, so it must not leave the machine
/// unencrypted.
pub fn validate_endpoint(url: &str) -> anyhow::Result<()> {
    let loopback = ["http://127.0.0.1", "http://localhost", "http://[::1]"];
    if url.starts_with("https://") || loopback.iter().any(|p| url.starts_with(p)) {
        return Ok(());
    }
    anyhow::bail!("Ledger endpoint must use HTTPS, got: {}", url)
}

fn transport_error(e: reqwest::Error) -> LedgerError {
    if e.is_timeout() {
        LedgerError::Timeout
    } else if e.is_decode() {
        LedgerError::Decode(e.to_string())
    } else {
        LedgerError::Transport(e.to_string())
    }
}

impl RemoteLedger {
    pub fn new(
        base_url: &str,
        api_key: &str,
        timeout: Duration,
        max_retries: u32,
    ) -> anyhow::Result<Self> {
        validate_endpoint(base_url)?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {}", e))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            max_retries,
            retry_backoff: RETRY_BACKOFF,
        })
    }

    #[cfg(test)]
    fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, path)
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Accept", "application/json")
    }

    /// Send a request, retrying transient failures. `build` is called with the
    /// attempt number (0 for the first send) and must describe the same
    /// operation every time.
    async fn send<T, F>(&self, what: &str, build: F) -> Result<T, LedgerError>
    where
        T: DeserializeOwned,
        F: Fn(u32) -> reqwest::RequestBuilder,
    {
        let mut attempt = 0u32;
        loop {
            match self.send_once(build(attempt)).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    attempt += 1;
                    tracing::warn!(
                        request = what,
                        attempt,
                        max_retries = self.max_retries,
                        error = %e,
                        "Transient ledger failure, retrying"
                    );
                    tokio::time::sleep(self.retry_backoff * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn send_once<T: DeserializeOwned>(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<T, LedgerError> {
        let response = self
            .authorized(builder)
            .send()
            .await
            .map_err(transport_error)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LedgerError::Http {
                status: status.as_u16(),
                body,
            });
        }
        response
            .json::<T>()
            .await
            .map_err(|e| LedgerError::Decode(e.to_string()))
    }
}

#[async_trait]
impl Ledger for RemoteLedger {
    async fn get_user_credits(&self, user_id: &UserId) -> Result<CreditBalance, LedgerError> {
        let url = self.url("user_credits");
        let filter = format!("eq.{}", user_id);
        let rows: Vec<CreditBalance> = self
            .send("get_user_credits", |_| {
                self.client
                    .get(&url)
                    .query(&[("user_id", filter.as_str()), ("select", "*")])
            })
            .await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| LedgerError::NotFound(user_id.to_string()))
    }

    async fn initialize_trial(
        &self,
        user_id: &UserId,
        amount: i64,
    ) -> Result<CreditBalance, LedgerError> {
        let url = self.url("rpc/initialize_user_credits");
        let params = InitializeTrialParams {
            p_user_id: user_id.as_str(),
            p_amount: amount,
        };
        let _: serde_json::Value = self
            .send("initialize_trial", |_| self.client.post(&url).json(&params))
            .await?;
        self.get_user_credits(user_id).await
    }

    async fn deduct(&self, request: &DeductRequest) -> Result<DeductionResult, LedgerError> {
        let url = self.url("rpc/deduct_credits_idempotent");
        let row: RpcRow<DeductionResult> = self
            .send("deduct", |attempt| {
                let key = IdempotencyKey::for_action(
                    KeyIntent::Retry {
                        key: &request.idempotency_key,
                        attempt,
                    },
                    DEDUCT_SCOPE,
                    &request.agent_id,
                    &request.user_id,
                );
                let params = DeductParams {
                    p_user_id: request.user_id.as_str(),
                    p_amount: request.amount,
                    p_agent_id: &request.agent_id,
                    p_description: &request.description,
                    p_idempotency_key: key.as_str(),
                };
                self.client
                    .post(&url)
                    .header("Idempotency-Key", key.as_str())
                    .json(&params)
            })
            .await?;
        row.into_first()
            .ok_or_else(|| LedgerError::Decode("empty deduction result".to_string()))
    }

    async fn add_credits(&self, request: &AddCreditsRequest) -> Result<bool, LedgerError> {
        let url = self.url("rpc/add_credits");
        let params = AddCreditsParams {
            p_user_id: request.user_id.as_str(),
            p_amount: request.amount,
            p_type: request.kind.id(),
            p_description: &request.description,
            p_metadata: &request.metadata,
        };
        let ok: bool = self
            .send("add_credits", |_| self.client.post(&url).json(&params))
            .await?;
        Ok(ok)
    }

    async fn transactions(
        &self,
        user_id: &UserId,
        limit: usize,
    ) -> Result<Vec<CreditTransaction>, LedgerError> {
        let url = self.url("credit_transactions");
        let filter = format!("eq.{}", user_id);
        let limit = limit.to_string();
        self.send("transactions", |_| {
            self.client.get(&url).query(&[
                ("user_id", filter.as_str()),
                ("order", "created_at.desc"),
                ("limit", limit.as_str()),
            ])
        })
        .await
    }

    async fn agent_pricing(&self, agent_id: &str) -> Result<Option<AgentPricing>, LedgerError> {
        let url = self.url("agent_pricing");
        let filter = format!("eq.{}", agent_id);
        let rows: Vec<AgentPricing> = self
            .send("agent_pricing", |_| {
                self.client
                    .get(&url)
                    .query(&[("agent_id", filter.as_str())])
            })
            .await?;
        Ok(rows.into_iter().next())
    }
}
